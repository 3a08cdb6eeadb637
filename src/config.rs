// src/config.rs

//! Configuration loading utilities.
//!
//! This module provides convenience functions for loading configuration
//! from files and watching a file for edits.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;
use crate::models::Config;
use crate::utils::log;

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load(path)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, falling back to defaults when the file is missing.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::warn(&format!(
            "Config file {path:?} not found, using default configuration."
        ));
        return Ok(Config::default());
    }
    load_config(path)
}

/// Detects edits to a configuration file by polling its modification time.
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Watch `path`, treating its current contents as already loaded.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let modified = modified_at(&path);
        Self { path, modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The reloaded configuration when the file changed since the last poll.
    ///
    /// An edit that fails to load or validate is returned as an error once;
    /// the next poll reports only a further edit.
    pub fn poll(&mut self) -> Option<Result<Config>> {
        let modified = modified_at(&self.path);
        if modified.is_none() || modified == self.modified {
            return None;
        }
        self.modified = modified;
        ::log::info!("Config file {:?} changed, reloading", self.path);
        Some(load_config(&self.path))
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SOURCES: &str = r#"
        [[sources]]
        id = "fca"
        target = "https://www.fca.org.uk/handbook"
        cadence = "0 */6 * * *"
    "#;

    #[test]
    fn test_load_config_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regwatch.toml");
        fs::write(&path, SOURCES).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.sources.len(), 1);

        fs::write(&path, format!("{SOURCES}{SOURCES}")).unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_watcher_reports_edits_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regwatch.toml");
        fs::write(&path, "").unwrap();

        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().is_none());

        fs::write(&path, SOURCES).unwrap();
        let bumped = SystemTime::now() + Duration::from_secs(5);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(bumped)
            .unwrap();

        let reloaded = watcher.poll().unwrap().unwrap();
        assert_eq!(reloaded.sources[0].id, "fca");
        assert!(watcher.poll().is_none());
    }
}
