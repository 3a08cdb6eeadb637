// src/utils/log.rs

//! Console reporter for CLI command output.
//!
//! Diagnostic logging goes through the `log` facade; this module prints the
//! human-facing results of a command with timestamps and levels.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;

/// Whether report output is suppressed
static QUIET: AtomicBool = AtomicBool::new(false);

/// Report level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Suppress informational output
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

fn should_print(level: Level) -> bool {
    level >= Level::Warn || !QUIET.load(Ordering::Relaxed)
}

/// Format a line with timestamp and level
fn format_line(level: Level, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] [{}] {}", timestamp, level.as_str(), message)
}

/// Print an info line
pub fn info(message: &str) {
    if should_print(Level::Info) {
        println!("{}", format_line(Level::Info, message));
    }
}

/// Print a warning line
pub fn warn(message: &str) {
    if should_print(Level::Warn) {
        eprintln!("{}", format_line(Level::Warn, message));
    }
}

/// Print an error line
pub fn error(message: &str) {
    eprintln!("{}", format_line(Level::Error, message));
}

/// Print a success line (always shown)
pub fn success(message: &str) {
    println!("{}", format_line(Level::Info, &format!("✓ {}", message)));
}

/// Print a header
pub fn header(title: &str) {
    if should_print(Level::Info) {
        let border = "═".repeat(60);
        println!("{}", format_line(Level::Info, &border));
        println!("{}", format_line(Level::Info, &format!("  {}", title)));
        println!("{}", format_line(Level::Info, &border));
    }
}

/// Print an indented sub-item
pub fn sub_item(message: &str) {
    if should_print(Level::Info) {
        println!("{}", format_line(Level::Info, &format!("    {}", message)));
    }
}

/// Print a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    if should_print(Level::Info) {
        println!();
        println!("{}", format_line(Level::Info, &format!("[SUMMARY] {}", title)));
        for (key, value) in items {
            println!("{}", format_line(Level::Info, &format!("    {}: {}", key, value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_format_line() {
        let line = format_line(Level::Warn, "source disabled");
        assert!(line.contains("[WARN] source disabled"));
    }
}
