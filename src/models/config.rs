//! Application configuration structures.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::change::SeverityTier;
use super::notification::NotificationPreference;
use super::source::SourceDefinition;
use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP, retry and rate-limit behavior
    #[serde(default)]
    pub fetcher: FetcherConfig,

    /// Worker pool and health settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Diff settings
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Similarity thresholds and topic vocabulary
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Delivery retry and digest settings
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Where snapshots, records and the audit trail live
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Additional HTML parsers keyed by id
    #[serde(default)]
    pub parsers: Vec<ParserDefinition>,

    /// Monitored sources
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,

    /// Recipient notification preferences
    #[serde(default)]
    pub recipients: Vec<NotificationPreference>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.fetcher.user_agent.trim().is_empty() {
            return Err(AppError::validation("fetcher.user_agent is empty"));
        }
        if self.fetcher.attempt_timeout_secs == 0 {
            return Err(AppError::validation(
                "fetcher.attempt_timeout_secs must be > 0",
            ));
        }
        if self.fetcher.max_attempts == 0 {
            return Err(AppError::validation("fetcher.max_attempts must be > 0"));
        }
        if self.notifier.max_attempts == 0 {
            return Err(AppError::validation("notifier.max_attempts must be > 0"));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(AppError::validation("scheduler.max_concurrent must be > 0"));
        }
        if self.scheduler.cycle_timeout_secs == 0 {
            return Err(AppError::validation(
                "scheduler.cycle_timeout_secs must be > 0",
            ));
        }
        if self.scheduler.failure_threshold == 0 {
            return Err(AppError::validation(
                "scheduler.failure_threshold must be > 0",
            ));
        }
        if self.notifier.digest_capacity == 0 {
            return Err(AppError::validation("notifier.digest_capacity must be > 0"));
        }
        self.classifier.thresholds.validate()?;

        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(AppError::validation("source with empty id"));
            }
            if source.target.trim().is_empty() {
                return Err(AppError::validation(format!(
                    "source '{}' has an empty target",
                    source.id
                )));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }

        for recipient in &self.recipients {
            if recipient.channels.is_empty() {
                return Err(AppError::validation(format!(
                    "recipient '{}' has no channels",
                    recipient.recipient_id
                )));
            }
        }
        Ok(())
    }
}

/// HTTP client, retry and rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Timeout for a single fetch attempt in seconds
    #[serde(default = "defaults::attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Total attempts per fetch, including the first
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base_ms: u64,

    /// Growth factor between retries
    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.0 - 1.0)
    #[serde(default = "defaults::jitter")]
    pub jitter: f64,

    /// Minimum delay between requests to the same domain in milliseconds
    #[serde(default = "defaults::min_request_interval")]
    pub min_request_interval_ms: u64,
}

impl FetcherConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            attempt_timeout_secs: defaults::attempt_timeout(),
            max_attempts: defaults::max_attempts(),
            backoff_base_ms: defaults::backoff_base(),
            backoff_multiplier: defaults::backoff_multiplier(),
            jitter: defaults::jitter(),
            min_request_interval_ms: defaults::min_request_interval(),
        }
    }
}

/// Worker pool, timeouts and circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum cycles executing at once across all sources
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Upper bound for one fetch/detect/classify/dispatch cycle in seconds
    #[serde(default = "defaults::cycle_timeout")]
    pub cycle_timeout_secs: u64,

    /// How often cadences are evaluated in milliseconds
    #[serde(default = "defaults::tick_interval")]
    pub tick_interval_ms: u64,

    /// Consecutive failed cycles before a source is disabled
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// How often the config file is checked for source edits in seconds
    #[serde(default = "defaults::reload_interval")]
    pub reload_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            cycle_timeout_secs: defaults::cycle_timeout(),
            tick_interval_ms: defaults::tick_interval(),
            failure_threshold: defaults::failure_threshold(),
            reload_interval_secs: defaults::reload_interval(),
        }
    }
}

/// Change detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Upper bound for the stored diff summary in bytes
    #[serde(default = "defaults::max_diff_bytes")]
    pub max_diff_bytes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_diff_bytes: defaults::max_diff_bytes(),
        }
    }
}

/// Similarity upper bounds per tier. A similarity below `critical` is
/// CRITICAL, below `high` is HIGH, and so on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SeverityThresholds {
    #[serde(default = "defaults::critical_below")]
    pub critical: f64,
    #[serde(default = "defaults::high_below")]
    pub high: f64,
    #[serde(default = "defaults::medium_below")]
    pub medium: f64,
    #[serde(default = "defaults::low_below")]
    pub low: f64,
}

impl SeverityThresholds {
    /// Map a similarity score onto a tier.
    pub fn tier_for(&self, similarity: f64) -> SeverityTier {
        if similarity < self.critical {
            SeverityTier::Critical
        } else if similarity < self.high {
            SeverityTier::High
        } else if similarity < self.medium {
            SeverityTier::Medium
        } else if similarity < self.low {
            SeverityTier::Low
        } else {
            SeverityTier::Informational
        }
    }

    /// Thresholds must be within 0..=1 and non-decreasing.
    pub fn validate(&self) -> Result<()> {
        let ordered = [self.critical, self.high, self.medium, self.low];
        if ordered.iter().any(|t| !(0.0..=1.0).contains(t)) {
            return Err(AppError::validation(
                "classifier.thresholds must be within 0.0..=1.0",
            ));
        }
        if ordered.windows(2).any(|w| w[0] > w[1]) {
            return Err(AppError::validation(
                "classifier.thresholds must be ordered critical <= high <= medium <= low",
            ));
        }
        Ok(())
    }
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            critical: defaults::critical_below(),
            high: defaults::high_below(),
            medium: defaults::medium_below(),
            low: defaults::low_below(),
        }
    }
}

/// Severity classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub thresholds: SeverityThresholds,

    /// Tier assigned to a source's first snapshot
    #[serde(default = "defaults::baseline_tier")]
    pub baseline_tier: SeverityTier,

    /// Topic name to the terms and phrases that indicate it
    #[serde(default)]
    pub vocabulary: BTreeMap<String, Vec<String>>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            thresholds: SeverityThresholds::default(),
            baseline_tier: defaults::baseline_tier(),
            vocabulary: BTreeMap::new(),
        }
    }
}

/// Delivery and digest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// Total delivery attempts per notification
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "defaults::backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "defaults::jitter")]
    pub jitter: f64,

    /// Queue size per (recipient, cadence) before an early flush
    #[serde(default = "defaults::digest_capacity")]
    pub digest_capacity: usize,

    /// Cron expression for the daily digest flush
    #[serde(default = "defaults::daily_digest")]
    pub daily_digest: String,

    /// Cron expression for the weekly digest flush
    #[serde(default = "defaults::weekly_digest")]
    pub weekly_digest: String,

    /// Timeout for a webhook request in seconds
    #[serde(default = "defaults::attempt_timeout")]
    pub webhook_timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            backoff_base_ms: defaults::backoff_base(),
            backoff_multiplier: defaults::backoff_multiplier(),
            jitter: defaults::jitter(),
            digest_capacity: defaults::digest_capacity(),
            daily_digest: defaults::daily_digest(),
            weekly_digest: defaults::weekly_digest(),
            webhook_timeout_secs: defaults::attempt_timeout(),
        }
    }
}

/// Storage location settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::storage_dir")]
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: defaults::storage_dir(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

/// An HTML parser that extracts text from the elements matching `selector`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParserDefinition {
    pub id: String,
    pub selector: String,
}

mod defaults {
    use std::path::PathBuf;

    use crate::models::SeverityTier;

    // Fetcher defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; regwatch/0.1)".into()
    }
    pub fn attempt_timeout() -> u64 {
        30
    }
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn backoff_base() -> u64 {
        1000
    }
    pub fn backoff_multiplier() -> f64 {
        1.5
    }
    pub fn jitter() -> f64 {
        0.2
    }
    pub fn min_request_interval() -> u64 {
        1000
    }

    // Scheduler defaults
    pub fn max_concurrent() -> usize {
        3
    }
    pub fn cycle_timeout() -> u64 {
        300
    }
    pub fn tick_interval() -> u64 {
        1000
    }
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn reload_interval() -> u64 {
        30
    }

    // Detector defaults
    pub fn max_diff_bytes() -> usize {
        4096
    }

    // Classifier defaults
    pub fn critical_below() -> f64 {
        0.50
    }
    pub fn high_below() -> f64 {
        0.70
    }
    pub fn medium_below() -> f64 {
        0.85
    }
    pub fn low_below() -> f64 {
        0.95
    }
    pub fn baseline_tier() -> SeverityTier {
        SeverityTier::Informational
    }

    // Notifier defaults
    pub fn digest_capacity() -> usize {
        500
    }
    pub fn daily_digest() -> String {
        "0 0 0 * * *".into()
    }
    pub fn weekly_digest() -> String {
        "0 0 0 * * MON".into()
    }

    pub fn storage_dir() -> PathBuf {
        PathBuf::from("storage")
    }
    pub fn log_level() -> String {
        "info".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        max_concurrent = 2

        [classifier.vocabulary]
        privacy = ["personal data", "gdpr"]
        capital = ["capital requirement"]

        [[parsers]]
        id = "handbook"
        selector = "main article"

        [[sources]]
        id = "fca-handbook"
        name = "FCA Handbook"
        target = "https://example.org/handbook"
        parser = "handbook"
        cadence = "0 */6 * * *"

        [[recipients]]
        recipient_id = "compliance"
        address = "compliance@example.org"
        min_severity = "HIGH"
        channels = ["log"]
        cadence = "DAILY"
    "#;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 2);
        assert_eq!(config.scheduler.failure_threshold, 5);
        assert_eq!(config.fetcher.max_attempts, 3);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.parsers[0].selector, "main article");
        assert_eq!(config.classifier.vocabulary["privacy"].len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_user_agent() {
        let mut config = Config::default();
        config.fetcher.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.scheduler.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_sources() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        let dup = config.sources[0].clone();
        config.sources.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unordered_thresholds() {
        let mut config = Config::default();
        config.classifier.thresholds.high = 0.4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_thresholds_map_tiers() {
        let t = SeverityThresholds::default();
        assert_eq!(t.tier_for(0.40), SeverityTier::Critical);
        assert_eq!(t.tier_for(0.50), SeverityTier::High);
        assert_eq!(t.tier_for(0.69), SeverityTier::High);
        assert_eq!(t.tier_for(0.80), SeverityTier::Medium);
        assert_eq!(t.tier_for(0.90), SeverityTier::Low);
        assert_eq!(t.tier_for(0.95), SeverityTier::Informational);
        assert_eq!(t.tier_for(1.0), SeverityTier::Informational);
    }
}
