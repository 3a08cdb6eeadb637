//! Circuit Breaker pattern implementation.
//!
//! Disables a source after repeated consecutive failed cycles so that a
//! broken source stops consuming fetch capacity until an operator reviews it.
//!
//! > A failed cycle increments the failure counter, a successful one resets
//! > it. Reaching the threshold disables the source and flags it for review.
//! > Cancelled cycles leave the counter untouched.

use crate::models::RegulatorySource;
use crate::storage::SourceHealth;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed cycles that disable a source. Default: 5
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

/// How a cycle ended, as far as source health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    Succeeded,
    Failed,
    Cancelled,
}

/// Result of circuit breaker check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerResult {
    /// Nothing to record
    Unchanged,
    /// Success after failures: counter back to zero
    Reset { previous_failures: u32 },
    /// Failure below the threshold
    Counted { consecutive_failures: u32 },
    /// Threshold reached: disable the source
    Tripped { consecutive_failures: u32 },
}

/// Circuit breaker for failing sources.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    /// Decide how a finished cycle affects the source.
    pub fn check(&self, source: &RegulatorySource, verdict: CycleVerdict) -> CircuitBreakerResult {
        match verdict {
            CycleVerdict::Cancelled => CircuitBreakerResult::Unchanged,
            CycleVerdict::Succeeded if source.consecutive_failures == 0 => {
                CircuitBreakerResult::Unchanged
            }
            CycleVerdict::Succeeded => CircuitBreakerResult::Reset {
                previous_failures: source.consecutive_failures,
            },
            CycleVerdict::Failed => {
                let consecutive_failures = source.consecutive_failures.saturating_add(1);
                if source.enabled && consecutive_failures >= self.config.failure_threshold {
                    CircuitBreakerResult::Tripped {
                        consecutive_failures,
                    }
                } else {
                    CircuitBreakerResult::Counted {
                        consecutive_failures,
                    }
                }
            }
        }
    }

    /// Health to write for the source, or `None` when nothing changes.
    pub fn evaluate(&self, source: &RegulatorySource, verdict: CycleVerdict) -> Option<SourceHealth> {
        let current = SourceHealth::of(source);
        match self.check(source, verdict) {
            CircuitBreakerResult::Unchanged => None,
            CircuitBreakerResult::Reset { previous_failures } => {
                log::info!(
                    "Circuit breaker: '{}' recovered after {} failed cycles",
                    source.id,
                    previous_failures
                );
                Some(SourceHealth {
                    consecutive_failures: 0,
                    ..current
                })
            }
            CircuitBreakerResult::Counted {
                consecutive_failures,
            } => {
                log::warn!(
                    "Circuit breaker: '{}' failed {} of {} cycles in a row",
                    source.id,
                    consecutive_failures,
                    self.config.failure_threshold
                );
                Some(SourceHealth {
                    consecutive_failures,
                    ..current
                })
            }
            CircuitBreakerResult::Tripped {
                consecutive_failures,
            } => {
                log::error!(
                    "Circuit breaker: TRIPPED for '{}' after {} consecutive failures, disabling",
                    source.id,
                    consecutive_failures
                );
                Some(SourceHealth {
                    consecutive_failures,
                    enabled: false,
                    needs_review: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDefinition;

    fn make_source(failures: u32) -> RegulatorySource {
        let def: SourceDefinition = toml::from_str(
            r#"
            id = "sec"
            target = "https://sec.example/rules"
            cadence = "0 * * * *"
            "#,
        )
        .unwrap();
        let mut source = RegulatorySource::from_definition(&def);
        source.consecutive_failures = failures;
        source
    }

    #[test]
    fn test_success_without_failures_is_unchanged() {
        let cb = CircuitBreaker::new();
        assert_eq!(
            cb.check(&make_source(0), CycleVerdict::Succeeded),
            CircuitBreakerResult::Unchanged
        );
        assert!(cb.evaluate(&make_source(0), CycleVerdict::Succeeded).is_none());
    }

    #[test]
    fn test_success_resets_counter() {
        let cb = CircuitBreaker::new();
        let health = cb.evaluate(&make_source(3), CycleVerdict::Succeeded).unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.enabled);
    }

    #[test]
    fn test_failure_below_threshold() {
        let cb = CircuitBreaker::new();
        assert_eq!(
            cb.check(&make_source(2), CycleVerdict::Failed),
            CircuitBreakerResult::Counted {
                consecutive_failures: 3
            }
        );
        let health = cb.evaluate(&make_source(2), CycleVerdict::Failed).unwrap();
        assert!(health.enabled);
        assert!(!health.needs_review);
    }

    #[test]
    fn test_fifth_failure_trips() {
        let cb = CircuitBreaker::new();
        assert_eq!(
            cb.check(&make_source(4), CycleVerdict::Failed),
            CircuitBreakerResult::Tripped {
                consecutive_failures: 5
            }
        );
        let health = cb.evaluate(&make_source(4), CycleVerdict::Failed).unwrap();
        assert!(!health.enabled);
        assert!(health.needs_review);
    }

    #[test]
    fn test_cancellation_does_not_count() {
        let cb = CircuitBreaker::new();
        assert!(cb.evaluate(&make_source(4), CycleVerdict::Cancelled).is_none());
    }

    #[test]
    fn test_custom_threshold() {
        let cb = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 2,
        });
        assert!(matches!(
            cb.check(&make_source(1), CycleVerdict::Failed),
            CircuitBreakerResult::Tripped { .. }
        ));
    }
}
