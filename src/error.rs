// src/error.rs

//! Unified error handling for the monitoring engine.
//!
//! `AppError` is the crate-wide error. Fetch and delivery failures have their
//! own enums because their retryability decides how the retry policy treats them.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// CSS selector parsing failed
    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    /// Cron expression parsing failed
    #[error("Invalid cadence '{expression}': {message}")]
    Cadence { expression: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Fetch failed after the retry policy gave up
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Delivery failed after the retry policy gave up
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// A uniqueness constraint rejected a write
    #[error("Persistence conflict on {entity}: {message}")]
    Conflict { entity: String, message: String },

    /// Cooperative cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A job cycle ran past its deadline
    #[error("Cycle timed out after {0:?}")]
    CycleTimeout(Duration),

    /// Entity lookup failed
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A cycle for the source is already running
    #[error("A job for source '{0}' is already in flight")]
    AlreadyRunning(String),

    /// Source is disabled and awaits operator review
    #[error("Source '{0}' is disabled")]
    SourceDisabled(String),
}

impl AppError {
    /// Create a selector parsing error.
    pub fn selector(selector: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Selector {
            selector: selector.into(),
            message: message.to_string(),
        }
    }

    /// Create a cadence parsing error.
    pub fn cadence(expression: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Cadence {
            expression: expression.into(),
            message: message.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a persistence conflict.
    pub fn conflict(entity: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Conflict {
            entity: entity.into(),
            message: message.to_string(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Whether this error is a cooperative cancellation.
    ///
    /// Cancellations are not failures of the source and never count toward
    /// the circuit breaker.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled(_)
                | Self::Fetch(FetchError::Cancelled)
                | Self::Delivery(DeliveryError::Cancelled)
        )
    }
}

/// Failure reported by a fetch target or raised while fetching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Attempt exceeded its timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection refused, reset, or other transport failure
    #[error("connection failed: {0}")]
    Connection(String),

    /// Non-success HTTP status
    #[error("HTTP status {0}")]
    Status(u16),

    /// Target reference cannot be fetched at all
    #[error("malformed target '{0}'")]
    MalformedTarget(String),

    /// Parser could not turn the payload into text
    #[error("parse failure: {0}")]
    Parse(String),

    /// Stop requested between attempts
    #[error("fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Timeouts, connection failures, 429 and 5xx are retryable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status(code) => *code == 429 || (500..600).contains(code),
            Self::MalformedTarget(_) | Self::Parse(_) | Self::Cancelled => false,
        }
    }
}

/// Failure reported by a delivery channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transport is temporarily unavailable
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// The channel refused the message
    #[error("delivery rejected: {0}")]
    Rejected(String),

    /// Stop requested between attempts
    #[error("delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Only unavailability is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failure inside the severity classifier.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationError {
    /// Neither text has a single term to compare
    #[error("neither text contains any terms")]
    NoTerms,

    /// Similarity came out as NaN or outside 0..=1
    #[error("similarity {0} is not a valid score")]
    InvalidScore(f64),
}
