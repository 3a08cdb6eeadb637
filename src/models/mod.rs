// src/models/mod.rs

//! Domain models for the monitoring engine.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod audit;
mod change;
mod config;
mod job;
mod notification;
mod snapshot;
mod source;

// Re-export all public types
pub use audit::{AuditEntry, AuditEvent, RecordFilter};
pub use change::{ChangeRecord, ChangeType, SeverityAssessment, SeverityTier};
pub use config::{
    ClassifierConfig, Config, DetectorConfig, FetcherConfig, LoggingConfig, NotifierConfig,
    ParserDefinition, SchedulerConfig, SeverityThresholds, StorageConfig,
};
pub use job::{JobExecution, JobOutcome, JobTrigger};
pub use notification::{
    ChannelId, DeliveryStatus, DigestCadence, NotificationPreference, NotificationRecord,
};
pub use snapshot::{ArchivedContent, ContentSnapshot, RawContent};
pub use source::{Cadence, RegulatorySource, SourceDefinition};
