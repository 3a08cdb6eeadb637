//! Persistence for sources, snapshots, change records, notifications, jobs
//! and the audit trail.
//!
//! Both backends share [`StoreState`]: every mutation validates its
//! constraints and appends the matching audit entries under one lock, so a
//! state change and its audit entry are never observed apart.
//!
//! ## Local layout
//!
//! ```text
//! {root}/
//! ├── store.lock                 # Held by whichever handle is writing
//! ├── state.json                 # Sources, records, jobs, committed audit length
//! ├── audit.jsonl                # Audit trail, one entry per line
//! └── snapshots/                 # Archived content, one pair per snapshot
//!     └── {source_id}/
//!         ├── 00000001.raw
//!         └── 00000001.txt
//! ```

pub mod local;
pub mod memory;
mod state;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ArchivedContent, AuditEntry, AuditEvent, ChangeRecord, ContentSnapshot, JobExecution,
    NotificationRecord, RecordFilter, RegulatorySource, SeverityAssessment, SourceDefinition,
};

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use state::StoreState;

/// Health fields of a source, written as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub enabled: bool,
    pub needs_review: bool,
}

impl SourceHealth {
    pub fn of(source: &RegulatorySource) -> Self {
        Self {
            consecutive_failures: source.consecutive_failures,
            enabled: source.enabled,
            needs_review: source.needs_review,
        }
    }

    /// Healthy and enabled, as after an operator review.
    pub fn reset() -> Self {
        Self {
            consecutive_failures: 0,
            enabled: true,
            needs_review: false,
        }
    }
}

/// Everything a detected change persists, committed atomically.
#[derive(Debug, Clone)]
pub struct ChangeCommit {
    pub snapshot: ContentSnapshot,
    pub content: ArchivedContent,
    pub change: ChangeRecord,
    pub assessment: SeverityAssessment,
}

/// A change record with its assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeView {
    pub change: ChangeRecord,
    pub assessment: Option<SeverityAssessment>,
}

/// Trait for engine storage backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a source or apply an edited definition to an existing one.
    ///
    /// Health fields of an existing source are kept.
    async fn register_source(&self, def: &SourceDefinition) -> Result<RegulatorySource>;

    async fn get_source(&self, id: &str) -> Result<Option<RegulatorySource>>;

    async fn list_sources(&self) -> Result<Vec<RegulatorySource>>;

    /// Write a source's health fields, auditing enable/disable transitions.
    async fn update_source_health(&self, id: &str, health: SourceHealth)
    -> Result<RegulatorySource>;

    async fn latest_snapshot(&self, source_id: &str) -> Result<Option<ContentSnapshot>>;

    /// All snapshots of a source in sequence order.
    async fn snapshots(&self, source_id: &str) -> Result<Vec<ContentSnapshot>>;

    /// Load archived content by its `content_ref`.
    async fn load_content(&self, content_ref: &str) -> Result<Option<ArchivedContent>>;

    /// Persist a snapshot with its change record and assessment.
    ///
    /// Fails with a conflict when the snapshot sequence is not the next one
    /// for its source; nothing is written in that case.
    async fn commit_change(&self, commit: ChangeCommit) -> Result<()>;

    async fn get_change(&self, id: Uuid) -> Result<Option<ChangeView>>;

    async fn changes(&self, filter: &RecordFilter) -> Result<Vec<ChangeView>>;

    async fn open_job(&self, job: &JobExecution) -> Result<()>;

    async fn mark_job_retrying(&self, job_id: Uuid, attempt: u32, error: &str) -> Result<()>;

    /// Write the final state of a job. Ended jobs cannot be written again.
    async fn finish_job(&self, job: &JobExecution) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobExecution>>;

    async fn jobs(&self, filter: &RecordFilter) -> Result<Vec<JobExecution>>;

    /// Create a pending notification. Returns `false` without writing when
    /// one already exists for the same change, recipient and channel.
    async fn create_notification(&self, record: &NotificationRecord) -> Result<bool>;

    /// Update a non-terminal notification.
    async fn update_notification(&self, record: &NotificationRecord) -> Result<()>;

    async fn notifications(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>>;

    /// Append an audit entry that has no accompanying state change.
    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEntry>;

    async fn audit_entries(&self, filter: &RecordFilter) -> Result<Vec<AuditEntry>>;
}
