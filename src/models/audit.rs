//! Audit trail entries and query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::{ChangeRecord, SeverityAssessment, SeverityTier};
use super::job::JobExecution;
use super::notification::NotificationRecord;
use super::snapshot::ContentSnapshot;

/// Something that happened and must stay on record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    SourceRegistered { source_id: String },
    SourceUpdated { source_id: String },
    SourceDisabled { source_id: String, consecutive_failures: u32 },
    SourceEnabled { source_id: String },
    JobStarted { job: JobExecution },
    JobRetrying { job_id: Uuid, source_id: String, attempt: u32, error: String },
    JobFinished { job: JobExecution },
    JobSkipped { source_id: String, reason: String },
    SnapshotCreated { snapshot: ContentSnapshot },
    ChangeDetected { change: ChangeRecord },
    SeverityAssessed { assessment: SeverityAssessment },
    ClassificationFailed { change_id: Uuid, reason: String },
    ConflictDetected { source_id: String, detail: String },
    NotificationQueued { notification: NotificationRecord },
    NotificationSent { notification: NotificationRecord },
    NotificationFailed { notification: NotificationRecord },
}

impl AuditEvent {
    /// Source the event belongs to, when there is one.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::SourceRegistered { source_id }
            | Self::SourceUpdated { source_id }
            | Self::SourceDisabled { source_id, .. }
            | Self::SourceEnabled { source_id }
            | Self::JobRetrying { source_id, .. }
            | Self::JobSkipped { source_id, .. }
            | Self::ConflictDetected { source_id, .. } => Some(source_id),
            Self::JobStarted { job } | Self::JobFinished { job } => Some(&job.source_id),
            Self::SnapshotCreated { snapshot } => Some(&snapshot.source_id),
            Self::ChangeDetected { change } => Some(&change.source_id),
            Self::NotificationQueued { notification }
            | Self::NotificationSent { notification }
            | Self::NotificationFailed { notification } => Some(&notification.source_id),
            Self::SeverityAssessed { .. } | Self::ClassificationFailed { .. } => None,
        }
    }

    /// Short event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceRegistered { .. } => "source_registered",
            Self::SourceUpdated { .. } => "source_updated",
            Self::SourceDisabled { .. } => "source_disabled",
            Self::SourceEnabled { .. } => "source_enabled",
            Self::JobStarted { .. } => "job_started",
            Self::JobRetrying { .. } => "job_retrying",
            Self::JobFinished { .. } => "job_finished",
            Self::JobSkipped { .. } => "job_skipped",
            Self::SnapshotCreated { .. } => "snapshot_created",
            Self::ChangeDetected { .. } => "change_detected",
            Self::SeverityAssessed { .. } => "severity_assessed",
            Self::ClassificationFailed { .. } => "classification_failed",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::NotificationQueued { .. } => "notification_queued",
            Self::NotificationSent { .. } => "notification_sent",
            Self::NotificationFailed { .. } => "notification_failed",
        }
    }
}

/// A recorded audit event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Monotonic across the whole trail
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub source_id: Option<String>,
    pub severity: Option<SeverityTier>,
    pub event: AuditEvent,
}

/// Filter shared by all read queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub source_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,

    /// Minimum severity; entries without a severity never match
    pub min_severity: Option<SeverityTier>,

    /// Most recent N results
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Self::default()
        }
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn at_least(tier: SeverityTier) -> Self {
        Self {
            min_severity: Some(tier),
            ..Self::default()
        }
    }

    pub fn matches(
        &self,
        source_id: Option<&str>,
        at: DateTime<Utc>,
        severity: Option<SeverityTier>,
    ) -> bool {
        if let Some(wanted) = &self.source_id {
            if source_id != Some(wanted.as_str()) {
                return false;
            }
        }
        if self.from.is_some_and(|from| at < from) {
            return false;
        }
        if self.to.is_some_and(|to| at > to) {
            return false;
        }
        match (self.min_severity, severity) {
            (Some(min), Some(tier)) => tier >= min,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Keep only the newest `limit` items of an oldest-first list.
    pub fn apply_limit<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if let Some(limit) = self.limit {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        items
    }
}
