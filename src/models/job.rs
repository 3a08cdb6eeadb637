//! Job executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of a job cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    /// Cycle in progress
    Running,
    /// Cycle in progress, the fetcher is backing off after a transient error
    Retrying,
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobTrigger {
    Scheduled,
    Manual,
}

/// One scheduler invocation for one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobExecution {
    pub id: Uuid,
    pub source_id: String,
    pub trigger: JobTrigger,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: JobOutcome,
    pub error: Option<String>,
    pub items_processed: u32,
}

impl JobExecution {
    /// Open a new execution.
    pub fn start(id: Uuid, source_id: &str, trigger: JobTrigger) -> Self {
        Self {
            id,
            source_id: source_id.to_string(),
            trigger,
            started_at: Utc::now(),
            ended_at: None,
            outcome: JobOutcome::Running,
            error: None,
            items_processed: 0,
        }
    }

    /// An execution is immutable once it has ended.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Close the execution as succeeded.
    pub fn succeed(mut self, items_processed: u32) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = JobOutcome::Succeeded;
        self.items_processed = items_processed;
        self
    }

    /// Close the execution as failed.
    pub fn fail(mut self, error: impl Into<String>, items_processed: u32) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = JobOutcome::Failed;
        self.error = Some(error.into());
        self.items_processed = items_processed;
        self
    }
}
