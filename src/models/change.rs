//! Change records and their severity assessments.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of change between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// First snapshot of a source
    Added,
    Modified,
    /// Content disappeared
    Removed,
    /// Fingerprint unchanged
    None,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Removed => "REMOVED",
            Self::None => "NONE",
        }
    }
}

/// A detected change between the prior and the new snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub source_id: String,
    pub prior_snapshot_id: Option<Uuid>,

    /// Absent for `NONE`, which creates no snapshot
    pub new_snapshot_id: Option<Uuid>,

    pub change_type: ChangeType,

    /// Line-level diff, capped in size
    pub diff_summary: String,

    pub detected_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn is_change(&self) -> bool {
        self.change_type != ChangeType::None
    }
}

/// Severity tiers, ordered from least to most significant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeverityTier {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "INFORMATIONAL",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse a tier name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFORMATIONAL" | "INFO" => Some(Self::Informational),
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for SeverityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity assessment attached to exactly one change record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeverityAssessment {
    pub id: Uuid,
    pub change_id: Uuid,

    /// Cosine similarity between old and new text, 0.0 to 1.0
    pub similarity: f64,

    pub tier: SeverityTier,

    /// Matched vocabulary topics
    pub topics: BTreeSet<String>,

    /// The classifier errored and the tier is a fallback
    #[serde(default)]
    pub classification_failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SeverityAssessment {
    /// Fallback assessment used when classification fails.
    pub fn failed(change_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_id,
            similarity: 1.0,
            tier: SeverityTier::Informational,
            topics: BTreeSet::new(),
            classification_failed: true,
            failure_reason: Some(reason.into()),
        }
    }
}
