//! Fetched content and persisted snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content returned by the fetcher.
#[derive(Debug, Clone)]
pub struct RawContent {
    /// Payload exactly as received, kept for archival
    pub raw: Vec<u8>,

    /// Parsed and normalized text
    pub text: String,

    pub fetched_at: DateTime<Utc>,

    /// Number of attempts the fetch needed
    pub attempts: u32,
}

/// An immutable snapshot of a source's content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentSnapshot {
    pub id: Uuid,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,

    /// Hex SHA-256 of the normalized text
    pub fingerprint: String,

    /// Archive key for the raw and normalized content
    pub content_ref: String,

    /// Monotonic, gap-free per source, starting at 1
    pub sequence: u64,
}

impl ContentSnapshot {
    /// Archive key for a snapshot's content.
    pub fn content_key(source_id: &str, sequence: u64) -> String {
        format!("snapshots/{}/{:08}", source_id, sequence)
    }
}

/// Archived payload of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedContent {
    pub raw: Vec<u8>,
    pub text: String,
}
