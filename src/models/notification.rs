//! Recipient preferences and notification records.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::change::SeverityTier;

/// Identifier of a delivery channel, e.g. `log` or `webhook`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How often a recipient wants to hear about changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DigestCadence {
    Immediate,
    Daily,
    Weekly,
}

impl DigestCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "IMMEDIATE",
            Self::Daily => "DAILY",
            Self::Weekly => "WEEKLY",
        }
    }
}

/// A recipient's notification preference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPreference {
    pub recipient_id: String,

    /// Address handed to the delivery channel
    pub address: String,

    #[serde(default = "default_min_severity")]
    pub min_severity: SeverityTier,

    pub channels: BTreeSet<ChannelId>,

    #[serde(default = "default_cadence")]
    pub cadence: DigestCadence,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Restrict to these source ids; empty means all sources
    #[serde(default)]
    pub sources: BTreeSet<String>,
}

fn default_min_severity() -> SeverityTier {
    SeverityTier::Medium
}

fn default_cadence() -> DigestCadence {
    DigestCadence::Immediate
}

fn default_enabled() -> bool {
    true
}

impl NotificationPreference {
    /// Whether a change of `tier` from `source_id` qualifies for this recipient.
    pub fn accepts(&self, source_id: &str, tier: SeverityTier) -> bool {
        self.enabled
            && tier >= self.min_severity
            && (self.sources.is_empty() || self.sources.contains(source_id))
    }
}

/// Delivery state of a notification record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// One notification of one change to one recipient over one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub recipient_id: String,
    pub change_id: Uuid,
    pub source_id: String,
    pub channel: ChannelId,
    pub cadence: DigestCadence,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Create a pending record.
    pub fn pending(
        pref: &NotificationPreference,
        change_id: Uuid,
        source_id: &str,
        channel: &ChannelId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: pref.recipient_id.clone(),
            change_id,
            source_id: source_id.to_string(),
            channel: channel.clone(),
            cadence: pref.cadence,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Uniqueness key: (change, recipient, channel).
    pub fn unique_key(&self) -> (Uuid, String, ChannelId) {
        (self.change_id, self.recipient_id.clone(), self.channel.clone())
    }
}
