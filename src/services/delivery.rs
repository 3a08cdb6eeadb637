// src/services/delivery.rs

//! Delivery channels and recipient preferences.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{DeliveryError, Result};
use crate::models::{
    ChangeRecord, ChangeType, ChannelId, NotificationPreference, SeverityAssessment, SeverityTier,
};
use crate::utils::http::create_webhook_client;

/// One change as presented to a recipient.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeSummary {
    pub change_id: Uuid,
    pub source_id: String,
    pub change_type: ChangeType,
    pub tier: SeverityTier,
    pub similarity: f64,
    pub topics: BTreeSet<String>,
    pub diff_summary: String,
    pub detected_at: DateTime<Utc>,
}

impl ChangeSummary {
    pub fn new(change: &ChangeRecord, assessment: &SeverityAssessment) -> Self {
        Self {
            change_id: change.id,
            source_id: change.source_id.clone(),
            change_type: change.change_type,
            tier: assessment.tier,
            similarity: assessment.similarity,
            topics: assessment.topics.clone(),
            diff_summary: change.diff_summary.clone(),
            detected_at: change.detected_at,
        }
    }

    fn headline(&self) -> String {
        format!(
            "[{}] {} change on '{}'",
            self.tier,
            self.change_type.as_str(),
            self.source_id
        )
    }
}

/// Payload handed to a delivery channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
    pub changes: Vec<ChangeSummary>,
}

impl Message {
    /// Message for a single change.
    pub fn single(summary: ChangeSummary) -> Self {
        let subject = summary.headline();
        let body = Self::describe(&summary);
        Self {
            subject,
            body,
            changes: vec![summary],
        }
    }

    /// Batched message for a digest.
    pub fn digest(label: &str, changes: Vec<ChangeSummary>) -> Self {
        let subject = format!("{} digest: {} regulatory changes", label, changes.len());
        let body = changes
            .iter()
            .map(Self::describe)
            .collect::<Vec<_>>()
            .join("\n\n");
        Self {
            subject,
            body,
            changes,
        }
    }

    fn describe(summary: &ChangeSummary) -> String {
        let mut text = summary.headline();
        if !summary.topics.is_empty() {
            let topics: Vec<&str> = summary.topics.iter().map(String::as_str).collect();
            text.push_str(&format!("\nTopics: {}", topics.join(", ")));
        }
        if !summary.diff_summary.is_empty() {
            text.push('\n');
            text.push_str(&summary.diff_summary);
        }
        text
    }
}

/// Transport for notifications.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(&self, address: &str, message: &Message)
    -> std::result::Result<(), DeliveryError>;
}

/// Routes channel ids to their transports.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    channels: HashMap<ChannelId, Arc<dyn DeliveryChannel>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the built-in `log` and `webhook` channels.
    pub fn with_defaults(user_agent: &str, webhook_timeout_secs: u64) -> Result<Self> {
        let mut router = Self::new();
        router.register(ChannelId::new("log"), Arc::new(LogChannel));
        router.register(
            ChannelId::new("webhook"),
            Arc::new(WebhookChannel::new(create_webhook_client(
                user_agent,
                webhook_timeout_secs,
            )?)),
        );
        Ok(router)
    }

    pub fn register(&mut self, id: ChannelId, channel: Arc<dyn DeliveryChannel>) {
        self.channels.insert(id, channel);
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    /// Deliver through the named channel.
    pub async fn deliver(
        &self,
        channel: &ChannelId,
        address: &str,
        message: &Message,
    ) -> std::result::Result<(), DeliveryError> {
        match self.channels.get(channel) {
            Some(transport) => transport.deliver(address, message).await,
            None => Err(DeliveryError::Rejected(format!(
                "no channel registered as '{channel}'"
            ))),
        }
    }
}

/// Writes notifications to the application log.
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    async fn deliver(
        &self,
        address: &str,
        message: &Message,
    ) -> std::result::Result<(), DeliveryError> {
        log::info!("Notify {}: {}", address, message.subject);
        for change in &message.changes {
            log::debug!("  {} {}", change.change_id, change.diff_summary);
        }
        Ok(())
    }
}

/// POSTs the message as JSON to the recipient address.
pub struct WebhookChannel {
    client: Client,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
    changes: &'a [ChangeSummary],
}

impl WebhookChannel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryChannel for WebhookChannel {
    async fn deliver(
        &self,
        address: &str,
        message: &Message,
    ) -> std::result::Result<(), DeliveryError> {
        let payload = WebhookPayload {
            subject: &message.subject,
            body: &message.body,
            changes: &message.changes,
        };
        let response = self
            .client
            .post(address)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    DeliveryError::Rejected(e.to_string())
                } else {
                    DeliveryError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.as_u16() == 429 || status.is_server_error() {
            Err(DeliveryError::Unavailable(format!("HTTP {status}")))
        } else {
            Err(DeliveryError::Rejected(format!("HTTP {status}")))
        }
    }
}

/// Source of recipient preferences.
#[async_trait]
pub trait PreferenceProvider: Send + Sync {
    async fn preferences(&self) -> Result<Vec<NotificationPreference>>;
}

/// Preferences held in memory, replaced on configuration reload.
#[derive(Default)]
pub struct StaticPreferences {
    preferences: RwLock<Vec<NotificationPreference>>,
}

impl StaticPreferences {
    pub fn new(preferences: Vec<NotificationPreference>) -> Self {
        Self {
            preferences: RwLock::new(preferences),
        }
    }

    pub async fn replace(&self, preferences: Vec<NotificationPreference>) {
        *self.preferences.write().await = preferences;
    }
}

#[async_trait]
impl PreferenceProvider for StaticPreferences {
    async fn preferences(&self) -> Result<Vec<NotificationPreference>> {
        Ok(self.preferences.read().await.clone())
    }
}
