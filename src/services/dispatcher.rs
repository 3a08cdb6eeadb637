// src/services/dispatcher.rs

//! Notification dispatch.
//!
//! Each qualifying (recipient, channel) pair gets one notification record per
//! change. Immediate recipients are delivered to right away with retry;
//! digest recipients are queued and delivered in one batch per channel when
//! their cadence flushes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{DeliveryError, Result};
use crate::models::{
    ChangeRecord, ChannelId, DeliveryStatus, DigestCadence, NotificationRecord, NotifierConfig,
    RecordFilter, SeverityAssessment,
};
use crate::services::delivery::{ChangeSummary, ChannelRouter, Message, PreferenceProvider};
use crate::services::digest::{DigestBuffer, DigestItem};
use crate::storage::Store;
use crate::utils::retry::{RetryError, RetryPolicy};

/// Recipients whose digests are sent concurrently during a flush.
const FLUSH_CONCURRENCY: usize = 4;

/// Counts from one digest flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Batched deliveries attempted
    pub deliveries: usize,
    /// Notifications marked SENT
    pub sent: usize,
    /// Notifications marked FAILED
    pub failed: usize,
    /// Notifications put back in the queue because their outcome could not
    /// be recorded
    pub requeued: usize,
}

impl FlushReport {
    fn add(&mut self, other: FlushReport) {
        self.deliveries += other.deliveries;
        self.sent += other.sent;
        self.failed += other.failed;
        self.requeued += other.requeued;
    }
}

/// Result of delivering one message with retry.
struct Attempted {
    attempts: u32,
    error: Option<String>,
}

/// Filters changes by preference and delivers notifications.
pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    preferences: Arc<dyn PreferenceProvider>,
    router: ChannelRouter,
    policy: RetryPolicy,
    digests: DigestBuffer,
}

impl NotificationDispatcher {
    pub fn new(
        config: &NotifierConfig,
        store: Arc<dyn Store>,
        preferences: Arc<dyn PreferenceProvider>,
        router: ChannelRouter,
    ) -> Self {
        Self {
            store,
            preferences,
            router,
            policy: RetryPolicy::for_notifier(config),
            digests: DigestBuffer::new(config.digest_capacity),
        }
    }

    /// Replace the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn digests(&self) -> &DigestBuffer {
        &self.digests
    }

    /// Create and deliver notifications for a committed change.
    ///
    /// Returns the records created by this call. A (change, recipient,
    /// channel) triple that already has a record is skipped.
    pub async fn dispatch(
        &self,
        change: &ChangeRecord,
        assessment: &SeverityAssessment,
        cancel: &CancellationToken,
    ) -> Result<Vec<NotificationRecord>> {
        if !change.is_change() {
            return Ok(Vec::new());
        }

        let summary = ChangeSummary::new(change, assessment);
        let mut created = Vec::new();

        for pref in self.preferences.preferences().await? {
            if !pref.accepts(&change.source_id, assessment.tier) {
                continue;
            }
            for channel in &pref.channels {
                let record =
                    NotificationRecord::pending(&pref, change.id, &change.source_id, channel);
                if !self.store.create_notification(&record).await? {
                    log::debug!(
                        "Notification of {} to {} via {} already exists",
                        change.id,
                        pref.recipient_id,
                        channel
                    );
                    continue;
                }

                match pref.cadence {
                    DigestCadence::Immediate => {
                        let message = Message::single(summary.clone());
                        let outcome = self
                            .deliver(channel, &pref.address, &message, cancel)
                            .await;
                        created.push(self.finalize(record, &outcome).await?);
                    }
                    DigestCadence::Daily | DigestCadence::Weekly => {
                        created.push(record.clone());
                        let item = DigestItem {
                            notification: record,
                            address: pref.address.clone(),
                            summary: summary.clone(),
                        };
                        if let Some(full) = self.digests.push(item) {
                            log::info!(
                                "Digest queue for {} is full, flushing early",
                                pref.recipient_id
                            );
                            self.send_digest(&pref.recipient_id, full, cancel).await;
                        }
                    }
                }
            }
        }
        Ok(created)
    }

    /// Drain every queue of the cadence and send one batch per recipient
    /// and channel.
    ///
    /// Items whose outcome cannot be recorded go back in the queue for the
    /// next flush.
    pub async fn flush_digests(
        &self,
        cadence: DigestCadence,
        cancel: &CancellationToken,
    ) -> FlushReport {
        let parts: Vec<FlushReport> = stream::iter(self.digests.drain(cadence))
            .map(|(recipient_id, items)| async move {
                self.send_digest(&recipient_id, items, cancel).await
            })
            .buffer_unordered(FLUSH_CONCURRENCY)
            .collect()
            .await;

        let mut report = FlushReport::default();
        for part in parts {
            report.add(part);
        }
        if report.deliveries > 0 {
            log::info!(
                "{} digest flush: {} deliveries, {} sent, {} failed, {} requeued",
                cadence.as_str(),
                report.deliveries,
                report.sent,
                report.failed,
                report.requeued
            );
        }
        report
    }

    /// Re-queue digest notifications left PENDING by a previous run.
    pub async fn restore_pending(&self) -> Result<usize> {
        let preferences = self.preferences.preferences().await?;
        let mut restored = 0;

        for record in self.store.notifications(&RecordFilter::default()).await? {
            if record.status != DeliveryStatus::Pending
                || record.cadence == DigestCadence::Immediate
                || self.digests.contains(record.id)
            {
                continue;
            }
            let Some(pref) = preferences
                .iter()
                .find(|p| p.recipient_id == record.recipient_id)
            else {
                log::warn!(
                    "Pending digest notification {} has no recipient '{}'",
                    record.id,
                    record.recipient_id
                );
                continue;
            };
            let Some(view) = self.store.get_change(record.change_id).await? else {
                continue;
            };
            let Some(assessment) = view.assessment else {
                continue;
            };

            // Restored items never trigger an early flush; the next
            // scheduled flush picks them up.
            let item = DigestItem {
                address: pref.address.clone(),
                summary: ChangeSummary::new(&view.change, &assessment),
                notification: record,
            };
            self.digests.requeue(vec![item]);
            restored += 1;
        }
        if restored > 0 {
            log::info!("Restored {} pending digest notifications", restored);
        }
        Ok(restored)
    }

    /// Send one batched message per channel for a recipient's items.
    async fn send_digest(
        &self,
        recipient_id: &str,
        items: Vec<DigestItem>,
        cancel: &CancellationToken,
    ) -> FlushReport {
        let mut by_channel: BTreeMap<ChannelId, Vec<DigestItem>> = BTreeMap::new();
        for item in items {
            by_channel
                .entry(item.notification.channel.clone())
                .or_default()
                .push(item);
        }

        let mut report = FlushReport::default();
        let mut unsent = Vec::new();
        for (channel, items) in by_channel {
            let Some(first) = items.first() else {
                continue;
            };
            let address = first.address.clone();
            let label = first.notification.cadence.as_str();
            let message = Message::digest(
                label,
                items.iter().map(|item| item.summary.clone()).collect(),
            );

            log::info!(
                "Sending {} digest with {} changes to {} via {}",
                label,
                items.len(),
                recipient_id,
                channel
            );
            let outcome = self.deliver(&channel, &address, &message, cancel).await;
            report.deliveries += 1;
            for item in items {
                match self.finalize(item.notification.clone(), &outcome).await {
                    Ok(record) if record.status == DeliveryStatus::Sent => report.sent += 1,
                    Ok(_) => report.failed += 1,
                    Err(e) => {
                        log::error!(
                            "Could not record digest notification {} for {}: {}",
                            item.notification.id,
                            recipient_id,
                            e
                        );
                        unsent.push(item);
                    }
                }
            }
        }

        if !unsent.is_empty() {
            report.requeued = unsent.len();
            self.digests.requeue(unsent);
        }
        report
    }

    /// Deliver a message with the retry policy.
    async fn deliver(
        &self,
        channel: &ChannelId,
        address: &str,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Attempted {
        let outcome = self
            .policy
            .run(
                cancel,
                DeliveryError::is_retryable,
                |attempt, error: &DeliveryError, delay: Duration| {
                    log::warn!(
                        "Delivery to {} via {} failed on attempt {}: {}. Retrying in {:?}",
                        address,
                        channel,
                        attempt,
                        error,
                        delay
                    );
                    std::future::ready(())
                },
                |attempt| async move {
                    self.router
                        .deliver(channel, address, message)
                        .await
                        .map(|()| attempt)
                },
            )
            .await;

        match outcome {
            Ok(attempts) => Attempted {
                attempts,
                error: None,
            },
            Err(RetryError::Exhausted { error, attempts })
            | Err(RetryError::Permanent { error, attempts }) => Attempted {
                attempts,
                error: Some(error.to_string()),
            },
            Err(RetryError::Cancelled { attempts }) => Attempted {
                attempts,
                error: Some(DeliveryError::Cancelled.to_string()),
            },
        }
    }

    /// Record the terminal state of a notification.
    async fn finalize(
        &self,
        mut record: NotificationRecord,
        outcome: &Attempted,
    ) -> Result<NotificationRecord> {
        record.attempts += outcome.attempts;
        record.last_attempt_at = Some(Utc::now());
        match &outcome.error {
            None => record.status = DeliveryStatus::Sent,
            Some(error) => {
                log::error!(
                    "Notification {} to {} FAILED: {}",
                    record.id,
                    record.recipient_id,
                    error
                );
                record.status = DeliveryStatus::Failed;
                record.last_error = Some(error.clone());
            }
        }
        self.store.update_notification(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NotificationPreference, SeverityTier};
    use crate::services::delivery::StaticPreferences;
    use crate::storage::MemoryStore;
    use crate::storage::tests::{commit_for, definition};
    use crate::testing::{FlakyStore, RecordingChannel};
    use std::collections::BTreeSet;

    fn pref(recipient: &str, min: SeverityTier, cadence: DigestCadence) -> NotificationPreference {
        NotificationPreference {
            recipient_id: recipient.into(),
            address: format!("{recipient}@example.org"),
            min_severity: min,
            channels: BTreeSet::from([ChannelId::new("test")]),
            cadence,
            enabled: true,
            sources: BTreeSet::new(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        channel: Arc<RecordingChannel>,
        dispatcher: NotificationDispatcher,
    }

    async fn fixture(prefs: Vec<NotificationPreference>, capacity: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store
            .register_source(&definition("fca"))
            .await
            .unwrap();
        let channel = Arc::new(RecordingChannel::new());
        let mut router = ChannelRouter::new();
        router.register(ChannelId::new("test"), channel.clone());
        let config = NotifierConfig {
            digest_capacity: capacity,
            ..NotifierConfig::default()
        };
        let dispatcher = NotificationDispatcher::new(
            &config,
            store.clone(),
            Arc::new(StaticPreferences::new(prefs)),
            router,
        )
        .with_policy(RetryPolicy::immediate(3));
        Fixture {
            store,
            channel,
            dispatcher,
        }
    }

    /// Commit a change at `sequence` and return it with its assessment.
    async fn committed(
        store: &MemoryStore,
        sequence: u64,
        tier: SeverityTier,
    ) -> (ChangeRecord, SeverityAssessment) {
        let mut commit = commit_for("fca", sequence, &format!("version {sequence}"));
        commit.assessment.tier = tier;
        let pair = (commit.change.clone(), commit.assessment.clone());
        store.commit_change(commit).await.unwrap();
        pair
    }

    #[tokio::test]
    async fn test_immediate_delivery_is_sent() {
        let f = fixture(
            vec![pref("alice", SeverityTier::High, DigestCadence::Immediate)],
            10,
        )
        .await;
        let (change, assessment) = committed(&f.store, 1, SeverityTier::Critical).await;

        let records = f
            .dispatcher
            .dispatch(&change, &assessment, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DeliveryStatus::Sent);
        assert_eq!(records[0].attempts, 1);
        assert_eq!(f.channel.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_below_min_severity_is_filtered() {
        let f = fixture(
            vec![pref("alice", SeverityTier::High, DigestCadence::Immediate)],
            10,
        )
        .await;
        let (change, assessment) = committed(&f.store, 1, SeverityTier::Medium).await;

        let records = f
            .dispatcher
            .dispatch(&change, &assessment, &CancellationToken::new())
            .await
            .unwrap();
        assert!(records.is_empty());
        assert!(f.channel.deliveries().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_twice_is_exactly_once() {
        let f = fixture(
            vec![pref("alice", SeverityTier::Low, DigestCadence::Immediate)],
            10,
        )
        .await;
        let (change, assessment) = committed(&f.store, 1, SeverityTier::High).await;
        let cancel = CancellationToken::new();

        assert_eq!(
            f.dispatcher
                .dispatch(&change, &assessment, &cancel)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(f
            .dispatcher
            .dispatch(&change, &assessment, &cancel)
            .await
            .unwrap()
            .is_empty());

        let stored = f
            .store
            .notifications(&RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(f.channel.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_fail() {
        let f = fixture(
            vec![pref("alice", SeverityTier::Low, DigestCadence::Immediate)],
            10,
        )
        .await;
        f.channel
            .fail_next(5, DeliveryError::Unavailable("smtp down".into()));
        let (change, assessment) = committed(&f.store, 1, SeverityTier::High).await;

        let records = f
            .dispatcher
            .dispatch(&change, &assessment, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records[0].status, DeliveryStatus::Failed);
        assert_eq!(records[0].attempts, 3);
        assert!(records[0].last_error.as_deref().unwrap().contains("smtp down"));

        let failed = f
            .store
            .audit_entries(&RecordFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event.kind() == "notification_failed")
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let f = fixture(
            vec![pref("alice", SeverityTier::Low, DigestCadence::Immediate)],
            10,
        )
        .await;
        f.channel
            .fail_next(1, DeliveryError::Rejected("bad address".into()));
        let (change, assessment) = committed(&f.store, 1, SeverityTier::High).await;

        let records = f
            .dispatcher
            .dispatch(&change, &assessment, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(records[0].status, DeliveryStatus::Failed);
        assert_eq!(records[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_daily_digest_batches_changes() {
        let f = fixture(
            vec![pref("bob", SeverityTier::Low, DigestCadence::Daily)],
            10,
        )
        .await;
        let cancel = CancellationToken::new();
        for sequence in 1..=2 {
            let (change, assessment) = committed(&f.store, sequence, SeverityTier::High).await;
            let records = f
                .dispatcher
                .dispatch(&change, &assessment, &cancel)
                .await
                .unwrap();
            assert_eq!(records[0].status, DeliveryStatus::Pending);
        }
        assert!(f.channel.deliveries().is_empty());

        // Weekly flush leaves daily queues alone
        let weekly = f
            .dispatcher
            .flush_digests(DigestCadence::Weekly, &cancel)
            .await;
        assert_eq!(weekly.deliveries, 0);

        let report = f
            .dispatcher
            .flush_digests(DigestCadence::Daily, &cancel)
            .await;
        assert_eq!(
            report,
            FlushReport {
                deliveries: 1,
                sent: 2,
                failed: 0,
                requeued: 0,
            }
        );

        let deliveries = f.channel.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message.changes.len(), 2);

        let stored = f
            .store
            .notifications(&RecordFilter::default())
            .await
            .unwrap();
        assert!(stored.iter().all(|n| n.status == DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn test_full_digest_flushes_early() {
        let f = fixture(
            vec![pref("bob", SeverityTier::Low, DigestCadence::Weekly)],
            2,
        )
        .await;
        let cancel = CancellationToken::new();
        for sequence in 1..=3 {
            let (change, assessment) = committed(&f.store, sequence, SeverityTier::High).await;
            f.dispatcher
                .dispatch(&change, &assessment, &cancel)
                .await
                .unwrap();
        }
        let deliveries = f.channel.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message.changes.len(), 2);
        assert_eq!(f.dispatcher.digests().len("bob", DigestCadence::Weekly), 1);
    }

    #[tokio::test]
    async fn test_restore_pending_digests() {
        let prefs = vec![pref("bob", SeverityTier::Low, DigestCadence::Daily)];
        let f = fixture(prefs.clone(), 10).await;
        let (change, assessment) = committed(&f.store, 1, SeverityTier::High).await;
        f.dispatcher
            .dispatch(&change, &assessment, &CancellationToken::new())
            .await
            .unwrap();

        // A fresh dispatcher over the same store starts with empty queues
        let mut router = ChannelRouter::new();
        router.register(ChannelId::new("test"), f.channel.clone());
        let restarted = NotificationDispatcher::new(
            &NotifierConfig::default(),
            f.store.clone(),
            Arc::new(StaticPreferences::new(prefs)),
            router,
        );
        assert_eq!(restarted.restore_pending().await.unwrap(), 1);
        assert_eq!(restarted.restore_pending().await.unwrap(), 0);
        assert_eq!(restarted.digests().len("bob", DigestCadence::Daily), 1);
    }

    #[tokio::test]
    async fn test_restore_at_capacity_keeps_every_item() {
        let prefs = vec![pref("bob", SeverityTier::Low, DigestCadence::Daily)];
        let f = fixture(prefs.clone(), 10).await;
        let cancel = CancellationToken::new();
        for sequence in 1..=3 {
            let (change, assessment) = committed(&f.store, sequence, SeverityTier::High).await;
            f.dispatcher
                .dispatch(&change, &assessment, &cancel)
                .await
                .unwrap();
        }

        let mut router = ChannelRouter::new();
        router.register(ChannelId::new("test"), f.channel.clone());
        let config = NotifierConfig {
            digest_capacity: 2,
            ..NotifierConfig::default()
        };
        let restarted = NotificationDispatcher::new(
            &config,
            f.store.clone(),
            Arc::new(StaticPreferences::new(prefs)),
            router,
        );
        assert_eq!(restarted.restore_pending().await.unwrap(), 3);
        assert_eq!(restarted.digests().len("bob", DigestCadence::Daily), 3);

        let report = restarted.flush_digests(DigestCadence::Daily, &cancel).await;
        assert_eq!(report.sent, 3);
        let pending = f
            .store
            .notifications(&RecordFilter::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.status == DeliveryStatus::Pending)
            .count();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_unrecorded_digest_items_are_requeued() {
        let store = Arc::new(FlakyStore::new());
        store.register_source(&definition("fca")).await.unwrap();
        let channel = Arc::new(RecordingChannel::new());
        let mut router = ChannelRouter::new();
        router.register(ChannelId::new("test"), channel.clone());
        let dispatcher = NotificationDispatcher::new(
            &NotifierConfig::default(),
            store.clone(),
            Arc::new(StaticPreferences::new(vec![
                pref("alice", SeverityTier::Low, DigestCadence::Daily),
                pref("bob", SeverityTier::Low, DigestCadence::Daily),
            ])),
            router,
        )
        .with_policy(RetryPolicy::immediate(3));

        let cancel = CancellationToken::new();
        let commit = commit_for("fca", 1, "version 1");
        let (change, assessment) = (commit.change.clone(), commit.assessment.clone());
        store.commit_change(commit).await.unwrap();
        dispatcher
            .dispatch(&change, &assessment, &cancel)
            .await
            .unwrap();

        store.fail_updates(1);
        let report = dispatcher.flush_digests(DigestCadence::Daily, &cancel).await;
        assert_eq!(report.deliveries, 2);
        assert_eq!(report.sent, 1);
        assert_eq!(report.requeued, 1);

        let queued = dispatcher.digests().len("alice", DigestCadence::Daily)
            + dispatcher.digests().len("bob", DigestCadence::Daily);
        assert_eq!(queued, 1);

        let retried = dispatcher.flush_digests(DigestCadence::Daily, &cancel).await;
        assert_eq!(retried.sent, 1);
        let stored = store.notifications(&RecordFilter::default()).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|n| n.status == DeliveryStatus::Sent));
    }
}
