// src/testing.rs

//! In-crate test doubles: a scripted fetch target, a recording delivery
//! channel and a wired engine.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{AppError, DeliveryError, FetchError, Result};
use crate::models::{
    ArchivedContent, AuditEntry, AuditEvent, ChannelId, Config, ContentSnapshot, DigestCadence,
    JobExecution, NotificationPreference, NotificationRecord, RecordFilter, RegulatorySource,
    SeverityTier, SourceDefinition,
};
use crate::pipeline::engine::{Engine, EngineBuilder};
use crate::services::delivery::{ChannelRouter, DeliveryChannel, Message};
use crate::services::fetcher::FetchTarget;
use crate::storage::{ChangeCommit, ChangeView, MemoryStore, SourceHealth, Store};
use crate::utils::retry::RetryPolicy;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One scripted response of a [`ScriptedTarget`].
#[derive(Debug, Clone)]
pub enum Step {
    Body(String),
    Fail(FetchError),
    /// Never completes; the fetcher's attempt timeout ends it
    Hang,
    /// Waits until the gate is notified, then returns the body
    Gate(Arc<Notify>, String),
}

#[derive(Default)]
struct Script {
    steps: VecDeque<Step>,
    sticky: Option<String>,
    calls: usize,
}

/// Fetch target answering from per-target scripts.
///
/// Queued steps are consumed in order; once empty, the sticky response (if
/// any) answers every call, otherwise the call fails with a connection error.
#[derive(Default)]
pub struct ScriptedTarget {
    scripts: Mutex<HashMap<String, Script>>,
}

impl ScriptedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, target: &str, step: Step) {
        lock(&self.scripts)
            .entry(target.to_string())
            .or_default()
            .steps
            .push_back(step);
    }

    /// Answer with `body` once the queued steps run out.
    pub fn respond(&self, target: &str, body: &str) {
        lock(&self.scripts)
            .entry(target.to_string())
            .or_default()
            .sticky = Some(body.to_string());
    }

    pub fn calls(&self, target: &str) -> usize {
        lock(&self.scripts).get(target).map_or(0, |s| s.calls)
    }
}

#[async_trait]
impl FetchTarget for ScriptedTarget {
    async fn retrieve(&self, target: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let step = {
            let mut scripts = lock(&self.scripts);
            let script = scripts.entry(target.to_string()).or_default();
            script.calls += 1;
            match script.steps.pop_front() {
                Some(step) => step,
                None => match &script.sticky {
                    Some(body) => Step::Body(body.clone()),
                    None => Step::Fail(FetchError::Connection(format!("no script for {target}"))),
                },
            }
        };

        match step {
            Step::Body(body) => Ok(body.into_bytes()),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
            Step::Gate(gate, body) => {
                gate.notified().await;
                Ok(body.into_bytes())
            }
        }
    }
}

/// A message handed to a [`RecordingChannel`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub address: String,
    pub message: Message,
}

/// Delivery channel that records messages and fails on request.
#[derive(Default)]
pub struct RecordingChannel {
    deliveries: Mutex<Vec<Delivery>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries with `error`.
    pub fn fail_next(&self, n: usize, error: DeliveryError) {
        let mut failures = lock(&self.failures);
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Take `delay` over every delivery from now on.
    pub fn slow_down(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Successful deliveries so far.
    pub fn deliveries(&self) -> Vec<Delivery> {
        lock(&self.deliveries).clone()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    async fn deliver(
        &self,
        address: &str,
        message: &Message,
    ) -> std::result::Result<(), DeliveryError> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.failures).pop_front() {
            return Err(error);
        }
        lock(&self.deliveries).push(Delivery {
            address: address.to_string(),
            message: message.clone(),
        });
        Ok(())
    }
}

/// Memory store whose notification updates can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_updates: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `update_notification`.
    pub fn fail_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn register_source(&self, def: &SourceDefinition) -> Result<RegulatorySource> {
        self.inner.register_source(def).await
    }

    async fn get_source(&self, id: &str) -> Result<Option<RegulatorySource>> {
        self.inner.get_source(id).await
    }

    async fn list_sources(&self) -> Result<Vec<RegulatorySource>> {
        self.inner.list_sources().await
    }

    async fn update_source_health(
        &self,
        id: &str,
        health: SourceHealth,
    ) -> Result<RegulatorySource> {
        self.inner.update_source_health(id, health).await
    }

    async fn latest_snapshot(&self, source_id: &str) -> Result<Option<ContentSnapshot>> {
        self.inner.latest_snapshot(source_id).await
    }

    async fn snapshots(&self, source_id: &str) -> Result<Vec<ContentSnapshot>> {
        self.inner.snapshots(source_id).await
    }

    async fn load_content(&self, content_ref: &str) -> Result<Option<ArchivedContent>> {
        self.inner.load_content(content_ref).await
    }

    async fn commit_change(&self, commit: ChangeCommit) -> Result<()> {
        self.inner.commit_change(commit).await
    }

    async fn get_change(&self, id: Uuid) -> Result<Option<ChangeView>> {
        self.inner.get_change(id).await
    }

    async fn changes(&self, filter: &RecordFilter) -> Result<Vec<ChangeView>> {
        self.inner.changes(filter).await
    }

    async fn open_job(&self, job: &JobExecution) -> Result<()> {
        self.inner.open_job(job).await
    }

    async fn mark_job_retrying(&self, job_id: Uuid, attempt: u32, error: &str) -> Result<()> {
        self.inner.mark_job_retrying(job_id, attempt, error).await
    }

    async fn finish_job(&self, job: &JobExecution) -> Result<()> {
        self.inner.finish_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobExecution>> {
        self.inner.get_job(id).await
    }

    async fn jobs(&self, filter: &RecordFilter) -> Result<Vec<JobExecution>> {
        self.inner.jobs(filter).await
    }

    async fn create_notification(&self, record: &NotificationRecord) -> Result<bool> {
        self.inner.create_notification(record).await
    }

    async fn update_notification(&self, record: &NotificationRecord) -> Result<()> {
        let failing = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::Io(std::io::Error::other("disk full")));
        }
        self.inner.update_notification(record).await
    }

    async fn notifications(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>> {
        self.inner.notifications(filter).await
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.inner.append_audit(event).await
    }

    async fn audit_entries(&self, filter: &RecordFilter) -> Result<Vec<AuditEntry>> {
        self.inner.audit_entries(filter).await
    }
}

/// Source definition for a scripted target.
pub fn source_definition(id: &str, target: &str) -> SourceDefinition {
    toml::from_str(&format!(
        r#"
        id = "{id}"
        target = "{target}"
        cadence = "* * * * * *"
        "#
    ))
    .unwrap()
}

/// Recipient reached through the `test` channel.
pub fn recipient(id: &str, min_severity: SeverityTier, cadence: DigestCadence) -> NotificationPreference {
    NotificationPreference {
        recipient_id: id.to_string(),
        address: format!("{id}@example.org"),
        min_severity,
        channels: BTreeSet::from([ChannelId::new("test")]),
        cadence,
        enabled: true,
        sources: BTreeSet::new(),
    }
}

/// An engine over a memory store, a scripted target and a recording channel
/// registered as `test`.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub target: Arc<ScriptedTarget>,
    pub channel: Arc<RecordingChannel>,
}

impl TestEngine {
    pub async fn new(config: Config) -> Self {
        Self::with(config, |builder| builder).await
    }

    /// Like [`TestEngine::new`], with a final say over the builder.
    pub async fn with(
        mut config: Config,
        customize: impl FnOnce(EngineBuilder) -> EngineBuilder,
    ) -> Self {
        config.fetcher.min_request_interval_ms = 0;
        let store = Arc::new(MemoryStore::new());
        let target = Arc::new(ScriptedTarget::new());
        let channel = Arc::new(RecordingChannel::new());
        let mut router = ChannelRouter::new();
        router.register(ChannelId::new("test"), channel.clone());

        let builder = EngineBuilder::new(config)
            .store(store.clone())
            .target(target.clone())
            .router(router)
            .fetch_policy(RetryPolicy::immediate(3))
            .delivery_policy(RetryPolicy::immediate(3))
            .attempt_timeout(std::time::Duration::from_millis(50));
        let engine = customize(builder).build().await.unwrap();

        Self {
            engine,
            store,
            target,
            channel,
        }
    }
}
