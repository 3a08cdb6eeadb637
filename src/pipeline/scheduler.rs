// src/pipeline/scheduler.rs

//! Job scheduler.
//!
//! Each source holds a state token: a cycle claims it before it starts and
//! the claim is released when the cycle's task ends, so a source never has
//! two cycles in flight. A semaphore bounds cycles executing across all
//! sources; claimed cycles wait there for a permit.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    AuditEvent, Cadence, DigestCadence, JobExecution, JobTrigger, NotifierConfig,
    RegulatorySource, SchedulerConfig,
};
use crate::services::dispatcher::FlushReport;
use crate::storage::{SourceHealth, Store};

use super::cycle::CycleRunner;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler view of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    /// Claimed by a job, which may still be waiting for a worker
    Running { job_id: Uuid },
}

/// Per-source state tokens.
#[derive(Default)]
struct SlotTable {
    running: Mutex<HashMap<String, Uuid>>,
}

impl SlotTable {
    /// Claim the source for `job_id`, or `None` when it is already claimed.
    fn try_claim(self: &Arc<Self>, source_id: &str, job_id: Uuid) -> Option<SlotGuard> {
        let mut running = lock(&self.running);
        if running.contains_key(source_id) {
            return None;
        }
        running.insert(source_id.to_string(), job_id);
        Some(SlotGuard {
            table: Arc::clone(self),
            source_id: source_id.to_string(),
        })
    }

    fn state(&self, source_id: &str) -> SourceState {
        match lock(&self.running).get(source_id) {
            Some(job_id) => SourceState::Running { job_id: *job_id },
            None => SourceState::Idle,
        }
    }
}

/// Releases a source's claim when dropped.
struct SlotGuard {
    table: Arc<SlotTable>,
    source_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.table.running).remove(&self.source_id);
    }
}

/// A started job.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    handle: JoinHandle<Result<JobExecution>>,
}

impl JobHandle {
    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<JobExecution> {
        self.handle
            .await
            .map_err(|e| AppError::cancelled(format!("job task ended abnormally: {e}")))?
    }
}

/// Next fire time of a cadence, remembered with the expression it came from.
type Due = (String, DateTime<Utc>);

/// Runs cycles on cadence and on demand.
pub struct Scheduler {
    runner: Arc<CycleRunner>,
    store: Arc<dyn Store>,
    slots: Arc<SlotTable>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    tick_interval: std::time::Duration,
    /// Sources present in the current configuration; `None` schedules all
    configured: RwLock<Option<HashSet<String>>>,
    source_due: Mutex<HashMap<String, Due>>,
    digests: Vec<(DigestCadence, Cadence)>,
    digest_due: Mutex<HashMap<DigestCadence, Due>>,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        notifier: &NotifierConfig,
        runner: Arc<CycleRunner>,
    ) -> Result<Self> {
        let digests = vec![
            (DigestCadence::Daily, Cadence::parse(&notifier.daily_digest)?),
            (DigestCadence::Weekly, Cadence::parse(&notifier.weekly_digest)?),
        ];
        Ok(Self {
            store: Arc::clone(runner.store()),
            runner,
            slots: Arc::new(SlotTable::default()),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            tick_interval: config.tick_interval(),
            configured: RwLock::new(None),
            source_due: Mutex::new(HashMap::new()),
            digests,
            digest_due: Mutex::new(HashMap::new()),
        })
    }

    pub fn state(&self, source_id: &str) -> SourceState {
        self.slots.state(source_id)
    }

    /// Token cancelled on shutdown; every cycle runs under a child of it.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Restrict cadence scheduling to the given sources.
    pub fn set_configured(&self, ids: HashSet<String>) {
        let mut configured = self.configured.write().unwrap_or_else(PoisonError::into_inner);
        *configured = Some(ids);
    }

    fn is_configured(&self, source_id: &str) -> bool {
        self.configured
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_none_or(|ids| ids.contains(source_id))
    }

    /// Start a cycle now, bypassing the source's cadence.
    pub async fn trigger_now(&self, source_id: &str) -> Result<JobHandle> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", source_id))?;
        if !source.enabled {
            return Err(AppError::SourceDisabled(source.id));
        }
        let handle = self.start(&source, JobTrigger::Manual)?;
        log::info!("Manual job {} queued for '{}'", handle.job_id, source.id);
        Ok(handle)
    }

    /// Claim the source and spawn its cycle.
    fn start(&self, source: &RegulatorySource, trigger: JobTrigger) -> Result<JobHandle> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::cancelled("scheduler is shutting down"));
        }
        let job_id = Uuid::new_v4();
        let guard = self
            .slots
            .try_claim(&source.id, job_id)
            .ok_or_else(|| AppError::AlreadyRunning(source.id.clone()))?;

        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let cancel = self.shutdown.clone();
        let source_id = source.id.clone();

        let handle = self.tracker.spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            let job = JobExecution::start(job_id, &source_id, trigger);
            match permit {
                Some(_permit) => runner.run(job, &cancel).await,
                None => {
                    runner
                        .abandon(job, "shutdown before a worker was free")
                        .await
                }
            }
        });
        Ok(JobHandle { job_id, handle })
    }

    /// Whether `key` is due at `now`, advancing its next fire time if so.
    ///
    /// A key seen for the first time, or whose expression changed, is
    /// scheduled for its next fire time after `now` and is not due yet.
    fn take_due<K>(
        due: &mut HashMap<K, Due>,
        key: K,
        cadence: &Cadence,
        now: DateTime<Utc>,
    ) -> bool
    where
        K: std::hash::Hash + Eq,
    {
        let expression = cadence.expression();
        let fire = match due.get(&key) {
            Some((expr, at)) if expr == expression => {
                if *at > now {
                    return false;
                }
                true
            }
            _ => false,
        };
        match cadence.next_after(now) {
            Some(next) => {
                due.insert(key, (expression.to_string(), next));
            }
            None => {
                due.remove(&key);
            }
        }
        fire
    }

    /// Evaluate cadences at `now` and start everything that is due.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobHandle>> {
        let mut started = Vec::new();

        for source in self.store.list_sources().await? {
            if !source.enabled || !self.is_configured(&source.id) {
                continue;
            }
            let due = Self::take_due(
                &mut *lock(&self.source_due),
                source.id.clone(),
                &source.cadence,
                now,
            );
            if !due {
                continue;
            }

            match self.start(&source, JobTrigger::Scheduled) {
                Ok(handle) => started.push(handle),
                Err(AppError::AlreadyRunning(_)) => {
                    log::warn!("Skipping '{}': previous cycle still in flight", source.id);
                    self.store
                        .append_audit(AuditEvent::JobSkipped {
                            source_id: source.id.clone(),
                            reason: "previous cycle still in flight".into(),
                        })
                        .await?;
                }
                Err(e) => log::error!("Could not start cycle for '{}': {}", source.id, e),
            }
        }

        for (cadence, schedule) in &self.digests {
            let due = Self::take_due(&mut *lock(&self.digest_due), *cadence, schedule, now);
            if due {
                let dispatcher = Arc::clone(self.runner.dispatcher());
                let cancel = self.shutdown.clone();
                let cadence = *cadence;
                self.tracker.spawn(async move {
                    dispatcher.flush_digests(cadence, &cancel).await;
                });
            }
        }

        Ok(started)
    }

    /// Tick on the configured interval until shutdown.
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        log::info!("Scheduler started (tick every {:?})", self.tick_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        log::error!("Scheduler tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// Re-enable a source after review, resetting its failure counter.
    pub async fn enable_source(&self, source_id: &str) -> Result<RegulatorySource> {
        let source = self
            .store
            .update_source_health(source_id, SourceHealth::reset())
            .await?;
        lock(&self.source_due).remove(source_id);
        log::info!("Source '{}' re-enabled", source_id);
        Ok(source)
    }

    /// Flush queued digests of the cadence now.
    pub async fn flush_digests(&self, cadence: DigestCadence) -> FlushReport {
        self.runner
            .dispatcher()
            .flush_digests(cadence, &self.shutdown)
            .await
    }

    /// Cancel in-flight work and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::models::{Config, JobOutcome, RecordFilter};
    use crate::testing::{Step, TestEngine, source_definition};
    use chrono::Duration;
    use tokio::sync::Notify;

    async fn engine(sources: &[&str], max_concurrent: usize) -> TestEngine {
        let mut config = Config::default();
        config.scheduler.max_concurrent = max_concurrent;
        for id in sources {
            config
                .sources
                .push(source_definition(id, &format!("mem://{id}")));
        }
        TestEngine::new(config).await
    }

    #[tokio::test]
    async fn test_second_trigger_is_rejected_while_running() {
        let t = engine(&["a"], 3).await;
        let gate = Arc::new(Notify::new());
        t.target
            .push("mem://a", Step::Gate(Arc::clone(&gate), "body".into()));
        let scheduler = t.engine.scheduler();

        let first = scheduler.trigger_now("a").await.unwrap();
        assert_eq!(
            scheduler.state("a"),
            SourceState::Running {
                job_id: first.job_id
            }
        );
        assert!(matches!(
            scheduler.trigger_now("a").await,
            Err(AppError::AlreadyRunning(_))
        ));

        gate.notify_one();
        let job = first.wait().await.unwrap();
        assert_eq!(job.outcome, JobOutcome::Succeeded);
        assert_eq!(scheduler.state("a"), SourceState::Idle);
        assert_eq!(t.target.calls("mem://a"), 1);
    }

    #[tokio::test]
    async fn test_due_cycle_for_busy_source_is_skipped_and_audited() {
        let t = engine(&["a"], 3).await;
        let gate = Arc::new(Notify::new());
        t.target
            .push("mem://a", Step::Gate(Arc::clone(&gate), "body".into()));
        let scheduler = t.engine.scheduler();

        let now = Utc::now();
        assert!(scheduler.tick(now).await.unwrap().is_empty());
        let started = scheduler.tick(now + Duration::seconds(2)).await.unwrap();
        assert_eq!(started.len(), 1);

        let skipped = scheduler.tick(now + Duration::seconds(4)).await.unwrap();
        assert!(skipped.is_empty());
        let kinds: Vec<_> = t
            .store
            .audit_entries(&RecordFilter::for_source("a"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event.kind())
            .collect();
        assert!(kinds.contains(&"job_skipped"));

        gate.notify_one();
        for handle in started {
            handle.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit_queues_cycles() {
        let t = engine(&["a", "b"], 1).await;
        let gate = Arc::new(Notify::new());
        t.target
            .push("mem://a", Step::Gate(Arc::clone(&gate), "a".into()));
        t.target.respond("mem://b", "b");
        let scheduler = t.engine.scheduler();

        let a = scheduler.trigger_now("a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let b = scheduler.trigger_now("b").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(t.target.calls("mem://b"), 0);

        gate.notify_one();
        assert_eq!(a.wait().await.unwrap().outcome, JobOutcome::Succeeded);
        assert_eq!(b.wait().await.unwrap().outcome, JobOutcome::Succeeded);
        assert_eq!(t.target.calls("mem://b"), 1);
    }

    #[tokio::test]
    async fn test_three_timed_out_cycles_count_three() {
        let t = engine(&["b"], 3).await;
        let scheduler = t.engine.scheduler();
        for _ in 0..3 {
            for _ in 0..3 {
                t.target.push("mem://b", Step::Hang);
            }
            let job = scheduler.trigger_now("b").await.unwrap().wait().await.unwrap();
            assert_eq!(job.outcome, JobOutcome::Failed);
        }

        let source = t.store.get_source("b").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 3);
        assert!(source.enabled);
        assert_eq!(t.target.calls("mem://b"), 9);
    }

    #[tokio::test]
    async fn test_five_failed_cycles_disable_until_reenabled() {
        let t = engine(&["c"], 3).await;
        let scheduler = t.engine.scheduler();
        for _ in 0..5 {
            t.target.push("mem://c", Step::Fail(FetchError::Status(500)));
            t.target.push("mem://c", Step::Fail(FetchError::Status(500)));
            t.target.push("mem://c", Step::Fail(FetchError::Status(500)));
            let job = scheduler.trigger_now("c").await.unwrap().wait().await.unwrap();
            assert_eq!(job.outcome, JobOutcome::Failed);
        }

        let source = t.store.get_source("c").await.unwrap().unwrap();
        assert!(!source.enabled);
        assert!(source.needs_review);
        assert_eq!(
            t.store
                .jobs(&RecordFilter::for_source("c"))
                .await
                .unwrap()
                .len(),
            5
        );

        assert!(matches!(
            scheduler.trigger_now("c").await,
            Err(AppError::SourceDisabled(_))
        ));
        let now = Utc::now();
        scheduler.tick(now).await.unwrap();
        assert!(scheduler
            .tick(now + Duration::seconds(2))
            .await
            .unwrap()
            .is_empty());

        scheduler.enable_source("c").await.unwrap();
        t.target.respond("mem://c", "back");
        let job = scheduler.trigger_now("c").await.unwrap().wait().await.unwrap();
        assert_eq!(job.outcome, JobOutcome::Succeeded);
        let source = t.store.get_source("c").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_unknown_source_is_rejected() {
        let t = engine(&[], 3).await;
        assert!(matches!(
            t.engine.scheduler().trigger_now("nope").await,
            Err(AppError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_cycles() {
        let t = engine(&["a"], 3).await;
        t.target.push("mem://a", Step::Hang);
        let scheduler = t.engine.scheduler();
        let handle = scheduler.trigger_now("a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        scheduler.shutdown().await;
        let job = handle.wait().await.unwrap();
        assert_eq!(job.outcome, JobOutcome::Failed);
        assert!(job.error.as_deref().unwrap().starts_with("cancelled"));
        assert!(matches!(
            scheduler.trigger_now("a").await,
            Err(AppError::Cancelled(_))
        ));
    }
}
