// src/pipeline/cycle.rs

//! One fetch/detect/classify/dispatch cycle for one source.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, FetchError, Result};
use crate::models::{AuditEvent, JobExecution, RegulatorySource};
use crate::services::classifier::SeverityClassifier;
use crate::services::detector::ChangeDetector;
use crate::services::dispatcher::NotificationDispatcher;
use crate::services::fetcher::{Fetcher, RetryObserver};
use crate::storage::Store;

use super::circuit_breaker::{CircuitBreaker, CycleVerdict};

/// How long a timed-out cycle gets to wind down after its token is cancelled.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Marks the job RETRYING whenever the fetcher backs off.
struct JobObserver<'a> {
    store: &'a dyn Store,
    job_id: Uuid,
}

#[async_trait]
impl RetryObserver for JobObserver<'_> {
    async fn on_retry(&self, attempt: u32, error: FetchError, _delay: Duration) {
        if let Err(e) = self
            .store
            .mark_job_retrying(self.job_id, attempt, &error.to_string())
            .await
        {
            log::warn!("Could not mark job {} as retrying: {}", self.job_id, e);
        }
    }
}

/// Runs job cycles and records their outcome.
pub struct CycleRunner {
    store: Arc<dyn Store>,
    fetcher: Fetcher,
    detector: ChangeDetector,
    classifier: SeverityClassifier,
    dispatcher: Arc<NotificationDispatcher>,
    breaker: CircuitBreaker,
    cycle_timeout: Duration,
}

impl CycleRunner {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Fetcher,
        detector: ChangeDetector,
        classifier: SeverityClassifier,
        dispatcher: Arc<NotificationDispatcher>,
        breaker: CircuitBreaker,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            fetcher,
            detector,
            classifier,
            dispatcher,
            breaker,
            cycle_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Run a cycle for the job's source and return the finished job.
    ///
    /// Errors are returned only when the job itself cannot be recorded; a
    /// failing cycle yields a FAILED job.
    pub async fn run(&self, job: JobExecution, cancel: &CancellationToken) -> Result<JobExecution> {
        let source = self
            .store
            .get_source(&job.source_id)
            .await?
            .ok_or_else(|| AppError::not_found("source", &job.source_id))?;

        self.store.open_job(&job).await?;
        log::info!("Job {} started for '{}'", job.id, source.id);

        let child = cancel.child_token();
        let committed = AtomicBool::new(false);
        let result = self
            .execute_with_deadline(&source, job.id, &child, &committed)
            .await;
        let (finished, verdict) = match result {
            Ok(items) => (job.succeed(items), CycleVerdict::Succeeded),
            Err(e) if e.is_cancellation() => {
                log::warn!("Job {} for '{}' cancelled: {}", job.id, source.id, e);
                (job.fail(format!("cancelled: {e}"), 0), CycleVerdict::Cancelled)
            }
            Err(e) if committed.load(Ordering::Acquire) => {
                // Not a source failure
                log::error!(
                    "Job {} for '{}' failed after its change was committed: {}",
                    job.id,
                    source.id,
                    e
                );
                (job.fail(e.to_string(), 1), CycleVerdict::Cancelled)
            }
            Err(e) => {
                log::error!("Job {} for '{}' failed: {}", job.id, source.id, e);
                (job.fail(e.to_string(), 0), CycleVerdict::Failed)
            }
        };

        self.store.finish_job(&finished).await?;
        self.apply_breaker(&source.id, verdict).await?;

        log::info!(
            "Job {} for '{}' finished {} ({} items)",
            finished.id,
            source.id,
            finished.outcome.as_str(),
            finished.items_processed
        );
        Ok(finished)
    }

    /// Record a job that never got to run.
    pub async fn abandon(&self, job: JobExecution, reason: &str) -> Result<JobExecution> {
        self.store.open_job(&job).await?;
        let finished = job.fail(format!("cancelled: {reason}"), 0);
        self.store.finish_job(&finished).await?;
        Ok(finished)
    }

    async fn apply_breaker(&self, source_id: &str, verdict: CycleVerdict) -> Result<()> {
        let Some(current) = self.store.get_source(source_id).await? else {
            return Ok(());
        };
        if let Some(health) = self.breaker.evaluate(&current, verdict) {
            self.store.update_source_health(source_id, health).await?;
        }
        Ok(())
    }

    async fn execute_with_deadline(
        &self,
        source: &RegulatorySource,
        job_id: Uuid,
        cancel: &CancellationToken,
        committed: &AtomicBool,
    ) -> Result<u32> {
        let work = self.execute(source, job_id, cancel, committed);
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => result,
            _ = tokio::time::sleep(self.cycle_timeout) => {
                log::error!(
                    "Job {} for '{}' exceeded {:?}, cancelling",
                    job_id,
                    source.id,
                    self.cycle_timeout
                );
                cancel.cancel();
                match tokio::time::timeout(CANCEL_GRACE, work).await {
                    Ok(Ok(items)) => {
                        log::warn!(
                            "Job {} for '{}' completed after its deadline",
                            job_id,
                            source.id
                        );
                        Ok(items)
                    }
                    _ => Err(AppError::CycleTimeout(self.cycle_timeout)),
                }
            }
        }
    }

    /// Returns the number of records written: the change plus its
    /// notifications.
    ///
    /// Cancellation is honored up to the commit. Once the change is on
    /// record the cycle runs to the end; deliveries cut short by the token
    /// are recorded FAILED.
    async fn execute(
        &self,
        source: &RegulatorySource,
        job_id: Uuid,
        cancel: &CancellationToken,
        committed: &AtomicBool,
    ) -> Result<u32> {
        let observer = JobObserver {
            store: self.store.as_ref(),
            job_id,
        };
        let content = self.fetcher.fetch(source, cancel, &observer).await?;
        let detection = self.detector.detect(source, content).await?;
        if !detection.is_change() {
            return Ok(0);
        }

        let assessment = self.classifier.classify(
            &detection.change,
            &detection.prior_text,
            &detection.new_text,
        );

        if cancel.is_cancelled() {
            return Err(AppError::cancelled("stopped before the change was committed"));
        }
        if let Err(e) = self.detector.commit(&detection, &assessment).await {
            if let AppError::Conflict { message, .. } = &e {
                log::error!("Conflict while committing '{}': {}", source.id, message);
                self.store
                    .append_audit(AuditEvent::ConflictDetected {
                        source_id: source.id.clone(),
                        detail: message.clone(),
                    })
                    .await?;
            }
            return Err(e);
        }
        committed.store(true, Ordering::Release);

        let notifications = self
            .dispatcher
            .dispatch(&detection.change, &assessment, cancel)
            .await?;
        if cancel.is_cancelled() {
            log::warn!(
                "Job {} for '{}' was cancelled while dispatching; undelivered notifications are FAILED",
                job_id,
                source.id
            );
        }
        Ok(1 + notifications.len() as u32)
    }
}
