//! In-memory storage, used by tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ArchivedContent, AuditEntry, AuditEvent, ContentSnapshot, JobExecution, NotificationRecord,
    RecordFilter, RegulatorySource, SourceDefinition,
};

use super::{ChangeCommit, ChangeView, SourceHealth, Store, StoreState};

/// Store that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    contents: Mutex<HashMap<String, ArchivedContent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_source(&self, def: &SourceDefinition) -> Result<RegulatorySource> {
        Ok(self.state.lock().await.register_source(def))
    }

    async fn get_source(&self, id: &str) -> Result<Option<RegulatorySource>> {
        Ok(self.state.lock().await.source(id))
    }

    async fn list_sources(&self) -> Result<Vec<RegulatorySource>> {
        Ok(self.state.lock().await.sources())
    }

    async fn update_source_health(
        &self,
        id: &str,
        health: SourceHealth,
    ) -> Result<RegulatorySource> {
        self.state.lock().await.update_source_health(id, health)
    }

    async fn latest_snapshot(&self, source_id: &str) -> Result<Option<ContentSnapshot>> {
        Ok(self.state.lock().await.latest_snapshot(source_id))
    }

    async fn snapshots(&self, source_id: &str) -> Result<Vec<ContentSnapshot>> {
        Ok(self.state.lock().await.snapshots(source_id))
    }

    async fn load_content(&self, content_ref: &str) -> Result<Option<ArchivedContent>> {
        Ok(self.contents.lock().await.get(content_ref).cloned())
    }

    async fn commit_change(&self, commit: ChangeCommit) -> Result<()> {
        let mut state = self.state.lock().await;
        state.commit_change(&commit)?;
        self.contents
            .lock()
            .await
            .insert(commit.snapshot.content_ref, commit.content);
        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> Result<Option<ChangeView>> {
        Ok(self.state.lock().await.change(id))
    }

    async fn changes(&self, filter: &RecordFilter) -> Result<Vec<ChangeView>> {
        Ok(self.state.lock().await.changes(filter))
    }

    async fn open_job(&self, job: &JobExecution) -> Result<()> {
        self.state.lock().await.open_job(job)
    }

    async fn mark_job_retrying(&self, job_id: Uuid, attempt: u32, error: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .mark_job_retrying(job_id, attempt, error)
    }

    async fn finish_job(&self, job: &JobExecution) -> Result<()> {
        self.state.lock().await.finish_job(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobExecution>> {
        Ok(self.state.lock().await.job(id))
    }

    async fn jobs(&self, filter: &RecordFilter) -> Result<Vec<JobExecution>> {
        Ok(self.state.lock().await.jobs(filter))
    }

    async fn create_notification(&self, record: &NotificationRecord) -> Result<bool> {
        self.state.lock().await.create_notification(record)
    }

    async fn update_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.state.lock().await.update_notification(record)
    }

    async fn notifications(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>> {
        Ok(self.state.lock().await.notifications(filter))
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEntry> {
        Ok(self.state.lock().await.append_audit(event))
    }

    async fn audit_entries(&self, filter: &RecordFilter) -> Result<Vec<AuditEntry>> {
        Ok(self.state.lock().await.audit(filter))
    }
}
