// src/services/audit.rs

//! Read-only queries over the audit trail.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{AuditEntry, JobExecution, NotificationRecord, RecordFilter};
use crate::storage::{ChangeView, Store};

/// Query facade over recorded changes, jobs, notifications and audit entries.
///
/// Exposes no writes; every entry is appended by the store alongside the
/// state change it records.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn Store>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Change records with their assessments.
    pub async fn changes(&self, filter: &RecordFilter) -> Result<Vec<ChangeView>> {
        self.store.changes(filter).await
    }

    pub async fn change(&self, id: Uuid) -> Result<Option<ChangeView>> {
        self.store.get_change(id).await
    }

    pub async fn jobs(&self, filter: &RecordFilter) -> Result<Vec<JobExecution>> {
        self.store.jobs(filter).await
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<JobExecution>> {
        self.store.get_job(id).await
    }

    pub async fn notifications(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>> {
        self.store.notifications(filter).await
    }

    /// Raw audit entries in append order.
    pub async fn entries(&self, filter: &RecordFilter) -> Result<Vec<AuditEntry>> {
        self.store.audit_entries(filter).await
    }
}
