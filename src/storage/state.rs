//! Store state and its constraint-checked transitions.
//!
//! Every transition validates before it mutates, so a failed call leaves the
//! state untouched. Each transition appends its audit entries in the same
//! call, which is what makes an audit entry part of the state change it records.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    AuditEntry, AuditEvent, ChangeRecord, ContentSnapshot, DeliveryStatus, JobExecution, JobOutcome,
    NotificationRecord, RecordFilter, RegulatorySource, SeverityAssessment, SeverityTier,
    SourceDefinition,
};

use super::{ChangeCommit, ChangeView, SourceHealth};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    sources: BTreeMap<String, RegulatorySource>,
    /// Per source, ordered by sequence
    snapshots: BTreeMap<String, Vec<ContentSnapshot>>,
    changes: Vec<ChangeRecord>,
    assessments: Vec<SeverityAssessment>,
    jobs: Vec<JobExecution>,
    notifications: Vec<NotificationRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    audit: Vec<AuditEntry>,
    next_audit_sequence: u64,
}

impl StoreState {
    fn append(&mut self, event: AuditEvent, severity: Option<SeverityTier>) -> AuditEntry {
        let source_id = event.source_id().map(str::to_string);
        self.append_for(source_id, event, severity)
    }

    fn append_for(
        &mut self,
        source_id: Option<String>,
        event: AuditEvent,
        severity: Option<SeverityTier>,
    ) -> AuditEntry {
        self.next_audit_sequence += 1;
        let entry = AuditEntry {
            sequence: self.next_audit_sequence,
            recorded_at: Utc::now(),
            source_id,
            severity,
            event,
        };
        self.audit.push(entry.clone());
        entry
    }

    fn tier_of(&self, change_id: Uuid) -> Option<SeverityTier> {
        self.assessments
            .iter()
            .find(|a| a.change_id == change_id)
            .map(|a| a.tier)
    }

    // --- Sources ---

    pub fn register_source(&mut self, def: &SourceDefinition) -> RegulatorySource {
        match self.sources.get_mut(&def.id) {
            Some(existing) => {
                if existing.apply_definition(def) {
                    let updated = existing.clone();
                    self.append(
                        AuditEvent::SourceUpdated {
                            source_id: def.id.clone(),
                        },
                        None,
                    );
                    updated
                } else {
                    existing.clone()
                }
            }
            None => {
                let source = RegulatorySource::from_definition(def);
                self.sources.insert(source.id.clone(), source.clone());
                self.append(
                    AuditEvent::SourceRegistered {
                        source_id: def.id.clone(),
                    },
                    None,
                );
                source
            }
        }
    }

    pub fn source(&self, id: &str) -> Option<RegulatorySource> {
        self.sources.get(id).cloned()
    }

    pub fn sources(&self) -> Vec<RegulatorySource> {
        self.sources.values().cloned().collect()
    }

    pub fn update_source_health(
        &mut self,
        id: &str,
        health: SourceHealth,
    ) -> Result<RegulatorySource> {
        let source = self
            .sources
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("source", id))?;

        let was_enabled = source.enabled;
        source.consecutive_failures = health.consecutive_failures;
        source.enabled = health.enabled;
        source.needs_review = health.needs_review;
        source.updated_at = Utc::now();
        let updated = source.clone();

        if was_enabled && !updated.enabled {
            self.append(
                AuditEvent::SourceDisabled {
                    source_id: id.to_string(),
                    consecutive_failures: updated.consecutive_failures,
                },
                None,
            );
        } else if !was_enabled && updated.enabled {
            self.append(
                AuditEvent::SourceEnabled {
                    source_id: id.to_string(),
                },
                None,
            );
        }
        Ok(updated)
    }

    // --- Snapshots and changes ---

    pub fn latest_snapshot(&self, source_id: &str) -> Option<ContentSnapshot> {
        self.snapshots
            .get(source_id)
            .and_then(|list| list.last())
            .cloned()
    }

    pub fn snapshots(&self, source_id: &str) -> Vec<ContentSnapshot> {
        self.snapshots.get(source_id).cloned().unwrap_or_default()
    }

    /// Persist snapshot, change and assessment together.
    pub fn commit_change(&mut self, commit: &ChangeCommit) -> Result<()> {
        let snapshot = &commit.snapshot;
        let change = &commit.change;
        let assessment = &commit.assessment;

        if !self.sources.contains_key(&snapshot.source_id) {
            return Err(AppError::not_found("source", &snapshot.source_id));
        }
        let latest = self
            .latest_snapshot(&snapshot.source_id)
            .map_or(0, |s| s.sequence);
        if snapshot.sequence != latest + 1 {
            return Err(AppError::conflict(
                "snapshot",
                format!(
                    "source '{}' expected sequence {} but got {}",
                    snapshot.source_id,
                    latest + 1,
                    snapshot.sequence
                ),
            ));
        }
        if change.new_snapshot_id != Some(snapshot.id) || assessment.change_id != change.id {
            return Err(AppError::validation(
                "change commit references do not line up",
            ));
        }
        if self.changes.iter().any(|c| c.id == change.id) {
            return Err(AppError::conflict(
                "change",
                format!("change {} already recorded", change.id),
            ));
        }

        let tier = Some(assessment.tier);
        self.snapshots
            .entry(snapshot.source_id.clone())
            .or_default()
            .push(snapshot.clone());
        self.changes.push(change.clone());
        self.assessments.push(assessment.clone());

        self.append(
            AuditEvent::SnapshotCreated {
                snapshot: snapshot.clone(),
            },
            None,
        );
        self.append(
            AuditEvent::ChangeDetected {
                change: change.clone(),
            },
            tier,
        );
        self.append_for(
            Some(change.source_id.clone()),
            AuditEvent::SeverityAssessed {
                assessment: assessment.clone(),
            },
            tier,
        );
        if assessment.classification_failed {
            self.append_for(
                Some(change.source_id.clone()),
                AuditEvent::ClassificationFailed {
                    change_id: change.id,
                    reason: assessment.failure_reason.clone().unwrap_or_default(),
                },
                tier,
            );
        }
        Ok(())
    }

    pub fn change(&self, id: Uuid) -> Option<ChangeView> {
        self.changes.iter().find(|c| c.id == id).map(|change| ChangeView {
            change: change.clone(),
            assessment: self
                .assessments
                .iter()
                .find(|a| a.change_id == id)
                .cloned(),
        })
    }

    pub fn changes(&self, filter: &RecordFilter) -> Vec<ChangeView> {
        let matched = self
            .changes
            .iter()
            .filter(|c| {
                filter.matches(Some(&c.source_id), c.detected_at, self.tier_of(c.id))
            })
            .filter_map(|c| self.change(c.id))
            .collect();
        filter.apply_limit(matched)
    }

    // --- Jobs ---

    pub fn open_job(&mut self, job: &JobExecution) -> Result<()> {
        if self.jobs.iter().any(|j| j.id == job.id) {
            return Err(AppError::conflict(
                "job",
                format!("job {} already exists", job.id),
            ));
        }
        if job.is_ended() {
            return Err(AppError::validation("cannot open an ended job"));
        }
        self.jobs.push(job.clone());
        self.append(AuditEvent::JobStarted { job: job.clone() }, None);
        Ok(())
    }

    pub fn mark_job_retrying(&mut self, job_id: Uuid, attempt: u32, error: &str) -> Result<()> {
        let job = self.open_job_mut(job_id)?;
        job.outcome = JobOutcome::Retrying;
        let source_id = job.source_id.clone();
        self.append(
            AuditEvent::JobRetrying {
                job_id,
                source_id,
                attempt,
                error: error.to_string(),
            },
            None,
        );
        Ok(())
    }

    pub fn finish_job(&mut self, job: &JobExecution) -> Result<()> {
        if !job.is_ended() {
            return Err(AppError::validation("finish_job needs an ended job"));
        }
        let stored = self.open_job_mut(job.id)?;
        *stored = job.clone();
        self.append(AuditEvent::JobFinished { job: job.clone() }, None);
        Ok(())
    }

    fn open_job_mut(&mut self, job_id: Uuid) -> Result<&mut JobExecution> {
        let job = self
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::not_found("job", job_id))?;
        if job.is_ended() {
            return Err(AppError::validation(format!(
                "job {job_id} has ended and is immutable"
            )));
        }
        Ok(job)
    }

    pub fn job(&self, id: Uuid) -> Option<JobExecution> {
        self.jobs.iter().find(|j| j.id == id).cloned()
    }

    pub fn jobs(&self, filter: &RecordFilter) -> Vec<JobExecution> {
        let matched = self
            .jobs
            .iter()
            .filter(|j| filter.matches(Some(&j.source_id), j.started_at, None))
            .cloned()
            .collect();
        filter.apply_limit(matched)
    }

    // --- Notifications ---

    /// Returns `false` when the (change, recipient, channel) triple exists.
    pub fn create_notification(&mut self, record: &NotificationRecord) -> Result<bool> {
        let key = record.unique_key();
        if self.notifications.iter().any(|n| n.unique_key() == key) {
            return Ok(false);
        }
        if !self.changes.iter().any(|c| c.id == record.change_id) {
            return Err(AppError::not_found("change", record.change_id));
        }
        self.notifications.push(record.clone());
        let tier = self.tier_of(record.change_id);
        self.append(
            AuditEvent::NotificationQueued {
                notification: record.clone(),
            },
            tier,
        );
        Ok(true)
    }

    pub fn update_notification(&mut self, record: &NotificationRecord) -> Result<()> {
        let stored = self
            .notifications
            .iter_mut()
            .find(|n| n.id == record.id)
            .ok_or_else(|| AppError::not_found("notification", record.id))?;
        if stored.status.is_terminal() {
            return Err(AppError::validation(format!(
                "notification {} is already {:?}",
                record.id, stored.status
            )));
        }
        if stored.unique_key() != record.unique_key() {
            return Err(AppError::validation(
                "notification identity cannot change",
            ));
        }
        *stored = record.clone();

        let tier = self.tier_of(record.change_id);
        let event = match record.status {
            DeliveryStatus::Sent => Some(AuditEvent::NotificationSent {
                notification: record.clone(),
            }),
            DeliveryStatus::Failed => Some(AuditEvent::NotificationFailed {
                notification: record.clone(),
            }),
            DeliveryStatus::Pending => None,
        };
        if let Some(event) = event {
            self.append(event, tier);
        }
        Ok(())
    }

    pub fn notifications(&self, filter: &RecordFilter) -> Vec<NotificationRecord> {
        let matched = self
            .notifications
            .iter()
            .filter(|n| {
                filter.matches(
                    Some(&n.source_id),
                    n.created_at,
                    self.tier_of(n.change_id),
                )
            })
            .cloned()
            .collect();
        filter.apply_limit(matched)
    }

    // --- Audit ---

    pub fn append_audit(&mut self, event: AuditEvent) -> AuditEntry {
        self.append(event, None)
    }

    pub fn audit(&self, filter: &RecordFilter) -> Vec<AuditEntry> {
        filter_audit(&self.audit, filter)
    }

    /// Move out the audit entries appended so far, for storage elsewhere.
    pub fn take_audit(&mut self) -> Vec<AuditEntry> {
        std::mem::take(&mut self.audit)
    }
}

pub fn filter_audit(entries: &[AuditEntry], filter: &RecordFilter) -> Vec<AuditEntry> {
    let matched = entries
        .iter()
        .filter(|e| filter.matches(e.source_id.as_deref(), e.recorded_at, e.severity))
        .cloned()
        .collect();
    filter.apply_limit(matched)
}
