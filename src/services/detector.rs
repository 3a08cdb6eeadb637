// src/services/detector.rs

//! Change detection against the latest snapshot.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ArchivedContent, ChangeRecord, ChangeType, ContentSnapshot, DetectorConfig, RawContent,
    RegulatorySource, SeverityAssessment,
};
use crate::pipeline::diff::{DiffCalculator, LineDiff};
use crate::storage::{ChangeCommit, Store};
use crate::utils::text;

/// Outcome of comparing fetched content with the latest snapshot.
///
/// Nothing is persisted until [`ChangeDetector::commit`].
#[derive(Debug, Clone)]
pub struct Detection {
    pub change: ChangeRecord,
    /// New snapshot, absent when nothing changed
    pub snapshot: Option<ContentSnapshot>,
    /// Normalized text of the prior snapshot, empty without one
    pub prior_text: String,
    pub new_text: String,
    pub raw: Vec<u8>,
    pub diff: LineDiff,
}

impl Detection {
    pub fn is_change(&self) -> bool {
        self.change.is_change()
    }
}

/// Compares fetched content with stored snapshots.
pub struct ChangeDetector {
    store: Arc<dyn Store>,
    diff: DiffCalculator,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn Store>, config: &DetectorConfig) -> Self {
        Self {
            store,
            diff: DiffCalculator::new(config.max_diff_bytes),
        }
    }

    /// Compare `content` with the source's latest snapshot.
    pub async fn detect(&self, source: &RegulatorySource, content: RawContent) -> Result<Detection> {
        let fingerprint = text::fingerprint(&content.text);
        let latest = self.store.latest_snapshot(&source.id).await?;

        if let Some(prior) = latest.as_ref().filter(|s| s.fingerprint == fingerprint) {
            log::debug!(
                "'{}' unchanged since snapshot {}",
                source.id,
                prior.sequence
            );
            return Ok(Detection {
                change: ChangeRecord {
                    id: Uuid::new_v4(),
                    source_id: source.id.clone(),
                    prior_snapshot_id: Some(prior.id),
                    new_snapshot_id: None,
                    change_type: ChangeType::None,
                    diff_summary: String::new(),
                    detected_at: Utc::now(),
                },
                snapshot: None,
                prior_text: content.text.clone(),
                new_text: content.text,
                raw: content.raw,
                diff: LineDiff::default(),
            });
        }

        let prior_text = match &latest {
            Some(prior) => self
                .store
                .load_content(&prior.content_ref)
                .await?
                .map(|archived| archived.text)
                .ok_or_else(|| AppError::not_found("snapshot content", &prior.content_ref))?,
            None => String::new(),
        };

        let change_type = match &latest {
            None => ChangeType::Added,
            Some(_) if content.text.is_empty() && !prior_text.is_empty() => ChangeType::Removed,
            Some(_) => ChangeType::Modified,
        };

        let sequence = latest.as_ref().map_or(1, |s| s.sequence + 1);
        let snapshot = ContentSnapshot {
            id: Uuid::new_v4(),
            source_id: source.id.clone(),
            fetched_at: content.fetched_at,
            fingerprint,
            content_ref: ContentSnapshot::content_key(&source.id, sequence),
            sequence,
        };

        let diff = self.diff.calculate(&prior_text, &content.text);
        let change = ChangeRecord {
            id: Uuid::new_v4(),
            source_id: source.id.clone(),
            prior_snapshot_id: latest.as_ref().map(|s| s.id),
            new_snapshot_id: Some(snapshot.id),
            change_type,
            diff_summary: self.diff.summarize(&diff),
            detected_at: Utc::now(),
        };
        log::info!(
            "'{}' {} at sequence {} ({} lines changed)",
            source.id,
            change_type.as_str(),
            sequence,
            diff.change_count()
        );

        Ok(Detection {
            change,
            snapshot: Some(snapshot),
            prior_text,
            new_text: content.text,
            raw: content.raw,
            diff,
        })
    }

    /// Persist the detection's snapshot, change and assessment together.
    ///
    /// A detection without change writes nothing.
    pub async fn commit(&self, detection: &Detection, assessment: &SeverityAssessment) -> Result<()> {
        let Some(snapshot) = &detection.snapshot else {
            return Ok(());
        };
        self.store
            .commit_change(ChangeCommit {
                snapshot: snapshot.clone(),
                content: ArchivedContent {
                    raw: detection.raw.clone(),
                    text: detection.new_text.clone(),
                },
                change: detection.change.clone(),
                assessment: assessment.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SeverityTier, SourceDefinition};
    use crate::storage::MemoryStore;
    use std::collections::BTreeSet;

    async fn setup() -> (ChangeDetector, Arc<MemoryStore>, RegulatorySource) {
        let store = Arc::new(MemoryStore::new());
        let def: SourceDefinition = toml::from_str(
            r#"
            id = "fca"
            target = "mem://fca"
            cadence = "0 * * * *"
            "#,
        )
        .unwrap();
        let source = store.register_source(&def).await.unwrap();
        let detector = ChangeDetector::new(store.clone(), &DetectorConfig::default());
        (detector, store, source)
    }

    fn content(text: &str) -> RawContent {
        RawContent {
            raw: text.as_bytes().to_vec(),
            text: text.to_string(),
            fetched_at: Utc::now(),
            attempts: 1,
        }
    }

    fn assessment(detection: &Detection) -> SeverityAssessment {
        SeverityAssessment {
            id: Uuid::new_v4(),
            change_id: detection.change.id,
            similarity: 0.5,
            tier: SeverityTier::Medium,
            topics: BTreeSet::new(),
            classification_failed: false,
            failure_reason: None,
        }
    }

    async fn detect_and_commit(
        detector: &ChangeDetector,
        source: &RegulatorySource,
        text: &str,
    ) -> Detection {
        let detection = detector.detect(source, content(text)).await.unwrap();
        detector
            .commit(&detection, &assessment(&detection))
            .await
            .unwrap();
        detection
    }

    #[tokio::test]
    async fn test_first_snapshot_is_added() {
        let (detector, _, source) = setup().await;
        let detection = detect_and_commit(&detector, &source, "Rule 1").await;
        assert_eq!(detection.change.change_type, ChangeType::Added);
        assert_eq!(detection.snapshot.unwrap().sequence, 1);
        assert!(detection.change.prior_snapshot_id.is_none());
        assert_eq!(detection.change.diff_summary, "+ Rule 1");
    }

    #[tokio::test]
    async fn test_identical_content_is_none() {
        let (detector, store, source) = setup().await;
        detect_and_commit(&detector, &source, "X").await;

        let second = detect_and_commit(&detector, &source, "X").await;
        assert_eq!(second.change.change_type, ChangeType::None);
        assert!(second.snapshot.is_none());
        assert!(second.change.new_snapshot_id.is_none());
        assert_eq!(store.snapshots("fca").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_modified_and_removed() {
        let (detector, store, source) = setup().await;
        let first = detect_and_commit(&detector, &source, "Rule 1\nRule 2").await;

        let modified = detect_and_commit(&detector, &source, "Rule 1\nRule 2b").await;
        assert_eq!(modified.change.change_type, ChangeType::Modified);
        assert_eq!(modified.prior_text, "Rule 1\nRule 2");
        assert_eq!(
            modified.change.prior_snapshot_id,
            first.snapshot.map(|s| s.id)
        );
        assert_eq!(modified.change.diff_summary, "- Rule 2\n+ Rule 2b");

        let removed = detect_and_commit(&detector, &source, "").await;
        assert_eq!(removed.change.change_type, ChangeType::Removed);

        let sequences: Vec<u64> = store
            .snapshots("fca")
            .await
            .unwrap()
            .iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stale_detection_conflicts() {
        let (detector, _, source) = setup().await;
        let a = detector.detect(&source, content("A")).await.unwrap();
        let b = detector.detect(&source, content("B")).await.unwrap();

        detector.commit(&a, &assessment(&a)).await.unwrap();
        let err = detector.commit(&b, &assessment(&b)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict { .. }));
    }
}
