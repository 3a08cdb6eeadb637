// src/services/classifier.rs

//! Severity classification.
//!
//! Old and new text are turned into term-frequency vectors and compared by
//! cosine similarity; the similarity maps onto a tier through configurable
//! thresholds. Topic tags come from vocabulary terms found in changed lines.
//! All maps are ordered, so the same input always yields the same output.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::error::ClassificationError;
use crate::models::{ChangeRecord, ChangeType, ClassifierConfig, SeverityAssessment, SeverityTier};
use crate::pipeline::diff::line_diff;
use crate::utils::text;

/// A topic and the token sequences that indicate it.
#[derive(Debug, Clone)]
struct Topic {
    name: String,
    phrases: Vec<Vec<String>>,
}

/// Assigns a severity tier and topic tags to a change.
#[derive(Debug, Clone)]
pub struct SeverityClassifier {
    config: ClassifierConfig,
    topics: Vec<Topic>,
}

impl SeverityClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let topics = config
            .vocabulary
            .iter()
            .map(|(name, terms)| Topic {
                name: name.clone(),
                phrases: terms
                    .iter()
                    .map(|term| text::terms(term))
                    .filter(|tokens| !tokens.is_empty())
                    .collect(),
            })
            .collect();
        Self {
            config: config.clone(),
            topics,
        }
    }

    /// Classify a change. Never fails: a classifier error yields an
    /// INFORMATIONAL assessment flagged as failed.
    pub fn classify(&self, change: &ChangeRecord, old_text: &str, new_text: &str) -> SeverityAssessment {
        match self.try_classify(change, old_text, new_text) {
            Ok(assessment) => assessment,
            Err(error) => {
                log::warn!("Classification of change {} failed: {}", change.id, error);
                SeverityAssessment::failed(change.id, error.to_string())
            }
        }
    }

    /// Classify a change, surfacing classifier errors.
    pub fn try_classify(
        &self,
        change: &ChangeRecord,
        old_text: &str,
        new_text: &str,
    ) -> Result<SeverityAssessment, ClassificationError> {
        let (similarity, tier, topics) = match change.change_type {
            ChangeType::None => (1.0, SeverityTier::Informational, BTreeSet::new()),
            ChangeType::Added => (
                0.0,
                self.config.baseline_tier,
                self.topics_in(new_text.lines()),
            ),
            ChangeType::Modified | ChangeType::Removed => {
                let similarity = cosine_similarity(old_text, new_text)?;
                let diff = line_diff(old_text, new_text);
                (
                    similarity,
                    self.config.thresholds.tier_for(similarity),
                    self.topics_in(diff.changed_lines()),
                )
            }
        };

        Ok(SeverityAssessment {
            id: Uuid::new_v4(),
            change_id: change.id,
            similarity,
            tier,
            topics,
            classification_failed: false,
            failure_reason: None,
        })
    }

    /// Topics whose phrases occur in any of the given lines.
    pub fn topics_in<'a>(&self, lines: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        for line in lines {
            let tokens = text::terms(line);
            if tokens.is_empty() {
                continue;
            }
            for topic in &self.topics {
                if found.contains(&topic.name) {
                    continue;
                }
                let matched = topic.phrases.iter().any(|phrase| {
                    tokens
                        .windows(phrase.len())
                        .any(|window| window == phrase.as_slice())
                });
                if matched {
                    found.insert(topic.name.clone());
                }
            }
        }
        found
    }
}

/// Term-frequency vector of a text.
fn term_frequencies(text: &str) -> BTreeMap<String, f64> {
    let mut counts = BTreeMap::new();
    for term in text::terms(text) {
        *counts.entry(term).or_insert(0.0) += 1.0;
    }
    counts
}

/// Cosine similarity of the term-frequency vectors of two texts.
///
/// A text without terms is orthogonal to one with terms. Two texts without
/// terms cannot be compared.
pub fn cosine_similarity(a: &str, b: &str) -> Result<f64, ClassificationError> {
    let va = term_frequencies(a);
    let vb = term_frequencies(b);
    if va.is_empty() && vb.is_empty() {
        return Err(ClassificationError::NoTerms);
    }
    if va.is_empty() || vb.is_empty() {
        return Ok(0.0);
    }

    let dot: f64 = va
        .iter()
        .filter_map(|(term, x)| vb.get(term).map(|y| x * y))
        .sum();
    let norm_a = va.values().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = vb.values().map(|x| x * x).sum::<f64>().sqrt();

    let similarity = dot / (norm_a * norm_b);
    if similarity.is_nan() {
        return Err(ClassificationError::InvalidScore(similarity));
    }
    Ok(similarity.clamp(0.0, 1.0))
}
