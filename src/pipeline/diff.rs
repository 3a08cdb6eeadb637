//! Line-level diff between two normalized texts.
//!
//! Lines are compared as multisets: a line present twice before and once
//! after counts as one removal. Order within each side follows the text.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::utils::text;

/// Appended when a summary was cut to fit its size cap.
pub const TRUNCATION_MARKER: &str = "[diff truncated]";

/// Lines added and removed between two texts.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LineDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl LineDiff {
    /// Check if there are any changes.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Get the total number of changed lines.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    /// Added and removed lines together.
    pub fn changed_lines(&self) -> impl Iterator<Item = &str> {
        self.removed
            .iter()
            .chain(self.added.iter())
            .map(String::as_str)
    }
}

/// Calculator for diffs and their capped summaries.
#[derive(Debug, Clone)]
pub struct DiffCalculator {
    /// Size cap for summaries in bytes
    max_bytes: usize,
}

impl DiffCalculator {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Calculate the diff between previous and current text.
    pub fn calculate(&self, previous: &str, current: &str) -> LineDiff {
        let mut unmatched: HashMap<&str, usize> = HashMap::new();
        for line in previous.lines() {
            *unmatched.entry(line).or_default() += 1;
        }
        let mut curr_counts: HashMap<&str, usize> = HashMap::new();
        for line in current.lines() {
            *curr_counts.entry(line).or_default() += 1;
        }

        // Added: occurrences in current beyond those in previous
        let mut added = Vec::new();
        for line in current.lines() {
            match unmatched.get_mut(line) {
                Some(count) if *count > 0 => *count -= 1,
                _ => added.push(line.to_string()),
            }
        }

        // Removed: occurrences in previous beyond those in current
        let mut removed = Vec::new();
        for line in previous.lines() {
            match curr_counts.get_mut(line) {
                Some(count) if *count > 0 => *count -= 1,
                _ => removed.push(line.to_string()),
            }
        }

        LineDiff { added, removed }
    }

    /// Render `- ` removed and `+ ` added lines, capped at the size limit.
    pub fn summarize(&self, diff: &LineDiff) -> String {
        let full = diff
            .removed
            .iter()
            .map(|line| format!("- {line}"))
            .chain(diff.added.iter().map(|line| format!("+ {line}")))
            .collect::<Vec<_>>()
            .join("\n");

        if full.len() <= self.max_bytes {
            return full;
        }
        if self.max_bytes <= TRUNCATION_MARKER.len() {
            return text::truncate_bytes(TRUNCATION_MARKER, self.max_bytes).to_string();
        }

        let budget = self.max_bytes - TRUNCATION_MARKER.len() - 1;
        let cut = text::truncate_bytes(&full, budget);
        // Prefer whole lines when at least one fits
        let kept = match cut.rfind('\n') {
            Some(end) => &cut[..end],
            None => cut,
        };
        if kept.is_empty() {
            TRUNCATION_MARKER.to_string()
        } else {
            format!("{kept}\n{TRUNCATION_MARKER}")
        }
    }
}

/// Convenience function to calculate a diff.
pub fn line_diff(previous: &str, current: &str) -> LineDiff {
    DiffCalculator::new(usize::MAX).calculate(previous, current)
}
