//! Monitored regulatory sources.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, Result};

/// Fetch cadence parsed from a cron expression.
///
/// Accepts the classic 5-field form (`min hour dom month dow`), the 6-field
/// form with leading seconds, and shorthands such as `@hourly`.
#[derive(Clone)]
pub struct Cadence {
    expression: String,
    schedule: Schedule,
}

impl Cadence {
    /// Parse a cron expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let schedule =
            Schedule::from_str(&normalized).map_err(|e| AppError::cadence(expression, e))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as written in configuration.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cadence").field(&self.expression).finish()
    }
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Serialize for Cadence {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        Cadence::parse(&expression).map_err(serde::de::Error::custom)
    }
}

/// Declarative source definition as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDefinition {
    /// Stable identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Fetch target reference (usually a URL)
    pub target: String,

    /// Parser identifier resolved through the parser registry
    #[serde(default = "default_parser")]
    pub parser: String,

    /// Cron expression
    pub cadence: Cadence,

    /// Initial enabled flag for newly registered sources
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_parser() -> String {
    "html".into()
}

fn default_enabled() -> bool {
    true
}

/// A monitored source with its health state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulatorySource {
    pub id: String,
    pub name: String,
    pub target: String,
    pub parser: String,
    pub cadence: Cadence,
    pub enabled: bool,

    /// Failed cycles since the last success
    pub consecutive_failures: u32,

    /// Set when the circuit breaker disabled the source
    #[serde(default)]
    pub needs_review: bool,

    pub updated_at: DateTime<Utc>,
}

impl RegulatorySource {
    /// Build a freshly registered source from its definition.
    pub fn from_definition(def: &SourceDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: if def.name.is_empty() {
                def.id.clone()
            } else {
                def.name.clone()
            },
            target: def.target.clone(),
            parser: def.parser.clone(),
            cadence: def.cadence.clone(),
            enabled: def.enabled,
            consecutive_failures: 0,
            needs_review: false,
            updated_at: Utc::now(),
        }
    }

    /// Apply an edited definition without touching health fields.
    pub fn apply_definition(&mut self, def: &SourceDefinition) -> bool {
        let name = if def.name.is_empty() { &def.id } else { &def.name };
        let changed = self.name != *name
            || self.target != def.target
            || self.parser != def.parser
            || self.cadence != def.cadence;

        if changed {
            self.name = name.clone();
            self.target = def.target.clone();
            self.parser = def.parser.clone();
            self.cadence = def.cadence.clone();
            self.updated_at = Utc::now();
        }
        changed
    }
}
