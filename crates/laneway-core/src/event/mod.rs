//! Status event data model.
//!
//! A [`StatusEvent`] records one lane transition of one work package. Events
//! are created once by a producer, appended to `status.events.jsonl`, and
//! never mutated afterwards.
//!
//! # Line format
//!
//! One canonical JSON object per line, keys sorted:
//!
//! ```text
//! {"actor":"a","at":"...","event_id":"...","evidence":null,"execution_mode":"worktree","feature_slug":"...","force":false,"from_lane":"planned","reason":null,"review_ref":null,"to_lane":"claimed","wp_id":"WP01"}
//! ```

pub mod canonical;

pub use canonical::canonicalize_json;

use crate::lane::Lane;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Sortable unique event identifier (UUIDv7 text form).
///
/// Lexicographic order of freshly generated ids follows creation time, but
/// the log never relies on it: ordering is append position only.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Wrap an existing id string without validation.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the producer performed the work that led to the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Worktree,
    DirectRepo,
}

/// Review evidence attached to a transition into `done`.
///
/// Unknown fields are preserved for forward compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default)]
    pub reviewer: String,
    #[serde(default)]
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Evidence {
    #[must_use]
    pub fn approved_by(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            verdict: "approved".to_string(),
            ..Self::default()
        }
    }

    /// A reviewer and a verdict are both present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.reviewer.trim().is_empty() && !self.verdict.trim().is_empty()
    }
}

/// One immutable lane transition of one work package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_id: EventId,
    pub feature_slug: String,
    pub wp_id: String,
    pub from_lane: Lane,
    pub to_lane: Lane,
    pub at: DateTime<Utc>,
    pub actor: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub review_ref: Option<String>,
    #[serde(default)]
    pub evidence: Option<Evidence>,
}

impl StatusEvent {
    /// Build an unforced transition stamped with a fresh id and the current
    /// time.
    #[must_use]
    pub fn transition(
        feature_slug: impl Into<String>,
        wp_id: impl Into<String>,
        from_lane: Lane,
        to_lane: Lane,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            feature_slug: feature_slug.into(),
            wp_id: wp_id.into(),
            from_lane,
            to_lane,
            at: Utc::now(),
            actor: actor.into(),
            force: false,
            execution_mode: ExecutionMode::Worktree,
            reason: None,
            review_ref: None,
            evidence: None,
        }
    }

    #[must_use]
    pub fn with_force(mut self, reason: impl Into<String>) -> Self {
        self.force = true;
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    #[must_use]
    pub fn with_review_ref(mut self, review_ref: impl Into<String>) -> Self {
        self.review_ref = Some(review_ref.into());
        self
    }

    #[must_use]
    pub const fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Serialize to a single canonical JSON line (no trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if a nested evidence value cannot be represented as
    /// JSON.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        Ok(canonicalize_json(&value))
    }

    /// Parse one log line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid event object.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} -> {} by {}{}",
            self.event_id,
            self.wp_id,
            self.from_lane,
            self.to_lane,
            self.actor,
            if self.force { " (forced)" } else { "" }
        )
    }
}
