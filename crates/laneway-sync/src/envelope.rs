//! Sync envelopes: the record shipped to the remote authority.
//!
//! # Wire shape
//!
//! ```text
//! {
//!   "schema_version": 1,
//!   "event_id": "0190a3c2-...",
//!   "event_type": "WPStatusChanged",
//!   "aggregate_id": "WP01",
//!   "aggregate_type": "WorkPackage",
//!   "node_id": "3fa9c02b17de",
//!   "lamport_clock": 42,
//!   "causation_id": null,
//!   "timestamp": "2026-02-15T09:30:00Z",
//!   "payload": { ... }
//! }
//! ```
//!
//! The payload schema is chosen by `event_type`. Kinds this build does not
//! know are kept as raw JSON and round-trip unchanged.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use laneway_core::event::{ExecutionMode, StatusEvent};
use laneway_core::lane::Lane;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope schema written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Known event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WpStatusChanged,
    WpCreated,
    WpAssigned,
    FeatureCreated,
    FeatureCompleted,
    ErrorLogged,
}

impl EventKind {
    pub const ALL: [Self; 6] = [
        Self::WpStatusChanged,
        Self::WpCreated,
        Self::WpAssigned,
        Self::FeatureCreated,
        Self::FeatureCompleted,
        Self::ErrorLogged,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WpStatusChanged => "WPStatusChanged",
            Self::WpCreated => "WPCreated",
            Self::WpAssigned => "WPAssigned",
            Self::FeatureCreated => "FeatureCreated",
            Self::FeatureCompleted => "FeatureCompleted",
            Self::ErrorLogged => "ErrorLogged",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    const fn aggregate_type(self) -> &'static str {
        match self {
            Self::WpStatusChanged | Self::WpCreated | Self::WpAssigned => "WorkPackage",
            Self::FeatureCreated | Self::FeatureCompleted => "Feature",
            Self::ErrorLogged => "Error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangedPayload {
    pub feature_slug: String,
    pub wp_id: String,
    pub from_lane: Lane,
    pub to_lane: Lane,
    pub actor: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_ref: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpCreatedPayload {
    pub feature_slug: String,
    pub wp_id: String,
    pub title: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WpAssignedPayload {
    pub wp_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCreatedPayload {
    pub feature_slug: String,
    #[serde(default)]
    pub target_branch: String,
    #[serde(default)]
    pub wp_count: usize,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCompletedPayload {
    pub feature_slug: String,
    #[serde(default)]
    pub total_wps: usize,
    pub completed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLoggedPayload {
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Typed payload, selected by the envelope's `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SyncPayload {
    StatusChanged(StatusChangedPayload),
    WpCreated(WpCreatedPayload),
    WpAssigned(WpAssignedPayload),
    FeatureCreated(FeatureCreatedPayload),
    FeatureCompleted(FeatureCompletedPayload),
    ErrorLogged(ErrorLoggedPayload),
    /// Payload of a kind this build does not know.
    Unknown(Value),
}

impl SyncPayload {
    /// Parse `payload` according to `event_type`. Unknown kinds never fail.
    ///
    /// # Errors
    ///
    /// Returns an error if a known kind's payload does not match its schema.
    pub fn deserialize_for(event_type: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let Some(kind) = EventKind::parse(event_type) else {
            return Ok(Self::Unknown(payload));
        };
        Ok(match kind {
            EventKind::WpStatusChanged => Self::StatusChanged(serde_json::from_value(payload)?),
            EventKind::WpCreated => Self::WpCreated(serde_json::from_value(payload)?),
            EventKind::WpAssigned => Self::WpAssigned(serde_json::from_value(payload)?),
            EventKind::FeatureCreated => Self::FeatureCreated(serde_json::from_value(payload)?),
            EventKind::FeatureCompleted => Self::FeatureCompleted(serde_json::from_value(payload)?),
            EventKind::ErrorLogged => Self::ErrorLogged(serde_json::from_value(payload)?),
        })
    }

    /// Kind of a typed payload; `None` for [`SyncPayload::Unknown`].
    #[must_use]
    pub const fn kind(&self) -> Option<EventKind> {
        match self {
            Self::StatusChanged(_) => Some(EventKind::WpStatusChanged),
            Self::WpCreated(_) => Some(EventKind::WpCreated),
            Self::WpAssigned(_) => Some(EventKind::WpAssigned),
            Self::FeatureCreated(_) => Some(EventKind::FeatureCreated),
            Self::FeatureCompleted(_) => Some(EventKind::FeatureCompleted),
            Self::ErrorLogged(_) => Some(EventKind::ErrorLogged),
            Self::Unknown(_) => None,
        }
    }

    fn aggregate_id(&self) -> String {
        match self {
            Self::StatusChanged(p) => p.wp_id.clone(),
            Self::WpCreated(p) => p.wp_id.clone(),
            Self::WpAssigned(p) => p.wp_id.clone(),
            Self::FeatureCreated(p) => p.feature_slug.clone(),
            Self::FeatureCompleted(p) => p.feature_slug.clone(),
            Self::ErrorLogged(p) => p.wp_id.clone().unwrap_or_else(|| p.error_type.clone()),
            Self::Unknown(_) => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One event as delivered to (or received from) the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub schema_version: u32,
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub node_id: String,
    pub lamport_clock: u64,
    pub causation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: SyncPayload,
}

impl<'de> Deserialize<'de> for SyncEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        /// First pass: everything but a typed payload.
        #[derive(Deserialize)]
        struct SyncEventRaw {
            #[serde(default = "default_schema_version")]
            schema_version: u32,
            event_id: String,
            event_type: String,
            #[serde(default)]
            aggregate_id: String,
            #[serde(default)]
            aggregate_type: String,
            #[serde(default)]
            node_id: String,
            lamport_clock: u64,
            #[serde(default)]
            causation_id: Option<String>,
            timestamp: DateTime<Utc>,
            #[serde(default)]
            payload: Value,
        }

        let raw = SyncEventRaw::deserialize(deserializer)?;
        let payload = SyncPayload::deserialize_for(&raw.event_type, raw.payload)
            .map_err(serde::de::Error::custom)?;

        Ok(Self {
            schema_version: raw.schema_version,
            event_id: raw.event_id,
            event_type: raw.event_type,
            aggregate_id: raw.aggregate_id,
            aggregate_type: raw.aggregate_type,
            node_id: raw.node_id,
            lamport_clock: raw.lamport_clock,
            causation_id: raw.causation_id,
            timestamp: raw.timestamp,
            payload,
        })
    }
}

const fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl SyncEvent {
    /// Wrap a typed payload with a fresh event id and the current time.
    ///
    /// Returns `None` for [`SyncPayload::Unknown`], which has no kind to
    /// stamp; build those envelopes field by field.
    #[must_use]
    pub fn wrap(
        payload: SyncPayload,
        node_id: impl Into<String>,
        lamport_clock: u64,
    ) -> Option<Self> {
        let kind = payload.kind()?;
        Some(Self {
            schema_version: SCHEMA_VERSION,
            event_id: uuid::Uuid::now_v7().to_string(),
            event_type: kind.as_str().to_string(),
            aggregate_id: payload.aggregate_id(),
            aggregate_type: kind.aggregate_type().to_string(),
            node_id: node_id.into(),
            lamport_clock,
            causation_id: None,
            timestamp: Utc::now(),
            payload,
        })
    }

    /// Envelope for a lane transition. Reuses the status event's id so the
    /// same transition enqueued twice collapses to one queue row and one
    /// server-side record.
    #[must_use]
    pub fn status_changed(
        event: &StatusEvent,
        node_id: impl Into<String>,
        lamport_clock: u64,
    ) -> Self {
        let payload = StatusChangedPayload {
            feature_slug: event.feature_slug.clone(),
            wp_id: event.wp_id.clone(),
            from_lane: event.from_lane,
            to_lane: event.to_lane,
            actor: event.actor.clone(),
            force: event.force,
            execution_mode: event.execution_mode,
            reason: event.reason.clone(),
            review_ref: event.review_ref.clone(),
            extra: BTreeMap::new(),
        };
        Self {
            schema_version: SCHEMA_VERSION,
            event_id: event.event_id.to_string(),
            event_type: EventKind::WpStatusChanged.as_str().to_string(),
            aggregate_id: event.wp_id.clone(),
            aggregate_type: EventKind::WpStatusChanged.aggregate_type().to_string(),
            node_id: node_id.into(),
            lamport_clock,
            causation_id: None,
            timestamp: event.at,
            payload: SyncPayload::StatusChanged(payload),
        }
    }

    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_type)
    }
}
