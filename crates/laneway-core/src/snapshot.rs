//! Snapshot materialization: a deterministic fold of the status log.
//!
//! The snapshot is a cache. It is rebuilt from scratch on every call, written
//! with temp-file-then-rename, and can be deleted at any time. Nothing reads
//! it as authority; [`check_snapshot`] only reports how far it lags the log.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{EventId, StatusEvent};
use crate::lane::Lane;
use crate::store::{EventLogStore, StoreError, io_err, write_atomic};

/// Materialized state of one work package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WpState {
    pub lane: Lane,
    pub actor: String,
    pub last_transition_at: DateTime<Utc>,
    pub last_event_id: EventId,
    pub force_count: u32,
}

/// Current-state view of a feature, derived from its full event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub feature_slug: String,
    pub materialized_at: DateTime<Utc>,
    pub event_count: usize,
    pub last_event_id: Option<EventId>,
    pub work_packages: BTreeMap<String, WpState>,
    pub summary: BTreeMap<Lane, usize>,
}

impl StatusSnapshot {
    /// Current lane of a work package, if it has any event.
    #[must_use]
    pub fn lane_of(&self, wp_id: &str) -> Option<Lane> {
        self.work_packages.get(wp_id).map(|wp| wp.lane)
    }

    /// Equality ignoring `materialized_at`.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        self.feature_slug == other.feature_slug
            && self.event_count == other.event_count
            && self.last_event_id == other.last_event_id
            && self.work_packages == other.work_packages
            && self.summary == other.summary
    }
}

/// Fold events in order into a snapshot stamped with `materialized_at`.
///
/// A repeated `event_id` is applied once (first occurrence wins), which keeps
/// the fold stable when two copies of a log were union-merged.
#[must_use]
pub fn reduce_at(
    feature_slug: &str,
    events: &[StatusEvent],
    materialized_at: DateTime<Utc>,
) -> StatusSnapshot {
    let mut seen: HashSet<&EventId> = HashSet::with_capacity(events.len());
    let mut work_packages: BTreeMap<String, WpState> = BTreeMap::new();
    let mut event_count = 0usize;
    let mut last_event_id = None;

    for event in events {
        if !seen.insert(&event.event_id) {
            debug!(event_id = %event.event_id, "skipping duplicate event id during fold");
            continue;
        }
        event_count += 1;
        last_event_id = Some(event.event_id.clone());

        let prior_force = work_packages
            .get(&event.wp_id)
            .map_or(0, |wp| wp.force_count);
        work_packages.insert(
            event.wp_id.clone(),
            WpState {
                lane: event.to_lane,
                actor: event.actor.clone(),
                last_transition_at: event.at,
                last_event_id: event.event_id.clone(),
                force_count: prior_force + u32::from(event.force),
            },
        );
    }

    let summary = summarize(&work_packages);
    StatusSnapshot {
        feature_slug: feature_slug.to_string(),
        materialized_at,
        event_count,
        last_event_id,
        work_packages,
        summary,
    }
}

/// [`reduce_at`] stamped with the current time.
#[must_use]
pub fn reduce(feature_slug: &str, events: &[StatusEvent]) -> StatusSnapshot {
    reduce_at(feature_slug, events, Utc::now())
}

/// Count work packages per lane. Every lane is present, zero or not.
#[must_use]
pub fn summarize(work_packages: &BTreeMap<String, WpState>) -> BTreeMap<Lane, usize> {
    let mut summary: BTreeMap<Lane, usize> = Lane::ALL.iter().map(|lane| (*lane, 0)).collect();
    for wp in work_packages.values() {
        *summary.entry(wp.lane).or_insert(0) += 1;
    }
    summary
}

/// Rebuild the feature's snapshot from its full log and write `status.json`.
///
/// # Errors
///
/// Propagates log read errors and snapshot write errors.
pub fn materialize(store: &EventLogStore, feature_slug: &str) -> Result<StatusSnapshot, StoreError> {
    let events = store.read_events(feature_slug)?;
    let snapshot = reduce(feature_slug, &events);
    write_snapshot(store, &snapshot)?;
    debug!(
        feature = feature_slug,
        events = snapshot.event_count,
        wps = snapshot.work_packages.len(),
        "materialized status snapshot"
    );
    Ok(snapshot)
}

/// Write a snapshot to its well-known location atomically.
///
/// # Errors
///
/// Returns [`StoreError::SnapshotEncode`] if the snapshot cannot be encoded
/// and [`StoreError::Io`] if the temp write or rename fails.
pub fn write_snapshot(store: &EventLogStore, snapshot: &StatusSnapshot) -> Result<(), StoreError> {
    let path = store.snapshot_path(&snapshot.feature_slug);
    let mut body =
        serde_json::to_string_pretty(snapshot).map_err(|source| StoreError::SnapshotEncode {
            feature: snapshot.feature_slug.clone(),
            source,
        })?;
    body.push('\n');
    write_atomic(&path, body.as_bytes()).map_err(io_err(&path))
}

/// Load `status.json` if present.
///
/// Returns `Ok(None)` when the file is missing.
///
/// # Errors
///
/// Returns [`StoreError::Io`] on read failure and
/// [`StoreError::SnapshotEncode`] if the file is not a valid snapshot.
pub fn load_snapshot(
    store: &EventLogStore,
    feature_slug: &str,
) -> Result<Option<StatusSnapshot>, StoreError> {
    let path = store.snapshot_path(feature_slug);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path)(err)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StoreError::SnapshotEncode {
            feature: feature_slug.to_string(),
            source,
        })
}

// ---------------------------------------------------------------------------
// Drift between snapshot and log
// ---------------------------------------------------------------------------

/// One way the cached snapshot disagrees with the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftFinding {
    /// The log has events but no snapshot exists.
    MissingSnapshot { log_events: usize },
    /// `status.json` exists but cannot be parsed.
    UnreadableSnapshot { detail: String },
    /// Snapshot was materialized from a different log state.
    StaleSnapshot {
        snapshot_events: usize,
        log_events: usize,
    },
}

impl std::fmt::Display for DriftFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSnapshot { log_events } => {
                write!(f, "snapshot missing for a log with {log_events} event(s)")
            }
            Self::UnreadableSnapshot { detail } => write!(f, "snapshot unreadable: {detail}"),
            Self::StaleSnapshot {
                snapshot_events,
                log_events,
            } => write!(
                f,
                "snapshot covers {snapshot_events} event(s) but log holds {log_events}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

/// Decides how serious a drift finding is. Supplied by the caller.
pub trait DriftPolicy {
    fn classify(&self, finding: &DriftFinding) -> Severity;
}

/// Every finding is a warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarnPolicy;

impl DriftPolicy for WarnPolicy {
    fn classify(&self, _finding: &DriftFinding) -> Severity {
        Severity::Warning
    }
}

/// Every finding is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictPolicy;

impl DriftPolicy for StrictPolicy {
    fn classify(&self, _finding: &DriftFinding) -> Severity {
        Severity::Error
    }
}

/// Config-selectable policy: every finding gets the same severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftLevel {
    #[default]
    Warn,
    Error,
}

impl DriftPolicy for DriftLevel {
    fn classify(&self, finding: &DriftFinding) -> Severity {
        match self {
            Self::Warn => WarnPolicy.classify(finding),
            Self::Error => StrictPolicy.classify(finding),
        }
    }
}

/// Result of comparing a feature's snapshot against its log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftReport {
    pub findings: Vec<(DriftFinding, Severity)>,
}

impl DriftReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.findings
            .iter()
            .any(|(_, severity)| *severity == Severity::Error)
    }
}

/// Compare `status.json` with a fresh fold of the log.
///
/// Never rewrites the snapshot.
///
/// # Errors
///
/// Propagates log read errors. An unparseable snapshot is a finding, not an
/// error.
pub fn check_snapshot(
    store: &EventLogStore,
    feature_slug: &str,
    policy: &dyn DriftPolicy,
) -> Result<DriftReport, StoreError> {
    let events = store.read_events(feature_slug)?;
    let fresh = reduce(feature_slug, &events);

    let finding = match load_snapshot(store, feature_slug) {
        Ok(None) if fresh.event_count == 0 => None,
        Ok(None) => Some(DriftFinding::MissingSnapshot {
            log_events: fresh.event_count,
        }),
        Ok(Some(cached))
            if cached.event_count != fresh.event_count
                || cached.last_event_id != fresh.last_event_id =>
        {
            Some(DriftFinding::StaleSnapshot {
                snapshot_events: cached.event_count,
                log_events: fresh.event_count,
            })
        }
        Ok(Some(_)) => None,
        Err(StoreError::SnapshotEncode { source, .. }) => Some(DriftFinding::UnreadableSnapshot {
            detail: source.to_string(),
        }),
        Err(err) => return Err(err),
    };

    let mut report = DriftReport::default();
    if let Some(finding) = finding {
        let severity = policy.classify(&finding);
        warn!(feature = feature_slug, ?severity, "{finding}");
        report.findings.push((finding, severity));
    }
    Ok(report)
}
