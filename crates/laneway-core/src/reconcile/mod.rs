//! Drift reconciliation between the status log and git history.
//!
//! The reconciler looks for work that git says happened but the log does not
//! record, proposes the missing events, and in apply mode appends them.
//!
//! | current lane  | git evidence         | proposal                        |
//! |---------------|----------------------|---------------------------------|
//! | `planned`     | any linked commit    | `planned -> claimed`            |
//! | `in_progress` | WP branch merged     | chain to `for_review`           |
//! | `blocked`     | any                  | detail only                     |
//! | terminal      | any                  | detail containing "terminal"    |
//!
//! Everything else produces nothing.

pub mod git;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::error::ErrorCode;
use crate::event::{ExecutionMode, StatusEvent};
use crate::lane::{Lane, advancement_chain};
use crate::snapshot::{materialize, reduce};
use crate::store::{EventLogStore, StoreError};
use crate::transition::{TransitionError, validate_transition};

pub use git::{CommitInfo, GitCli, GitError, RepoHistory, ScanOutcome};

/// Actor recorded on every synthesized event.
pub const RECONCILE_ACTOR: &str = "reconcile";

/// Rollout phase of the status model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Phase {
    /// Events are recorded but reconcile may only report.
    Hardening = 0,
    #[default]
    DualWrite = 1,
    ReadCutover = 2,
}

impl Phase {
    #[must_use]
    pub const fn allows_apply(self) -> bool {
        !matches!(self, Self::Hardening)
    }
}

impl TryFrom<u8> for Phase {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Hardening),
            1 => Ok(Self::DualWrite),
            2 => Ok(Self::ReadCutover),
            other => Err(format!("unknown status phase {other}; expected 0, 1, or 2")),
        }
    }
}

impl From<Phase> for u8 {
    fn from(phase: Phase) -> Self {
        phase as Self
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hardening => "hardening",
            Self::DualWrite => "dual-write",
            Self::ReadCutover => "read-cutover",
        };
        write!(f, "{} ({name})", u8::from(*self))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reconcile apply is disabled at phase {phase}")]
    PhaseDisabled { phase: Phase },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another writer moved the WP between the scan and the append.
    #[error("reconcile proposal went stale: {0}")]
    Stale(#[from] TransitionError),
}

impl ReconcileError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PhaseDisabled { .. } => ErrorCode::ReconcileDisabled,
            Self::Store(err) => err.code(),
            Self::Stale(err) => err.code(),
        }
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileResult {
    pub drift_detected: bool,
    pub suggested_events: Vec<StatusEvent>,
    pub details: Vec<String>,
    /// One entry per repository that could not be scanned.
    pub errors: Vec<String>,
    pub repos_scanned: usize,
    pub wps_analyzed: usize,
}

#[derive(Default)]
struct GitEvidence {
    commits: BTreeMap<String, Vec<CommitInfo>>,
    merged: BTreeSet<String>,
}

impl GitEvidence {
    fn has_any(&self, wp_id: &str) -> bool {
        self.merged.contains(wp_id) || self.commits.get(wp_id).is_some_and(|c| !c.is_empty())
    }
}

/// Compare the feature's log with git history and propose corrective events.
///
/// In dry-run mode nothing is written. Otherwise each proposal is appended in
/// order and the snapshot is rebuilt once at the end. A repository that fails
/// to scan is listed in [`ReconcileResult::errors`] and the rest still run.
///
/// # Errors
///
/// Returns [`ReconcileError::PhaseDisabled`] before doing any work when
/// asked to apply at [`Phase::Hardening`], [`ReconcileError::Store`] for
/// log I/O failures, and [`ReconcileError::Stale`] if a concurrent writer
/// moved a WP first. Proposals are validated together under the writer lock,
/// so either all of them are appended or none.
pub fn reconcile(
    store: &EventLogStore,
    feature_slug: &str,
    repos: &[&dyn RepoHistory],
    phase: Phase,
    dry_run: bool,
) -> Result<ReconcileResult, ReconcileError> {
    if !dry_run && !phase.allows_apply() {
        return Err(ReconcileError::PhaseDisabled { phase });
    }

    let events = store.read_events(feature_slug)?;
    let snapshot = reduce(feature_slug, &events);

    let mut result = ReconcileResult::default();
    let evidence = gather(repos, feature_slug, &mut result);

    let wp_ids: BTreeSet<&String> = snapshot
        .work_packages
        .keys()
        .chain(evidence.commits.keys())
        .chain(evidence.merged.iter())
        .collect();
    result.wps_analyzed = wp_ids.len();

    for wp_id in wp_ids {
        let lane = snapshot.lane_of(wp_id).unwrap_or(Lane::Planned);
        let hops: Vec<(Lane, Lane)> = match lane {
            Lane::Done | Lane::Canceled => {
                result
                    .details
                    .push(format!("{wp_id}: lane {lane} is terminal; no events proposed"));
                continue;
            }
            Lane::Blocked => {
                if evidence.has_any(wp_id) {
                    result.details.push(format!(
                        "{wp_id}: blocked with git activity; needs a human to unblock"
                    ));
                }
                continue;
            }
            Lane::Planned if evidence.commits.get(wp_id).is_some_and(|c| !c.is_empty()) => {
                vec![(Lane::Planned, Lane::Claimed)]
            }
            Lane::InProgress if evidence.merged.contains(wp_id) => {
                advancement_chain(Lane::InProgress, Lane::ForReview)
            }
            _ => continue,
        };

        let reason = if evidence.merged.contains(wp_id) {
            format!("{wp_id} branch merged into mainline")
        } else {
            format!("commits found for {wp_id}")
        };
        for (from, to) in hops {
            result.details.push(format!("{wp_id}: propose {from} -> {to} ({reason})"));
            result.suggested_events.push(
                StatusEvent::transition(feature_slug, wp_id.as_str(), from, to, RECONCILE_ACTOR)
                    .with_execution_mode(ExecutionMode::DirectRepo)
                    .with_reason(reason.clone()),
            );
        }
    }

    result.drift_detected = !result.suggested_events.is_empty();

    if dry_run || result.suggested_events.is_empty() {
        debug!(
            feature = feature_slug,
            proposals = result.suggested_events.len(),
            dry_run,
            "reconcile finished without writing"
        );
        return Ok(result);
    }

    let proposals = &result.suggested_events;
    store.append_all_with(feature_slug, |events| {
        let snapshot = reduce(feature_slug, events);
        let mut moved: BTreeMap<&str, Lane> = BTreeMap::new();
        for event in proposals {
            let current = moved
                .get(event.wp_id.as_str())
                .copied()
                .or_else(|| snapshot.lane_of(&event.wp_id))
                .unwrap_or(Lane::Planned);
            validate_transition(current, event)?;
            moved.insert(&event.wp_id, event.to_lane);
        }
        Ok::<_, ReconcileError>(proposals.clone())
    })?;
    materialize(store, feature_slug)?;
    info!(
        feature = feature_slug,
        applied = result.suggested_events.len(),
        "applied reconciliation events"
    );
    Ok(result)
}

/// [`reconcile`] driven by project configuration.
///
/// Scans the project root plus every `[reconcile] repos` entry with the
/// configured mainline and timeout. A path that is not a repository is
/// recorded in `errors` like any other failing repository.
///
/// # Errors
///
/// Same as [`reconcile`].
pub fn reconcile_project(
    project_root: &Path,
    config: &ProjectConfig,
    feature_slug: &str,
    dry_run: bool,
) -> Result<ReconcileResult, ReconcileError> {
    let phase = config.status.phase;
    if !dry_run && !phase.allows_apply() {
        return Err(ReconcileError::PhaseDisabled { phase });
    }

    let timeout = Duration::from_secs(config.reconcile.scan_timeout_secs);
    let mut open_errors = Vec::new();
    let mut repos = Vec::new();
    for path in config.reconcile.repo_paths(project_root) {
        match GitCli::open(path) {
            Ok(cli) => {
                let cli = cli.with_timeout(timeout);
                repos.push(match &config.reconcile.mainline {
                    Some(mainline) => cli.with_mainline(mainline.clone()),
                    None => cli,
                });
            }
            Err(err) => {
                warn!(error = %err, "skipping repository");
                open_errors.push(err.to_string());
            }
        }
    }

    let histories: Vec<&dyn RepoHistory> =
        repos.iter().map(|repo| repo as &dyn RepoHistory).collect();
    let store = config.status.store(project_root);
    let mut result = reconcile(&store, feature_slug, &histories, phase, dry_run)?;
    result.errors.splice(0..0, open_errors);
    Ok(result)
}

fn gather(
    repos: &[&dyn RepoHistory],
    feature_slug: &str,
    result: &mut ReconcileResult,
) -> GitEvidence {
    let mut evidence = GitEvidence::default();
    for repo in repos {
        let label = repo.label();
        let scan = match repo.scan_commits(feature_slug) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(repo = %label, error = %err, "repository scan failed");
                result.errors.push(format!("{label}: {err}"));
                continue;
            }
        };
        let merged = match repo.merged_wps(feature_slug) {
            Ok(merged) => merged,
            Err(err) => {
                warn!(repo = %label, error = %err, "merge detection failed");
                result.errors.push(format!("{label}: {err}"));
                BTreeSet::new()
            }
        };

        result.repos_scanned += 1;
        if scan.timed_out {
            result
                .details
                .push(format!("{label}: scan timed out; results are partial"));
        }
        for (wp_id, commits) in scan.commits {
            let known = evidence.commits.entry(wp_id).or_default();
            for commit in commits {
                if !known.iter().any(|c| c.sha == commit.sha) {
                    known.push(commit);
                }
            }
        }
        evidence.merged.extend(merged);
    }
    evidence
}
