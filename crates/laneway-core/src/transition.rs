//! Structural validation of a proposed transition against the current lane.
//!
//! This enforces the log's invariants only. Whether the actor is *allowed* to
//! move the work package is decided by the caller before it gets here.

use crate::error::ErrorCode;
use crate::event::StatusEvent;
use crate::lane::{Lane, is_legal};

/// Why a transition was rejected before reaching the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to} for {wp_id}")]
    Illegal { wp_id: String, from: Lane, to: Lane },

    #[error("{wp_id} is in {current}, but the transition claims it is in {claimed}")]
    StaleFromLane {
        wp_id: String,
        current: Lane,
        claimed: Lane,
    },

    #[error("{wp_id} is in terminal lane {lane}")]
    TerminalLane { wp_id: String, lane: Lane },

    #[error("{wp_id} cannot move to done without reviewer and verdict evidence")]
    MissingReviewEvidence { wp_id: String },

    #[error("forced transition of {wp_id} needs a non-empty {field}")]
    MissingForceReason { wp_id: String, field: &'static str },
}

impl TransitionError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Illegal { .. } => ErrorCode::IllegalTransition,
            Self::StaleFromLane { .. } => ErrorCode::StaleFromLane,
            Self::TerminalLane { .. } => ErrorCode::TerminalLane,
            Self::MissingReviewEvidence { .. } => ErrorCode::MissingReviewEvidence,
            Self::MissingForceReason { .. } => ErrorCode::MissingForceReason,
        }
    }
}

/// Check `event` against the work package's current materialized lane.
///
/// Unforced transitions must start from `current`, follow a legal edge, and
/// never leave a terminal lane. A transition into `done` carries complete
/// review evidence. A forced transition skips those checks but must name an
/// actor and a reason.
///
/// # Errors
///
/// Returns the first violated rule as a [`TransitionError`].
pub fn validate_transition(current: Lane, event: &StatusEvent) -> Result<(), TransitionError> {
    let wp_id = || event.wp_id.clone();

    if event.force {
        if event.actor.trim().is_empty() {
            return Err(TransitionError::MissingForceReason {
                wp_id: wp_id(),
                field: "actor",
            });
        }
        let has_reason = event
            .reason
            .as_deref()
            .is_some_and(|reason| !reason.trim().is_empty());
        if !has_reason {
            return Err(TransitionError::MissingForceReason {
                wp_id: wp_id(),
                field: "reason",
            });
        }
        return Ok(());
    }

    if current.is_terminal() {
        return Err(TransitionError::TerminalLane {
            wp_id: wp_id(),
            lane: current,
        });
    }
    if event.from_lane != current {
        return Err(TransitionError::StaleFromLane {
            wp_id: wp_id(),
            current,
            claimed: event.from_lane,
        });
    }
    if !is_legal(event.from_lane, event.to_lane) {
        return Err(TransitionError::Illegal {
            wp_id: wp_id(),
            from: event.from_lane,
            to: event.to_lane,
        });
    }
    if event.to_lane == Lane::Done
        && !event
            .evidence
            .as_ref()
            .is_some_and(crate::event::Evidence::is_complete)
    {
        return Err(TransitionError::MissingReviewEvidence { wp_id: wp_id() });
    }
    Ok(())
}
