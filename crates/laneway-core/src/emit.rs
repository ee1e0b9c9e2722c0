//! Validated transition emission.
//!
//! `emit_transition` is the write path for producers that want structural
//! checks: resolve the current lane from the log, validate, append, and
//! re-materialize the snapshot.

use tracing::info;

use crate::error::ErrorCode;
use crate::event::{Evidence, ExecutionMode, StatusEvent};
use crate::lane::Lane;
use crate::snapshot::{materialize, reduce};
use crate::store::{EventLogStore, StoreError};
use crate::transition::{TransitionError, validate_transition};

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EmitError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Transition(err) => err.code(),
            Self::Store(err) => err.code(),
        }
    }
}

/// A requested move of one work package to `to_lane`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub feature_slug: String,
    pub wp_id: String,
    pub to_lane: Lane,
    pub actor: String,
    /// Lane the caller believes the WP is in. `None` trusts the log.
    pub expected_from: Option<Lane>,
    pub force: bool,
    pub reason: Option<String>,
    pub evidence: Option<Evidence>,
    pub review_ref: Option<String>,
    pub execution_mode: ExecutionMode,
}

impl TransitionRequest {
    #[must_use]
    pub fn new(
        feature_slug: impl Into<String>,
        wp_id: impl Into<String>,
        to_lane: Lane,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            feature_slug: feature_slug.into(),
            wp_id: wp_id.into(),
            to_lane,
            actor: actor.into(),
            expected_from: None,
            force: false,
            reason: None,
            evidence: None,
            review_ref: None,
            execution_mode: ExecutionMode::default(),
        }
    }

    #[must_use]
    pub const fn expecting(mut self, from: Lane) -> Self {
        self.expected_from = Some(from);
        self
    }

    #[must_use]
    pub fn forced(mut self, reason: impl Into<String>) -> Self {
        self.force = true;
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

    fn into_event(self, from_lane: Lane) -> StatusEvent {
        let mut event = StatusEvent::transition(
            self.feature_slug,
            self.wp_id,
            from_lane,
            self.to_lane,
            self.actor,
        )
        .with_execution_mode(self.execution_mode);
        event.force = self.force;
        event.reason = self.reason;
        event.evidence = self.evidence;
        event.review_ref = self.review_ref;
        event
    }
}

/// Validate and append one transition, then refresh `status.json`.
///
/// The current lane is read from the log under the writer lock; a WP with no
/// events is `planned`. When `expected_from` is set and disagrees with the
/// log, the request is rejected as stale.
///
/// # Errors
///
/// Returns [`EmitError::Transition`] if validation fails (nothing is written)
/// and [`EmitError::Store`] for log or snapshot I/O failures.
pub fn emit_transition(
    store: &EventLogStore,
    request: TransitionRequest,
) -> Result<StatusEvent, EmitError> {
    let feature_slug = request.feature_slug.clone();

    let event = store.append_with(&feature_slug, |events| {
        let current = reduce(&feature_slug, events)
            .lane_of(&request.wp_id)
            .unwrap_or(Lane::Planned);
        let from_lane = request.expected_from.unwrap_or(current);
        let event = request.into_event(from_lane);
        validate_transition(current, &event)?;
        Ok::<_, EmitError>(event)
    })?;

    materialize(store, &feature_slug)?;
    info!(
        feature = %feature_slug,
        wp_id = %event.wp_id,
        from = %event.from_lane,
        to = %event.to_lane,
        forced = event.force,
        "emitted status transition"
    );
    Ok(event)
}
