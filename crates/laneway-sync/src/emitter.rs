//! Local producer side: stamp events with the Lamport clock and stage them
//! in the offline queue.

use std::path::Path;

use laneway_core::error::ErrorCode;
use laneway_core::event::StatusEvent;
use tracing::{debug, warn};

use crate::clock::{ClockError, LamportClock};
use crate::envelope::{SyncEvent, SyncPayload};
use crate::queue::{OfflineQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("payload has no known event type; build the envelope explicitly")]
    UntypedPayload,
}

impl EmitterError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Clock(err) => err.code(),
            Self::Queue(err) => err.code(),
            Self::UntypedPayload => ErrorCode::InternalUnexpected,
        }
    }
}

/// Owns this node's clock and queue handle.
#[derive(Debug)]
pub struct SyncEmitter {
    clock: LamportClock,
    queue: OfflineQueue,
}

impl SyncEmitter {
    #[must_use]
    pub const fn new(clock: LamportClock, queue: OfflineQueue) -> Self {
        Self { clock, queue }
    }

    /// Open the clock and queue stored under `home`.
    ///
    /// # Errors
    ///
    /// Returns an error if either cannot be loaded.
    pub fn open_in(home: &Path, max_queue_size: usize) -> Result<Self, EmitterError> {
        let clock = LamportClock::load_in(home)?;
        let queue = OfflineQueue::open_in(home)?.with_max_size(max_queue_size);
        Ok(Self::new(clock, queue))
    }

    /// Stage a lane transition for delivery.
    ///
    /// Returns `Ok(false)` when the queue is full; the event stays in the
    /// local log and is not lost, only not yet staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock cannot be persisted or the queue fails.
    pub fn emit_status(&mut self, event: &StatusEvent) -> Result<bool, EmitterError> {
        let lamport = self.clock.tick()?;
        let envelope = SyncEvent::status_changed(event, self.clock.node_id(), lamport);
        self.stage(&envelope)
    }

    /// Stage any typed payload under a fresh event id.
    ///
    /// # Errors
    ///
    /// [`EmitterError::UntypedPayload`] for [`SyncPayload::Unknown`], plus
    /// the failures of [`SyncEmitter::emit_status`].
    pub fn emit(&mut self, payload: SyncPayload) -> Result<bool, EmitterError> {
        if payload.kind().is_none() {
            return Err(EmitterError::UntypedPayload);
        }
        let lamport = self.clock.tick()?;
        let envelope = SyncEvent::wrap(payload, self.clock.node_id(), lamport)
            .ok_or(EmitterError::UntypedPayload)?;
        self.stage(&envelope)
    }

    fn stage(&mut self, envelope: &SyncEvent) -> Result<bool, EmitterError> {
        if !self.queue.enqueue(envelope)? {
            warn!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "sync queue full; event kept locally only"
            );
            return Ok(false);
        }
        debug!(
            event_id = %envelope.event_id,
            lamport = envelope.lamport_clock,
            "staged sync event"
        );
        Ok(true)
    }

    #[must_use]
    pub const fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub const fn clock_mut(&mut self) -> &mut LamportClock {
        &mut self.clock
    }

    #[must_use]
    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub const fn queue_mut(&mut self) -> &mut OfflineQueue {
        &mut self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::WpAssignedPayload;
    use laneway_core::lane::Lane;
    use std::collections::BTreeMap;

    fn emitter(max: usize) -> SyncEmitter {
        SyncEmitter::new(
            LamportClock::in_memory(0, "node-a"),
            OfflineQueue::open_in_memory().unwrap().with_max_size(max),
        )
    }

    fn transition(wp: &str) -> StatusEvent {
        StatusEvent::transition("034-auth-retry", wp, Lane::Planned, Lane::Claimed, "alice")
    }

    #[test]
    fn status_events_get_increasing_clock() {
        let mut emitter = emitter(10);
        assert!(emitter.emit_status(&transition("WP01")).unwrap());
        assert!(emitter.emit_status(&transition("WP02")).unwrap());

        let queued = emitter.queue().drain(None).unwrap();
        assert_eq!(queued[0].payload["lamport_clock"], 1);
        assert_eq!(queued[1].payload["lamport_clock"], 2);
        assert_eq!(queued[0].payload["node_id"], "node-a");
    }

    #[test]
    fn full_queue_is_reported_not_raised() {
        let mut emitter = emitter(1);
        assert!(emitter.emit_status(&transition("WP01")).unwrap());
        assert!(!emitter.emit_status(&transition("WP02")).unwrap());
        assert_eq!(emitter.queue().size().unwrap(), 1);
    }

    #[test]
    fn same_transition_twice_is_one_row() {
        let mut emitter = emitter(10);
        let event = transition("WP01");
        emitter.emit_status(&event).unwrap();
        emitter.emit_status(&event).unwrap();
        assert_eq!(emitter.queue().size().unwrap(), 1);
        assert_eq!(emitter.clock().value(), 2);
    }

    #[test]
    fn typed_payloads_are_wrapped() {
        let mut emitter = emitter(10);
        let payload = SyncPayload::WpAssigned(WpAssignedPayload {
            wp_id: "WP03".into(),
            agent_id: "agent-7".into(),
            phase: "implementation".into(),
            retry_count: 0,
            extra: BTreeMap::new(),
        });
        assert!(emitter.emit(payload).unwrap());
        let queued = emitter.queue().drain(None).unwrap();
        assert_eq!(queued[0].event_type, "WPAssigned");

        let err = emitter
            .emit(SyncPayload::Unknown(serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, EmitterError::UntypedPayload));
    }
}
