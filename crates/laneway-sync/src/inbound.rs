//! Remote events arriving at this node.
//!
//! Every inbound envelope advances the local clock, whatever its kind. The
//! clock is read from a lenient header pass first, so an envelope whose
//! payload this build cannot type still moves the clock forward before the
//! full parse runs.

use laneway_core::error::ErrorCode;
use serde::Deserialize;
use tracing::debug;

use crate::clock::{ClockError, LamportClock};
use crate::envelope::SyncEvent;

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("inbound event has no readable lamport_clock: {0}")]
    MissingClock(#[source] serde_json::Error),

    #[error("inbound event {event_id} is malformed: {source}")]
    Malformed {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Clock(#[from] ClockError),
}

impl InboundError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingClock(_) | Self::Malformed { .. } => ErrorCode::InternalUnexpected,
            Self::Clock(err) => err.code(),
        }
    }
}

/// A parsed remote event and the local clock value after receiving it.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub event: SyncEvent,
    pub local_clock: u64,
}

#[derive(Deserialize)]
struct Header {
    #[serde(default)]
    event_id: String,
    lamport_clock: u64,
}

/// Advance `clock` past the envelope's `lamport_clock`, then parse it.
///
/// # Errors
///
/// [`InboundError::MissingClock`] leaves the clock untouched.
/// [`InboundError::Malformed`] is returned after the clock has advanced.
pub fn receive_remote(clock: &mut LamportClock, raw: &str) -> Result<Received, InboundError> {
    let header: Header = serde_json::from_str(raw).map_err(InboundError::MissingClock)?;
    let local_clock = clock.receive(header.lamport_clock)?;

    let event: SyncEvent = serde_json::from_str(raw).map_err(|source| InboundError::Malformed {
        event_id: header.event_id.clone(),
        source,
    })?;
    debug!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        remote = header.lamport_clock,
        local = local_clock,
        "received remote event"
    );
    Ok(Received { event, local_clock })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_type: &str, lamport: u64, payload: &serde_json::Value) -> String {
        json!({
            "schema_version": 1,
            "event_id": "remote-1",
            "event_type": event_type,
            "aggregate_id": "WP01",
            "aggregate_type": "WorkPackage",
            "node_id": "remote",
            "lamport_clock": lamport,
            "causation_id": null,
            "timestamp": "2026-02-15T09:30:00Z",
            "payload": payload,
        })
        .to_string()
    }

    #[test]
    fn unknown_kinds_still_advance_the_clock() {
        let mut clock = LamportClock::in_memory(5, "local");
        let received = receive_remote(
            &mut clock,
            &raw("MissionReplayed", 42, &json!({"anything": true})),
        )
        .unwrap();
        assert_eq!(received.local_clock, 43);
        assert_eq!(received.event.kind(), None);
    }

    #[test]
    fn malformed_payload_advances_then_fails() {
        let mut clock = LamportClock::in_memory(5, "local");
        let err = receive_remote(&mut clock, &raw("WPStatusChanged", 9, &json!({}))).unwrap_err();
        assert!(matches!(err, InboundError::Malformed { .. }));
        assert_eq!(clock.value(), 10);
    }

    #[test]
    fn missing_clock_changes_nothing() {
        let mut clock = LamportClock::in_memory(5, "local");
        let err = receive_remote(&mut clock, r#"{"event_id":"x"}"#).unwrap_err();
        assert!(matches!(err, InboundError::MissingClock(_)));
        assert_eq!(clock.value(), 5);
    }

    #[test]
    fn saturated_remote_clock_is_refused() {
        let mut clock = LamportClock::in_memory(5, "local");
        let err = receive_remote(
            &mut clock,
            &raw("MissionReplayed", u64::MAX, &json!({})),
        )
        .unwrap_err();
        assert!(matches!(err, InboundError::Clock(ClockError::Overflow { .. })));
        assert_eq!(err.code(), ErrorCode::ClockOverflow);
        assert_eq!(clock.value(), 5);
    }
}
