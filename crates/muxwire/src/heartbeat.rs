//! Connection liveness.
//!
//! When a connection has been read-idle for the configured interval the reader
//! asks [`HeartbeatState::on_idle`] what to do: send another probe, or give up
//! on the peer. Any inbound frame proves the peer alive and resets the count.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::Frame;
use crate::serialization::{SerializationError, SerializationRegistry};

/// Default number of unanswered probes tolerated before closing.
pub const DEFAULT_MAX_UNANSWERED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Send a heartbeat request.
    Probe,
    /// The peer missed too many probes; close the connection.
    Close { unanswered: u32 },
}

/// Unanswered-probe counter of one connection.
#[derive(Debug, Default)]
pub struct HeartbeatState {
    unanswered: AtomicU32,
}

impl HeartbeatState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every inbound frame, before anything else looks at it.
    pub fn observe_inbound(&self) {
        self.unanswered.store(0, Ordering::Release);
    }

    /// Read-idle trigger.
    pub fn on_idle(&self, max_unanswered: u32) -> IdleDecision {
        let unanswered = self.unanswered.load(Ordering::Acquire);
        if unanswered >= max_unanswered {
            IdleDecision::Close { unanswered }
        } else {
            IdleDecision::Probe
        }
    }

    /// The probe reached the transport. Returns the new count.
    pub fn probe_written(&self) -> u32 {
        self.unanswered.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unanswered(&self) -> u32 {
        self.unanswered.load(Ordering::Acquire)
    }
}

/// Heartbeat request carrying the cached null of `serialization_id`.
pub fn probe(
    registry: &SerializationRegistry,
    request_id: u64,
    serialization_id: u8,
) -> Result<Frame, SerializationError> {
    let body = registry.null_payload(serialization_id)?;
    Ok(Frame::heartbeat_request(request_id, serialization_id, body))
}

/// Answer to a received heartbeat request.
pub fn answer(
    registry: &SerializationRegistry,
    request: &Frame,
) -> Result<Frame, SerializationError> {
    let body = registry.null_payload(request.serialization_id)?;
    Ok(Frame::heartbeat_response(
        request.request_id,
        request.serialization_id,
        body,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Body;
    use crate::serialization::{JSON_ID, MSGPACK_ID};

    #[test]
    fn closes_after_threshold_unanswered_probes() {
        let state = HeartbeatState::new();
        assert_eq!(state.on_idle(2), IdleDecision::Probe);
        assert_eq!(state.probe_written(), 1);
        assert_eq!(state.on_idle(2), IdleDecision::Probe);
        assert_eq!(state.probe_written(), 2);
        assert_eq!(state.on_idle(2), IdleDecision::Close { unanswered: 2 });
    }

    #[test]
    fn inbound_traffic_resets_the_count() {
        let state = HeartbeatState::new();
        state.probe_written();
        state.probe_written();
        state.observe_inbound();
        assert_eq!(state.unanswered(), 0);
        assert_eq!(state.on_idle(2), IdleDecision::Probe);
    }

    #[test]
    fn zero_threshold_closes_on_first_idle() {
        let state = HeartbeatState::new();
        assert_eq!(state.on_idle(0), IdleDecision::Close { unanswered: 0 });
    }

    #[test]
    fn probe_and_answer_frames() {
        let registry = SerializationRegistry::with_defaults();
        let request = probe(&registry, 11, MSGPACK_ID).unwrap();
        assert_eq!(request.kind(), "heartbeat-request");
        assert_eq!(request.flags(), (MSGPACK_ID << 3) | 0b111);
        assert_eq!(request.body.as_ref(), &[0xc0]);

        let reply = answer(&registry, &request).unwrap();
        assert_eq!(reply.kind(), "heartbeat-response");
        assert_eq!(reply.request_id, 11);
        assert_eq!(reply.serialization_id, MSGPACK_ID);

        let json = Frame::heartbeat_request(12, JSON_ID, Body::empty());
        assert_eq!(answer(&registry, &json).unwrap().body.as_ref(), b"null\n");
        assert!(probe(&registry, 1, 17).is_err());
    }
}
