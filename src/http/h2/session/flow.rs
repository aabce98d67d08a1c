//! Session and stream flow control.
//!
//! Send windows are charged when a DATA frame is built and queued, not
//! when it reaches the transport, so a full write queue already counts as
//! back-pressure. Receive windows are charged when DATA arrives and
//! credited when the caller reads (or the data is thrown away).

use super::{AvailabilityState, SessionInner};
use crate::http::h2::codec::FrameCodec;
use crate::http::h2::error::{Error, ErrorCode};
use crate::http::h2::frames::{DataFrame, FrameType};
use crate::http::h2::priority::RequestPriority;
use crate::http::h2::stream::{StreamId, StreamKey};
use crate::http::h2::write_queue::FrameProducer;
use crate::http::h2::CONNECTION_STREAM_ID;
use tracing::{debug, trace, warn};

/// Largest DATA payload framed at once
const MAX_DATA_FRAME_CHUNK_SIZE: usize = 16 * 1024 - 9;

fn window_delta(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

impl SessionInner {
    /// Frame the next chunk of a stream's pending body.
    ///
    /// The chunk is clamped to both send windows and the peer's frame size.
    /// `None` when nothing can be sent; a stream blocked by the session
    /// window is parked until a WINDOW_UPDATE arrives.
    fn create_data_frame(&mut self, key: StreamKey) -> Option<FrameProducer> {
        if self.availability == AvailabilityState::Draining {
            return None;
        }
        let max_chunk = MAX_DATA_FRAME_CHUNK_SIZE.min(self.peer_max_frame_size as usize);
        let session_window = self.session_send_window.size();

        let stream = self.streams.get_mut(&key)?;
        let requested = stream.pending_send.len();
        let mut effective = requested.min(max_chunk);

        // A bare END_STREAM costs no window
        if requested > 0 {
            let stream_window = stream.send_window.size();
            if stream_window <= 0 {
                trace!(stream_id = stream.id, "send stalled by stream window");
                stream.send_stalled_by_flow_control = true;
                return None;
            }
            effective = effective.min(stream_window as usize);

            if session_window <= 0 {
                trace!(stream_id = stream.id, "send stalled by session window");
                stream.send_stalled_by_flow_control = true;
                let (id, priority) = (stream.id, stream.priority);
                self.queue_send_stalled_stream(id, priority);
                return None;
            }
            effective = effective.min(session_window as usize);
        }

        let fin = stream.pending_fin && effective == requested;
        if effective > 0 {
            if let Err(e) = stream.send_window.decrease(window_delta(effective)) {
                self.do_drain_session(Err(e), "Stream send window underflow");
                return None;
            }
        }
        let payload = stream.pending_send.split_to(effective).freeze();
        if fin {
            stream.fin_queued = true;
        }
        let stream_id = stream.id;

        if effective > 0 {
            self.send_preface_ping_if_none_in_flight();
            if let Err(e) = self.session_send_window.decrease(window_delta(effective)) {
                self.do_drain_session(Err(e), "Session send window underflow");
                return None;
            }
        }

        let frame = FrameCodec::encode_data_frame(&DataFrame::new(stream_id, payload, fin));
        Some(FrameProducer::Data {
            frame,
            payload_len: effective,
        })
    }

    /// Queue the stream's next DATA frame if it is allowed one now. A
    /// stream has at most one DATA frame queued at a time.
    pub(super) fn queue_next_data_frame(&mut self, key: StreamKey) {
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        if stream.id == 0
            || !stream.request_headers_sent
            || stream.data_write_queued
            || stream.send_stalled_by_flow_control
            || !stream.has_pending_send()
        {
            return;
        }
        let priority = stream.priority;
        let Some(producer) = self.create_data_frame(key) else {
            return;
        };
        if let Some(stream) = self.streams.get_mut(&key) {
            stream.data_write_queued = true;
        }
        self.enqueue_write(priority, FrameType::Data, producer, Some(key));
    }

    fn queue_send_stalled_stream(&mut self, id: StreamId, priority: RequestPriority) {
        let queue = &mut self.send_stalled_streams[priority.index()];
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    fn pop_stream_to_possibly_resume(&mut self) -> Option<StreamId> {
        RequestPriority::HIGHEST_FIRST
            .iter()
            .find_map(|priority| self.send_stalled_streams[priority.index()].pop_front())
    }

    /// Restart a stalled stream whose own window has reopened
    pub(super) fn possibly_resume_if_send_stalled(&mut self, key: StreamKey) {
        let session_window = self.session_send_window.size();
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if !stream.send_stalled_by_flow_control || stream.send_window.is_stalled() {
            return;
        }
        if session_window > 0 {
            stream.send_stalled_by_flow_control = false;
            self.queue_next_data_frame(key);
        } else {
            let (id, priority) = (stream.id, stream.priority);
            self.queue_send_stalled_stream(id, priority);
        }
    }

    /// Hand a reopened session window to parked streams, most urgent first
    pub(super) fn resume_send_stalled_streams(&mut self) {
        while !self.session_send_window.is_stalled() {
            let Some(id) = self.pop_stream_to_possibly_resume() else {
                break;
            };
            if let Some(&key) = self.active.get(&id) {
                self.possibly_resume_if_send_stalled(key);
            }
        }
    }

    /// Return send-window bytes of DATA that will never be written
    pub(super) fn credit_send_window(&mut self, len: usize) {
        if let Err(e) = self.session_send_window.increase(window_delta(len)) {
            warn!(error = %e, len, "could not return discarded bytes to the send window");
            return;
        }
        self.resume_send_stalled_streams();
    }

    /// Apply a session-level WINDOW_UPDATE
    pub(super) fn increase_send_window_size(&mut self, increment: u32) {
        let delta = i32::try_from(increment).unwrap_or(i32::MAX);
        match self.session_send_window.increase(delta) {
            Ok(size) => trace!(increment, size, "session send window increased"),
            Err(e) => {
                // Session window overflow drains as a protocol error
                let error = match e {
                    Error::FlowControl(message) => Error::Protocol(message),
                    other => other,
                };
                self.do_drain_session(Err(error), "Invalid session WINDOW_UPDATE");
                return;
            }
        }
        self.resume_send_stalled_streams();
    }

    /// Apply a stream-level WINDOW_UPDATE
    pub(super) fn increase_stream_send_window_size(&mut self, key: StreamKey, increment: u32) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        let delta = i32::try_from(increment).unwrap_or(i32::MAX);
        if let Err(e) = stream.send_window.increase(delta) {
            let description = e.to_string();
            self.reset_stream(key, ErrorCode::FlowControlError, &description);
            return;
        }
        self.possibly_resume_if_send_stalled(key);
    }

    /// Charge received DATA to the session window. Drains the session and
    /// returns false when the peer overran it.
    pub(super) fn decrease_recv_window_size(&mut self, len: usize) -> bool {
        match self.session_recv_window.decrease(window_delta(len)) {
            Ok(_) => true,
            Err(e) => {
                self.do_drain_session(Err(e), "Session receive window exceeded");
                false
            }
        }
    }

    /// Credit consumed or discarded bytes to the session receive window,
    /// announcing them once enough have built up
    pub(super) fn increase_recv_window_size(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        match self.session_recv_window.increase(window_delta(len)) {
            Ok(Some(increment)) => {
                self.enqueue_window_update(CONNECTION_STREAM_ID, increment, RequestPriority::Highest)
            }
            Ok(None) => {}
            Err(e) => self.do_drain_session(Err(e), "Session receive window overflow"),
        }
    }

    /// Credit a stream's bytes read by its caller
    pub(super) fn increase_stream_recv_window_size(&mut self, key: StreamKey, len: usize) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if stream.fin_received || len == 0 {
            return;
        }
        match stream.recv_window.increase(window_delta(len)) {
            Ok(Some(increment)) => {
                let (id, priority) = (stream.id, stream.priority);
                self.enqueue_window_update(id, increment, priority);
            }
            Ok(None) => {}
            Err(e) => {
                let description = e.to_string();
                self.reset_stream(key, ErrorCode::FlowControlError, &description);
            }
        }
    }

    /// The caller read `len` bytes of a stream's body
    pub(crate) fn on_stream_data_consumed(&mut self, key: StreamKey, len: usize) {
        self.increase_recv_window_size(len);
        self.increase_stream_recv_window_size(key, len);
    }

    /// Shift every stream's send window after the peer changed
    /// SETTINGS_INITIAL_WINDOW_SIZE
    pub(super) fn update_streams_send_window_size(&mut self, delta: i32) {
        let keys: Vec<StreamKey> = self
            .active
            .values()
            .copied()
            .chain(self.created.iter().copied())
            .collect();
        for key in &keys {
            let Some(stream) = self.streams.get_mut(key) else {
                continue;
            };
            if let Err(e) = stream.send_window.adjust(delta) {
                let description = format!(
                    "New SETTINGS_INITIAL_WINDOW_SIZE value overflows flow control window of stream {}",
                    stream.id
                );
                debug!(error = %e, "initial window adjustment failed");
                self.do_drain_session(Err(Error::FlowControl(description.clone())), &description);
                return;
            }
        }
        if delta > 0 {
            for key in keys {
                self.possibly_resume_if_send_stalled(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::clock::ManualClock;
    use crate::http::h2::session::{Session, SessionBuilder, SessionKey};
    use crate::http::{MemoryTransport, MemoryTransportHandle};

    fn session() -> (Session, MemoryTransportHandle) {
        let (transport, peer) = MemoryTransport::new();
        let session = SessionBuilder::new(SessionKey::new("a.test", 443))
            .clock(ManualClock::new())
            .build(transport)
            .unwrap();
        session.run_until_idle().unwrap();
        peer.take_outbound();
        (session, peer)
    }

    #[test]
    fn test_credit_send_window_round_trip() {
        let (session, _peer) = session();
        let mut inner = session.inner_mut().unwrap();
        let before = inner.session_send_window.size();
        inner.session_send_window.decrease(1000).unwrap();
        inner.credit_send_window(1000);
        assert_eq!(inner.session_send_window.size(), before);
    }

    #[test]
    fn test_session_window_update_overflow_drains() {
        let (session, _peer) = session();
        let mut inner = session.inner_mut().unwrap();
        inner.increase_send_window_size(i32::MAX as u32);
        assert_eq!(inner.availability, AvailabilityState::Draining);
        assert!(matches!(inner.error_on_close, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_stalled_stream_queue_has_no_duplicates() {
        let (session, _peer) = session();
        let mut inner = session.inner_mut().unwrap();
        inner.queue_send_stalled_stream(1, RequestPriority::Low);
        inner.queue_send_stalled_stream(1, RequestPriority::Low);
        inner.queue_send_stalled_stream(3, RequestPriority::Highest);
        assert_eq!(inner.pop_stream_to_possibly_resume(), Some(3));
        assert_eq!(inner.pop_stream_to_possibly_resume(), Some(1));
        assert_eq!(inner.pop_stream_to_possibly_resume(), None);
    }
}
