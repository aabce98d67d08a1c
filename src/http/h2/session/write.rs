//! Write loop, outbound frame queueing and keepalive pings

use super::tasks::Task;
use super::{AvailabilityState, SessionInner, WriteState};
use crate::http::h2::codec::FrameCodec;
use crate::http::h2::error::{Error, ErrorCode};
use crate::http::h2::frames::{
    FrameFlags, FrameType, GoawayFrame, HeadersFrame, PingFrame, PriorityFrame, PrioritySpec, RstStreamFrame,
    SettingsFrame, WindowUpdateFrame,
};
use crate::http::h2::priority::legacy::{to_spdy_priority, weight_for};
use crate::http::h2::priority::RequestPriority;
use crate::http::h2::stream::{StreamId, StreamKey};
use crate::http::h2::write_queue::{FrameProducer, WriteQueueEntry};
use crate::http::h2::{CONNECTION_PREFACE, CONNECTION_STREAM_ID, MAX_STREAM_ID};
use bytes::{Bytes, BytesMut};
use std::io;
use tracing::{debug, trace};

/// Frame currently being handed to the transport
#[derive(Debug)]
pub(crate) struct InFlightWrite {
    pub(super) frame_type: FrameType,
    /// Cleared when the stream closes mid-write
    pub(super) stream: Option<StreamKey>,
    data: Bytes,
    offset: usize,
    /// Flow-controlled DATA bytes inside `data`
    payload_len: usize,
    end_stream: bool,
}

impl InFlightWrite {
    fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

impl SessionInner {
    pub(super) fn pump_write_loop(&mut self) {
        if self.write_state != WriteState::DoWrite {
            return;
        }
        if let Err(e) = self.do_write_loop() {
            debug!(error = %e, "write loop not run");
        }
        self.maybe_destroy();
    }

    pub(super) fn maybe_post_write_loop(&mut self) {
        if self.write_state == WriteState::Idle {
            self.write_state = WriteState::DoWrite;
            self.tasks.post(Task::PumpWrite);
        }
    }

    /// Write queued frames until the queue is empty or the transport
    /// pushes back
    pub(super) fn do_write_loop(&mut self) -> Result<(), Error> {
        if self.in_io_loop {
            return Err(Error::ReentrantLoop);
        }
        self.in_io_loop = true;

        let mut result = Ok(0);
        loop {
            match self.write_state {
                WriteState::Idle => break,
                WriteState::DoWrite => {
                    if let Some(r) = self.do_write() {
                        result = r;
                    }
                }
                WriteState::DoWriteComplete => {
                    let r = std::mem::replace(&mut result, Ok(0));
                    if !self.do_write_complete(r) {
                        break;
                    }
                }
            }
        }

        self.in_io_loop = false;
        Ok(())
    }

    /// Start (or retry) the in-flight write. `None` when there is nothing
    /// to write; the loop is then idle.
    fn do_write(&mut self) -> Option<io::Result<usize>> {
        while self.in_flight_write.is_none() {
            let Some(entry) = self.write_queue.dequeue() else {
                self.write_state = WriteState::Idle;
                return None;
            };
            self.in_flight_write = self.produce_write(entry);
        }

        self.write_state = WriteState::DoWriteComplete;
        let write = self.in_flight_write.as_ref()?;
        Some(self.transport.write(write.remaining()))
    }

    /// Returns false when the loop has to wait for the transport
    fn do_write_complete(&mut self, result: io::Result<usize>) -> bool {
        self.write_state = WriteState::DoWrite;
        let written = match result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("write blocked");
                self.write_blocked = true;
                return false;
            }
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) => Err(Error::from(e)),
        };
        self.last_activity = self.clock.now();

        let n = match written {
            Ok(n) => n,
            Err(error) => {
                if let Some(write) = self.in_flight_write.take() {
                    if write.payload_len > 0 {
                        self.credit_send_window(write.payload_len);
                    }
                }
                self.do_drain_session(Err(error), "Write error");
                return true;
            }
        };

        let Some(write) = self.in_flight_write.as_mut() else {
            return true;
        };
        write.offset += n;
        if write.offset < write.data.len() {
            return true;
        }

        if let Some(write) = self.in_flight_write.take() {
            trace!(frame = write.frame_type.name(), len = write.data.len(), "frame written");
            if let Some(key) = write.stream {
                self.on_frame_write_complete(key, write.frame_type, write.payload_len, write.end_stream);
            }
        }
        true
    }

    /// Turn a dequeued entry into bytes. `None` skips the entry.
    fn produce_write(&mut self, entry: WriteQueueEntry) -> Option<InFlightWrite> {
        let WriteQueueEntry {
            frame_type,
            producer,
            stream,
        } = entry;
        match producer {
            FrameProducer::Serialized(data) => Some(InFlightWrite {
                frame_type,
                stream,
                data,
                offset: 0,
                payload_len: 0,
                end_stream: false,
            }),
            FrameProducer::Data { frame, payload_len } => {
                let end_stream = frame.get(4).is_some_and(|flags| flags & FrameFlags::END_STREAM != 0);
                Some(InFlightWrite {
                    frame_type,
                    stream,
                    data: frame,
                    offset: 0,
                    payload_len,
                    end_stream,
                })
            }
            FrameProducer::Headers { headers, end_stream } => {
                let key = stream?;
                let id = self.activate_created_stream(key)?;
                let priority = self.streams.get(&key)?.priority;

                self.send_preface_ping_if_none_in_flight();
                let (parent, exclusive) = self.priority_tree.on_stream_creation(id, to_spdy_priority(priority));
                let block = match self.header_encoder.encode(&headers) {
                    Ok(block) => block,
                    Err(e) => {
                        self.do_drain_session(Err(e), "Failed to encode request headers");
                        return None;
                    }
                };
                let frame = HeadersFrame::new(id, block, end_stream)
                    .with_priority(PrioritySpec::new(parent, exclusive, weight_for(priority)));
                let data = FrameCodec::encode_headers_frame(&frame, self.peer_max_frame_size as usize);
                Some(InFlightWrite {
                    frame_type,
                    stream,
                    data,
                    offset: 0,
                    payload_len: 0,
                    end_stream,
                })
            }
        }
    }

    /// Give a created stream the next client stream id. Ids are handed out
    /// in write order so they increase on the wire.
    fn activate_created_stream(&mut self, key: StreamKey) -> Option<StreamId> {
        if !self.created.remove(&key) {
            return None;
        }
        let id = self.stream_hi_water_mark;
        self.stream_hi_water_mark += 2;
        self.streams.get_mut(&key)?.set_id(id);
        self.active.insert(id, key);
        self.streams_initiated_count += 1;
        debug!(?key, stream_id = id, "stream activated");

        if self.stream_hi_water_mark > MAX_STREAM_ID {
            // No stream can follow this one
            self.make_unavailable();
            self.start_going_away(MAX_STREAM_ID, Error::Aborted);
        }
        Some(id)
    }

    fn on_frame_write_complete(&mut self, key: StreamKey, frame_type: FrameType, payload_len: usize, end_stream: bool) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        match frame_type {
            FrameType::Headers => stream.request_headers_sent = true,
            FrameType::Data => {
                stream.data_write_queued = false;
                stream.send_bytes += payload_len as u64;
            }
            _ => return,
        }
        if end_stream {
            stream.fin_sent = true;
        }

        if stream.fin_sent && stream.fin_received {
            self.close_stream(key, Ok(()));
        } else {
            self.queue_next_data_frame(key);
        }
    }

    // Enqueueing

    /// Queue a frame. Writes are dropped once the session is draining.
    pub(super) fn enqueue_write(
        &mut self,
        priority: RequestPriority,
        frame_type: FrameType,
        producer: FrameProducer,
        stream: Option<StreamKey>,
    ) {
        if self.availability == AvailabilityState::Draining {
            return;
        }
        self.write_queue.enqueue(priority, frame_type, producer, stream);
        self.maybe_post_write_loop();
    }

    fn enqueue_session_write(&mut self, priority: RequestPriority, frame_type: FrameType, data: Bytes) {
        self.enqueue_write(priority, frame_type, FrameProducer::Serialized(data), None);
    }

    /// Preface, SETTINGS and the session window bump, as one write
    pub(super) fn send_initial_data(&mut self) {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(CONNECTION_PREFACE);
        let settings = SettingsFrame::new(self.config.initial_settings());
        buf.extend_from_slice(&FrameCodec::encode_settings_frame(&settings));
        if let Some(delta) = self.session_recv_window.open_to_max() {
            let update = WindowUpdateFrame::new(CONNECTION_STREAM_ID, delta as u32);
            buf.extend_from_slice(&FrameCodec::encode_window_update_frame(&update));
        }
        self.enqueue_session_write(RequestPriority::Highest, FrameType::Settings, buf.freeze());
    }

    pub(super) fn enqueue_goaway_frame(&mut self, code: ErrorCode, description: &str) {
        let frame = GoawayFrame::new(
            self.last_accepted_push_stream_id,
            code,
            Bytes::copy_from_slice(description.as_bytes()),
        );
        self.enqueue_session_write(
            RequestPriority::Highest,
            FrameType::Goaway,
            FrameCodec::encode_goaway_frame(&frame),
        );
    }

    pub(super) fn enqueue_reset_stream_frame(&mut self, stream_id: StreamId, code: ErrorCode, description: &str) {
        debug!(stream_id, code = code.name(), description, "sending RST_STREAM");
        let frame = RstStreamFrame {
            stream_id,
            error_code: code,
        };
        self.enqueue_session_write(
            RequestPriority::Highest,
            FrameType::RstStream,
            FrameCodec::encode_rst_stream_frame(&frame),
        );
    }

    pub(super) fn enqueue_settings_ack(&mut self) {
        self.enqueue_session_write(
            RequestPriority::Highest,
            FrameType::Settings,
            FrameCodec::encode_settings_frame(&SettingsFrame::ack()),
        );
    }

    pub(super) fn enqueue_window_update(&mut self, stream_id: StreamId, increment: i32, priority: RequestPriority) {
        trace!(stream_id, increment, "sending WINDOW_UPDATE");
        let frame = WindowUpdateFrame::new(stream_id, increment as u32);
        self.enqueue_session_write(
            priority,
            FrameType::WindowUpdate,
            FrameCodec::encode_window_update_frame(&frame),
        );
    }

    pub(super) fn enqueue_priority_frame(&mut self, stream_id: StreamId, priority: PrioritySpec) {
        let frame = PriorityFrame { stream_id, priority };
        self.enqueue_session_write(
            RequestPriority::Highest,
            FrameType::Priority,
            FrameCodec::encode_priority_frame(&frame),
        );
    }

    /// Move an active stream in the dependency tree and tell the peer
    pub(super) fn update_stream_dependencies(&mut self, id: StreamId, priority: RequestPriority) {
        for update in self.priority_tree.on_stream_update(id, to_spdy_priority(priority)) {
            let weight = self
                .active
                .get(&update.id)
                .and_then(|key| self.streams.get(key))
                .map_or_else(|| weight_for(priority), |stream| weight_for(stream.priority));
            let spec = PrioritySpec::new(update.parent_stream_id, update.exclusive, weight);
            self.enqueue_priority_frame(update.id, spec);
        }
    }

    // Pings

    /// Ping before writing on a connection that has been quiet long enough
    /// to be suspect
    pub(super) fn send_preface_ping_if_none_in_flight(&mut self) {
        if self.pings_in_flight > 0 || !self.config.enable_ping_based_connection_checking {
            return;
        }
        let idle = self.clock.now().saturating_duration_since(self.last_activity);
        if idle > self.config.connection_at_risk_of_loss_time {
            self.write_ping_frame(PingFrame::new(self.next_ping_id));
        }
    }

    pub(super) fn write_ping_frame(&mut self, frame: PingFrame) {
        self.enqueue_session_write(RequestPriority::Highest, FrameType::Ping, FrameCodec::encode_ping_frame(&frame));
        if frame.ack {
            return;
        }
        debug!(ping_id = frame.id(), "sending PING");
        self.next_ping_id += 2;
        self.pings_in_flight += 1;
        self.plan_to_check_ping_status();
        self.last_ping_sent = Some(self.clock.now());
    }

    fn plan_to_check_ping_status(&mut self) {
        if self.check_ping_status_pending {
            return;
        }
        self.check_ping_status_pending = true;
        let now = self.clock.now();
        self.tasks.post_delayed(
            Task::CheckPingStatus { last_check_time: now },
            now + self.config.hung_interval,
        );
    }

    /// Fail the session when nothing was read for a whole hung interval
    /// while a ping is outstanding
    pub(super) fn check_ping_status(&mut self, last_check_time: std::time::Instant) {
        if self.pings_in_flight == 0 {
            self.check_ping_status_pending = false;
            return;
        }
        let now = self.clock.now();
        let idle = now.saturating_duration_since(self.last_activity);
        if idle > self.config.hung_interval || self.last_activity < last_check_time {
            self.do_drain_session(Err(Error::PingFailed), "Failed ping.");
            return;
        }
        let delay = self.config.hung_interval - idle;
        self.tasks.post_delayed(Task::CheckPingStatus { last_check_time: now }, now + delay);
    }
}
