//! Read loop and inbound frame dispatch

use super::tasks::Task;
use super::{AvailabilityState, ReadState, SessionInner};
use crate::http::h2::error::{Error, ErrorCode};
use crate::http::h2::frames::{FrameEvent, HeaderList, PingFrame};
use crate::http::h2::priority::legacy::{from_spdy_priority, weight_to_spdy_priority};
use crate::http::h2::settings::{Settings, SettingsParameter};
use crate::http::h2::stream::{header_value, StreamId, StreamKey};
use bytes::Bytes;
use std::io;
use tracing::{debug, trace, warn};

impl SessionInner {
    pub(super) fn pump_read_loop(&mut self) {
        if self.availability == AvailabilityState::Draining {
            return;
        }
        if let Err(e) = self.do_read_loop() {
            debug!(error = %e, "read loop not run");
        }
        self.maybe_destroy();
    }

    /// Read and dispatch frames until the transport has nothing more, the
    /// session drains, or this turn's budget is spent
    pub(super) fn do_read_loop(&mut self) -> Result<(), Error> {
        if self.in_io_loop {
            return Err(Error::ReentrantLoop);
        }
        self.in_io_loop = true;

        let started = self.clock.now();
        let mut bytes_read_without_yielding = 0;
        let mut result: io::Result<usize> = Ok(0);
        loop {
            let pending = match self.read_state {
                ReadState::DoRead => {
                    result = self.do_read();
                    matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock)
                }
                ReadState::DoReadComplete => {
                    let r = std::mem::replace(&mut result, Ok(0));
                    if let Ok(n) = r {
                        bytes_read_without_yielding += n;
                    }
                    self.do_read_complete(r);
                    false
                }
            };

            if self.availability == AvailabilityState::Draining || pending {
                break;
            }
            if self.read_state == ReadState::DoRead
                && (bytes_read_without_yielding > self.config.yield_after_bytes_read
                    || self.clock.now().saturating_duration_since(started) > self.config.yield_after_duration)
            {
                trace!(bytes_read_without_yielding, "read loop yielding");
                self.tasks.post(Task::PumpRead);
                break;
            }
        }

        self.in_io_loop = false;
        Ok(())
    }

    fn do_read(&mut self) -> io::Result<usize> {
        let result = self.transport.read(&mut self.read_buf);
        match &result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            _ => self.read_state = ReadState::DoReadComplete,
        }
        result
    }

    fn do_read_complete(&mut self, result: io::Result<usize>) {
        self.read_state = ReadState::DoRead;
        let n = match result {
            Ok(0) => {
                self.do_drain_session(Err(Error::ConnectionClosed), "Connection closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                self.do_drain_session(Err(Error::from(e)), "Read error");
                return;
            }
        };

        self.last_activity = self.clock.now();
        trace!(len = n, "read from transport");
        self.decoder.push(&self.read_buf[..n]);

        while self.availability != AvailabilityState::Draining {
            match self.decoder.next_event() {
                Ok(Some(event)) => self.on_frame_event(event),
                Ok(None) => break,
                Err(e) => {
                    let description = e.to_string();
                    self.do_drain_session(Err(e), &description);
                }
            }
        }
    }

    fn on_frame_event(&mut self, event: FrameEvent) {
        self.frames_received += 1;
        match event {
            FrameEvent::Data {
                stream_id,
                payload,
                padding,
                end_stream,
            } => self.on_data(stream_id, payload, padding, end_stream),
            FrameEvent::Headers {
                stream_id,
                end_stream,
                headers,
                ..
            } => self.on_headers(stream_id, headers, end_stream),
            FrameEvent::Priority { stream_id, priority } => {
                let level = from_spdy_priority(weight_to_spdy_priority(priority.weight));
                trace!(
                    stream_id,
                    weight = priority.weight,
                    priority = level.name(),
                    "ignoring PRIORITY from server"
                );
            }
            FrameEvent::RstStream { stream_id, error_code } => self.on_rst_stream(stream_id, error_code),
            FrameEvent::Settings { settings } => self.on_settings(settings),
            FrameEvent::SettingsAck => trace!("SETTINGS acknowledged"),
            FrameEvent::PushPromise {
                stream_id,
                promised_stream_id,
                headers,
            } => self.on_push_promise(stream_id, promised_stream_id, headers),
            FrameEvent::Ping { ack, data } => self.on_ping(ack, data),
            FrameEvent::Goaway {
                last_stream_id,
                error_code,
                debug_data,
            } => self.on_goaway(last_stream_id, error_code, debug_data),
            FrameEvent::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            FrameEvent::Unknown { stream_id, frame_type } => self.on_unknown_frame(stream_id, frame_type),
            FrameEvent::StreamError {
                stream_id,
                description,
            } => self.on_stream_error(stream_id, &description),
        }
    }

    fn active_stream(&self, stream_id: StreamId) -> Option<StreamKey> {
        self.active.get(&stream_id).copied()
    }

    fn on_data(&mut self, stream_id: StreamId, payload: Bytes, padding: usize, end_stream: bool) {
        let len = payload.len();
        trace!(stream_id, len, padding, end_stream, "DATA");

        if !self.decrease_recv_window_size(len + padding) {
            return;
        }
        // Padding is never delivered; hand it straight back
        self.increase_recv_window_size(padding);

        let Some(key) = self.active_stream(stream_id) else {
            debug!(stream_id, "DATA for unknown stream");
            self.increase_recv_window_size(len);
            return;
        };
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        if stream.fin_received {
            self.reset_stream(key, ErrorCode::StreamClosed, "Data received after END_STREAM.");
            self.increase_recv_window_size(len);
            return;
        }
        if !stream.response_headers_received {
            self.reset_stream(key, ErrorCode::ProtocolError, "Data received before headers.");
            self.increase_recv_window_size(len);
            return;
        }

        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if let Err(e) = stream.recv_window.decrease((len + padding) as i32) {
            let description = e.to_string();
            self.do_drain_session(Err(e), &description);
            return;
        }
        stream.recv_bytes += len as u64;
        if len > 0 {
            stream.inbox.borrow_mut().data.push_back(payload);
        }
        self.increase_stream_recv_window_size(key, padding);

        if end_stream {
            self.on_fin_received(key);
        }
    }

    fn on_fin_received(&mut self, key: StreamKey) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.fin_received = true;
        stream.inbox.borrow_mut().fin_received = true;
        if stream.fin_sent && stream.claimed {
            self.close_stream(key, Ok(()));
        }
    }

    fn on_headers(&mut self, stream_id: StreamId, headers: HeaderList, end_stream: bool) {
        trace!(stream_id, end_stream, count = headers.len(), "HEADERS");
        let Some(key) = self.active_stream(stream_id) else {
            debug!(stream_id, "HEADERS for unknown stream");
            return;
        };
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };

        if stream.is_push() && !stream.active_push {
            if self.num_active_pushed >= self.max_concurrent_pushed_streams {
                self.reset_stream(key, ErrorCode::RefusedStream, "Too many pushed streams.");
                return;
            }
            stream.active_push = true;
            self.num_active_pushed += 1;
        }

        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if !stream.response_headers_received {
            let status = header_value(&headers, ":status").map(str::to_string);
            let Some(status) = status else {
                self.reset_stream(key, ErrorCode::ProtocolError, "Response headers do not include :status.");
                return;
            };
            if status.starts_with('1') {
                trace!(stream_id, %status, "skipping informational response");
                return;
            }
            stream.response_headers_received = true;
            stream.inbox.borrow_mut().response_headers = Some(headers);
        } else {
            if !end_stream {
                self.reset_stream(key, ErrorCode::ProtocolError, "Trailers must end the stream.");
                return;
            }
            stream.inbox.borrow_mut().trailers = Some(headers);
        }

        if end_stream {
            self.on_fin_received(key);
        }
    }

    fn on_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        let Some(key) = self.active_stream(stream_id) else {
            warn!(stream_id, code = code.name(), "RST_STREAM for unknown stream");
            return;
        };
        debug!(stream_id, code = code.name(), "stream reset by peer");
        match code {
            ErrorCode::NoError => self.close_stream(key, Err(Error::RstStreamNoError)),
            ErrorCode::RefusedStream => self.close_stream(key, Err(Error::RefusedStream)),
            ErrorCode::Http11Required => {
                self.do_drain_session(Err(Error::Http11Required), "HTTP_1_1_REQUIRED for stream.")
            }
            code => self.close_stream(key, Err(Error::StreamReset(code))),
        }
    }

    fn on_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode, debug_data: Bytes) {
        debug!(
            last_stream_id,
            code = code.name(),
            debug_data = %String::from_utf8_lossy(&debug_data),
            active_streams = self.active.len(),
            "GOAWAY received"
        );
        self.make_unavailable();
        if code == ErrorCode::Http11Required {
            self.do_drain_session(Err(Error::Http11Required), "HTTP_1_1_REQUIRED for stream.");
            return;
        }
        self.start_going_away(last_stream_id, Error::RefusedStream);
        self.maybe_finish_going_away();
    }

    fn on_window_update(&mut self, stream_id: StreamId, increment: u32) {
        trace!(stream_id, increment, "WINDOW_UPDATE");
        if stream_id == 0 {
            if increment < 1 {
                self.do_drain_session(
                    Err(Error::Protocol(format!("Received WINDOW_UPDATE with an invalid delta {}", increment))),
                    "Invalid session WINDOW_UPDATE",
                );
                return;
            }
            self.increase_send_window_size(increment);
            return;
        }

        let Some(key) = self.active_stream(stream_id) else {
            trace!(stream_id, "WINDOW_UPDATE for unknown stream");
            return;
        };
        if increment < 1 {
            self.reset_stream(
                key,
                ErrorCode::FlowControlError,
                &format!("Received WINDOW_UPDATE with an invalid delta {}", increment),
            );
            return;
        }
        self.increase_stream_send_window_size(key, increment);
    }

    fn on_settings(&mut self, settings: Settings) {
        for (param, value) in settings.iter() {
            self.handle_setting(param, value);
            if self.availability == AvailabilityState::Draining {
                return;
            }
        }
        self.enqueue_settings_ack();
    }

    fn handle_setting(&mut self, param: SettingsParameter, value: u32) {
        debug!(setting = param.name(), value, "peer setting");
        match param {
            SettingsParameter::MaxConcurrentStreams => {
                self.max_concurrent_streams = value.min(self.config.max_concurrent_stream_limit) as usize;
                self.process_pending_stream_requests();
            }
            SettingsParameter::InitialWindowSize => {
                if value > i32::MAX as u32 {
                    self.do_drain_session(
                        Err(Error::FlowControl(format!("Invalid initial window size {}", value))),
                        "Invalid SETTINGS_INITIAL_WINDOW_SIZE",
                    );
                    return;
                }
                let value = value as i32;
                let delta = value - self.stream_initial_send_window_size;
                self.stream_initial_send_window_size = value;
                self.update_streams_send_window_size(delta);
            }
            SettingsParameter::MaxFrameSize => self.peer_max_frame_size = value,
            _ => {}
        }
    }

    fn on_ping(&mut self, ack: bool, data: [u8; 8]) {
        if !ack {
            trace!("answering PING");
            self.write_ping_frame(PingFrame::ack(data));
            return;
        }
        self.pings_in_flight -= 1;
        if self.pings_in_flight < 0 {
            self.do_drain_session(Err(Error::Protocol("Unexpected PING ACK.".to_string())), "Unexpected PING ACK.");
            return;
        }
        if let Some(sent) = self.last_ping_sent {
            let rtt = self.clock.now().saturating_duration_since(sent);
            debug!(ping_id = u64::from_be_bytes(data), ?rtt, "PING acknowledged");
        }
    }

    fn on_unknown_frame(&mut self, stream_id: StreamId, frame_type: u8) {
        let implausible = if stream_id % 2 == 1 {
            stream_id >= self.stream_hi_water_mark
        } else {
            stream_id > self.last_accepted_push_stream_id
        };
        if implausible {
            self.do_drain_session(
                Err(Error::Protocol(format!(
                    "Unknown frame type {:#x} on unused stream {}",
                    frame_type, stream_id
                ))),
                "Received unknown frame on an unused stream",
            );
            return;
        }
        trace!(stream_id, frame_type, "ignoring unknown frame");
    }

    fn on_stream_error(&mut self, stream_id: StreamId, description: &str) {
        warn!(stream_id, description, "stream error");
        match self.active_stream(stream_id) {
            Some(key) => self.reset_stream(key, ErrorCode::ProtocolError, description),
            None => self.enqueue_reset_stream_frame(stream_id, ErrorCode::ProtocolError, description),
        }
    }
}
