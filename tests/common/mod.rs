//! Scripted HTTP/2 server peer for driving a client session in tests

#![allow(dead_code)]

use bytes::Bytes;
use h2mux::http::h2::codec::{FrameCodec, FrameDecoder, HeaderEncoder};
use h2mux::http::h2::frames::{
    DataFrame, FrameEvent, GoawayFrame, HeadersFrame, PingFrame, PushPromiseFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use h2mux::http::h2::settings::Settings;
use h2mux::http::h2::{
    ErrorCode, ManualClock, RequestPriority, Session, SessionBuilder, SessionKey, StreamHandle, StreamId,
    CONNECTION_PREFACE,
};
use h2mux::http::{MemoryTransport, MemoryTransportHandle};

pub const ORIGIN: &str = "https://www.example.org";

/// Install a fmt subscriber once per test binary; `RUST_LOG` controls it
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Server side of a [`MemoryTransport`]
pub struct ServerPeer {
    pub transport: MemoryTransportHandle,
    decoder: FrameDecoder,
    encoder: HeaderEncoder,
    preface_seen: bool,
}

impl ServerPeer {
    pub fn new(transport: MemoryTransportHandle) -> Self {
        ServerPeer {
            transport,
            decoder: FrameDecoder::new(16 * 1024 * 1024, 1024 * 1024),
            encoder: HeaderEncoder::new(),
            preface_seen: false,
        }
    }

    /// Decode everything the client has written since the last call
    pub fn frames(&mut self) -> Vec<FrameEvent> {
        let out = self.transport.take_outbound();
        let mut data = &out[..];
        if !self.preface_seen && !data.is_empty() {
            assert!(data.starts_with(CONNECTION_PREFACE), "client did not start with the preface");
            data = &data[CONNECTION_PREFACE.len()..];
            self.preface_seen = true;
        }
        self.decoder.push(data);
        let mut events = Vec::new();
        while let Some(event) = self.decoder.next_event().expect("client wrote a malformed frame") {
            events.push(event);
        }
        events
    }

    pub fn send_raw(&self, data: &[u8]) {
        self.transport.push_inbound(data);
    }

    pub fn send_settings(&self, settings: Settings) {
        self.send_raw(&FrameCodec::encode_settings_frame(&SettingsFrame::new(settings)));
    }

    pub fn send_settings_ack(&self) {
        self.send_raw(&FrameCodec::encode_settings_frame(&SettingsFrame::ack()));
    }

    pub fn send_headers(&mut self, stream_id: StreamId, headers: &[(&str, &str)], end_stream: bool) {
        let block = self.encode(headers);
        let frame = HeadersFrame::new(stream_id, block, end_stream);
        self.send_raw(&FrameCodec::encode_headers_frame(&frame, 16384));
    }

    pub fn send_response(&mut self, stream_id: StreamId, status: u16, end_stream: bool) {
        let status = status.to_string();
        self.send_headers(stream_id, &[(":status", &status)], end_stream);
    }

    pub fn send_data(&self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(data), end_stream);
        self.send_raw(&FrameCodec::encode_data_frame(&frame));
    }

    pub fn send_padded_data(&self, stream_id: StreamId, data: &[u8], padding: u8, end_stream: bool) {
        let frame = DataFrame::new(stream_id, Bytes::copy_from_slice(data), end_stream).with_padding(padding);
        self.send_raw(&FrameCodec::encode_data_frame(&frame));
    }

    /// PUSH_PROMISE for a GET of `url` on `associated_id`
    pub fn send_push_promise(&mut self, associated_id: StreamId, promised_id: StreamId, url: &str) {
        let url = url::Url::parse(url).expect("push url");
        let authority = match url.port() {
            Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        self.send_push_promise_headers(
            associated_id,
            promised_id,
            &[
                (":method", "GET"),
                (":scheme", url.scheme()),
                (":authority", &authority),
                (":path", url.path()),
            ],
        );
    }

    pub fn send_push_promise_headers(&mut self, associated_id: StreamId, promised_id: StreamId, headers: &[(&str, &str)]) {
        let header_block = self.encode(headers);
        let frame = PushPromiseFrame {
            stream_id: associated_id,
            promised_stream_id: promised_id,
            header_block,
        };
        self.send_raw(&FrameCodec::encode_push_promise_frame(&frame, 16384));
    }

    pub fn send_rst_stream(&self, stream_id: StreamId, error_code: ErrorCode) {
        let frame = RstStreamFrame { stream_id, error_code };
        self.send_raw(&FrameCodec::encode_rst_stream_frame(&frame));
    }

    pub fn send_goaway(&self, last_stream_id: StreamId, code: ErrorCode) {
        let frame = GoawayFrame::new(last_stream_id, code, Bytes::new());
        self.send_raw(&FrameCodec::encode_goaway_frame(&frame));
    }

    pub fn send_window_update(&self, stream_id: StreamId, increment: u32) {
        let frame = WindowUpdateFrame::new(stream_id, increment);
        self.send_raw(&FrameCodec::encode_window_update_frame(&frame));
    }

    pub fn send_ping(&self, id: u64) {
        self.send_raw(&FrameCodec::encode_ping_frame(&PingFrame::new(id)));
    }

    pub fn send_ping_ack(&self, data: [u8; 8]) {
        self.send_raw(&FrameCodec::encode_ping_frame(&PingFrame::ack(data)));
    }

    fn encode(&mut self, headers: &[(&str, &str)]) -> Bytes {
        let list: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.encoder.encode(&list).expect("hpack encode")
    }
}

/// A session over an in-memory transport with a manual clock. The
/// preface and initial SETTINGS have already been written and discarded.
pub struct Harness {
    pub session: Session,
    pub peer: ServerPeer,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_builder(|builder| builder)
    }

    pub fn with_builder(configure: impl FnOnce(SessionBuilder) -> SessionBuilder) -> Self {
        setup_tracing();
        let (transport, handle) = MemoryTransport::new();
        let clock = ManualClock::new();
        let builder = SessionBuilder::new(SessionKey::new("www.example.org", 443)).clock(clock.clone());
        let session = configure(builder).build(transport).expect("session");
        session.run_until_idle().expect("initial turn");
        let mut peer = ServerPeer::new(handle);
        let initial = peer.frames();
        assert!(matches!(initial.first(), Some(FrameEvent::Settings { .. })));
        Harness { session, peer, clock }
    }

    /// Let the session read whatever the peer sent and flush its writes
    pub fn turn(&self) {
        self.session.on_transport_readable().expect("session turn");
    }

    /// Open a stream and queue a GET without body
    pub fn open_get(&self, path: &str, priority: RequestPriority) -> StreamHandle {
        let mut request = self
            .session
            .request_stream(&format!("{}{}", ORIGIN, path), priority)
            .expect("request stream");
        let stream = request.try_take().expect("stream below the limit").expect("stream");
        stream.send_request("GET", &[], true).expect("send request");
        stream
    }
}

/// Ids of all HEADERS frames in `events`
pub fn headers_ids(events: &[FrameEvent]) -> Vec<StreamId> {
    events
        .iter()
        .filter_map(|event| match event {
            FrameEvent::Headers { stream_id, .. } => Some(*stream_id),
            _ => None,
        })
        .collect()
}

/// (stream id, code) of all RST_STREAM frames in `events`
pub fn resets(events: &[FrameEvent]) -> Vec<(StreamId, ErrorCode)> {
    events
        .iter()
        .filter_map(|event| match event {
            FrameEvent::RstStream { stream_id, error_code } => Some((*stream_id, *error_code)),
            _ => None,
        })
        .collect()
}

/// Code of the GOAWAY in `events`, if any
pub fn goaway_code(events: &[FrameEvent]) -> Option<ErrorCode> {
    events.iter().find_map(|event| match event {
        FrameEvent::Goaway { error_code, .. } => Some(*error_code),
        _ => None,
    })
}

/// (stream id, increment) of all WINDOW_UPDATE frames in `events`
pub fn window_updates(events: &[FrameEvent]) -> Vec<(StreamId, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            FrameEvent::WindowUpdate { stream_id, increment } => Some((*stream_id, *increment)),
            _ => None,
        })
        .collect()
}

/// Total DATA payload bytes per frame for `stream_id`
pub fn data_lens(events: &[FrameEvent], stream_id: StreamId) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            FrameEvent::Data {
                stream_id: id, payload, ..
            } if *id == stream_id => Some(payload.len()),
            _ => None,
        })
        .collect()
}
