//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] serializes outbound frames into contiguous buffers.
//! [`FrameDecoder`] is the incremental inbound side: bytes are pushed in as
//! they arrive from the transport and complete frames are pulled out as
//! [`FrameEvent`]s, with header blocks reassembled and HPACK-decoded.

use super::error::{Error, ErrorCode, Result};
use super::frames::*;
use super::stream::StreamId;
use super::{DEFAULT_MAX_FRAME_SIZE, MAX_STREAM_ID};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Maximum frame payload size (16MB - 1)
pub const MAX_FRAME_SIZE: usize = 0x00FFFFFF;

/// Per-entry overhead counted against SETTINGS_MAX_HEADER_LIST_SIZE
const HEADER_ENTRY_OVERHEAD: usize = 32;

/// Parsed 9-octet frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    /// Raw type octet; extension types have no [`FrameType`]
    pub frame_type: u8,
    pub flags: FrameFlags,
    pub stream_id: StreamId,
}

/// Stateless frame serializer
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame header
    pub fn encode_header(
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        header[0] = ((length >> 16) & 0xFF) as u8;
        header[1] = ((length >> 8) & 0xFF) as u8;
        header[2] = (length & 0xFF) as u8;
        header[3] = frame_type.as_u8();
        header[4] = flags.as_u8();

        // Reserved bit is always sent as 0
        let stream_id = stream_id & MAX_STREAM_ID;
        header[5..9].copy_from_slice(&stream_id.to_be_bytes());

        header
    }

    /// Decode a frame header
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | (bytes[2] as usize);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & MAX_STREAM_ID;

        FrameHeader {
            length,
            frame_type: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(frame: &DataFrame) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        let payload_len = frame.flow_controlled_len();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Data, flags, frame.stream_id, payload_len));

        match frame.padding {
            Some(pad_len) => {
                buf.put_u8(pad_len);
                buf.put_slice(&frame.data);
                buf.put_bytes(0, pad_len as usize);
            }
            None => buf.put_slice(&frame.data),
        }

        buf.freeze()
    }

    /// Encode a HEADERS frame, continuing the header block in CONTINUATION
    /// frames when it does not fit in `max_frame_size`.
    pub fn encode_headers_frame(frame: &HeadersFrame, max_frame_size: usize) -> Bytes {
        let mut flags = FrameFlags::empty();
        if frame.end_stream {
            flags.set(FrameFlags::END_STREAM);
        }

        let mut prefix = BytesMut::new();
        if let Some(priority) = &frame.priority {
            flags.set(FrameFlags::PRIORITY);
            Self::put_priority(&mut prefix, priority);
        }

        Self::encode_header_block(
            FrameType::Headers,
            flags,
            frame.stream_id,
            &prefix,
            &frame.header_block,
            max_frame_size,
        )
    }

    /// Encode a PUSH_PROMISE frame, with CONTINUATION frames as needed
    pub fn encode_push_promise_frame(frame: &PushPromiseFrame, max_frame_size: usize) -> Bytes {
        let mut prefix = BytesMut::with_capacity(4);
        prefix.put_u32(frame.promised_stream_id & MAX_STREAM_ID);

        Self::encode_header_block(
            FrameType::PushPromise,
            FrameFlags::empty(),
            frame.stream_id,
            &prefix,
            &frame.header_block,
            max_frame_size,
        )
    }

    fn encode_header_block(
        frame_type: FrameType,
        mut flags: FrameFlags,
        stream_id: StreamId,
        prefix: &[u8],
        block: &[u8],
        max_frame_size: usize,
    ) -> Bytes {
        let max_frame_size = max_frame_size.clamp(DEFAULT_MAX_FRAME_SIZE as usize, MAX_FRAME_SIZE);
        let first_len = block.len().min(max_frame_size - prefix.len());
        let (first, mut rest) = block.split_at(first_len);

        if rest.is_empty() {
            flags.set(FrameFlags::END_HEADERS);
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + prefix.len() + block.len());
        buf.put_slice(&Self::encode_header(frame_type, flags, stream_id, prefix.len() + first.len()));
        buf.put_slice(prefix);
        buf.put_slice(first);

        while !rest.is_empty() {
            let len = rest.len().min(max_frame_size);
            let (chunk, tail) = rest.split_at(len);
            let mut flags = FrameFlags::empty();
            if tail.is_empty() {
                flags.set(FrameFlags::END_HEADERS);
            }
            buf.put_slice(&Self::encode_header(FrameType::Continuation, flags, stream_id, len));
            buf.put_slice(chunk);
            rest = tail;
        }

        buf.freeze()
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(frame: &SettingsFrame) -> Bytes {
        let mut payload = BytesMut::new();
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            for (param, value) in frame.settings.iter() {
                payload.put_u16(param.as_u16());
                payload.put_u32(value);
            }
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_slice(&Self::encode_header(FrameType::Settings, flags, 0, payload.len()));
        buf.put_slice(&payload);
        buf.freeze()
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(frame: &PingFrame) -> Bytes {
        let flags = if frame.ack {
            FrameFlags::from_u8(FrameFlags::ACK)
        } else {
            FrameFlags::empty()
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 8);
        buf.put_slice(&Self::encode_header(FrameType::Ping, flags, 0, 8));
        buf.put_slice(&frame.data);
        buf.freeze()
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(frame: &GoawayFrame) -> Bytes {
        let payload_len = 8 + frame.debug_data.len();

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload_len);
        buf.put_slice(&Self::encode_header(FrameType::Goaway, FrameFlags::empty(), 0, payload_len));
        buf.put_u32(frame.last_stream_id & MAX_STREAM_ID);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
        buf.freeze()
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(frame: &WindowUpdateFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::WindowUpdate,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.size_increment & 0x7FFFFFFF);
        buf.freeze()
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(frame: &RstStreamFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 4);
        buf.put_slice(&Self::encode_header(
            FrameType::RstStream,
            FrameFlags::empty(),
            frame.stream_id,
            4,
        ));
        buf.put_u32(frame.error_code.as_u32());
        buf.freeze()
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(frame: &PriorityFrame) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 5);
        buf.put_slice(&Self::encode_header(
            FrameType::Priority,
            FrameFlags::empty(),
            frame.stream_id,
            5,
        ));
        Self::put_priority(&mut buf, &frame.priority);
        buf.freeze()
    }

    fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
        let mut dep = priority.stream_dependency & MAX_STREAM_ID;
        if priority.exclusive {
            dep |= 0x80000000;
        }
        buf.put_u32(dep);
        buf.put_u8(priority.weight.clamp(1, 256).wrapping_sub(1) as u8);
    }
}

/// HPACK header block encoder
pub struct HeaderEncoder {
    hpack: hpack::Encoder<'static>,
}

impl HeaderEncoder {
    pub fn new() -> Self {
        HeaderEncoder {
            hpack: hpack::Encoder::new(),
        }
    }

    /// Compress a header list into one header block.
    ///
    /// Blocks must be written in the order they are encoded, since each one
    /// mutates the shared dynamic table.
    pub fn encode(&mut self, headers: &[(String, String)]) -> Result<Bytes> {
        let mut block = Vec::new();
        let tuples = headers
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()));
        self.hpack
            .encode_into(tuples, &mut block)
            .map_err(|e| Error::Internal(format!("HPACK encode error: {}", e)))?;
        Ok(Bytes::from(block))
    }
}

impl Default for HeaderEncoder {
    fn default() -> Self {
        Self::new()
    }
}

enum HeaderBlockKind {
    Headers {
        priority: Option<PrioritySpec>,
        end_stream: bool,
    },
    PushPromise {
        promised_stream_id: StreamId,
    },
}

struct PendingHeaderBlock {
    stream_id: StreamId,
    kind: HeaderBlockKind,
    fragment: BytesMut,
}

/// Incremental inbound frame decoder
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
    max_header_list_size: usize,
    hpack: hpack::Decoder<'static>,
    pending_block: Option<PendingHeaderBlock>,
}

impl FrameDecoder {
    /// Create a decoder enforcing the frame size and header list size
    /// this endpoint advertised
    pub fn new(max_frame_size: usize, max_header_list_size: usize) -> Self {
        FrameDecoder {
            buffer: BytesMut::with_capacity(max_frame_size + FRAME_HEADER_SIZE),
            max_frame_size,
            max_header_list_size,
            hpack: hpack::Decoder::new(),
            pending_block: None,
        }
    }

    /// Append bytes read from the transport
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the decoder is between frames with nothing buffered
    pub fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.pending_block.is_none()
    }

    /// Decode the next complete frame.
    ///
    /// `Ok(None)` means more input is needed. Any error is fatal to the
    /// connection: the decoder state is no longer usable.
    pub fn next_event(&mut self) -> Result<Option<FrameEvent>> {
        loop {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return Ok(None);
            }

            let mut raw = [0u8; FRAME_HEADER_SIZE];
            raw.copy_from_slice(&self.buffer[..FRAME_HEADER_SIZE]);
            let header = FrameCodec::decode_header(&raw);

            if header.length > self.max_frame_size {
                return Err(Error::FrameSize(format!(
                    "Frame of {} bytes exceeds max frame size {}",
                    header.length, self.max_frame_size
                )));
            }
            if self.buffer.len() < FRAME_HEADER_SIZE + header.length {
                return Ok(None);
            }

            self.buffer.advance(FRAME_HEADER_SIZE);
            let payload = self.buffer.split_to(header.length).freeze();

            trace!(
                frame_type = header.frame_type,
                stream_id = header.stream_id,
                length = header.length,
                "decoded frame header"
            );

            if let Some(event) = self.decode_frame(header, payload)? {
                return Ok(Some(event));
            }
        }
    }

    fn decode_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<Option<FrameEvent>> {
        let frame_type = FrameType::from_u8(header.frame_type);

        if let Some(pending) = &self.pending_block {
            if frame_type != Some(FrameType::Continuation) || header.stream_id != pending.stream_id {
                return Err(Error::Protocol(format!(
                    "Expected CONTINUATION for stream {}",
                    pending.stream_id
                )));
            }
        }

        let Some(frame_type) = frame_type else {
            return Ok(Some(FrameEvent::Unknown {
                stream_id: header.stream_id,
                frame_type: header.frame_type,
            }));
        };

        let stream_id = header.stream_id;
        let flags = header.flags;

        match frame_type {
            FrameType::Data => {
                require_stream(frame_type, stream_id)?;
                let (payload, padding) = strip_padding(flags, payload)?;
                Ok(Some(FrameEvent::Data {
                    stream_id,
                    payload,
                    padding,
                    end_stream: flags.is_end_stream(),
                }))
            }
            FrameType::Headers => {
                require_stream(frame_type, stream_id)?;
                let (mut payload, _) = strip_padding(flags, payload)?;
                let priority = if flags.is_priority() {
                    if payload.len() < 5 {
                        return Err(Error::FrameSize("HEADERS priority block truncated".into()));
                    }
                    Some(read_priority(&mut payload))
                } else {
                    None
                };
                let kind = HeaderBlockKind::Headers {
                    priority,
                    end_stream: flags.is_end_stream(),
                };
                self.begin_header_block(stream_id, kind, payload, flags.is_end_headers())
            }
            FrameType::Priority => {
                require_stream(frame_type, stream_id)?;
                let mut payload = require_len(frame_type, payload, 5)?;
                Ok(Some(FrameEvent::Priority {
                    stream_id,
                    priority: read_priority(&mut payload),
                }))
            }
            FrameType::RstStream => {
                require_stream(frame_type, stream_id)?;
                let mut payload = require_len(frame_type, payload, 4)?;
                Ok(Some(FrameEvent::RstStream {
                    stream_id,
                    error_code: ErrorCode::from_wire(payload.get_u32()),
                }))
            }
            FrameType::Settings => {
                require_connection(frame_type, stream_id)?;
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(Error::FrameSize("SETTINGS ack with payload".into()));
                    }
                    return Ok(Some(FrameEvent::SettingsAck));
                }
                let settings = super::settings::Settings::parse(&payload)?;
                Ok(Some(FrameEvent::Settings { settings }))
            }
            FrameType::PushPromise => {
                require_stream(frame_type, stream_id)?;
                let (mut payload, _) = strip_padding(flags, payload)?;
                if payload.len() < 4 {
                    return Err(Error::FrameSize("PUSH_PROMISE truncated".into()));
                }
                let promised_stream_id = payload.get_u32() & MAX_STREAM_ID;
                let kind = HeaderBlockKind::PushPromise { promised_stream_id };
                self.begin_header_block(stream_id, kind, payload, flags.is_end_headers())
            }
            FrameType::Ping => {
                require_connection(frame_type, stream_id)?;
                let payload = require_len(frame_type, payload, 8)?;
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Some(FrameEvent::Ping {
                    ack: flags.is_ack(),
                    data,
                }))
            }
            FrameType::Goaway => {
                require_connection(frame_type, stream_id)?;
                if payload.len() < 8 {
                    return Err(Error::FrameSize("GOAWAY truncated".into()));
                }
                let mut payload = payload;
                let last_stream_id = payload.get_u32() & MAX_STREAM_ID;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Ok(Some(FrameEvent::Goaway {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                }))
            }
            FrameType::WindowUpdate => {
                let mut payload = require_len(frame_type, payload, 4)?;
                Ok(Some(FrameEvent::WindowUpdate {
                    stream_id,
                    increment: payload.get_u32() & 0x7FFFFFFF,
                }))
            }
            FrameType::Continuation => {
                let Some(pending) = self.pending_block.as_mut() else {
                    return Err(Error::Protocol("Unexpected CONTINUATION frame".into()));
                };
                pending.fragment.extend_from_slice(&payload);
                if pending.fragment.len() > self.max_header_list_size.saturating_mul(2) {
                    return Err(Error::Protocol("Header block too large".into()));
                }
                if !flags.is_end_headers() {
                    return Ok(None);
                }
                match self.pending_block.take() {
                    Some(pending) => self.finish_header_block(pending),
                    None => Ok(None),
                }
            }
        }
    }

    fn begin_header_block(
        &mut self,
        stream_id: StreamId,
        kind: HeaderBlockKind,
        fragment: Bytes,
        end_headers: bool,
    ) -> Result<Option<FrameEvent>> {
        let pending = PendingHeaderBlock {
            stream_id,
            kind,
            fragment: BytesMut::from(&fragment[..]),
        };
        if end_headers {
            self.finish_header_block(pending)
        } else {
            self.pending_block = Some(pending);
            Ok(None)
        }
    }

    fn finish_header_block(&mut self, pending: PendingHeaderBlock) -> Result<Option<FrameEvent>> {
        // Always decode so the dynamic table stays in sync, even when the
        // list is then rejected for size.
        let decoded = self
            .hpack
            .decode(&pending.fragment)
            .map_err(|e| Error::Compression(format!("HPACK decode error: {:?}", e)))?;

        let list_size: usize = decoded
            .iter()
            .map(|(name, value)| name.len() + value.len() + HEADER_ENTRY_OVERHEAD)
            .sum();

        let error_stream = match pending.kind {
            HeaderBlockKind::Headers { .. } => pending.stream_id,
            HeaderBlockKind::PushPromise { promised_stream_id } => promised_stream_id,
        };
        if list_size > self.max_header_list_size {
            return Ok(Some(FrameEvent::StreamError {
                stream_id: error_stream,
                description: format!(
                    "Header list of {} bytes exceeds limit {}",
                    list_size, self.max_header_list_size
                ),
            }));
        }

        let headers: HeaderList = decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        let event = match pending.kind {
            HeaderBlockKind::Headers {
                priority,
                end_stream,
            } => FrameEvent::Headers {
                stream_id: pending.stream_id,
                priority,
                end_stream,
                headers,
            },
            HeaderBlockKind::PushPromise { promised_stream_id } => FrameEvent::PushPromise {
                stream_id: pending.stream_id,
                promised_stream_id,
                headers,
            },
        };
        Ok(Some(event))
    }
}

fn require_stream(frame_type: FrameType, stream_id: StreamId) -> Result<()> {
    if stream_id == 0 {
        return Err(Error::Protocol(format!("{} frame on stream 0", frame_type.name())));
    }
    Ok(())
}

fn require_connection(frame_type: FrameType, stream_id: StreamId) -> Result<()> {
    if stream_id != 0 {
        return Err(Error::Protocol(format!(
            "{} frame on stream {}",
            frame_type.name(),
            stream_id
        )));
    }
    Ok(())
}

fn require_len(frame_type: FrameType, payload: Bytes, len: usize) -> Result<Bytes> {
    if payload.len() != len {
        return Err(Error::FrameSize(format!(
            "{} payload must be {} bytes, got {}",
            frame_type.name(),
            len,
            payload.len()
        )));
    }
    Ok(payload)
}

/// Strip padding, returning the body and the number of octets the padding
/// occupied (pad length octet included).
fn strip_padding(flags: FrameFlags, payload: Bytes) -> Result<(Bytes, usize)> {
    if !flags.is_padded() {
        return Ok((payload, 0));
    }
    let Some(&pad_len) = payload.first() else {
        return Err(Error::Protocol("Padded frame without pad length".into()));
    };
    let pad_len = pad_len as usize;
    if pad_len >= payload.len() {
        return Err(Error::Protocol("Padding exceeds frame payload".into()));
    }
    let body = payload.slice(1..payload.len() - pad_len);
    Ok((body, pad_len + 1))
}

fn read_priority(payload: &mut Bytes) -> PrioritySpec {
    let dep = payload.get_u32();
    let weight = payload.get_u8() as u16 + 1;
    PrioritySpec::new(dep & MAX_STREAM_ID, dep & 0x80000000 != 0, weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::settings::SettingsBuilder;

    fn decoder() -> FrameDecoder {
        FrameDecoder::new(16384, 256 * 1024)
    }

    fn headers_block(headers: &[(&str, &str)]) -> Bytes {
        let list: HeaderList = headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        HeaderEncoder::new().encode(&list).unwrap()
    }

    #[test]
    fn test_encode_decode_header() {
        let flags = FrameFlags::from_u8(FrameFlags::END_STREAM | FrameFlags::END_HEADERS);
        let header = FrameCodec::encode_header(FrameType::Headers, flags, 42, 1234);
        let decoded = FrameCodec::decode_header(&header);

        assert_eq!(decoded.frame_type, FrameType::Headers.as_u8());
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.length, 1234);
    }

    #[test]
    fn test_encode_data_frame_with_padding() {
        let frame = DataFrame::new(1, Bytes::from("Hi"), false).with_padding(10);
        let encoded = FrameCodec::encode_data_frame(&frame);

        assert_eq!(encoded[0..3], [0, 0, 13]);
        assert_eq!(encoded[4] & FrameFlags::PADDED, FrameFlags::PADDED);
        assert_eq!(encoded[9], 10);
        assert_eq!(&encoded[10..12], b"Hi");
        assert_eq!(&encoded[12..22], &[0u8; 10]);
    }

    #[test]
    fn test_encode_settings_frame() {
        let settings = SettingsBuilder::new()
            .header_table_size(8192)
            .enable_push(false)
            .initial_window_size(65535)
            .build()
            .unwrap();
        let encoded = FrameCodec::encode_settings_frame(&SettingsFrame::new(settings));

        assert_eq!(encoded[3], FrameType::Settings.as_u8());
        assert_eq!(&encoded[5..9], &[0, 0, 0, 0]);
        assert_eq!(encoded[0..3], [0, 0, 18]);

        let ack = FrameCodec::encode_settings_frame(&SettingsFrame::ack());
        assert_eq!(ack.len(), FRAME_HEADER_SIZE);
        assert_eq!(ack[4], FrameFlags::ACK);
    }

    #[test]
    fn test_priority_weight_on_wire() {
        let frame = PriorityFrame {
            stream_id: 3,
            priority: PrioritySpec::new(1, true, 256),
        };
        let encoded = FrameCodec::encode_priority_frame(&frame);
        assert_eq!(&encoded[9..13], &[0x80, 0, 0, 1]);
        assert_eq!(encoded[13], 255);
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut decoder = decoder();
        let encoded = FrameCodec::encode_ping_frame(&PingFrame::new(7));

        decoder.push(&encoded[..5]);
        assert_eq!(decoder.next_event().unwrap(), None);
        decoder.push(&encoded[5..12]);
        assert_eq!(decoder.next_event().unwrap(), None);
        decoder.push(&encoded[12..]);

        assert_eq!(
            decoder.next_event().unwrap(),
            Some(FrameEvent::Ping {
                ack: false,
                data: 7u64.to_be_bytes()
            })
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_decoder_reports_padding() {
        let mut decoder = decoder();
        let frame = DataFrame::new(1, Bytes::from("abc"), true).with_padding(4);
        decoder.push(&FrameCodec::encode_data_frame(&frame));

        match decoder.next_event().unwrap() {
            Some(FrameEvent::Data {
                stream_id,
                payload,
                padding,
                end_stream,
            }) => {
                assert_eq!(stream_id, 1);
                assert_eq!(&payload[..], b"abc");
                assert_eq!(padding, 5);
                assert!(end_stream);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decoder_rejects_bad_padding() {
        let mut decoder = decoder();
        let mut raw = BytesMut::new();
        raw.put_slice(&FrameCodec::encode_header(
            FrameType::Data,
            FrameFlags::from_u8(FrameFlags::PADDED),
            1,
            3,
        ));
        raw.put_slice(&[5, 0, 0]);
        decoder.push(&raw);
        assert!(matches!(decoder.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decoder_reassembles_continuation() {
        let block = headers_block(&[(":status", "200"), ("x-long", &"v".repeat(40_000))]);
        let frame = HeadersFrame::new(1, block, false);
        let encoded = FrameCodec::encode_headers_frame(&frame, 16384);

        // Three frames: HEADERS + two CONTINUATION
        assert_eq!(encoded[3], FrameType::Headers.as_u8());
        assert_eq!(encoded[4] & FrameFlags::END_HEADERS, 0);

        let mut decoder = decoder();
        decoder.push(&encoded);
        match decoder.next_event().unwrap() {
            Some(FrameEvent::Headers { headers, end_stream, .. }) => {
                assert!(!end_stream);
                assert_eq!(headers[0], (":status".to_string(), "200".to_string()));
                assert_eq!(headers[1].1.len(), 40_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decoder_interleaved_continuation_is_error() {
        let block = headers_block(&[(":status", "200")]);
        let mut raw = BytesMut::new();
        raw.put_slice(&FrameCodec::encode_header(
            FrameType::Headers,
            FrameFlags::empty(),
            1,
            block.len(),
        ));
        raw.put_slice(&block);
        raw.put_slice(&FrameCodec::encode_ping_frame(&PingFrame::new(1)));

        let mut decoder = decoder();
        decoder.push(&raw);
        assert!(matches!(decoder.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decoder_oversized_frame() {
        let mut decoder = decoder();
        decoder.push(&FrameCodec::encode_header(
            FrameType::Data,
            FrameFlags::empty(),
            1,
            20_000,
        ));
        assert!(matches!(decoder.next_event(), Err(Error::FrameSize(_))));
    }

    #[test]
    fn test_decoder_unknown_frame() {
        let mut decoder = decoder();
        let mut raw = BytesMut::new();
        raw.put_slice(&[0, 0, 2, 0xbb, 0, 0, 0, 0, 5, 1, 2]);
        decoder.push(&raw);
        assert_eq!(
            decoder.next_event().unwrap(),
            Some(FrameEvent::Unknown {
                stream_id: 5,
                frame_type: 0xbb
            })
        );
    }

    #[test]
    fn test_decoder_header_list_limit_is_stream_error() {
        let mut decoder = FrameDecoder::new(16384, 64);
        let block = headers_block(&[(":status", "200"), ("x-big", &"a".repeat(100))]);
        let frame = PushPromiseFrame {
            stream_id: 1,
            promised_stream_id: 2,
            header_block: block,
        };
        decoder.push(&FrameCodec::encode_push_promise_frame(&frame, 16384));

        match decoder.next_event().unwrap() {
            Some(FrameEvent::StreamError { stream_id, .. }) => assert_eq!(stream_id, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decoder_settings_on_stream_is_error() {
        let mut decoder = decoder();
        decoder.push(&FrameCodec::encode_header(
            FrameType::Settings,
            FrameFlags::empty(),
            3,
            0,
        ));
        assert!(matches!(decoder.next_event(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_decoder_goaway() {
        let mut decoder = decoder();
        let frame = GoawayFrame::new(5, ErrorCode::EnhanceYourCalm, Bytes::from("slow down"));
        decoder.push(&FrameCodec::encode_goaway_frame(&frame));
        assert_eq!(
            decoder.next_event().unwrap(),
            Some(FrameEvent::Goaway {
                last_stream_id: 5,
                error_code: ErrorCode::EnhanceYourCalm,
                debug_data: Bytes::from("slow down"),
            })
        );
    }
}
