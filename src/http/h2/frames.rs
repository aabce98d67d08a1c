//! HTTP/2 frames
//!
//! Frame structs used when encoding outbound frames, and the closed set of
//! [`FrameEvent`]s the decoder hands to the session for inbound frames.

use super::error::ErrorCode;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;
use std::fmt;

/// Decoded header list, in wire order. Names are lowercase.
pub type HeaderList = Vec<(String, String)>;

/// HTTP/2 frame types (RFC 7540 Section 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    /// Convert frame type to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Frame type for a wire byte; `None` for extension frames
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Headers),
            0x2 => Some(FrameType::Priority),
            0x3 => Some(FrameType::RstStream),
            0x4 => Some(FrameType::Settings),
            0x5 => Some(FrameType::PushPromise),
            0x6 => Some(FrameType::Ping),
            0x7 => Some(FrameType::Goaway),
            0x8 => Some(FrameType::WindowUpdate),
            0x9 => Some(FrameType::Continuation),
            _ => None,
        }
    }

    /// Get frame type name
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }

    /// Whether the frame is session-level control traffic
    pub fn is_control(&self) -> bool {
        !matches!(self, FrameType::Data | FrameType::Headers | FrameType::Continuation)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u8())
    }
}

/// HTTP/2 frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// END_STREAM flag (0x1)
    pub const END_STREAM: u8 = 0x1;
    /// ACK flag (0x1), SETTINGS and PING only
    pub const ACK: u8 = 0x1;
    /// END_HEADERS flag (0x4)
    pub const END_HEADERS: u8 = 0x4;
    /// PADDED flag (0x8)
    pub const PADDED: u8 = 0x8;
    /// PRIORITY flag (0x20)
    pub const PRIORITY: u8 = 0x20;

    pub fn empty() -> Self {
        FrameFlags(0)
    }

    pub fn from_u8(flags: u8) -> Self {
        FrameFlags(flags)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_end_stream(&self) -> bool {
        self.is_set(Self::END_STREAM)
    }

    pub fn is_ack(&self) -> bool {
        self.is_set(Self::ACK)
    }

    pub fn is_end_headers(&self) -> bool {
        self.is_set(Self::END_HEADERS)
    }

    pub fn is_padded(&self) -> bool {
        self.is_set(Self::PADDED)
    }

    pub fn is_priority(&self) -> bool {
        self.is_set(Self::PRIORITY)
    }
}

/// DATA frame (RFC 7540 Section 6.1)
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub data: Bytes,
    pub end_stream: bool,
    /// Padding length (if PADDED flag is set)
    pub padding: Option<u8>,
}

impl DataFrame {
    pub fn new(stream_id: StreamId, data: Bytes, end_stream: bool) -> Self {
        DataFrame {
            stream_id,
            data,
            end_stream,
            padding: None,
        }
    }

    pub fn with_padding(mut self, padding: u8) -> Self {
        self.padding = Some(padding);
        self
    }

    /// Bytes charged against flow control: data, pad length octet and padding
    pub fn flow_controlled_len(&self) -> usize {
        match self.padding {
            Some(pad_len) => self.data.len() + 1 + pad_len as usize,
            None => self.data.len(),
        }
    }
}

/// HEADERS frame (RFC 7540 Section 6.2) carrying an encoded header block.
///
/// A block larger than the peer's max frame size is split into
/// CONTINUATION frames by the codec.
#[derive(Debug, Clone)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub header_block: Bytes,
    pub end_stream: bool,
    pub priority: Option<PrioritySpec>,
}

impl HeadersFrame {
    pub fn new(stream_id: StreamId, header_block: Bytes, end_stream: bool) -> Self {
        HeadersFrame {
            stream_id,
            header_block,
            end_stream,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: PrioritySpec) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Stream dependency (RFC 7540 Section 5.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    /// Parent stream, 0 for the root
    pub stream_dependency: StreamId,
    pub exclusive: bool,
    /// Weight in 1..=256; the wire carries `weight - 1`
    pub weight: u16,
}

impl PrioritySpec {
    pub fn new(stream_dependency: StreamId, exclusive: bool, weight: u16) -> Self {
        PrioritySpec {
            stream_dependency,
            exclusive,
            weight,
        }
    }
}

/// PRIORITY frame (RFC 7540 Section 6.3)
#[derive(Debug, Clone, Copy)]
pub struct PriorityFrame {
    pub stream_id: StreamId,
    pub priority: PrioritySpec,
}

/// RST_STREAM frame (RFC 7540 Section 6.4)
#[derive(Debug, Clone, Copy)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub error_code: ErrorCode,
}

/// SETTINGS frame (RFC 7540 Section 6.5)
#[derive(Debug, Clone)]
pub struct SettingsFrame {
    pub ack: bool,
    pub settings: Settings,
}

impl SettingsFrame {
    pub fn new(settings: Settings) -> Self {
        SettingsFrame {
            ack: false,
            settings,
        }
    }

    pub fn ack() -> Self {
        SettingsFrame {
            ack: true,
            settings: Settings::default(),
        }
    }
}

/// PUSH_PROMISE frame (RFC 7540 Section 6.6)
#[derive(Debug, Clone)]
pub struct PushPromiseFrame {
    /// Associated (client-initiated) stream
    pub stream_id: StreamId,
    pub promised_stream_id: StreamId,
    pub header_block: Bytes,
}

/// PING frame (RFC 7540 Section 6.7)
#[derive(Debug, Clone, Copy)]
pub struct PingFrame {
    pub ack: bool,
    pub data: [u8; 8],
}

impl PingFrame {
    /// PING carrying a numeric id as its opaque payload
    pub fn new(id: u64) -> Self {
        PingFrame {
            ack: false,
            data: id.to_be_bytes(),
        }
    }

    /// Acknowledge a received PING, echoing its payload
    pub fn ack(data: [u8; 8]) -> Self {
        PingFrame { ack: true, data }
    }

    pub fn id(&self) -> u64 {
        u64::from_be_bytes(self.data)
    }
}

/// GOAWAY frame (RFC 7540 Section 6.8)
#[derive(Debug, Clone)]
pub struct GoawayFrame {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    pub debug_data: Bytes,
}

impl GoawayFrame {
    pub fn new(last_stream_id: StreamId, error_code: ErrorCode, debug_data: Bytes) -> Self {
        GoawayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }
    }
}

/// WINDOW_UPDATE frame (RFC 7540 Section 6.9)
#[derive(Debug, Clone, Copy)]
pub struct WindowUpdateFrame {
    /// 0 for the connection-level window
    pub stream_id: StreamId,
    pub size_increment: u32,
}

impl WindowUpdateFrame {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdateFrame {
            stream_id,
            size_increment,
        }
    }
}

/// A fully decoded inbound frame.
///
/// Header blocks arrive already reassembled from their CONTINUATION frames
/// and decompressed; padding is stripped but reported so the session can
/// account for it in flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Data {
        stream_id: StreamId,
        payload: Bytes,
        /// Pad length octet plus padding bytes, 0 when unpadded
        padding: usize,
        end_stream: bool,
    },
    Headers {
        stream_id: StreamId,
        priority: Option<PrioritySpec>,
        end_stream: bool,
        headers: HeaderList,
    },
    Priority {
        stream_id: StreamId,
        priority: PrioritySpec,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        settings: Settings,
    },
    SettingsAck,
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderList,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    Goaway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    /// Extension frame; only its stream id is meaningful to the session
    Unknown {
        stream_id: StreamId,
        frame_type: u8,
    },
    /// A frame that is only fatal to one stream (e.g. an oversized header list)
    StreamError {
        stream_id: StreamId,
        description: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::Goaway.as_u8(), 0x7);
        assert_eq!(FrameType::from_u8(0x5), Some(FrameType::PushPromise));
        assert_eq!(FrameType::from_u8(0xb), None);
        assert_eq!(FrameType::WindowUpdate.to_string(), "WINDOW_UPDATE (0x8)");
    }

    #[test]
    fn test_control_frames() {
        assert!(FrameType::Settings.is_control());
        assert!(FrameType::RstStream.is_control());
        assert!(!FrameType::Data.is_control());
        assert!(!FrameType::Headers.is_control());
    }

    #[test]
    fn test_frame_flags() {
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::END_HEADERS);
        assert!(flags.is_end_headers());
        assert!(!flags.is_end_stream());

        flags.set(FrameFlags::PRIORITY);
        assert_eq!(flags.as_u8(), 0x24);
    }

    #[test]
    fn test_data_frame_flow_controlled_len() {
        let frame = DataFrame::new(1, Bytes::from_static(b"hello"), false);
        assert_eq!(frame.flow_controlled_len(), 5);
        assert_eq!(frame.with_padding(10).flow_controlled_len(), 16);
    }

    #[test]
    fn test_ping_id() {
        let ping = PingFrame::new(0x0102);
        assert_eq!(ping.data, [0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(ping.id(), 0x0102);
        assert!(PingFrame::ack(ping.data).ack);
    }
}
