//! HTTP/2 error types
//!
//! This module defines the session error type and the wire error codes
//! defined in RFC 7540 Section 7.
//!
//! `Error` is `Clone`: a single session-fatal error is handed to every open
//! stream and every pending stream request when the session drains.

use std::fmt;
use std::io;
use std::sync::Arc;

/// HTTP/2 session errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error from the transport
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Protocol error detected (RFC 7540 Section 7 - Error code 0x1)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Internal error (RFC 7540 Section 7 - Error code 0x2)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Flow control error (RFC 7540 Section 7 - Error code 0x3)
    #[error("Flow control error: {0}")]
    FlowControl(String),

    /// Frame size error (RFC 7540 Section 7 - Error code 0x6)
    #[error("Frame size error: {0}")]
    FrameSize(String),

    /// Compression error (RFC 7540 Section 7 - Error code 0x9)
    #[error("Compression error: {0}")]
    Compression(String),

    /// Inadequate security (RFC 7540 Section 7 - Error code 0xc)
    #[error("Inadequate security: {0}")]
    InadequateSecurity(String),

    /// Peer asked for a downgrade to HTTP/1.1
    #[error("HTTP/1.1 required")]
    Http11Required,

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Transport reset by peer
    #[error("Connection reset")]
    ConnectionReset,

    /// Transport is not connected
    #[error("Socket not connected")]
    SocketNotConnected,

    /// Local network configuration changed under the session
    #[error("Network changed")]
    NetworkChanged,

    /// Operation aborted because the session is going away
    #[error("Aborted")]
    Aborted,

    /// New streams cannot be created on a session that is going away
    #[error("Session is going away")]
    GoingAway,

    /// Peer refused the stream; safe to retry elsewhere
    #[error("Refused stream")]
    RefusedStream,

    /// Peer reset the stream with NO_ERROR
    #[error("Stream reset without error")]
    RstStreamNoError,

    /// Peer reset the stream with the given code
    #[error("Stream reset: {0}")]
    StreamReset(ErrorCode),

    /// Stream cancelled locally
    #[error("Stream cancelled")]
    Cancelled,

    /// Keepalive ping was not answered in time
    #[error("Ping failed")]
    PingFailed,

    /// Stream is unusable (e.g. an unclaimed push that expired)
    #[error("Invalid stream: {0}")]
    InvalidStream(String),

    /// Stream not found in the session tables
    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    /// No data available yet
    #[error("Operation would block")]
    WouldBlock,

    /// Call into the session while one of its loops is running
    #[error("Reentrant call into session")]
    ReentrantLoop,

    /// Session was destroyed before the operation could run
    #[error("Session is gone")]
    SessionGone,

    /// Target URL could not be used
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Invalid settings value
    #[error("Invalid settings value: {0}")]
    InvalidSettings(String),
}

impl Error {
    /// Wire error code sent in the GOAWAY frame when draining with this error
    pub fn goaway_code(&self) -> ErrorCode {
        match self {
            Error::Protocol(_) => ErrorCode::ProtocolError,
            Error::FlowControl(_) => ErrorCode::FlowControlError,
            Error::FrameSize(_) => ErrorCode::FrameSizeError,
            Error::Compression(_) => ErrorCode::CompressionError,
            Error::InadequateSecurity(_) => ErrorCode::InadequateSecurity,
            _ => ErrorCode::ProtocolError,
        }
    }

    /// Whether draining with this error should try to tell the peer.
    ///
    /// A GOAWAY cannot be delivered over a dead transport, and is pointless
    /// when the session is closing on our own initiative.
    pub fn sends_goaway(&self) -> bool {
        !matches!(
            self,
            Error::Aborted
                | Error::NetworkChanged
                | Error::SocketNotConnected
                | Error::Http11Required
                | Error::ConnectionClosed
                | Error::ConnectionReset
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => Error::ConnectionReset,
            io::ErrorKind::NotConnected => Error::SocketNotConnected,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(Arc::new(err)),
        }
    }
}

/// HTTP/2 error codes as defined in RFC 7540 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode a code read off the wire; unknown codes are internal errors
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;
