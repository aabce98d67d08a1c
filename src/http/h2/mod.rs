//! HTTP/2 client session engine
//!
//! This module multiplexes request streams over a single connection.
//!
//! # Architecture
//!
//! - **Framing**: [`codec::FrameCodec`] encodes frames and
//!   [`codec::FrameDecoder`] turns inbound bytes into [`frames::FrameEvent`]s,
//!   with HPACK handled by the `hpack` crate
//! - **Priorities**: [`priority::PriorityTree`] maps request priorities onto
//!   HTTP/2 dependencies; [`write_queue::WriteQueue`] orders outbound frames
//! - **Flow control**: [`flow_control::SendWindow`] and
//!   [`flow_control::RecvWindow`] at both session and stream level
//! - **Session**: [`Session`] runs the read and write loops, stream
//!   admission and the going-away and draining lifecycle
//! - **Push**: promised streams wait in a [`push::PushedStreamIndex`] until
//!   claimed by URL or expired
//!
//! # Example
//!
//! ```no_run
//! use h2mux::http::h2::{RequestPriority, SessionBuilder, SessionKey};
//! use h2mux::http::MemoryTransport;
//!
//! # fn main() -> Result<(), h2mux::http::h2::Error> {
//! let (transport, _peer) = MemoryTransport::new();
//! let session = SessionBuilder::new(SessionKey::new("example.com", 443)).build(transport)?;
//! let mut request = session.request_stream("https://example.com/", RequestPriority::Highest)?;
//! if let Some(stream) = request.try_take() {
//!     stream?.send_request("GET", &[], true)?;
//! }
//! session.run_until_idle()?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod priority;
pub mod push;
pub mod request;
pub mod session;
pub mod settings;
pub mod stream;
pub mod write_queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use error::{Error, ErrorCode, Result};
pub use frames::{FrameFlags, FrameType};
pub use priority::RequestPriority;
pub use request::StreamRequest;
pub use session::{
    AvailabilityState, LoadState, PoolDelegate, PushDelegate, Session, SessionBuilder, SessionInfo, SessionKey,
};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamHandle, StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 7540 Section 3.5:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
