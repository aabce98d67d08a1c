//! HTTP transport plumbing and the HTTP/2 session engine
//!
//! # Architecture
//!
//! The protocol code never touches sockets directly. It talks to a
//! [`Transport`], which defaults to plain TCP ([`crate::net::TcpTransport`])
//! and can be swapped for a TLS wrapper or the in-memory pipe
//! ([`MemoryTransport`]) the tests run against.

pub mod h2;
pub mod transport;

pub use transport::{MemoryTransport, MemoryTransportHandle, SslInfo, Transport};

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;
