//! h2mux - multiplexed HTTP/2 client sessions
//!
//! This crate drives the client side of an HTTP/2 connection: many request
//! streams share one transport, with prioritized writes, flow control,
//! graceful GOAWAY handling and server push.

pub mod http;
pub mod net;
