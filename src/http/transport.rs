//! Byte-stream transport abstraction
//!
//! A session talks to its connection only through the [`Transport`] trait,
//! which lets plain TCP, a TLS wrapper, or the in-memory pipe used by the
//! tests sit underneath the same protocol code.
//!
//! Transports are non-blocking: a read or write that cannot make progress
//! returns [`io::ErrorKind::WouldBlock`], and the session resumes once its
//! owner reports readiness.

use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;

/// Connection operations needed by a session
pub trait Transport {
    /// Read into `buf`. `Ok(0)` means the peer closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`, returning how much was taken
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shut the connection down
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Certificate details when the connection is TLS
    fn ssl_info(&self) -> Option<SslInfo> {
        None
    }
}

/// What the TLS layer verified about the server certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslInfo {
    /// DNS names the certificate is valid for; `*.` wildcards allowed
    pub dns_names: Vec<String>,
    /// Verification failed in a way that was overridden
    pub cert_status_error: bool,
    /// A client certificate was sent during the handshake
    pub client_cert_sent: bool,
}

impl SslInfo {
    pub fn new<I, S>(dns_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SslInfo {
            dns_names: dns_names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Whether the certificate covers `host`. A wildcard matches exactly
    /// one leftmost label.
    pub fn verify_name(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.dns_names.iter().any(|name| {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            match name.strip_prefix("*.") {
                Some(suffix) => match host.split_once('.') {
                    Some((label, rest)) => !label.is_empty() && rest == suffix,
                    None => false,
                },
                None => name == host,
            }
        })
    }

    /// Whether a connection made for `old_host` may also serve `new_host`
    pub fn can_pool(&self, old_host: &str, new_host: &str) -> bool {
        if old_host.eq_ignore_ascii_case(new_host) {
            return true;
        }
        if self.cert_status_error || self.client_cert_sent {
            return false;
        }
        self.verify_name(new_host)
    }
}

#[derive(Debug)]
struct MemoryState {
    inbound: BytesMut,
    inbound_closed: bool,
    read_error: Option<io::ErrorKind>,
    outbound: BytesMut,
    write_error: Option<io::ErrorKind>,
    write_blocked: bool,
    write_limit: Option<usize>,
    connected: bool,
    closed: bool,
    ssl_info: Option<SslInfo>,
    peer_addr: SocketAddr,
}

/// In-process transport.
///
/// The session owns the [`MemoryTransport`]; whoever plays the peer keeps
/// the [`MemoryTransportHandle`] to feed bytes in, collect what the session
/// wrote, and inject failures.
#[derive(Debug)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

/// Peer side of a [`MemoryTransport`]
#[derive(Debug, Clone)]
pub struct MemoryTransportHandle {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> (MemoryTransport, MemoryTransportHandle) {
        let state = Rc::new(RefCell::new(MemoryState {
            inbound: BytesMut::new(),
            inbound_closed: false,
            read_error: None,
            outbound: BytesMut::new(),
            write_error: None,
            write_blocked: false,
            write_limit: None,
            connected: true,
            closed: false,
            ssl_info: None,
            peer_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 443)),
        }));
        (
            MemoryTransport {
                state: Rc::clone(&state),
            },
            MemoryTransportHandle { state },
        )
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if let Some(kind) = state.read_error {
            return Err(kind.into());
        }
        if state.inbound.is_empty() {
            if state.inbound_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(state.inbound.len());
        buf[..n].copy_from_slice(&state.inbound.split_to(n));
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if state.write_blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = match state.write_limit {
            Some(limit) => buf.len().min(limit),
            None => buf.len(),
        };
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.state.borrow().peer_addr)
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.state.borrow().ssl_info.clone()
    }
}

impl MemoryTransportHandle {
    /// Make bytes available to the session's next read
    pub fn push_inbound(&self, data: &[u8]) {
        self.state.borrow_mut().inbound.extend_from_slice(data);
    }

    /// Everything the session wrote since the last call
    pub fn take_outbound(&self) -> Bytes {
        self.state.borrow_mut().outbound.split().freeze()
    }

    /// End of stream once the buffered inbound bytes are read
    pub fn close_inbound(&self) {
        self.state.borrow_mut().inbound_closed = true;
    }

    /// Fail every following read
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().read_error = Some(kind);
    }

    /// Fail every following write
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    /// Writes return WouldBlock while set
    pub fn set_write_blocked(&self, blocked: bool) {
        self.state.borrow_mut().write_blocked = blocked;
    }

    /// Accept at most `limit` bytes per write call
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.borrow_mut().write_limit = limit;
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.borrow_mut().connected = connected;
    }

    pub fn set_ssl_info(&self, ssl_info: Option<SslInfo>) {
        self.state.borrow_mut().ssl_info = ssl_info;
    }

    pub fn set_peer_addr(&self, addr: SocketAddr) {
        self.state.borrow_mut().peer_addr = addr;
    }

    /// The session closed its side
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}
