//! TCP transport
//!
//! Non-blocking TCP connection for running a session over a real socket.
//! The connection is established with a timeout and TCP_NODELAY set, then
//! switched to non-blocking mode so reads and writes surface
//! `WouldBlock` to the session's loops.

use crate::http::{SslInfo, Transport};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Plain TCP connection
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    connected: bool,
    ssl_info: Option<SslInfo>,
}

impl TcpTransport {
    /// Connect to `addr`, giving up after `timeout`
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&SockAddr::from(addr), timeout)?;
        debug!(%addr, "connected");
        Self::from_socket(socket)
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        Self::from_socket(Socket::from(stream))
    }

    fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nodelay(true)?;
        socket.set_nonblocking(true)?;
        Ok(TcpTransport {
            stream: socket.into(),
            connected: true,
            ssl_info: None,
        })
    }

    /// Attach certificate details from a TLS layer in front of this socket
    pub fn with_ssl_info(mut self, ssl_info: SslInfo) -> Self {
        self.ssl_info = Some(ssl_info);
        self
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.read(buf)?;
        if n == 0 {
            self.connected = false;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn close(&mut self) {
        if self.connected {
            // The peer may already be gone
            let _ = self.stream.shutdown(Shutdown::Both);
            self.connected = false;
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.ssl_info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut transport = TcpTransport::connect(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(transport.peer_addr().unwrap(), addr);
        assert!(transport.is_connected());

        let mut written = 0;
        while written < 4 {
            match transport.write(&b"ping"[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
                Err(e) => panic!("write failed: {}", e),
            }
        }

        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < 4 {
            match transport.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(&buf, b"ping");

        handle.join().unwrap();
        transport.close();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_tcp_transport_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let _server = listener.accept().unwrap();

        let mut transport = TcpTransport::from_stream(stream).unwrap();
        let mut buf = [0u8; 8];
        let err = transport.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
