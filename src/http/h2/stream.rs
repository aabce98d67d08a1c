//! HTTP/2 streams
//!
//! A [`Stream`] is the session's record of one request/response exchange.
//! It lives in the session's stream arena and is addressed by a
//! [`StreamKey`], which is never reused; the wire [`StreamId`] is only
//! assigned when the stream's HEADERS frame is about to be written.
//!
//! Callers hold a [`StreamHandle`]. The handle keeps only a weak reference
//! to the session plus the stream's inbox, so everything a caller can
//! observe (response headers, body, close status) survives the stream being
//! closed and removed from the session, and the session itself may be torn
//! down first.

use super::error::{Error, Result};
use super::flow_control::{RecvWindow, SendWindow};
use super::frames::HeaderList;
use super::priority::RequestPriority;
use super::session::SessionInner;
use bytes::{Buf, Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use tracing::debug;
use url::Url;

/// Stream ID type
pub type StreamId = u32;

/// Arena key of a stream within its session. Unique for the session's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(pub(crate) u64);

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created locally, no id assigned yet
    Idle,
    /// PUSH_PROMISE received, response HEADERS not yet
    ReservedRemote,
    Open,
    /// We sent END_STREAM
    HalfClosedLocal,
    /// Peer sent END_STREAM
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Idle | StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            StreamState::ReservedRemote | StreamState::Open | StreamState::HalfClosedLocal
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// Who opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Request,
    Push,
}

/// Caller-visible side of a stream, shared between the session's record
/// and the caller's handle.
#[derive(Debug, Default)]
pub(crate) struct StreamInbox {
    pub(crate) stream_id: StreamId,
    pub(crate) response_headers: Option<HeaderList>,
    pub(crate) trailers: Option<HeaderList>,
    pub(crate) push_request_headers: Option<HeaderList>,
    pub(crate) data: VecDeque<Bytes>,
    pub(crate) fin_received: bool,
    pub(crate) close_status: Option<Result<()>>,
    /// Bytes read by the caller but not yet credited to the session
    pub(crate) uncredited: usize,
    /// The handle went away while the session was busy; the session
    /// cancels the stream on its next turn
    pub(crate) handle_dropped: bool,
}

impl StreamInbox {
    fn read_into(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(chunk) = self.data.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            copied += n;
            if chunk.is_empty() {
                self.data.pop_front();
            }
        }
        copied
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.data.iter().map(Bytes::len).sum()
    }

    /// Drop unread data, returning how many bytes were dropped
    pub(crate) fn discard_data(&mut self) -> usize {
        let len = self.buffered_len();
        self.data.clear();
        len
    }
}

/// Session-side stream record
#[derive(Debug)]
pub(crate) struct Stream {
    pub(crate) key: StreamKey,
    pub(crate) kind: StreamKind,
    pub(crate) id: StreamId,
    pub(crate) url: Url,
    pub(crate) priority: RequestPriority,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) request_headers_queued: bool,
    pub(crate) request_headers_sent: bool,
    /// Body bytes accepted from the caller but not yet framed
    pub(crate) pending_send: BytesMut,
    /// Caller has finished the body; END_STREAM follows `pending_send`
    pub(crate) pending_fin: bool,
    /// A frame carrying END_STREAM has been queued
    pub(crate) fin_queued: bool,
    pub(crate) fin_sent: bool,
    pub(crate) fin_received: bool,
    pub(crate) response_headers_received: bool,
    /// One DATA frame of this stream sits in the write queue or in flight
    pub(crate) data_write_queued: bool,
    pub(crate) send_stalled_by_flow_control: bool,
    /// Pushed streams stay open until a caller takes them
    pub(crate) claimed: bool,
    /// Pushed stream whose response HEADERS were admitted
    pub(crate) active_push: bool,
    pub(crate) send_bytes: u64,
    pub(crate) recv_bytes: u64,
    pub(crate) inbox: Rc<RefCell<StreamInbox>>,
}

impl Stream {
    pub(crate) fn new_request(
        key: StreamKey,
        url: Url,
        priority: RequestPriority,
        send_window: i32,
        recv_window: i32,
    ) -> Self {
        Stream {
            key,
            kind: StreamKind::Request,
            id: 0,
            url,
            priority,
            send_window: SendWindow::new(send_window),
            recv_window: RecvWindow::new(recv_window),
            request_headers_queued: false,
            request_headers_sent: false,
            pending_send: BytesMut::new(),
            pending_fin: false,
            fin_queued: false,
            fin_sent: false,
            fin_received: false,
            response_headers_received: false,
            data_write_queued: false,
            send_stalled_by_flow_control: false,
            claimed: true,
            active_push: false,
            send_bytes: 0,
            recv_bytes: 0,
            inbox: Rc::new(RefCell::new(StreamInbox::default())),
        }
    }

    pub(crate) fn new_push(
        key: StreamKey,
        id: StreamId,
        url: Url,
        send_window: i32,
        recv_window: i32,
        request_headers: HeaderList,
    ) -> Self {
        let mut stream = Self::new_request(key, url, RequestPriority::Idle, send_window, recv_window);
        stream.kind = StreamKind::Push;
        stream.id = id;
        // The client never sends on a pushed stream
        stream.request_headers_queued = true;
        stream.request_headers_sent = true;
        stream.fin_queued = true;
        stream.fin_sent = true;
        stream.claimed = false;
        {
            let mut inbox = stream.inbox.borrow_mut();
            inbox.stream_id = id;
            inbox.push_request_headers = Some(request_headers);
        }
        stream
    }

    pub(crate) fn is_push(&self) -> bool {
        self.kind == StreamKind::Push
    }

    pub(crate) fn state(&self) -> StreamState {
        if self.id == 0 {
            return StreamState::Idle;
        }
        if self.is_push() && !self.response_headers_received {
            return StreamState::ReservedRemote;
        }
        match (self.fin_sent, self.fin_received) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) => StreamState::Open,
        }
    }

    pub(crate) fn set_id(&mut self, id: StreamId) {
        self.id = id;
        self.inbox.borrow_mut().stream_id = id;
    }

    /// Body bytes or a bare END_STREAM still waiting to be framed
    pub(crate) fn has_pending_send(&self) -> bool {
        !self.pending_send.is_empty() || (self.pending_fin && !self.fin_queued)
    }
}

/// Build the request header list for `url`: pseudo-headers first, then
/// caller headers with lowercased names.
pub(crate) fn request_header_list(url: &Url, method: &str, extra: &[(&str, &str)]) -> HeaderList {
    let authority = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    };
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    };

    let mut headers = vec![
        (":method".to_string(), method.to_string()),
        (":authority".to_string(), authority),
        (":scheme".to_string(), url.scheme().to_string()),
        (":path".to_string(), path),
    ];
    headers.extend(
        extra
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string())),
    );
    headers
}

/// Value of the first header called `name`
pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Caller handle to an open (or finished) stream.
///
/// Dropping the handle while the stream is still open cancels it.
pub struct StreamHandle {
    session: Weak<RefCell<SessionInner>>,
    key: StreamKey,
    url: Url,
    inbox: Rc<RefCell<StreamInbox>>,
    released: bool,
}

impl StreamHandle {
    pub(crate) fn new(
        session: Weak<RefCell<SessionInner>>,
        key: StreamKey,
        url: Url,
        inbox: Rc<RefCell<StreamInbox>>,
    ) -> Self {
        StreamHandle {
            session,
            key,
            url,
            inbox,
            released: false,
        }
    }

    /// Drop the handle without touching the session. Used by the session
    /// itself, which is already borrowed at that point.
    pub(crate) fn release(mut self) {
        self.released = true;
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut SessionInner) -> Result<R>) -> Result<R> {
        let session = self.session.upgrade().ok_or(Error::SessionGone)?;
        let mut inner = session.try_borrow_mut().map_err(|_| Error::ReentrantLoop)?;
        f(&mut inner)
    }

    pub(crate) fn key(&self) -> StreamKey {
        self.key
    }

    /// Wire id; 0 until the request HEADERS have been dequeued for writing
    pub fn stream_id(&self) -> StreamId {
        self.inbox.borrow().stream_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Queue the request HEADERS. `end_stream` marks a request without body.
    pub fn send_request(&self, method: &str, headers: &[(&str, &str)], end_stream: bool) -> Result<()> {
        let list = request_header_list(&self.url, method, headers);
        self.with_session(|session| session.send_request_headers(self.key, list, end_stream))
    }

    /// Queue request body bytes
    pub fn send_data(&self, data: impl Into<Bytes>, end_stream: bool) -> Result<()> {
        let data = data.into();
        self.with_session(|session| session.send_data(self.key, data, end_stream))
    }

    /// Read buffered response body.
    ///
    /// `Ok(0)` once the body is complete, [`Error::WouldBlock`] while more
    /// may arrive, and the stream's terminal error if it was reset.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let n = {
            let mut inbox = self.inbox.borrow_mut();
            let n = inbox.read_into(buf);
            inbox.uncredited += n;
            n
        };
        self.flush_credit();
        if n > 0 {
            return Ok(n);
        }

        let inbox = self.inbox.borrow();
        match &inbox.close_status {
            Some(Err(e)) => Err(e.clone()),
            Some(Ok(())) => Ok(0),
            None if inbox.fin_received => Ok(0),
            None => Err(Error::WouldBlock),
        }
    }

    /// Read everything buffered so far
    pub fn read_to_bytes(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Error::WouldBlock) if !out.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(out.freeze())
    }

    fn flush_credit(&self) {
        let credit = self.inbox.borrow().uncredited;
        if credit == 0 {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Ok(mut inner) = session.try_borrow_mut() {
            self.inbox.borrow_mut().uncredited = 0;
            inner.on_stream_data_consumed(self.key, credit);
        };
    }

    /// Bytes received but not yet read
    pub fn buffered_len(&self) -> usize {
        self.inbox.borrow().buffered_len()
    }

    pub fn response_headers(&self) -> Option<HeaderList> {
        self.inbox.borrow().response_headers.clone()
    }

    /// `:status` of the final response
    pub fn status(&self) -> Option<u16> {
        let inbox = self.inbox.borrow();
        let headers = inbox.response_headers.as_ref()?;
        header_value(headers, ":status")?.parse().ok()
    }

    pub fn trailers(&self) -> Option<HeaderList> {
        self.inbox.borrow().trailers.clone()
    }

    /// Request headers from the PUSH_PROMISE, for pushed streams
    pub fn push_request_headers(&self) -> Option<HeaderList> {
        self.inbox.borrow().push_request_headers.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.borrow().close_status.is_some()
    }

    /// `None` while open
    pub fn close_status(&self) -> Option<Result<()>> {
        self.inbox.borrow().close_status.clone()
    }

    /// Reset the stream locally. No-op once closed.
    pub fn cancel(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.with_session(|session| {
            session.cancel_stream(self.key);
            Ok(())
        })
    }

    pub fn priority(&self) -> Result<RequestPriority> {
        self.with_session(|session| session.stream_priority(self.key))
    }

    pub fn set_priority(&self, priority: RequestPriority) -> Result<()> {
        self.with_session(|session| session.set_stream_priority(self.key, priority))
    }

    pub fn send_window_size(&self) -> Result<i32> {
        self.with_session(|session| session.stream_send_window_size(self.key))
    }

    pub fn recv_window_size(&self) -> Result<i32> {
        self.with_session(|session| session.stream_recv_window_size(self.key))
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("key", &self.key)
            .field("stream_id", &self.stream_id())
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let unread = {
            let mut inbox = self.inbox.borrow_mut();
            let unread = inbox.discard_data() + inbox.uncredited;
            inbox.uncredited = 0;
            unread
        };
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.try_borrow_mut() {
            Ok(mut inner) => inner.on_stream_handle_dropped(self.key, unread),
            Err(_) => {
                debug!(key = ?self.key, "stream handle dropped inside session turn");
                let mut inbox = self.inbox.borrow_mut();
                inbox.uncredited = unread;
                inbox.handle_dropped = true;
            }
        };
    }
}
