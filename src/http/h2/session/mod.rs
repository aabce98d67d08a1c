//! Multiplexed HTTP/2 client session
//!
//! A [`Session`] owns one transport connection and multiplexes any number of
//! request streams over it. It is single threaded and cooperative: nothing
//! happens until the owner runs the session's task runner, either through
//! [`Session::run_until_idle`] or the readiness hooks
//! [`Session::on_transport_readable`] and [`Session::on_transport_writable`].
//!
//! # Lifecycle
//!
//! ```text
//! Available --(GOAWAY / make_unavailable)--> GoingAway --(last stream closed)--> Draining
//!     \____________________________(fatal error)_______________________________/
//! ```
//!
//! A going-away session keeps serving its open streams but refuses new
//! ones. A draining session fails everything still pending, flushes its
//! write queue and then closes the transport.
//!
//! # Example
//!
//! ```no_run
//! use h2mux::http::h2::{RequestPriority, SessionBuilder, SessionKey};
//! use h2mux::net::TcpTransport;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = TcpTransport::connect("127.0.0.1:8080".parse()?, Duration::from_secs(5))?;
//! let session = SessionBuilder::new(SessionKey::new("localhost", 8080)).build(transport)?;
//!
//! let mut request = session.request_stream("http://localhost:8080/", RequestPriority::Medium)?;
//! let stream = request.try_take().expect("below the stream limit")?;
//! stream.send_request("GET", &[], true)?;
//!
//! while !stream.is_closed() {
//!     session.on_transport_readable()?;
//! }
//! println!("status {:?}", stream.status());
//! # Ok(())
//! # }
//! ```

mod flow;
mod push;
mod read;
mod tasks;
mod write;

use super::clock::{Clock, SystemClock};
use super::codec::{FrameDecoder, HeaderEncoder};
use super::config::SessionConfig;
use super::error::{Error, Result};
use super::flow_control::{RecvWindow, SendWindow};
use super::priority::{PriorityTree, RequestPriority};
use super::push::PushedStreamIndex;
use super::request::{PendingStreamRequest, StreamRequest};
use super::stream::{Stream, StreamHandle, StreamId, StreamKey};
use super::write_queue::WriteQueue;
use super::{DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::Transport;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;
use tasks::{Task, TaskRunner};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;
use write::InFlightWrite;

/// Destination a session is connected to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
}

impl SessionKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SessionKey {
            host: host.into(),
            port,
        }
    }

    /// Key for the origin of `url`
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("{} has no host", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("{} has no port", url)))?;
        Ok(SessionKey::new(host, port))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Whether the session takes new streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityState {
    Available,
    /// Open streams continue, new ones are refused
    GoingAway,
    /// Terminal; the session is flushing and will close
    Draining,
}

/// Coarse progress of the session's streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    SendingRequest,
    WaitingForResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    DoRead,
    DoReadComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    Idle,
    DoWrite,
    DoWriteComplete,
}

/// Snapshot of session counters
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub availability: AvailabilityState,
    pub active_streams: usize,
    pub created_streams: usize,
    pub pending_stream_requests: usize,
    pub unclaimed_pushed_streams: usize,
    pub max_concurrent_streams: usize,
    pub streams_initiated_count: u64,
    pub streams_pushed_count: u64,
    pub streams_pushed_and_claimed_count: u64,
    pub streams_abandoned_count: u64,
    pub frames_received: u64,
    pub send_window_size: i32,
    pub recv_window_size: i32,
    pub unacked_recv_window_bytes: i32,
    pub error: Option<Error>,
}

/// Callbacks into the pool that owns the session.
///
/// Called while the session is mid-turn: calling back into the session
/// from here returns [`Error::ReentrantLoop`].
pub trait PoolDelegate {
    fn on_session_going_away(&mut self, _key: &SessionKey) {}

    /// The transport is closed; `error` is `None` after a graceful drain
    fn on_session_closed(&mut self, _key: &SessionKey, _error: Option<&Error>) {}

    fn register_unclaimed_push(&mut self, _url: &Url, _key: &SessionKey) {}

    fn unregister_unclaimed_push(&mut self, _url: &Url, _key: &SessionKey) {}
}

/// Told about every accepted server push
pub trait PushDelegate {
    fn on_push(&mut self, _url: &Url) {}
}

struct NoopDelegate;

impl PoolDelegate for NoopDelegate {}
impl PushDelegate for NoopDelegate {}

/// Builder for [`Session`]
pub struct SessionBuilder {
    key: SessionKey,
    config: SessionConfig,
    clock: Rc<dyn Clock>,
    pool: Box<dyn PoolDelegate>,
    push_delegate: Box<dyn PushDelegate>,
}

impl SessionBuilder {
    pub fn new(key: SessionKey) -> Self {
        SessionBuilder {
            key,
            config: SessionConfig::default(),
            clock: Rc::new(SystemClock),
            pool: Box::new(NoopDelegate),
            push_delegate: Box::new(NoopDelegate),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.config.enable_push = enable;
        self
    }

    /// Stream limit used until the server's SETTINGS arrive
    pub fn initial_max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.initial_max_concurrent_streams = max;
        self
    }

    pub fn session_max_recv_window_size(mut self, size: i32) -> Self {
        self.config.session_max_recv_window_size = size;
        self
    }

    pub fn stream_max_recv_window_size(mut self, size: i32) -> Self {
        self.config.stream_max_recv_window_size = size;
        self
    }

    pub fn trusted_proxy(mut self, trusted: bool) -> Self {
        self.config.trusted_proxy = trusted;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Rc::new(clock);
        self
    }

    pub fn pool_delegate(mut self, pool: impl PoolDelegate + 'static) -> Self {
        self.pool = Box::new(pool);
        self
    }

    pub fn push_delegate(mut self, delegate: impl PushDelegate + 'static) -> Self {
        self.push_delegate = Box::new(delegate);
        self
    }

    /// Start a session on `transport`.
    ///
    /// The connection preface and initial SETTINGS are queued and a read is
    /// posted; both happen on the first [`Session::run_until_idle`].
    pub fn build(self, transport: impl Transport + 'static) -> Result<Session> {
        self.config.validate()?;
        let SessionBuilder {
            key,
            config,
            clock,
            pool,
            push_delegate,
        } = self;

        let inner = Rc::new_cyclic(|weak| {
            RefCell::new(SessionInner::new(
                weak.clone(),
                key,
                config,
                Box::new(transport),
                clock,
                pool,
                push_delegate,
            ))
        });
        {
            let mut session = inner.borrow_mut();
            debug!(key = %session.key, "session initialized");
            session.send_initial_data();
            session.tasks.post(Task::PumpRead);
        }
        Ok(Session { inner })
    }
}

/// Client HTTP/2 session over one transport
pub struct Session {
    inner: Rc<RefCell<SessionInner>>,
}

impl Session {
    fn inner_mut(&self) -> Result<RefMut<'_, SessionInner>> {
        self.inner.try_borrow_mut().map_err(|_| Error::ReentrantLoop)
    }

    fn inner(&self) -> Ref<'_, SessionInner> {
        self.inner.borrow()
    }

    /// Ask for a new stream to `url`.
    ///
    /// Below the concurrency limit the returned request is already
    /// fulfilled; otherwise it waits in the priority queue.
    pub fn request_stream(&self, url: &str, priority: RequestPriority) -> Result<StreamRequest> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        self.inner_mut()?.request_stream(url, priority)
    }

    /// Take the unclaimed pushed stream for `url`, if the server pushed one
    pub fn get_push_stream(&self, url: &str, priority: RequestPriority) -> Result<Option<StreamHandle>> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        self.inner_mut()?.get_push_stream(&url, priority)
    }

    /// Reset the unclaimed push for `url` with CANCEL
    pub fn cancel_push(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        self.inner_mut()?.cancel_push(&url);
        Ok(())
    }

    /// Stop taking new streams; the session drains once its open streams
    /// have closed
    pub fn make_unavailable(&self) -> Result<()> {
        let mut inner = self.inner_mut()?;
        inner.make_unavailable();
        inner.maybe_finish_going_away();
        Ok(())
    }

    /// Drain the session with `error`, failing every stream
    pub fn close_session_on_error(&self, error: Error, description: &str) -> Result<()> {
        self.inner_mut()?.do_drain_session(Err(error), description);
        Ok(())
    }

    /// Drain the session if it has no open streams. Returns whether it did.
    pub fn close_if_idle(&self) -> Result<bool> {
        let mut inner = self.inner_mut()?;
        if !inner.active.is_empty() || !inner.created.is_empty() {
            return Ok(false);
        }
        inner.do_drain_session(Err(Error::ConnectionClosed), "Closing idle connection.");
        Ok(true)
    }

    /// Run posted tasks and expired timers until none are left
    pub fn run_until_idle(&self) -> Result<()> {
        loop {
            let mut inner = self.inner_mut()?;
            inner.release_dropped_handles();
            let now = inner.clock.now();
            let Some(task) = inner.tasks.pop_ready(now) else {
                return Ok(());
            };
            inner.run_task(task);
        }
    }

    /// The transport has data (or EOF) to read
    pub fn on_transport_readable(&self) -> Result<()> {
        {
            let mut inner = self.inner_mut()?;
            if inner.availability != AvailabilityState::Draining && inner.read_state == ReadState::DoRead {
                inner.tasks.post(Task::PumpRead);
            }
        }
        self.run_until_idle()
    }

    /// A previously blocked write can make progress
    pub fn on_transport_writable(&self) -> Result<()> {
        {
            let mut inner = self.inner_mut()?;
            if inner.write_blocked {
                inner.write_blocked = false;
                inner.tasks.post(Task::PumpWrite);
            }
        }
        self.run_until_idle()
    }

    /// When the earliest timer fires, if any
    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.inner().tasks.next_deadline()
    }

    pub fn key(&self) -> SessionKey {
        self.inner().key.clone()
    }

    pub fn availability_state(&self) -> AvailabilityState {
        self.inner().availability
    }

    pub fn is_available(&self) -> bool {
        self.availability_state() == AvailabilityState::Available
    }

    pub fn is_going_away(&self) -> bool {
        self.availability_state() == AvailabilityState::GoingAway
    }

    pub fn is_draining(&self) -> bool {
        self.availability_state() == AvailabilityState::Draining
    }

    /// The transport has been closed and the session does nothing more
    pub fn is_closed(&self) -> bool {
        self.inner().destroyed
    }

    /// Why the session drained; `None` while open or after a graceful drain
    pub fn error_on_close(&self) -> Option<Error> {
        self.inner().error_on_close.clone().err()
    }

    pub fn load_state(&self) -> LoadState {
        self.inner().load_state()
    }

    pub fn num_active_streams(&self) -> usize {
        self.inner().active.len()
    }

    pub fn num_created_streams(&self) -> usize {
        self.inner().created.len()
    }

    pub fn num_pending_stream_requests(&self) -> usize {
        self.inner().num_pending_stream_requests()
    }

    pub fn num_pushed_streams(&self) -> usize {
        self.inner().num_pushed
    }

    pub fn num_active_pushed_streams(&self) -> usize {
        self.inner().num_active_pushed
    }

    pub fn num_unclaimed_pushed_streams(&self) -> usize {
        self.inner().unclaimed_pushes.len()
    }

    pub fn has_unclaimed_pushed_stream(&self, url: &str) -> bool {
        Url::parse(url).is_ok_and(|url| self.inner().unclaimed_pushes.contains(&url))
    }

    pub fn max_concurrent_streams(&self) -> usize {
        self.inner().max_concurrent_streams
    }

    pub fn send_window_size(&self) -> i32 {
        self.inner().session_send_window.size()
    }

    pub fn recv_window_size(&self) -> i32 {
        self.inner().session_recv_window.size()
    }

    pub fn unacked_recv_window_bytes(&self) -> i32 {
        self.inner().session_recv_window.unacked()
    }

    /// Send window new streams start with
    pub fn stream_initial_send_window_size(&self) -> i32 {
        self.inner().stream_initial_send_window_size
    }

    pub fn pings_in_flight(&self) -> i64 {
        self.inner().pings_in_flight
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner().transport.peer_addr()
    }

    pub fn info(&self) -> SessionInfo {
        self.inner().info()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Session")
                .field("key", &inner.key)
                .field("availability", &inner.availability)
                .field("active_streams", &inner.active.len())
                .finish(),
            Err(_) => f.debug_struct("Session").finish_non_exhaustive(),
        }
    }
}

/// Session state shared with stream handles and requests through weak
/// references
pub(crate) struct SessionInner {
    weak_self: Weak<RefCell<SessionInner>>,
    key: SessionKey,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    clock: Rc<dyn Clock>,
    pool: Box<dyn PoolDelegate>,
    push_delegate: Box<dyn PushDelegate>,
    tasks: TaskRunner,

    availability: AvailabilityState,
    read_state: ReadState,
    write_state: WriteState,
    /// The transport refused the in-flight write; waiting for writability
    write_blocked: bool,
    in_io_loop: bool,
    destroyed: bool,
    error_on_close: Result<()>,

    decoder: FrameDecoder,
    header_encoder: HeaderEncoder,
    read_buf: Vec<u8>,
    write_queue: WriteQueue,
    in_flight_write: Option<InFlightWrite>,

    streams: HashMap<StreamKey, Stream>,
    /// Streams that have no id yet
    created: BTreeSet<StreamKey>,
    active: BTreeMap<StreamId, StreamKey>,
    next_stream_key: u64,
    /// Next client stream id
    stream_hi_water_mark: StreamId,
    last_accepted_push_stream_id: StreamId,
    pending_requests: [VecDeque<PendingStreamRequest>; RequestPriority::COUNT],
    next_request_id: u64,
    send_stalled_streams: [VecDeque<StreamId>; RequestPriority::COUNT],
    priority_tree: PriorityTree,

    unclaimed_pushes: PushedStreamIndex,
    /// Push streams in `active`
    num_pushed: usize,
    /// Push streams whose response HEADERS were admitted
    num_active_pushed: usize,
    next_push_sweep: Instant,
    push_sweep_posted: bool,

    max_concurrent_streams: usize,
    max_concurrent_pushed_streams: usize,
    stream_initial_send_window_size: i32,
    peer_max_frame_size: u32,
    session_send_window: SendWindow,
    session_recv_window: RecvWindow,

    pings_in_flight: i64,
    next_ping_id: u64,
    last_activity: Instant,
    last_ping_sent: Option<Instant>,
    check_ping_status_pending: bool,

    streams_initiated_count: u64,
    streams_pushed_count: u64,
    streams_pushed_and_claimed_count: u64,
    streams_abandoned_count: u64,
    frames_received: u64,
}

impl SessionInner {
    fn new(
        weak_self: Weak<RefCell<SessionInner>>,
        key: SessionKey,
        config: SessionConfig,
        transport: Box<dyn Transport>,
        clock: Rc<dyn Clock>,
        pool: Box<dyn PoolDelegate>,
        push_delegate: Box<dyn PushDelegate>,
    ) -> Self {
        let now = clock.now();
        let max_concurrent_streams = config
            .initial_max_concurrent_streams
            .min(config.max_concurrent_stream_limit) as usize;
        SessionInner {
            weak_self,
            key,
            transport,
            pool,
            push_delegate,
            tasks: TaskRunner::new(),
            availability: AvailabilityState::Available,
            read_state: ReadState::DoRead,
            write_state: WriteState::Idle,
            write_blocked: false,
            in_io_loop: false,
            destroyed: false,
            error_on_close: Ok(()),
            decoder: FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE as usize, config.max_header_list_size as usize),
            header_encoder: HeaderEncoder::new(),
            read_buf: vec![0; config.read_buffer_size],
            write_queue: WriteQueue::new(),
            in_flight_write: None,
            streams: HashMap::new(),
            created: BTreeSet::new(),
            active: BTreeMap::new(),
            next_stream_key: 1,
            stream_hi_water_mark: 1,
            last_accepted_push_stream_id: 0,
            pending_requests: Default::default(),
            next_request_id: 1,
            send_stalled_streams: Default::default(),
            priority_tree: PriorityTree::new(),
            unclaimed_pushes: PushedStreamIndex::new(),
            num_pushed: 0,
            num_active_pushed: 0,
            next_push_sweep: now + config.min_pushed_stream_lifetime,
            push_sweep_posted: false,
            max_concurrent_streams,
            max_concurrent_pushed_streams: config.max_concurrent_pushed_streams,
            stream_initial_send_window_size: DEFAULT_INITIAL_WINDOW_SIZE as i32,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            session_send_window: SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE as i32),
            session_recv_window: RecvWindow::with_sizes(
                DEFAULT_INITIAL_WINDOW_SIZE as i32,
                config.session_max_recv_window_size,
            ),
            pings_in_flight: 0,
            next_ping_id: 1,
            last_activity: now,
            last_ping_sent: None,
            check_ping_status_pending: false,
            streams_initiated_count: 0,
            streams_pushed_count: 0,
            streams_pushed_and_claimed_count: 0,
            streams_abandoned_count: 0,
            frames_received: 0,
            config,
            clock,
        }
    }

    fn run_task(&mut self, task: Task) {
        if self.destroyed {
            return;
        }
        match task {
            Task::PumpRead => self.pump_read_loop(),
            Task::PumpWrite => self.pump_write_loop(),
            Task::CompleteStreamRequest(request) => self.complete_stream_request(request),
            Task::CheckPingStatus { last_check_time } => self.check_ping_status(last_check_time),
            Task::SweepPushedStreams => {
                self.push_sweep_posted = false;
                self.delete_expired_pushed_streams();
                self.plan_push_sweep();
            }
        }
    }

    // Stream creation

    fn has_stream_capacity(&self) -> bool {
        let open = (self.active.len() + self.created.len()).saturating_sub(self.num_pushed);
        open < self.max_concurrent_streams
    }

    fn request_stream(&mut self, url: Url, priority: RequestPriority) -> Result<StreamRequest> {
        match self.availability {
            AvailabilityState::Available => {}
            AvailabilityState::GoingAway => return Err(Error::GoingAway),
            AvailabilityState::Draining => return Err(Error::ConnectionClosed),
        }

        let id = self.next_request_id;
        self.next_request_id += 1;

        if self.has_stream_capacity() {
            let handle = self.create_stream(url.clone(), priority)?;
            return Ok(StreamRequest::ready(self.weak_self.clone(), id, url, handle));
        }

        let (sender, receiver) = oneshot::channel();
        debug!(request = id, %url, priority = priority.name(), "stream request queued");
        self.pending_requests[priority.index()].push_back(PendingStreamRequest {
            id,
            url: url.clone(),
            priority,
            sender,
        });
        Ok(StreamRequest::pending(self.weak_self.clone(), id, url, receiver))
    }

    fn create_stream(&mut self, url: Url, priority: RequestPriority) -> Result<StreamHandle> {
        if !self.transport.is_connected() {
            self.do_drain_session(
                Err(Error::ConnectionClosed),
                "Tried to create stream for a closed socket connection.",
            );
            return Err(Error::ConnectionClosed);
        }

        let key = StreamKey(self.next_stream_key);
        self.next_stream_key += 1;
        let stream = Stream::new_request(
            key,
            url.clone(),
            priority,
            self.stream_initial_send_window_size,
            self.config.stream_max_recv_window_size,
        );
        let inbox = Rc::clone(&stream.inbox);
        self.streams.insert(key, stream);
        self.created.insert(key);
        debug!(?key, %url, "stream created");
        Ok(StreamHandle::new(self.weak_self.clone(), key, url, inbox))
    }

    fn next_pending_request(&mut self) -> Option<PendingStreamRequest> {
        for priority in RequestPriority::HIGHEST_FIRST {
            while let Some(request) = self.pending_requests[priority.index()].pop_front() {
                if !request.is_cancelled() {
                    return Some(request);
                }
            }
        }
        None
    }

    fn num_pending_stream_requests(&self) -> usize {
        self.pending_requests.iter().map(VecDeque::len).sum()
    }

    /// Hand freed stream slots to queued requests, most urgent first
    fn process_pending_stream_requests(&mut self) {
        let open = (self.active.len() + self.created.len()).saturating_sub(self.num_pushed);
        let mut available = self.max_concurrent_streams.saturating_sub(open);
        while available > 0 {
            let Some(request) = self.next_pending_request() else {
                break;
            };
            // Completion re-checks the limit; a request that loses the
            // race is queued again.
            self.tasks.post(Task::CompleteStreamRequest(request));
            available -= 1;
        }
    }

    fn complete_stream_request(&mut self, request: PendingStreamRequest) {
        if request.is_cancelled() {
            return;
        }
        let failure = match self.availability {
            AvailabilityState::Available => None,
            AvailabilityState::GoingAway => Some(Error::GoingAway),
            AvailabilityState::Draining => Some(Error::ConnectionClosed),
        };
        if let Some(error) = failure {
            let _ = request.complete(Err(error));
            return;
        }
        if !self.has_stream_capacity() {
            self.pending_requests[request.priority.index()].push_back(request);
            return;
        }

        match self.create_stream(request.url.clone(), request.priority) {
            Ok(handle) => {
                if let Some(handle) = request.complete(Ok(handle)) {
                    let key = handle.key();
                    handle.release();
                    self.close_stream(key, Err(Error::Cancelled));
                }
            }
            Err(e) => {
                let _ = request.complete(Err(e));
            }
        }
    }

    pub(crate) fn cancel_pending_request(&mut self, id: u64) {
        for queue in self.pending_requests.iter_mut() {
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                queue.remove(pos);
                debug!(request = id, "stream request cancelled");
                return;
            }
        }
    }

    pub(crate) fn change_pending_request_priority(&mut self, id: u64, priority: RequestPriority) {
        for queue in self.pending_requests.iter_mut() {
            if let Some(pos) = queue.iter().position(|r| r.id == id) {
                if let Some(mut request) = queue.remove(pos) {
                    request.priority = priority;
                    self.pending_requests[priority.index()].push_back(request);
                }
                return;
            }
        }
    }

    // Stream closure

    /// Close a stream wherever it lives. Closing twice is a no-op.
    fn close_stream(&mut self, key: StreamKey, status: Result<()>) {
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        let id = stream.id;
        if self.created.remove(&key) {
            self.delete_stream(key, status);
        } else if self.active.get(&id) == Some(&key) {
            self.close_active_stream(id, status);
        }
    }

    fn close_active_stream(&mut self, id: StreamId, status: Result<()>) {
        let Some(key) = self.active.remove(&id) else {
            return;
        };
        self.priority_tree.on_stream_destruction(id);

        let push_state = self.streams.get(&key).filter(|s| s.is_push()).map(|s| s.active_push);
        if let Some(active_push) = push_state {
            self.remove_unclaimed_push(id);
            self.num_pushed = self.num_pushed.saturating_sub(1);
            if active_push {
                self.num_active_pushed = self.num_active_pushed.saturating_sub(1);
            }
        }
        self.delete_stream(key, status);
    }

    fn delete_stream(&mut self, key: StreamKey, status: Result<()>) {
        let Some(stream) = self.streams.remove(&key) else {
            return;
        };
        if let Some(write) = self.in_flight_write.as_mut() {
            if write.stream == Some(key) {
                write.stream = None;
            }
        }

        let discarded: usize = self
            .write_queue
            .remove_pending_writes_for_stream(key)
            .iter()
            .map(|entry| entry.producer.flow_controlled_len())
            .sum();

        let unread = {
            let orphaned = Rc::strong_count(&stream.inbox) == 1;
            let mut inbox = stream.inbox.borrow_mut();
            if inbox.close_status.is_none() {
                inbox.close_status = Some(status.clone());
            }
            if orphaned {
                inbox.discard_data() + std::mem::take(&mut inbox.uncredited)
            } else {
                0
            }
        };
        debug!(?key, stream_id = stream.id, ?status, "stream closed");
        drop(stream);

        if discarded > 0 {
            self.credit_send_window(discarded);
        }
        if unread > 0 {
            self.increase_recv_window_size(unread);
        }
        if self.availability == AvailabilityState::Available {
            self.process_pending_stream_requests();
        }
        self.maybe_finish_going_away();
    }

    /// Send RST_STREAM (when the stream has an id) and close it
    fn reset_stream(&mut self, key: StreamKey, code: super::error::ErrorCode, description: &str) {
        use super::error::ErrorCode;
        let status = match code {
            ErrorCode::Cancel => Error::Cancelled,
            ErrorCode::RefusedStream => Error::RefusedStream,
            ErrorCode::FlowControlError => Error::FlowControl(description.to_string()),
            _ => Error::Protocol(description.to_string()),
        };
        self.reset_stream_with_status(key, code, description, status);
    }

    fn reset_stream_with_status(
        &mut self,
        key: StreamKey,
        code: super::error::ErrorCode,
        description: &str,
        status: Error,
    ) {
        let Some(stream) = self.streams.get(&key) else {
            return;
        };
        let id = stream.id;
        if id != 0 {
            self.enqueue_reset_stream_frame(id, code, description);
        }
        self.close_stream(key, Err(status));
    }

    // Going away and draining

    fn make_unavailable(&mut self) {
        if self.availability == AvailabilityState::Available {
            self.availability = AvailabilityState::GoingAway;
            debug!(key = %self.key, "session going away");
            self.pool.on_session_going_away(&self.key);
        }
        self.fail_pending_requests();
    }

    /// Fail every queued request with [`Error::Aborted`]
    fn fail_pending_requests(&mut self) {
        while let Some(request) = self.next_pending_request() {
            let _ = request.complete(Err(Error::Aborted));
        }
    }

    /// Fail pending requests and close every stream the peer will not
    /// process: active ones above `last_good_stream_id` and all created ones
    fn start_going_away(&mut self, last_good_stream_id: StreamId, status: Error) {
        self.fail_pending_requests();

        let doomed: Vec<StreamId> = self
            .active
            .range(last_good_stream_id.saturating_add(1)..)
            .map(|(&id, _)| id)
            .collect();
        for id in doomed {
            self.close_active_stream(id, Err(status.clone()));
        }

        let created: Vec<StreamKey> = self.created.iter().copied().collect();
        for key in created {
            self.close_stream(key, Err(status.clone()));
        }

        let streams = &self.streams;
        let discarded: usize = self
            .write_queue
            .remove_pending_writes_for_streams_after(last_good_stream_id, |key| streams.get(&key).map(|s| s.id))
            .iter()
            .map(|entry| entry.producer.flow_controlled_len())
            .sum();
        if discarded > 0 {
            self.credit_send_window(discarded);
        }

        self.maybe_finish_going_away();
    }

    fn maybe_finish_going_away(&mut self) {
        if self.availability == AvailabilityState::GoingAway && self.active.is_empty() && self.created.is_empty() {
            self.do_drain_session(Ok(()), "Finished going away");
        }
    }

    /// Enter the terminal state. `Err` fails every stream and request with
    /// that error and, for most errors, tells the peer with a GOAWAY.
    fn do_drain_session(&mut self, result: Result<()>, description: &str) {
        if self.availability == AvailabilityState::Draining {
            return;
        }
        self.make_unavailable();

        if let Err(error) = &result {
            if error.sends_goaway() {
                self.enqueue_goaway_frame(error.goaway_code(), description);
            }
            warn!(key = %self.key, %error, description, "session draining");
        } else {
            debug!(key = %self.key, description, "session draining");
        }

        self.availability = AvailabilityState::Draining;
        self.error_on_close = result.clone();

        if let Err(error) = result {
            self.start_going_away(0, error);
        }
        self.maybe_post_write_loop();
    }

    /// Close the transport once a draining session has flushed everything
    fn maybe_destroy(&mut self) {
        if self.destroyed
            || self.availability != AvailabilityState::Draining
            || self.in_flight_write.is_some()
            || !self.write_queue.is_empty()
        {
            return;
        }
        self.destroyed = true;
        self.fail_pending_requests();
        self.tasks.clear();
        self.transport.close();
        for (url, _) in self.unclaimed_pushes.clear() {
            self.pool.unregister_unclaimed_push(&url, &self.key);
        }
        debug!(key = %self.key, "session closed");
        let error = self.error_on_close.clone().err();
        self.pool.on_session_closed(&self.key, error.as_ref());
    }

    // Calls from stream handles

    fn stream_mut(&mut self, key: StreamKey) -> Result<&mut Stream> {
        self.streams
            .get_mut(&key)
            .ok_or_else(|| Error::InvalidStream("stream is closed".to_string()))
    }

    pub(crate) fn send_request_headers(
        &mut self,
        key: StreamKey,
        headers: super::frames::HeaderList,
        end_stream: bool,
    ) -> Result<()> {
        if self.availability == AvailabilityState::Draining {
            return Err(Error::ConnectionClosed);
        }
        let stream = self.stream_mut(key)?;
        if stream.is_push() {
            return Err(Error::InvalidStream("cannot send on a pushed stream".to_string()));
        }
        if stream.request_headers_queued {
            return Err(Error::InvalidStream("request headers already sent".to_string()));
        }
        stream.request_headers_queued = true;
        if end_stream {
            stream.pending_fin = true;
            stream.fin_queued = true;
        }
        let priority = stream.priority;
        self.enqueue_write(
            priority,
            super::frames::FrameType::Headers,
            super::write_queue::FrameProducer::Headers { headers, end_stream },
            Some(key),
        );
        Ok(())
    }

    pub(crate) fn send_data(&mut self, key: StreamKey, data: bytes::Bytes, end_stream: bool) -> Result<()> {
        if self.availability == AvailabilityState::Draining {
            return Err(Error::ConnectionClosed);
        }
        let stream = self.stream_mut(key)?;
        if stream.is_push() {
            return Err(Error::InvalidStream("cannot send on a pushed stream".to_string()));
        }
        if stream.pending_fin {
            return Err(Error::InvalidStream("request body already finished".to_string()));
        }
        stream.pending_send.extend_from_slice(&data);
        if end_stream {
            stream.pending_fin = true;
        }
        if stream.request_headers_sent && !stream.data_write_queued {
            self.queue_next_data_frame(key);
        }
        Ok(())
    }

    pub(crate) fn cancel_stream(&mut self, key: StreamKey) {
        self.reset_stream(key, super::error::ErrorCode::Cancel, "Stream cancelled");
    }

    pub(crate) fn on_stream_handle_dropped(&mut self, key: StreamKey, unread: usize) {
        if unread > 0 {
            self.increase_recv_window_size(unread);
        }
        if self.streams.contains_key(&key) {
            self.reset_stream(key, super::error::ErrorCode::Cancel, "Stream handle dropped");
        }
    }

    /// Cancel streams whose handles were dropped during an earlier turn
    fn release_dropped_handles(&mut self) {
        let dropped: Vec<(StreamKey, usize)> = self
            .streams
            .iter()
            .filter_map(|(&key, stream)| {
                let mut inbox = stream.inbox.borrow_mut();
                if !inbox.handle_dropped {
                    return None;
                }
                inbox.handle_dropped = false;
                Some((key, std::mem::take(&mut inbox.uncredited)))
            })
            .collect();
        for (key, unread) in dropped {
            self.on_stream_handle_dropped(key, unread);
        }
    }

    pub(crate) fn stream_priority(&self, key: StreamKey) -> Result<RequestPriority> {
        self.streams
            .get(&key)
            .map(|s| s.priority)
            .ok_or_else(|| Error::InvalidStream("stream is closed".to_string()))
    }

    pub(crate) fn stream_send_window_size(&self, key: StreamKey) -> Result<i32> {
        self.streams
            .get(&key)
            .map(|s| s.send_window.size())
            .ok_or_else(|| Error::InvalidStream("stream is closed".to_string()))
    }

    pub(crate) fn stream_recv_window_size(&self, key: StreamKey) -> Result<i32> {
        self.streams
            .get(&key)
            .map(|s| s.recv_window.size())
            .ok_or_else(|| Error::InvalidStream("stream is closed".to_string()))
    }

    pub(crate) fn set_stream_priority(&mut self, key: StreamKey, priority: RequestPriority) -> Result<()> {
        let stream = self.stream_mut(key)?;
        let old = stream.priority;
        if old == priority {
            return Ok(());
        }
        stream.priority = priority;
        let id = stream.id;
        self.write_queue.change_priority_of_writes_for_stream(key, old, priority);
        if id != 0 {
            self.update_stream_dependencies(id, priority);
        }
        Ok(())
    }

    // Queries

    fn load_state(&self) -> LoadState {
        let mut waiting = false;
        for stream in self.streams.values() {
            if stream.is_push() {
                continue;
            }
            if !stream.fin_sent {
                return LoadState::SendingRequest;
            }
            waiting = true;
        }
        if waiting {
            LoadState::WaitingForResponse
        } else {
            LoadState::Idle
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            key: self.key.clone(),
            availability: self.availability,
            active_streams: self.active.len(),
            created_streams: self.created.len(),
            pending_stream_requests: self.num_pending_stream_requests(),
            unclaimed_pushed_streams: self.unclaimed_pushes.len(),
            max_concurrent_streams: self.max_concurrent_streams,
            streams_initiated_count: self.streams_initiated_count,
            streams_pushed_count: self.streams_pushed_count,
            streams_pushed_and_claimed_count: self.streams_pushed_and_claimed_count,
            streams_abandoned_count: self.streams_abandoned_count,
            frames_received: self.frames_received,
            send_window_size: self.session_send_window.size(),
            recv_window_size: self.session_recv_window.size(),
            unacked_recv_window_bytes: self.session_recv_window.unacked(),
            error: self.error_on_close.clone().err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::clock::ManualClock;
    use crate::http::h2::frames::FrameEvent;
    use crate::http::h2::MAX_STREAM_ID;
    use crate::http::MemoryTransport;

    fn session() -> (Session, crate::http::MemoryTransportHandle) {
        let (transport, peer) = MemoryTransport::new();
        let session = SessionBuilder::new(SessionKey::new("a.test", 443))
            .clock(ManualClock::new())
            .build(transport)
            .unwrap();
        session.run_until_idle().unwrap();
        peer.take_outbound();
        (session, peer)
    }

    #[test]
    fn test_session_key_from_url() {
        let url = Url::parse("https://www.example.org/index.html").unwrap();
        let key = SessionKey::from_url(&url).unwrap();
        assert_eq!(key, SessionKey::new("www.example.org", 443));
        assert_eq!(key.to_string(), "www.example.org:443");
    }

    #[test]
    fn test_read_loop_rejects_reentry() {
        let (session, _peer) = session();
        let mut inner = session.inner_mut().unwrap();
        inner.in_io_loop = true;
        assert!(matches!(inner.do_read_loop(), Err(Error::ReentrantLoop)));
        assert!(matches!(inner.do_write_loop(), Err(Error::ReentrantLoop)));
        inner.in_io_loop = false;
    }

    #[test]
    fn test_public_calls_during_turn_are_reentrant() {
        let (session, _peer) = session();
        let _guard = session.inner.borrow_mut();
        assert!(matches!(session.run_until_idle(), Err(Error::ReentrantLoop)));
        assert!(matches!(
            session.request_stream("https://a.test/", RequestPriority::Low),
            Err(Error::ReentrantLoop)
        ));
    }

    #[test]
    fn test_stream_id_exhaustion_starts_going_away() {
        let (session, peer) = session();
        let mut first = session.request_stream("https://a.test/1", RequestPriority::Low).unwrap();
        let mut second = session.request_stream("https://a.test/2", RequestPriority::Low).unwrap();
        let first = first.try_take().unwrap().unwrap();
        let second = second.try_take().unwrap().unwrap();

        session.inner_mut().unwrap().stream_hi_water_mark = MAX_STREAM_ID;
        first.send_request("GET", &[], true).unwrap();
        session.run_until_idle().unwrap();

        assert_eq!(first.stream_id(), MAX_STREAM_ID);
        assert!(session.is_going_away());
        assert!(matches!(second.close_status(), Some(Err(Error::Aborted))));
        assert!(matches!(
            session.request_stream("https://a.test/3", RequestPriority::Low),
            Err(Error::GoingAway)
        ));

        let mut decoder = FrameDecoder::new(16384, 65536);
        decoder.push(&peer.take_outbound());
        assert!(matches!(
            decoder.next_event().unwrap(),
            Some(FrameEvent::Headers { stream_id: MAX_STREAM_ID, .. })
        ));
    }

    #[test]
    fn test_close_stream_twice_is_noop() {
        let (session, _peer) = session();
        let mut request = session.request_stream("https://a.test/", RequestPriority::Low).unwrap();
        let handle = request.try_take().unwrap().unwrap();
        let key = handle.key();

        let mut inner = session.inner_mut().unwrap();
        inner.close_stream(key, Err(Error::Cancelled));
        let window = inner.session_send_window.size();
        inner.close_stream(key, Err(Error::Aborted));
        assert_eq!(inner.session_send_window.size(), window);
        assert!(inner.created.is_empty());
        drop(inner);

        assert!(matches!(handle.close_status(), Some(Err(Error::Cancelled))));
    }
}
