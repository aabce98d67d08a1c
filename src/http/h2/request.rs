//! Requests to open a stream on a session.
//!
//! A session below its concurrency limit hands out a stream right away.
//! Otherwise the request waits in a per-priority queue and is completed
//! through a oneshot channel once a slot frees up, or failed when the
//! session goes away.

use super::error::{Error, Result};
use super::priority::RequestPriority;
use super::session::SessionInner;
use super::stream::StreamHandle;
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Weak;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

/// Queued stream creation, owned by the session
#[derive(Debug)]
pub(crate) struct PendingStreamRequest {
    pub(crate) id: u64,
    pub(crate) url: Url,
    pub(crate) priority: RequestPriority,
    pub(crate) sender: oneshot::Sender<Result<StreamHandle>>,
}

impl PendingStreamRequest {
    /// The caller dropped its [`StreamRequest`]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.sender.is_closed()
    }

    /// Deliver the outcome. A handle the caller no longer wants is handed
    /// back so the session can close its stream.
    pub(crate) fn complete(self, result: Result<StreamHandle>) -> Option<StreamHandle> {
        match self.sender.send(result) {
            Ok(()) => None,
            Err(Ok(handle)) => Some(handle),
            Err(Err(_)) => None,
        }
    }
}

enum RequestState {
    Ready(Result<StreamHandle>),
    Pending(oneshot::Receiver<Result<StreamHandle>>),
    Taken,
}

/// Caller side of a stream request
pub struct StreamRequest {
    session: Weak<RefCell<SessionInner>>,
    id: u64,
    url: Url,
    state: RequestState,
}

impl StreamRequest {
    pub(crate) fn ready(session: Weak<RefCell<SessionInner>>, id: u64, url: Url, handle: StreamHandle) -> Self {
        StreamRequest {
            session,
            id,
            url,
            state: RequestState::Ready(Ok(handle)),
        }
    }

    pub(crate) fn pending(
        session: Weak<RefCell<SessionInner>>,
        id: u64,
        url: Url,
        receiver: oneshot::Receiver<Result<StreamHandle>>,
    ) -> Self {
        StreamRequest {
            session,
            id,
            url,
            state: RequestState::Pending(receiver),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Still waiting for a free stream slot
    pub fn is_pending(&mut self) -> bool {
        self.refresh();
        matches!(self.state, RequestState::Pending(_))
    }

    /// Take the outcome if there is one.
    ///
    /// `None` while the request is queued. A session that disappears
    /// without answering yields [`Error::Aborted`].
    pub fn try_take(&mut self) -> Option<Result<StreamHandle>> {
        self.refresh();
        match std::mem::replace(&mut self.state, RequestState::Taken) {
            RequestState::Ready(result) => Some(result),
            pending @ RequestState::Pending(_) => {
                self.state = pending;
                None
            }
            RequestState::Taken => Some(Err(Error::InvalidStream("stream request already taken".to_string()))),
        }
    }

    fn refresh(&mut self) {
        let RequestState::Pending(receiver) = &mut self.state else {
            return;
        };
        match receiver.try_recv() {
            Ok(result) => self.state = RequestState::Ready(result),
            Err(oneshot::error::TryRecvError::Empty) => {}
            Err(oneshot::error::TryRecvError::Closed) => self.state = RequestState::Ready(Err(Error::Aborted)),
        }
    }

    /// Move a queued request to another priority bucket
    pub fn set_priority(&self, priority: RequestPriority) -> Result<()> {
        if !matches!(self.state, RequestState::Pending(_)) {
            return Ok(());
        }
        let session = self.session.upgrade().ok_or(Error::SessionGone)?;
        let mut inner = session.try_borrow_mut().map_err(|_| Error::ReentrantLoop)?;
        inner.change_pending_request_priority(self.id, priority);
        Ok(())
    }
}

impl Future for StreamRequest {
    type Output = Result<StreamHandle>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let RequestState::Pending(receiver) = &mut this.state {
            let result = match Pin::new(receiver).poll(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => return Poll::Pending,
            };
            this.state = RequestState::Taken;
            return Poll::Ready(result.unwrap_or(Err(Error::Aborted)));
        }
        Poll::Ready(this.try_take().unwrap_or(Err(Error::Aborted)))
    }
}

impl std::fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRequest")
            .field("id", &self.id)
            .field("url", &self.url.as_str())
            .field("pending", &matches!(self.state, RequestState::Pending(_)))
            .finish()
    }
}

impl Drop for StreamRequest {
    fn drop(&mut self) {
        if !matches!(self.state, RequestState::Pending(_)) {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.try_borrow_mut() {
            Ok(mut inner) => inner.cancel_pending_request(self.id),
            // The closed receiver is noticed when the request is completed
            Err(_) => debug!(request = self.id, "stream request dropped inside session turn"),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://a.test/").unwrap()
    }

    #[test]
    fn test_pending_then_closed_sender_aborts() {
        let (tx, rx) = oneshot::channel::<Result<StreamHandle>>();
        let mut request = StreamRequest::pending(Weak::new(), 1, url(), rx);
        assert!(request.is_pending());
        assert!(request.try_take().is_none());

        drop(tx);
        assert!(matches!(request.try_take(), Some(Err(Error::Aborted))));
        assert!(matches!(request.try_take(), Some(Err(Error::InvalidStream(_)))));
    }

    #[test]
    fn test_pending_receives_error() {
        let (tx, rx) = oneshot::channel::<Result<StreamHandle>>();
        let mut request = StreamRequest::pending(Weak::new(), 1, url(), rx);
        let pending = PendingStreamRequest {
            id: 1,
            url: url(),
            priority: RequestPriority::Low,
            sender: tx,
        };
        assert!(!pending.is_cancelled());
        assert!(pending.complete(Err(Error::Aborted)).is_none());
        assert!(!request.is_pending());
        assert!(matches!(request.try_take(), Some(Err(Error::Aborted))));
    }

    #[test]
    fn test_dropped_request_is_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<StreamHandle>>();
        let request = StreamRequest::pending(Weak::new(), 7, url(), rx);
        drop(request);
        let pending = PendingStreamRequest {
            id: 7,
            url: url(),
            priority: RequestPriority::Low,
            sender: tx,
        };
        assert!(pending.is_cancelled());
    }
}
