//! Server push: PUSH_PROMISE admission, claiming and expiry

use super::tasks::Task;
use super::{AvailabilityState, SessionInner};
use crate::http::h2::error::{Error, ErrorCode, Result};
use crate::http::h2::frames::{HeaderList, PrioritySpec};
use crate::http::h2::priority::legacy::{to_spdy_priority, weight_for};
use crate::http::h2::priority::RequestPriority;
use crate::http::h2::push::url_from_push_headers;
use crate::http::h2::stream::{header_value, Stream, StreamHandle, StreamId, StreamKey};
use std::rc::Rc;
use tracing::{debug, trace};
use url::Url;

impl SessionInner {
    pub(super) fn on_push_promise(&mut self, associated_id: StreamId, promised_id: StreamId, headers: HeaderList) {
        trace!(associated_id, promised_id, "PUSH_PROMISE");
        self.try_create_push_stream(associated_id, promised_id, headers);
    }

    fn refuse_push(&mut self, promised_id: StreamId, description: &str) {
        debug!(promised_id, description, "push refused");
        self.enqueue_reset_stream_frame(promised_id, ErrorCode::RefusedStream, description);
    }

    fn try_create_push_stream(&mut self, associated_id: StreamId, promised_id: StreamId, headers: HeaderList) {
        if !self.config.enable_push {
            self.do_drain_session(
                Err(Error::Protocol("Received push stream while push is disabled.".to_string())),
                "Received push stream while push is disabled.",
            );
            return;
        }
        if promised_id % 2 == 1 {
            let description = format!("Received invalid pushed stream id {} (must be even).", promised_id);
            self.do_drain_session(Err(Error::Protocol(description.clone())), &description);
            return;
        }
        if associated_id % 2 == 0 {
            let description = format!("Received pushed stream id {} with invalid associated stream id {}.", promised_id, associated_id);
            self.do_drain_session(Err(Error::Protocol(description.clone())), &description);
            return;
        }
        if promised_id <= self.last_accepted_push_stream_id {
            let description = format!(
                "Received pushed stream id {} must be larger than last accepted id {}.",
                promised_id, self.last_accepted_push_stream_id
            );
            self.do_drain_session(Err(Error::Protocol(description.clone())), &description);
            return;
        }
        if self.active.contains_key(&promised_id) {
            debug!(promised_id, "PUSH_PROMISE for an open stream ignored");
            return;
        }

        self.last_accepted_push_stream_id = promised_id;

        if self.availability != AvailabilityState::Available {
            self.refuse_push(promised_id, "Push stream request received while going away.");
            return;
        }
        self.streams_pushed_count += 1;

        let url = match url_from_push_headers(&headers) {
            Ok(url) => url,
            Err(_) => {
                self.refuse_push(promised_id, "Invalid pushed request headers.");
                return;
            }
        };

        let Some(associated_key) = self.active.get(&associated_id).copied() else {
            self.refuse_push(promised_id, "Received push for inactive associated stream.");
            return;
        };
        let Some(associated_url) = self.streams.get(&associated_key).map(|s| s.url.clone()) else {
            self.refuse_push(promised_id, "Received push for inactive associated stream.");
            return;
        };

        if associated_url.origin() != url.origin() && !self.cross_origin_push_allowed(&associated_url, &url) {
            self.refuse_push(promised_id, "Rejected cross origin push stream.");
            return;
        }

        match header_value(&headers, ":method") {
            Some("GET") | Some("HEAD") => {}
            _ => {
                self.refuse_push(promised_id, "Pushed request must be GET or HEAD.");
                return;
            }
        }

        let now = self.clock.now();
        if !self.unclaimed_pushes.insert(url.clone(), promised_id, now) {
            let description = format!("Received duplicate pushed stream with url: {}", url);
            self.refuse_push(promised_id, &description);
            return;
        }

        let key = StreamKey(self.next_stream_key);
        self.next_stream_key += 1;
        let stream = Stream::new_push(
            key,
            promised_id,
            url.clone(),
            self.stream_initial_send_window_size,
            self.config.stream_max_recv_window_size,
            headers,
        );
        self.streams.insert(key, stream);

        let (parent, exclusive) = self
            .priority_tree
            .on_stream_creation(promised_id, to_spdy_priority(RequestPriority::Idle));
        let weight = weight_for(RequestPriority::Idle);
        self.enqueue_priority_frame(promised_id, PrioritySpec::new(parent, exclusive, weight));

        self.delete_expired_pushed_streams();
        self.active.insert(promised_id, key);
        self.num_pushed += 1;
        debug!(promised_id, associated_id, %url, "push accepted");

        self.push_delegate.on_push(&url);
        self.pool.register_unclaimed_push(&url, &self.key);
        self.plan_push_sweep();
    }

    /// A push for another origin needs a secure connection whose
    /// certificate also covers the pushed host, unless a trusted proxy
    /// is in the path (which may push plain http only)
    fn cross_origin_push_allowed(&self, associated_url: &Url, url: &Url) -> bool {
        if self.config.trusted_proxy {
            return url.scheme() != "https";
        }
        if associated_url.scheme() != "https" || url.scheme() != "https" {
            return false;
        }
        let Some(ssl_info) = self.transport.ssl_info() else {
            return false;
        };
        match (associated_url.host_str(), url.host_str()) {
            (Some(old_host), Some(new_host)) => ssl_info.can_pool(old_host, new_host),
            _ => false,
        }
    }

    /// Claim the unclaimed push for `url`
    pub(super) fn get_push_stream(&mut self, url: &Url, priority: RequestPriority) -> Result<Option<StreamHandle>> {
        if self.availability == AvailabilityState::Draining {
            return Err(Error::ConnectionClosed);
        }
        let Some(entry) = self.unclaimed_pushes.remove(url) else {
            return Ok(None);
        };
        self.pool.unregister_unclaimed_push(url, &self.key);
        let Some(&key) = self.active.get(&entry.stream_id) else {
            return Ok(None);
        };
        self.streams_pushed_and_claimed_count += 1;

        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(None);
        };
        stream.claimed = true;
        let fin_received = stream.fin_received;
        let stream_url = stream.url.clone();
        let inbox = Rc::clone(&stream.inbox);
        debug!(stream_id = entry.stream_id, %url, "push claimed");

        self.set_stream_priority(key, priority)?;
        let handle = StreamHandle::new(self.weak_self.clone(), key, stream_url, inbox);
        if fin_received {
            self.close_stream(key, Ok(()));
        }
        Ok(Some(handle))
    }

    /// Reset the unclaimed push for `url` with CANCEL
    pub(super) fn cancel_push(&mut self, url: &Url) {
        let Some(entry) = self.unclaimed_pushes.get(url).copied() else {
            return;
        };
        if let Some(&key) = self.active.get(&entry.stream_id) {
            self.reset_stream(key, ErrorCode::Cancel, "Cancelled push stream.");
        }
    }

    /// Forget the index entry of a closing push stream
    pub(super) fn remove_unclaimed_push(&mut self, stream_id: StreamId) {
        if let Some(url) = self.unclaimed_pushes.remove_stream(stream_id) {
            self.pool.unregister_unclaimed_push(&url, &self.key);
        }
    }

    /// Reset unclaimed pushes older than the minimum lifetime
    pub(super) fn delete_expired_pushed_streams(&mut self) {
        if self.unclaimed_pushes.is_empty() {
            return;
        }
        let now = self.clock.now();
        if now < self.next_push_sweep {
            return;
        }
        let lifetime = self.config.min_pushed_stream_lifetime;
        for (url, stream_id) in self.unclaimed_pushes.remove_expired(now, lifetime) {
            self.pool.unregister_unclaimed_push(&url, &self.key);
            let Some(&key) = self.active.get(&stream_id) else {
                continue;
            };
            debug!(stream_id, %url, "unclaimed push expired");
            self.streams_abandoned_count += 1;
            self.reset_stream_with_status(
                key,
                ErrorCode::RefusedStream,
                "Stream not claimed.",
                Error::InvalidStream("Stream not claimed.".to_string()),
            );
        }
        self.next_push_sweep = now + lifetime;
    }

    /// Make sure a sweep is pending while unclaimed pushes exist
    pub(super) fn plan_push_sweep(&mut self) {
        if self.push_sweep_posted || self.unclaimed_pushes.is_empty() {
            return;
        }
        self.push_sweep_posted = true;
        let deadline = self.next_push_sweep.max(self.clock.now());
        self.tasks.post_delayed(Task::SweepPushedStreams, deadline);
    }
}
