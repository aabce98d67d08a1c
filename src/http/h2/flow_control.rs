//! HTTP/2 flow control
//!
//! Flow control as defined in RFC 7540 Section 5.2, applied independently
//! at the session and the stream level. Each level has a [`SendWindow`]
//! (how much we may still transmit) and a [`RecvWindow`] (how much the peer
//! may still transmit to us).

use super::error::{Error, Result};

/// Largest legal window size (2^31 - 1)
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;

/// Outbound window.
///
/// The size may go negative when SETTINGS_INITIAL_WINDOW_SIZE shrinks
/// after data has already been queued.
#[derive(Debug, Clone)]
pub struct SendWindow {
    size: i32,
}

impl SendWindow {
    pub fn new(initial_size: i32) -> Self {
        SendWindow { size: initial_size }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    /// No payload may be framed until the window grows
    pub fn is_stalled(&self) -> bool {
        self.size <= 0
    }

    /// Apply a WINDOW_UPDATE increment
    pub fn increase(&mut self, delta: i32) -> Result<i32> {
        if delta < 1 {
            return Err(Error::Protocol(format!(
                "Received WINDOW_UPDATE with an invalid delta {}",
                delta
            )));
        }
        self.size = self.size.checked_add(delta).ok_or_else(|| {
            Error::FlowControl(format!(
                "Received WINDOW_UPDATE delta {} overflows window size {}",
                delta, self.size
            ))
        })?;
        Ok(self.size)
    }

    /// Charge framed payload bytes against the window. Rejected without
    /// mutation when the window cannot cover `delta`.
    pub fn decrease(&mut self, delta: i32) -> Result<i32> {
        if delta < 1 || delta > self.size {
            return Err(Error::FlowControl(format!(
                "Cannot decrease send window of {} by {}",
                self.size, delta
            )));
        }
        self.size -= delta;
        Ok(self.size)
    }

    /// Shift the window by a SETTINGS_INITIAL_WINDOW_SIZE delta, which may
    /// be negative
    pub fn adjust(&mut self, delta: i32) -> Result<i32> {
        self.size = self.size.checked_add(delta).ok_or_else(|| {
            Error::FlowControl(format!(
                "Adjusting send window {} by {} overflows",
                self.size, delta
            ))
        })?;
        Ok(self.size)
    }
}

/// Inbound window.
///
/// Bytes the application has consumed are credited back to `size` right
/// away but only announced to the peer once `unacked` passes half of
/// `max_size`, so the window the peer sees is `size - unacked`.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    size: i32,
    max_size: i32,
    unacked: i32,
}

impl RecvWindow {
    /// Window that starts fully open at `max_size`
    pub fn new(max_size: i32) -> Self {
        Self::with_sizes(max_size, max_size)
    }

    /// Window whose advertised size starts below its target maximum
    pub fn with_sizes(size: i32, max_size: i32) -> Self {
        RecvWindow {
            size,
            max_size,
            unacked: 0,
        }
    }

    pub fn size(&self) -> i32 {
        self.size
    }

    pub fn max_size(&self) -> i32 {
        self.max_size
    }

    pub fn unacked(&self) -> i32 {
        self.unacked
    }

    /// Charge bytes received from the peer.
    ///
    /// Fails when the peer sent more than the window it was told about.
    pub fn decrease(&mut self, delta: i32) -> Result<i32> {
        if delta < 0 || delta > self.size - self.unacked {
            return Err(Error::FlowControl(format!(
                "delta_window_size is {} in DecreaseRecvWindowSize, which is larger than the receive window size of {}",
                delta,
                self.size - self.unacked
            )));
        }
        self.size -= delta;
        Ok(self.size)
    }

    /// Credit bytes that were consumed (or discarded).
    ///
    /// Returns the increment to announce in a WINDOW_UPDATE once enough
    /// credit has accumulated.
    pub fn increase(&mut self, delta: i32) -> Result<Option<i32>> {
        if delta < 1 {
            return Ok(None);
        }
        if delta > MAX_WINDOW_SIZE - self.size {
            return Err(Error::FlowControl(format!(
                "Receive window {} cannot grow by {}",
                self.size, delta
            )));
        }
        self.size += delta;
        self.unacked += delta;

        if self.unacked > self.max_size / 2 {
            let increment = self.unacked;
            self.unacked = 0;
            return Ok(Some(increment));
        }
        Ok(None)
    }

    /// Grow the window straight to `max_size`, returning the increment the
    /// caller must announce immediately
    pub fn open_to_max(&mut self) -> Option<i32> {
        let delta = self.max_size - self.size;
        if delta <= 0 {
            return None;
        }
        self.size = self.max_size;
        Some(delta)
    }
}
