//! Session configuration

use super::error::{Error, Result};
use super::settings::{Settings, SettingsParameter};
use std::time::Duration;

/// Session tuning knobs.
///
/// The defaults are what a browser-grade client uses; tests usually shrink
/// the windows and timers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Accept PUSH_PROMISE frames
    pub enable_push: bool,
    /// Stream limit assumed until the peer's SETTINGS arrive
    pub initial_max_concurrent_streams: u32,
    /// Upper bound applied to the peer's MAX_CONCURRENT_STREAMS
    pub max_concurrent_stream_limit: u32,
    /// Open pushed streams allowed at once
    pub max_concurrent_pushed_streams: usize,
    pub session_max_recv_window_size: i32,
    pub stream_max_recv_window_size: i32,
    pub header_table_size: u32,
    pub max_header_list_size: u32,
    pub enable_ping_based_connection_checking: bool,
    /// Idle time after which a PING precedes the next DATA frame
    pub connection_at_risk_of_loss_time: Duration,
    /// How long to wait for any read activity once a PING is out
    pub hung_interval: Duration,
    /// Unclaimed pushes younger than this survive the expiry sweep
    pub min_pushed_stream_lifetime: Duration,
    pub read_buffer_size: usize,
    /// The read loop yields after this many bytes in one turn
    pub yield_after_bytes_read: usize,
    /// ... or after this much time in one turn
    pub yield_after_duration: Duration,
    /// The connection goes through a proxy allowed to push any origin
    pub trusted_proxy: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            enable_push: true,
            initial_max_concurrent_streams: 100,
            max_concurrent_stream_limit: 256,
            max_concurrent_pushed_streams: 1000,
            session_max_recv_window_size: 15 * 1024 * 1024,
            stream_max_recv_window_size: 6 * 1024 * 1024,
            header_table_size: 64 * 1024,
            max_header_list_size: 256 * 1024,
            enable_ping_based_connection_checking: true,
            connection_at_risk_of_loss_time: Duration::from_secs(10),
            hung_interval: Duration::from_secs(10),
            min_pushed_stream_lifetime: Duration::from_secs(300),
            read_buffer_size: 8 * 1024,
            yield_after_bytes_read: 32 * 1024,
            yield_after_duration: Duration::from_millis(20),
            trusted_proxy: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_max_recv_window_size < 65535 {
            return Err(Error::InvalidSettings(format!(
                "session receive window {} is below the protocol default",
                self.session_max_recv_window_size
            )));
        }
        if self.stream_max_recv_window_size < 1 {
            return Err(Error::InvalidSettings(format!(
                "stream receive window {} must be positive",
                self.stream_max_recv_window_size
            )));
        }
        if self.read_buffer_size == 0 || self.yield_after_bytes_read == 0 {
            return Err(Error::InvalidSettings("read buffer sizes must be non-zero".to_string()));
        }
        if self.initial_max_concurrent_streams == 0 || self.max_concurrent_stream_limit == 0 {
            return Err(Error::InvalidSettings("stream limits must be non-zero".to_string()));
        }
        Ok(())
    }

    /// SETTINGS for the connection preface, protocol defaults left out
    pub fn initial_settings(&self) -> Settings {
        let mut settings = Settings::new();
        let values = [
            (SettingsParameter::HeaderTableSize, self.header_table_size),
            (SettingsParameter::EnablePush, u32::from(self.enable_push)),
            (
                SettingsParameter::InitialWindowSize,
                self.stream_max_recv_window_size as u32,
            ),
            (SettingsParameter::MaxHeaderListSize, self.max_header_list_size),
        ];
        for (param, value) in values {
            // Every value here passed validate(); set() cannot reject it
            let _ = settings.set(param, value);
        }
        settings.without_defaults()
    }
}
