//! HTTP/2 settings management
//!
//! SETTINGS parameters as defined in RFC 7540 Section 6.5. Both the settings
//! we advertise and the peer's values are kept as a [`Settings`] with every
//! parameter optional; an absent parameter means "protocol default".

use super::error::{Error, Result};
use std::fmt;

/// HTTP/2 settings parameters (RFC 7540 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,
    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,
    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,
}

impl SettingsParameter {
    /// Every recognized parameter, in identifier order
    pub const ALL: [SettingsParameter; 6] = [
        SettingsParameter::HeaderTableSize,
        SettingsParameter::EnablePush,
        SettingsParameter::MaxConcurrentStreams,
        SettingsParameter::InitialWindowSize,
        SettingsParameter::MaxFrameSize,
        SettingsParameter::MaxHeaderListSize,
    ];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// `None` for identifiers this endpoint does not understand
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            _ => None,
        }
    }

    /// Value in effect before any SETTINGS frame; `None` means unlimited
    pub fn protocol_default(self) -> Option<u32> {
        match self {
            SettingsParameter::HeaderTableSize => Some(4096),
            SettingsParameter::EnablePush => Some(1),
            SettingsParameter::MaxConcurrentStreams => None,
            SettingsParameter::InitialWindowSize => Some(65535),
            SettingsParameter::MaxFrameSize => Some(16384),
            SettingsParameter::MaxHeaderListSize => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Parse a SETTINGS payload. Unknown identifiers are ignored; a repeated
    /// identifier keeps the last value.
    pub fn parse(payload: &[u8]) -> Result<Settings> {
        if payload.len() % 6 != 0 {
            return Err(Error::FrameSize(format!(
                "SETTINGS payload length {} is not a multiple of 6",
                payload.len()
            )));
        }

        let mut settings = Settings::new();
        for chunk in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            if let Some(param) = SettingsParameter::from_u16(id) {
                settings.set(param, value)?;
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Set a parameter from its wire value
    pub fn set(&mut self, param: SettingsParameter, value: u32) -> Result<()> {
        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size = Some(value),
            SettingsParameter::EnablePush => {
                self.enable_push = match value {
                    0 => Some(false),
                    1 => Some(true),
                    _ => {
                        return Err(Error::Protocol(format!(
                            "SETTINGS_ENABLE_PUSH must be 0 or 1, got {}",
                            value
                        )))
                    }
                }
            }
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            SettingsParameter::InitialWindowSize => self.initial_window_size = Some(value),
            SettingsParameter::MaxFrameSize => self.max_frame_size = Some(value),
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size = Some(value),
        }
        Ok(())
    }

    /// Wire value of a parameter, if present
    pub fn get(&self, param: SettingsParameter) -> Option<u32> {
        match param {
            SettingsParameter::HeaderTableSize => self.header_table_size,
            SettingsParameter::EnablePush => self.enable_push.map(u32::from),
            SettingsParameter::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingsParameter::InitialWindowSize => self.initial_window_size,
            SettingsParameter::MaxFrameSize => self.max_frame_size,
            SettingsParameter::MaxHeaderListSize => self.max_header_list_size,
        }
    }

    /// Present parameters with their wire values, in identifier order
    pub fn iter(&self) -> impl Iterator<Item = (SettingsParameter, u32)> + '_ {
        SettingsParameter::ALL
            .into_iter()
            .filter_map(move |param| self.get(param).map(|value| (param, value)))
    }

    /// Only the parameters whose value differs from the protocol default
    pub fn without_defaults(&self) -> Settings {
        let mut out = Settings::new();
        for (param, value) in self.iter() {
            if param.protocol_default() != Some(value) {
                // Values came out of a valid Settings, so `set` cannot fail.
                let _ = out.set(param, value);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(4096)
    }

    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// None = unlimited
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(65535)
    }

    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(16384)
    }

    /// None = unlimited
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > 0x7FFFFFFF {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(16384..=16777215).contains(&max_frame_size) {
                return Err(Error::Protocol(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        for (param, value) in other.iter() {
            let _ = self.set(param, value);
        }
    }
}

/// Builder for HTTP/2 settings
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
