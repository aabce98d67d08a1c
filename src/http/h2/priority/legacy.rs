//! Compatibility layer between request priorities and HTTP/2 weights.
//!
//! Priorities are first collapsed to the eight SPDY/3 levels (0 highest,
//! 7 lowest) and then spread over the 1..=256 HTTP/2 weight range. The
//! dependency tree only ever sees SPDY levels.

use super::RequestPriority;

/// SPDY/3 priority level: 0 is the most urgent, 7 the least
pub type SpdyPriority = u8;

pub const HIGHEST_SPDY_PRIORITY: SpdyPriority = 0;
pub const LOWEST_SPDY_PRIORITY: SpdyPriority = 7;

/// Number of SPDY/3 priority levels
pub const NUM_SPDY_PRIORITIES: usize = 8;

/// Map a request priority to a SPDY/3 level
pub fn to_spdy_priority(priority: RequestPriority) -> SpdyPriority {
    RequestPriority::Highest as u8 - priority as u8
}

/// Map a SPDY/3 level back to a request priority
pub fn from_spdy_priority(priority: SpdyPriority) -> RequestPriority {
    let level = (RequestPriority::Highest as u8).saturating_sub(priority);
    RequestPriority::from_u8(level).unwrap_or(RequestPriority::Throttled)
}

/// HTTP/2 weight for a SPDY/3 level
pub fn spdy_priority_to_weight(priority: SpdyPriority) -> u16 {
    let priority = priority.min(LOWEST_SPDY_PRIORITY);
    let steps = 255.9f64 / 7.0;
    (steps * (7 - priority) as f64) as u16 + 1
}

/// SPDY/3 level for an HTTP/2 weight
pub fn weight_to_spdy_priority(weight: u16) -> SpdyPriority {
    let weight = weight.clamp(1, 256);
    let steps = 255.9f64 / 7.0;
    (7.0 - (weight - 1) as f64 / steps) as SpdyPriority
}

/// HTTP/2 weight for a request priority
pub fn weight_for(priority: RequestPriority) -> u16 {
    spdy_priority_to_weight(to_spdy_priority(priority))
}
