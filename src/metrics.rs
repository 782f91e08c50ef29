//! Metric helpers for `wirelink`.
//!
//! This module defines metric names and thin helpers wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! the helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::close::CloseCode;

/// Name of the gauge tracking connections with a running reader.
pub const CONNECTIONS_ACTIVE: &str = "wirelink_connections_active";
/// Name of the counter tracking processed packets.
pub const PACKETS_PROCESSED: &str = "wirelink_packets_processed_total";
/// Name of the counter tracking transferred bytes.
pub const BYTES_TRANSFERRED: &str = "wirelink_bytes_total";
/// Name of the counter tracking decode failures.
pub const DECODE_ERRORS: &str = "wirelink_decode_errors_total";
/// Name of the counter tracking connection closes by code.
pub const CONNECTIONS_CLOSED: &str = "wirelink_connections_closed_total";

/// Direction of packet processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Received from the peer.
    Inbound,
    /// Written to the peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "used by metrics only"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed packet of `bytes` wire bytes.
pub fn record_packet(direction: Direction, bytes: usize) {
    #[cfg(feature = "metrics")]
    {
        counter!(PACKETS_PROCESSED, "direction" => direction.as_str()).increment(1);
        counter!(BYTES_TRANSFERRED, "direction" => direction.as_str()).increment(bytes as u64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, bytes);
}

/// Record a decode failure.
pub fn inc_decode_errors() {
    #[cfg(feature = "metrics")]
    counter!(DECODE_ERRORS).increment(1);
}

/// Record a close with `code`.
pub fn record_close(code: CloseCode) {
    #[cfg(feature = "metrics")]
    counter!(CONNECTIONS_CLOSED, "code" => code.value().to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = code;
}
