//! Per-connection and engine-wide statistics.
//!
//! Counters are plain atomics updated with relaxed ordering; timestamps are
//! stored as milliseconds since the owning object was created so that they
//! fit in an atomic as well.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::Instant;

const UNSET: u64 = u64::MAX;

fn millis(d: Duration) -> u64 { u64::try_from(d.as_millis()).unwrap_or(UNSET - 1) }

/// A timestamp relative to a fixed origin, stored atomically.
#[derive(Debug)]
struct Stamp(AtomicU64);

impl Stamp {
    fn new(initial: u64) -> Self { Self(AtomicU64::new(initial)) }

    fn mark(&self, origin: Instant) { self.0.store(millis(origin.elapsed()), Ordering::Relaxed); }

    fn get(&self, origin: Instant) -> Option<Instant> {
        match self.0.load(Ordering::Relaxed) {
            UNSET => None,
            ms => Some(origin + Duration::from_millis(ms)),
        }
    }
}

/// Traffic counters and activity timestamps of one connection.
#[derive(Debug)]
pub struct ConnectionStats {
    created: Instant,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    received_tcps: AtomicU64,
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    handled_packets: AtomicU64,
    handled_bytes: AtomicU64,
    handled_cost_ms: AtomicU64,
    heartbeat_timeouts: AtomicU64,
    last_received_byte: Stamp,
    last_received_packet: Stamp,
    last_sent_byte: Stamp,
    last_sent_packet: Stamp,
    first_connected: Stamp,
    closed: Stamp,
}

impl Default for ConnectionStats {
    fn default() -> Self { Self::new() }
}

impl ConnectionStats {
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            received_bytes: AtomicU64::new(0),
            received_packets: AtomicU64::new(0),
            received_tcps: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            sent_packets: AtomicU64::new(0),
            handled_packets: AtomicU64::new(0),
            handled_bytes: AtomicU64::new(0),
            handled_cost_ms: AtomicU64::new(0),
            heartbeat_timeouts: AtomicU64::new(0),
            last_received_byte: Stamp::new(0),
            last_received_packet: Stamp::new(0),
            last_sent_byte: Stamp::new(0),
            last_sent_packet: Stamp::new(0),
            first_connected: Stamp::new(UNSET),
            closed: Stamp::new(UNSET),
        }
    }

    pub(crate) fn record_received_bytes(&self, n: usize) {
        self.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
        self.received_tcps.fetch_add(1, Ordering::Relaxed);
        self.last_received_byte.mark(self.created);
    }

    pub(crate) fn record_received_packet(&self) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
        self.last_received_packet.mark(self.created);
    }

    pub(crate) fn record_sent_bytes(&self) { self.last_sent_byte.mark(self.created); }

    pub(crate) fn record_sent_packet(&self, bytes: usize, success: bool) {
        self.last_sent_packet.mark(self.created);
        if success {
            self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
            self.sent_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_handled(&self, bytes: usize, cost: Duration) {
        self.handled_packets.fetch_add(1, Ordering::Relaxed);
        self.handled_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.handled_cost_ms.fetch_add(millis(cost), Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_timeout(&self) -> u64 {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn mark_connected(&self) {
        let _ = self.first_connected.0.compare_exchange(
            UNSET,
            millis(self.created.elapsed()),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.last_received_byte.mark(self.created);
        self.last_sent_packet.mark(self.created);
    }

    pub(crate) fn mark_closed(&self) { self.closed.mark(self.created); }

    /// When the connection object was created.
    #[must_use]
    pub fn time_created(&self) -> Instant { self.created }

    /// When the connection first became connected.
    #[must_use]
    pub fn time_first_connected(&self) -> Option<Instant> { self.first_connected.get(self.created) }

    /// When the connection was last closed.
    #[must_use]
    pub fn time_closed(&self) -> Option<Instant> { self.closed.get(self.created) }

    /// When bytes were last read from the socket.
    #[must_use]
    pub fn last_received_byte(&self) -> Instant {
        self.last_received_byte.get(self.created).unwrap_or(self.created)
    }

    /// When a packet was last decoded.
    #[must_use]
    pub fn last_received_packet(&self) -> Instant {
        self.last_received_packet.get(self.created).unwrap_or(self.created)
    }

    /// When bytes were last written to the socket.
    #[must_use]
    pub fn last_sent_byte(&self) -> Instant {
        self.last_sent_byte.get(self.created).unwrap_or(self.created)
    }

    /// When an outbound message last completed.
    #[must_use]
    pub fn last_sent_packet(&self) -> Instant {
        self.last_sent_packet.get(self.created).unwrap_or(self.created)
    }

    /// Time since the last inbound byte or outbound packet.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_received_byte()
            .max(self.last_sent_packet())
            .elapsed()
    }

    /// Total bytes read.
    #[must_use]
    pub fn received_bytes(&self) -> u64 { self.received_bytes.load(Ordering::Relaxed) }

    /// Total packets decoded.
    #[must_use]
    pub fn received_packets(&self) -> u64 { self.received_packets.load(Ordering::Relaxed) }

    /// Number of socket reads that returned data.
    #[must_use]
    pub fn received_tcps(&self) -> u64 { self.received_tcps.load(Ordering::Relaxed) }

    /// Bytes of successfully written messages.
    #[must_use]
    pub fn sent_bytes(&self) -> u64 { self.sent_bytes.load(Ordering::Relaxed) }

    /// Successfully written messages.
    #[must_use]
    pub fn sent_packets(&self) -> u64 { self.sent_packets.load(Ordering::Relaxed) }

    /// Packets passed to the handler.
    #[must_use]
    pub fn handled_packets(&self) -> u64 { self.handled_packets.load(Ordering::Relaxed) }

    /// Wire bytes of packets passed to the handler.
    #[must_use]
    pub fn handled_bytes(&self) -> u64 { self.handled_bytes.load(Ordering::Relaxed) }

    /// Accumulated handler time.
    #[must_use]
    pub fn handled_cost(&self) -> Duration {
        Duration::from_millis(self.handled_cost_ms.load(Ordering::Relaxed))
    }

    /// Consecutive heartbeat timeouts observed.
    #[must_use]
    pub fn heartbeat_timeouts(&self) -> u64 { self.heartbeat_timeouts.load(Ordering::Relaxed) }
}

/// Engine-wide counters shared by every connection of a server or client.
#[derive(Debug, Default)]
pub struct GroupStat {
    accepted: AtomicU64,
    active: AtomicU64,
    closed: AtomicU64,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    handled_packets: AtomicU64,
    decode_errors: AtomicU64,
}

impl GroupStat {
    pub(crate) fn record_accepted(&self) { self.accepted.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_closed(&self) { self.closed.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_received_bytes(&self, n: usize) {
        self.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received_packet(&self) {
        self.received_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) { self.handled_packets.fetch_add(1, Ordering::Relaxed); }

    pub(crate) fn record_decode_error(&self) { self.decode_errors.fetch_add(1, Ordering::Relaxed); }

    /// Connections accepted by a server or established by a client.
    #[must_use]
    pub fn accepted(&self) -> u64 { self.accepted.load(Ordering::Relaxed) }

    /// Connections whose reader is currently running.
    #[must_use]
    pub fn active(&self) -> u64 { self.active.load(Ordering::Relaxed) }

    /// Closes performed.
    #[must_use]
    pub fn closed(&self) -> u64 { self.closed.load(Ordering::Relaxed) }

    /// Total bytes read.
    #[must_use]
    pub fn received_bytes(&self) -> u64 { self.received_bytes.load(Ordering::Relaxed) }

    /// Total packets decoded.
    #[must_use]
    pub fn received_packets(&self) -> u64 { self.received_packets.load(Ordering::Relaxed) }

    /// Bytes of successfully written messages.
    #[must_use]
    pub fn sent_bytes(&self) -> u64 { self.sent_bytes.load(Ordering::Relaxed) }

    /// Successfully written messages.
    #[must_use]
    pub fn sent_packets(&self) -> u64 { self.sent_packets.load(Ordering::Relaxed) }

    /// Packets passed to handlers.
    #[must_use]
    pub fn handled_packets(&self) -> u64 { self.handled_packets.load(Ordering::Relaxed) }

    /// Decode failures.
    #[must_use]
    pub fn decode_errors(&self) -> u64 { self.decode_errors.load(Ordering::Relaxed) }
}

/// RAII guard counting a running reader in [`GroupStat::active`] and the
/// active connections gauge.
pub(crate) struct ActiveConnection<'a>(&'a GroupStat);

impl<'a> ActiveConnection<'a> {
    pub(crate) fn new(stat: &'a GroupStat) -> Self {
        stat.active.fetch_add(1, Ordering::Relaxed);
        crate::metrics::inc_connections();
        Self(stat)
    }
}

impl Drop for ActiveConnection<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::dec_connections();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ActiveConnection, ConnectionStats, GroupStat};

    #[test]
    fn active_guard_tracks_running_readers() {
        let stat = GroupStat::default();
        {
            let _a = ActiveConnection::new(&stat);
            let _b = ActiveConnection::new(&stat);
            assert_eq!(stat.active(), 2);
        }
        assert_eq!(stat.active(), 0);
    }

    #[test]
    fn failed_sends_do_not_count_bytes() {
        let stats = ConnectionStats::new();
        stats.record_sent_packet(10, true);
        stats.record_sent_packet(99, false);
        assert_eq!(stats.sent_bytes(), 10);
        assert_eq!(stats.sent_packets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_uses_latest_activity() {
        let stats = ConnectionStats::new();
        stats.mark_connected();
        tokio::time::advance(Duration::from_secs(5)).await;
        stats.record_received_bytes(4);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(stats.idle_time(), Duration::from_secs(2));
        assert!(stats.time_first_connected().is_some());
        assert!(stats.time_closed().is_none());
    }
}
