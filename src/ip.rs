//! Per-address decode error accounting and the address blacklist.

use std::{net::IpAddr, time::Duration};

use dashmap::{DashMap, DashSet};
use log::{debug, warn};
use tokio::time::Instant;

/// Decode errors counted for one address since `since`.
#[derive(Clone, Copy, Debug)]
struct ErrorCount {
    count: u32,
    since: Instant,
}

/// Tracks decode errors per peer address and the blacklist they feed.
///
/// A count expires `window` after its first error; expired counts are
/// dropped whenever a new error is recorded.
#[derive(Debug)]
pub struct IpGuard {
    max_decode_errors: u32,
    window: Duration,
    decode_errors: DashMap<IpAddr, ErrorCount>,
    blacklist: DashSet<IpAddr>,
}

impl IpGuard {
    /// Blacklist an address once it exceeds `max_decode_errors` decode
    /// errors within `window`. Zero never blacklists automatically.
    #[must_use]
    pub fn new(max_decode_errors: u32, window: Duration) -> Self {
        Self {
            max_decode_errors,
            window,
            decode_errors: DashMap::new(),
            blacklist: DashSet::new(),
        }
    }

    /// Whether connections from `ip` are refused.
    #[must_use]
    pub fn is_blacklisted(&self, ip: IpAddr) -> bool { self.blacklist.contains(&ip) }

    /// Refuse connections from `ip`. Returns `false` if it was already
    /// blacklisted.
    pub fn add(&self, ip: IpAddr) -> bool { self.blacklist.insert(ip) }

    /// Accept connections from `ip` again and forget its error count.
    pub fn remove(&self, ip: IpAddr) {
        self.blacklist.remove(&ip);
        self.decode_errors.remove(&ip);
    }

    /// Empty the blacklist and forget every error count.
    pub fn clear(&self) {
        self.blacklist.clear();
        self.decode_errors.clear();
    }

    /// Every blacklisted address.
    #[must_use]
    pub fn all(&self) -> Vec<IpAddr> { self.blacklist.iter().map(|ip| *ip).collect() }

    /// Unexpired decode errors recorded for `ip`.
    #[must_use]
    pub fn decode_errors(&self, ip: IpAddr) -> u32 {
        let now = Instant::now();
        self.decode_errors
            .get(&ip)
            .filter(|entry| !self.expired(entry, now))
            .map_or(0, |entry| entry.count)
    }

    /// Number of addresses with a live error count.
    #[must_use]
    pub fn tracked(&self) -> usize { self.decode_errors.len() }

    fn expired(&self, entry: &ErrorCount, now: Instant) -> bool {
        now.saturating_duration_since(entry.since) >= self.window
    }

    /// Drop every expired count.
    fn prune(&self, now: Instant) {
        let before = self.decode_errors.len();
        self.decode_errors.retain(|_, entry| !self.expired(entry, now));
        let dropped = before.saturating_sub(self.decode_errors.len());
        if dropped > 0 {
            debug!("expired decode error counts: dropped={dropped}");
        }
    }

    /// Count a decode error. Returns `true` when this error pushed the
    /// address onto the blacklist.
    pub(crate) fn record_decode_error(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        self.prune(now);
        let count = {
            let mut entry = self.decode_errors.entry(ip).or_insert(ErrorCount {
                count: 0,
                since: now,
            });
            entry.count = entry.count.saturating_add(1);
            entry.count
        };
        if self.max_decode_errors == 0 || count <= self.max_decode_errors {
            return false;
        }
        let added = self.add(ip);
        if added {
            warn!("address blacklisted: ip={ip}, decode_errors={count}");
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::time::{Duration, advance};

    use super::IpGuard;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    const OTHER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 8));
    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn blacklists_after_threshold_is_exceeded() {
        let guard = IpGuard::new(2, WINDOW);
        assert!(!guard.record_decode_error(PEER));
        assert!(!guard.record_decode_error(PEER));
        assert!(guard.record_decode_error(PEER));
        assert!(!guard.record_decode_error(PEER));
        assert!(guard.is_blacklisted(PEER));
        assert_eq!(guard.decode_errors(PEER), 4);
    }

    #[test]
    fn zero_threshold_only_counts() {
        let guard = IpGuard::new(0, WINDOW);
        for _ in 0..100 {
            assert!(!guard.record_decode_error(PEER));
        }
        assert!(!guard.is_blacklisted(PEER));
    }

    #[test]
    fn removal_resets_counters() {
        let guard = IpGuard::new(1, WINDOW);
        guard.record_decode_error(PEER);
        guard.record_decode_error(PEER);
        guard.remove(PEER);
        assert!(!guard.is_blacklisted(PEER));
        assert_eq!(guard.decode_errors(PEER), 0);
        assert!(guard.all().is_empty());
    }

    #[test]
    fn clear_forgets_counts() {
        let guard = IpGuard::new(1, WINDOW);
        guard.record_decode_error(PEER);
        guard.record_decode_error(OTHER);
        guard.clear();
        assert_eq!(guard.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_expire_after_the_window() {
        let guard = IpGuard::new(2, WINDOW);
        guard.record_decode_error(PEER);
        guard.record_decode_error(PEER);
        advance(WINDOW).await;
        assert_eq!(guard.decode_errors(PEER), 0);

        assert!(!guard.record_decode_error(OTHER));
        assert_eq!(guard.tracked(), 1);
        assert!(!guard.record_decode_error(PEER));
        assert!(!guard.is_blacklisted(PEER));
        assert_eq!(guard.decode_errors(PEER), 1);
    }
}
