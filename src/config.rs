//! Engine configuration.
//!
//! [`EngineConfig`] holds the knobs shared by servers and clients. It is a
//! plain struct with public fields and sensible defaults; the server and
//! client builders expose setters for the commonly tuned values.

use std::time::Duration;

/// Default size of a single socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;
/// Default heartbeat timeout.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default wait of [`Connection::send_sync`](crate::Connection::send_sync).
pub const DEFAULT_SYNC_SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default lifetime of a per-address decode error count.
pub const DEFAULT_DECODE_ERROR_WINDOW: Duration = Duration::from_secs(600);

/// Settings shared by every connection of a server or client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Name used in log records.
    pub name: String,
    /// Size of a single socket read; also bounds the slow-attack threshold.
    pub read_buffer_size: usize,
    /// Idle time after which the heartbeat check fires. Zero disables it.
    pub heartbeat_timeout: Duration,
    /// Close connections whose peers trickle bytes too slowly.
    pub check_attacks: bool,
    /// Connections are expected to carry a single exchange; no reconnects.
    pub short_connection: bool,
    /// Wait limit of blocking sends.
    pub sync_send_timeout: Duration,
    /// Decode errors tolerated per peer address before it is blacklisted.
    /// Zero disables the blacklist.
    pub max_decode_errors_per_ip: u32,
    /// Time after the first counted error at which a per-address count
    /// expires.
    pub decode_error_window: Duration,
    /// Maintain per-connection and engine-wide statistics.
    pub stat_on: bool,
    /// Pause between retries when a file transfer write accepts no bytes.
    pub write_backoff: BackoffConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "wirelink".to_owned(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            check_attacks: true,
            short_connection: false,
            sync_send_timeout: DEFAULT_SYNC_SEND_TIMEOUT,
            max_decode_errors_per_ip: 0,
            decode_error_window: DEFAULT_DECODE_ERROR_WINDOW,
            stat_on: true,
            write_backoff: BackoffConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp values to workable bounds.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.read_buffer_size = self.read_buffer_size.max(64);
        self.write_backoff = self.write_backoff.normalized();
        self
    }

    /// Threshold used by the slow-attack heuristic: a peer averaging fewer
    /// readable bytes per failed decode than this is treated as an attack.
    #[must_use]
    pub fn slow_attack_threshold(&self) -> usize { (self.read_buffer_size / 2).min(256) }
}

/// Configuration for exponential back-off timing.
///
/// Used by the server accept loop when `accept()` fails and by file
/// transfers when the socket accepts zero bytes. The delay starts at
/// `initial_delay` and doubles on each retry, capped at `max_delay`.
///
/// # Default Values
/// - `initial_delay`: 10 milliseconds
/// - `max_delay`: 1 second
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay used for the first retry.
    pub initial_delay: Duration,
    /// Maximum delay once retries have increased exponentially.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to at least one millisecond and ensure
    /// `initial_delay <= max_delay`.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use wirelink::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::ZERO,
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delay following `current`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration { (current * 2).min(self.max_delay) }
}

/// Client reconnection policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Wait between a close (or failed attempt) and the next attempt.
    pub interval: Duration,
    /// Attempts before the connection is removed; zero retries forever.
    pub retry_count: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            retry_count: 0,
        }
    }
}

impl ReconnectConfig {
    /// Create a policy retrying every `interval`, at most `retry_count` times.
    #[must_use]
    pub fn new(interval: Duration, retry_count: u32) -> Self {
        Self {
            interval,
            retry_count,
        }
    }

    /// Whether a connection that already made `attempts` attempts may try
    /// again.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        !self.interval.is_zero() && (self.retry_count == 0 || attempts < self.retry_count)
    }
}

/// Setters shared by [`crate::ServerBuilder`] and [`crate::ClientBuilder`].
///
/// Expands inside an `impl` block of a builder with `config`, `listener` and
/// `registry` fields.
macro_rules! engine_builder_setters {
    () => {
        /// Replace the whole engine configuration.
        #[must_use]
        pub fn config(mut self, config: $crate::config::EngineConfig) -> Self {
            self.config = config;
            self
        }

        /// Name used in log records.
        #[must_use]
        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.config.name = name.into();
            self
        }

        /// Size of a single socket read.
        #[must_use]
        pub fn read_buffer_size(mut self, size: usize) -> Self {
            self.config.read_buffer_size = size;
            self
        }

        /// Idle time after which the heartbeat check fires. Zero disables it.
        #[must_use]
        pub fn heartbeat_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.config.heartbeat_timeout = timeout;
            self
        }

        /// Enable or disable slow-attack detection.
        #[must_use]
        pub fn check_attacks(mut self, enabled: bool) -> Self {
            self.config.check_attacks = enabled;
            self
        }

        /// Treat connections as single exchanges that are never reconnected.
        #[must_use]
        pub fn short_connection(mut self, enabled: bool) -> Self {
            self.config.short_connection = enabled;
            self
        }

        /// Wait limit of blocking sends.
        #[must_use]
        pub fn sync_send_timeout(mut self, timeout: std::time::Duration) -> Self {
            self.config.sync_send_timeout = timeout;
            self
        }

        /// Decode errors tolerated per peer address before it is
        /// blacklisted. Zero disables the blacklist.
        #[must_use]
        pub fn max_decode_errors_per_ip(mut self, max: u32) -> Self {
            self.config.max_decode_errors_per_ip = max;
            self
        }

        /// Time after which a per-address decode error count expires.
        #[must_use]
        pub fn decode_error_window(mut self, window: std::time::Duration) -> Self {
            self.config.decode_error_window = window;
            self
        }

        /// Enable or disable statistics.
        #[must_use]
        pub fn stat_on(mut self, enabled: bool) -> Self {
            self.config.stat_on = enabled;
            self
        }

        /// Install a lifecycle observer.
        #[must_use]
        pub fn listener<L>(mut self, listener: L) -> Self
        where
            L: $crate::hooks::ConnectionListener<P>,
        {
            self.listener = std::sync::Arc::new(listener);
            self
        }

        /// Share a registry with other servers or clients.
        #[must_use]
        pub fn registry(
            mut self,
            registry: std::sync::Arc<$crate::registry::ConnectionRegistry<P>>,
        ) -> Self {
            self.registry = registry;
            self
        }
    };
}

pub(crate) use engine_builder_setters;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(8192, 256)]
    #[case(300, 150)]
    #[case(64, 32)]
    fn slow_attack_threshold_is_capped(#[case] read_buffer_size: usize, #[case] expected: usize) {
        let cfg = EngineConfig {
            read_buffer_size,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.slow_attack_threshold(), expected);
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.read_buffer_size, 8192);
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(120));
        assert_eq!(cfg.sync_send_timeout, Duration::from_secs(10));
        assert_eq!(cfg.decode_error_window, Duration::from_secs(600));
        assert!(cfg.check_attacks);
        assert!(!cfg.short_connection);
    }

    #[rstest]
    #[case(0, 0, true)]
    #[case(3, 2, true)]
    #[case(3, 3, false)]
    fn reconnect_retry_ceiling(#[case] retry_count: u32, #[case] attempts: u32, #[case] allowed: bool) {
        let cfg = ReconnectConfig::new(Duration::from_millis(10), retry_count);
        assert_eq!(cfg.allows(attempts), allowed);
    }

    #[test]
    fn zero_interval_disables_reconnect() {
        assert!(!ReconnectConfig::new(Duration::ZERO, 0).allows(0));
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.next_delay(Duration::from_millis(10)), Duration::from_millis(20));
        assert_eq!(cfg.next_delay(Duration::from_millis(900)), Duration::from_secs(1));
    }
}
