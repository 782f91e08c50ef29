//! Idle connection detection.

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    close::{CloseCode, CloseRequest},
    connection::Connection,
    engine::Engine,
    hooks::guarded,
    packet::Packet,
};

const MIN_SCAN_PERIOD: Duration = Duration::from_millis(10);

/// Period between two scans for a base timeout.
pub(in crate::server) fn scan_period(timeout: Duration) -> Duration {
    (timeout / 2).max(MIN_SCAN_PERIOD)
}

/// Periodically close connections idle for longer than their timeout.
///
/// Returns immediately when the configured timeout is zero.
#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
pub(in crate::server) async fn run<P: Packet>(engine: Arc<Engine<P>>, shutdown: CancellationToken) {
    let base = engine.config.heartbeat_timeout;
    if base.is_zero() {
        debug!("heartbeat check disabled: name={}", engine.config.name);
        return;
    }
    let mut ticker = interval(scan_period(base));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => break,
            _ = ticker.tick() => scan(&engine, base),
        }
    }
}

fn scan<P: Packet>(engine: &Engine<P>, base: Duration) {
    for conn in engine.registry.connected() {
        if conn.is_active() {
            check(&conn, base);
        }
    }
}

fn check<P: Packet>(conn: &Connection<P>, base: Duration) {
    let timeout = conn.heartbeat_timeout().unwrap_or(base);
    if timeout.is_zero() {
        return;
    }
    let idle = conn.stats().idle_time();
    if idle <= timeout {
        return;
    }
    let count = conn.stats().record_heartbeat_timeout();
    let listener = &conn.engine().listener;
    let keep = guarded("on_heartbeat_timeout", conn.id(), || {
        listener.on_heartbeat_timeout(conn, idle, count)
    })
    .unwrap_or(false);
    if keep {
        debug!(
            "heartbeat timeout ignored by listener: id={}, idle={idle:?}, count={count}",
            conn.id()
        );
        return;
    }
    info!(
        "heartbeat timeout: id={}, idle={idle:?}, timeout={timeout:?}",
        conn.id()
    );
    conn.close_with_request(
        CloseRequest::new(format!("no traffic for {idle:?}"))
            .code(CloseCode::HeartbeatTimeout)
            .force_remove(),
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::scan_period;

    #[rstest]
    #[case(Duration::from_secs(120), Duration::from_secs(60))]
    #[case(Duration::from_millis(100), Duration::from_millis(50))]
    #[case(Duration::from_millis(4), Duration::from_millis(10))]
    fn scan_period_is_half_the_timeout(#[case] timeout: Duration, #[case] expected: Duration) {
        assert_eq!(scan_period(timeout), expected);
    }
}
