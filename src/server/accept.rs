//! Accept loop.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::sync::CancellationToken;

use crate::{config::BackoffConfig, connection::Connection, engine::Engine, packet::Packet};

/// Source of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

/// Accept connections until `shutdown` is cancelled.
///
/// Accept failures back off exponentially between `backoff.initial_delay`
/// and `backoff.max_delay`; a successful accept resets the delay. Peers on
/// the blacklist are dropped before a connection is created.
pub(in crate::server) async fn accept_loop<L, P>(
    listener: Arc<L>,
    engine: Arc<Engine<P>>,
    shutdown: CancellationToken,
    backoff: BackoffConfig,
) where
    L: AcceptListener + 'static,
    P: Packet,
{
    let backoff = backoff.normalized();
    let mut delay = backoff.initial_delay;
    while let Some(next) = accept_iteration(&*listener, &engine, &shutdown, &backoff, delay).await {
        delay = next;
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<L, P>(
    listener: &L,
    engine: &Arc<Engine<P>>,
    shutdown: &CancellationToken,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    L: AcceptListener,
    P: Packet,
{
    select! {
        biased;

        () = shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok((stream, peer)) => {
                start_connection(engine, stream, peer).await;
                backoff.initial_delay
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                warn!("accept error: error={e:?}, local_addr={local_addr:?}");
                sleep(delay).await;
                backoff.next_delay(delay)
            }
        }),
    }
}

async fn start_connection<P: Packet>(engine: &Arc<Engine<P>>, stream: TcpStream, peer: SocketAddr) {
    if engine.ip_guard.is_blacklisted(peer.ip()) {
        debug!("refusing blacklisted peer: peer={peer}");
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: peer={peer}, error={e}");
    }
    let local = stream.local_addr().ok();
    let conn = Connection::new(engine, None);
    match conn.activate(stream, Some(peer), local, false).await {
        Ok(()) => debug!("connection accepted: id={}, peer={peer}", conn.id()),
        Err(e) => warn!("failed to start connection: peer={peer}, error={e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr, sync::Arc};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::{
        net::TcpStream,
        task::yield_now,
        time::{Duration, Instant, advance},
    };
    use tokio_util::{sync::CancellationToken, task::TaskTracker};

    use super::{AcceptListener, accept_loop};
    use crate::{
        codec::LineCodec,
        config::BackoffConfig,
        connection::Role,
        engine::test_engine,
    };

    /// Fails the first `failures` accepts, then never yields a connection.
    struct FailingListener {
        calls: Mutex<Vec<Instant>>,
        failures: usize,
    }

    #[async_trait]
    impl AcceptListener for FailingListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            let attempt = {
                let mut calls = self.calls.lock();
                calls.push(Instant::now());
                calls.len()
            };
            if attempt <= self.failures {
                return Err(io::Error::other("injected accept failure"));
            }
            std::future::pending().await
        }

        fn local_addr(&self) -> io::Result<SocketAddr> { Ok(SocketAddr::from(([127, 0, 0, 1], 0))) }
    }

    #[tokio::test(start_paused = true)]
    async fn accept_failures_back_off_exponentially() {
        let listener = Arc::new(FailingListener {
            calls: Mutex::new(Vec::new()),
            failures: 3,
        });
        let engine = test_engine(LineCodec::default(), Role::Server);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(8),
        };
        tracker.spawn(accept_loop(
            Arc::clone(&listener),
            engine,
            token.clone(),
            backoff,
        ));

        yield_now().await;
        for ms in [5, 8, 8] {
            advance(Duration::from_millis(ms)).await;
            yield_now().await;
        }
        token.cancel();
        tracker.close();
        tracker.wait().await;

        let calls = listener.calls.lock();
        assert_eq!(calls.len(), 4);
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(8),
                Duration::from_millis(8),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_loop_exits_promptly() {
        let listener = Arc::new(FailingListener {
            calls: Mutex::new(Vec::new()),
            failures: 0,
        });
        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            accept_loop(
                listener,
                test_engine(LineCodec::default(), Role::Server),
                token,
                BackoffConfig::default(),
            ),
        )
        .await
        .expect("accept loop must stop once cancelled");
    }
}
