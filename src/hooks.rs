//! Application callbacks.
//!
//! [`PacketHandler`] receives every decoded packet that is not a correlated
//! response. [`ConnectionListener`] observes the connection lifecycle; all of
//! its methods default to no-ops so implementations only override what they
//! need. Panics raised by either are caught and logged; they never unwind
//! into the engine.

use std::{
    any::Any,
    error::Error,
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Duration,
};

use async_trait::async_trait;
use log::error;

use crate::{
    connection::{Connection, ConnectionId},
    packet::{Outbound, Packet},
};

/// Error type returned by packet handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Application code invoked for each decoded packet.
///
/// Handlers run on the connection's reader task: the next read is issued
/// only after `handle` returns, which keeps packets of one connection
/// strictly ordered. Errors are logged and leave the connection open.
#[async_trait]
pub trait PacketHandler<P: Packet>: Send + Sync + 'static {
    /// Handle one packet received on `conn`.
    async fn handle(&self, packet: &P, conn: &Connection<P>) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`PacketHandler`].
///
/// The closure receives a clone of the packet and the connection handle.
///
/// ```
/// use wirelink::{
///     Connection,
///     Frame,
///     hooks::{FnHandler, HandlerError},
/// };
///
/// let echo = FnHandler::new(|frame: Frame, conn: Connection<Frame>| async move {
///     conn.send(frame);
///     Ok::<_, HandlerError>(())
/// });
/// # let _ = echo;
/// ```
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self { Self(f) }
}

#[async_trait]
impl<P, F, Fut> PacketHandler<P> for FnHandler<F>
where
    P: Packet + Clone,
    F: Fn(P, Connection<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, packet: &P, conn: &Connection<P>) -> Result<(), HandlerError> {
        (self.0)(packet.clone(), conn.clone()).await
    }
}

/// Lifecycle observer.
pub trait ConnectionListener<P: Packet>: Send + Sync + 'static {
    /// A connect attempt finished or a server connection was accepted.
    ///
    /// For TLS connections this fires once the handshake completes.
    fn on_after_connected(&self, _conn: &Connection<P>, _connected: bool, _is_reconnect: bool) {}

    /// Bytes were read from the socket.
    fn on_after_received_bytes(&self, _conn: &Connection<P>, _received: usize) {}

    /// A packet of `packet_size` wire bytes was decoded.
    fn on_after_decoded(&self, _conn: &Connection<P>, _packet: &P, _packet_size: usize) {}

    /// The handler finished with `packet`.
    fn on_after_handled(&self, _conn: &Connection<P>, _packet: &P, _cost: Duration) {}

    /// An outbound message was written, or failed to be.
    fn on_after_sent(&self, _conn: &Connection<P>, _outbound: &Outbound<P>, _success: bool) {}

    /// The connection is about to be torn down.
    ///
    /// Runs before the connection leaves the registries.
    fn on_before_close(
        &self,
        _conn: &Connection<P>,
        _cause: Option<&str>,
        _remark: &str,
        _need_remove: bool,
    ) {
    }

    /// No traffic was seen for `idle`. Return `true` to keep the connection.
    fn on_heartbeat_timeout(&self, _conn: &Connection<P>, _idle: Duration, _count: u64) -> bool {
        false
    }
}

/// Listener that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl<P: Packet> ConnectionListener<P> for NoopListener {}

/// Formats a panic payload for logging.
pub(crate) struct PanicMessage<'a>(pub(crate) &'a (dyn Any + Send));

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            f.write_str("<non-string panic payload>")
        }
    }
}

/// Run a synchronous callback, logging and swallowing any panic.
pub(crate) fn guarded<R>(hook: &'static str, id: ConnectionId, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            let panic = PanicMessage(panic.as_ref());
            // Emit via both `log` and `tracing` for tests that capture either.
            error!("callback panicked: hook={hook}, id={id}, panic={panic}");
            tracing::error!(hook, %id, %panic, "callback panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::{PanicMessage, guarded};
    use crate::connection::ConnectionId;

    #[test]
    fn formats_string_payloads() {
        let owned: Box<dyn std::any::Any + Send> = Box::new(String::from("boom"));
        assert_eq!(PanicMessage(owned.as_ref()).to_string(), "boom");
        let borrowed: Box<dyn std::any::Any + Send> = Box::new("bang");
        assert_eq!(PanicMessage(borrowed.as_ref()).to_string(), "bang");
    }

    #[test]
    #[traced_test]
    fn guarded_swallows_panics() {
        let result = guarded("on_before_close", ConnectionId::new(3), || -> u8 {
            panic!("observer failed")
        });
        assert!(result.is_none());
        assert!(logs_contain("callback panicked"));
        assert!(logs_contain("observer failed"));
    }

    #[test]
    fn guarded_returns_value() {
        assert_eq!(guarded("x", ConnectionId::new(1), || 5), Some(5));
    }
}
