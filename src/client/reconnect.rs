//! Client reconnection.
//!
//! A client connection that closes without being removed is handed to the
//! [`Reconnector`], which waits the configured interval and dials the same
//! target again. The connection keeps its identifier, properties and
//! bindings across attempts. Once the retry ceiling is reached the
//! connection is removed with [`CloseCode::ClientConnectionFail`].

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio::time::sleep;

use super::connect::establish;
use crate::{
    close::{CloseCode, CloseRequest},
    config::ReconnectConfig,
    connection::Connection,
    packet::Packet,
};

#[derive(Clone, Copy, Debug)]
pub(crate) struct Reconnector {
    config: ReconnectConfig,
}

impl Reconnector {
    pub(crate) fn new(config: ReconnectConfig) -> Self { Self { config } }

    /// Whether `conn` may be kept for another attempt.
    pub(crate) fn accepts<P: Packet>(&self, conn: &Connection<P>) -> bool {
        conn.target().is_some()
            && !conn.is_removed()
            && self.config.allows(conn.reconnect_attempts())
    }

    /// Queue a reconnect attempt for `conn`.
    pub(crate) fn schedule<P: Packet>(&self, conn: Connection<P>) {
        let engine = Arc::clone(conn.engine());
        debug!(
            "reconnect scheduled: id={}, interval={:?}, attempts={}",
            conn.id(),
            self.config.interval,
            conn.reconnect_attempts()
        );
        engine
            .tracker
            .spawn_on(attempt(conn, self.config.interval), &engine.runtime);
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn attempt<P: Packet>(conn: Connection<P>, interval: Duration) {
    let closing = conn.engine().closing.clone();
    tokio::select! {
        biased;

        () = closing.cancelled() => return,
        () = sleep(interval) => {}
    }
    if conn.is_removed() || conn.is_active() {
        return;
    }

    let attempt = conn.record_reconnect_attempt();
    info!(
        "reconnecting: id={}, server={:?}, attempt={attempt}",
        conn.id(),
        conn.server_node()
    );
    let result = tokio::select! {
        biased;

        () = closing.cancelled() => return,
        res = establish(&conn, true) => res,
    };
    if let Err(e) = result {
        if conn.is_removed() {
            debug!("reconnect abandoned: id={}, connection removed", conn.id());
            return;
        }
        warn!(
            "reconnect failed: id={}, attempt={attempt}, error={e}",
            conn.id()
        );
        if !conn.on_connect_failed(&e, true) {
            conn.close_with_request(
                CloseRequest::new("reconnect attempts exhausted")
                    .code(CloseCode::ClientConnectionFail)
                    .cause(&e)
                    .force_remove(),
            );
        }
    }
}
