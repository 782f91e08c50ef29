//! Hand decoded packets to their consumer.

use std::{panic::AssertUnwindSafe, sync::atomic::Ordering};

use futures::FutureExt;
use log::{error, warn};
use tokio::time::Instant;

use super::Connection;
use crate::{
    hooks::{PanicMessage, guarded},
    metrics::{self, Direction},
    packet::Packet,
};

impl<P: Packet> Connection<P> {
    /// Route one decoded packet of `size` wire bytes.
    ///
    /// A packet whose correlation identifier matches a pending
    /// [`Connection::call`] completes that call. Everything else goes to the
    /// packet handler on this task; handler errors and panics are logged and
    /// the connection stays open.
    pub(crate) async fn dispatch(&self, packet: P, size: usize) {
        let engine = self.engine();
        if engine.config.stat_on {
            self.inner.stats.record_received_packet();
            engine.stats.record_received_packet();
        }
        metrics::record_packet(Direction::Inbound, size);
        guarded("on_after_decoded", self.id(), || {
            engine.listener.on_after_decoded(self, &packet, size);
        });

        let packet = match packet.correlation_id() {
            Some(id) if engine.calls.is_pending(id) => match engine.calls.resolve(id, packet) {
                Ok(()) => return,
                // The caller gave up between the check and the send.
                Err(packet) => packet,
            },
            _ => packet,
        };

        if packet.keep_connection() && !self.inner.flags.bound.swap(true, Ordering::AcqRel) {
            engine.registry.bind_ip(self);
        }

        let started = Instant::now();
        let outcome = AssertUnwindSafe(engine.handler.handle(&packet, self))
            .catch_unwind()
            .await;
        let cost = started.elapsed();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("handler failed: id={}, error={e}", self.id());
                tracing::warn!(id = %self.id(), error = %e, "handler failed");
            }
            Err(panic) => {
                let panic = PanicMessage(panic.as_ref());
                error!("handler panicked: id={}, panic={panic}", self.id());
                tracing::error!(id = %self.id(), %panic, "handler panicked");
            }
        }

        if engine.config.stat_on {
            self.inner.stats.record_handled(size, cost);
            engine.stats.record_handled();
        }
        guarded("on_after_handled", self.id(), || {
            engine.listener.on_after_handled(self, &packet, cost);
        });
    }
}
