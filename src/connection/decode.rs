//! Incremental decoding of the inbound byte stream.

use bytes::BytesMut;
use log::{debug, info};

use super::Connection;
use crate::{error::DecodeLoopError, packet::Packet};

/// Decode state owned by a connection's reader task.
///
/// Bytes the codec did not consume stay in the window and are prepended to
/// the next chunk. Packets are dispatched in the order they were decoded,
/// and the next packet is only decoded after the previous one was handled.
#[derive(Debug, Default)]
pub(crate) struct DecodeLoop {
    window: BytesMut,
    failures: usize,
    last_percentage: Option<usize>,
}

impl DecodeLoop {
    /// Bytes waiting for more data.
    pub(crate) fn buffered(&self) -> usize { self.window.len() }

    /// Consecutive decode attempts that produced no packet.
    pub(crate) fn failures(&self) -> usize { self.failures }

    /// Append `chunk` and dispatch every complete packet.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeLoopError`] when the codec rejects the window or the
    /// peer keeps trickling bytes that never form a packet. The caller
    /// closes the connection.
    pub(crate) async fn feed<P: Packet>(
        &mut self,
        conn: &Connection<P>,
        chunk: &[u8],
    ) -> Result<(), DecodeLoopError> {
        self.window.extend_from_slice(chunk);
        let engine = conn.engine();
        while !self.window.is_empty() && conn.is_active() {
            let readable = self.window.len();
            if let Some(needed) = conn.packet_needed_length()
                && readable < needed
            {
                self.log_progress(conn, readable, needed);
                return Ok(());
            }

            let Some(packet) = engine.codec.decode(&mut self.window, conn)? else {
                self.record_failure(conn, readable)?;
                return Ok(());
            };

            let size = readable - self.window.len();
            self.failures = 0;
            self.last_percentage = None;
            conn.set_packet_needed_length(None);
            conn.dispatch(packet, size).await;
        }
        Ok(())
    }

    fn record_failure<P: Packet>(
        &mut self,
        conn: &Connection<P>,
        readable: usize,
    ) -> Result<(), DecodeLoopError> {
        self.failures += 1;
        let needed = conn.packet_needed_length();
        if self.failures > 3 && needed.is_none() {
            info!(
                "packet still incomplete: id={}, failures={}, readable={readable}",
                conn.id(),
                self.failures
            );
        }
        let config = &conn.engine().config;
        if config.check_attacks && self.failures > 10 {
            let average = readable / self.failures;
            if average < config.slow_attack_threshold() {
                return Err(DecodeLoopError::SlowAttack {
                    failures: self.failures,
                    average,
                });
            }
        }
        if let Some(needed) = needed {
            self.log_progress(conn, readable, needed);
        }
        Ok(())
    }

    fn log_progress<P: Packet>(&mut self, conn: &Connection<P>, readable: usize, needed: usize) {
        let percentage = readable * 100 / needed.max(1);
        if self.last_percentage != Some(percentage) {
            self.last_percentage = Some(percentage);
            debug!(
                "receiving large packet: id={}, received={readable}, needed={needed}, \
                 progress={percentage}%",
                conn.id()
            );
        }
    }
}
