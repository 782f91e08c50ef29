//! Single-flight send pipeline.
//!
//! Messages are appended to the connection's queue; the caller that flips
//! `sending` from idle to busy spawns the writer task, which drains the
//! queue in order and flips back to idle when it runs dry. Enqueue order is
//! wire order.

use std::{io, sync::atomic::Ordering, time::Duration};

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::{io::AsyncWriteExt, time::sleep};
use tokio_util::sync::CancellationToken;

use super::{BoxWriter, Connection};
use crate::{
    close::{CloseCode, CloseRequest},
    codec::CodecError,
    config::BackoffConfig,
    error::CallError,
    hooks::guarded,
    metrics::{self, Direction},
    packet::{Body, Outbound, Packet},
    tls::TlsError,
};

/// Zero-byte writes tolerated before a back-off write gives up.
const MAX_WRITE_STALLS: u32 = 16;

enum PrepareError {
    Encode(CodecError),
    Tls(TlsError),
}

impl<P: Packet> Connection<P> {
    /// Queue `outbound` for writing.
    ///
    /// Returns `false` when the connection is closing, closed or removed; the
    /// message's completion is then signalled with failure. While a TLS
    /// handshake is running, messages are parked and flushed once it
    /// completes.
    pub fn send(&self, outbound: impl Into<Outbound<P>>) -> bool { self.submit(outbound.into()) }

    /// Queue `outbound` and wait until it has been written.
    ///
    /// Returns `false` if the connection rejected the message, the write
    /// failed, or nothing happened within the configured
    /// `sync_send_timeout`.
    pub async fn send_sync(&self, outbound: impl Into<Outbound<P>>) -> bool {
        let mut outbound = outbound.into();
        let completion = outbound.attach_completion();
        if !self.submit(outbound) {
            return false;
        }
        let limit = self.engine().config.sync_send_timeout;
        match tokio::time::timeout(limit, completion).await {
            Ok(Ok(success)) => success,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("blocking send timed out: id={}, timeout={limit:?}", self.id());
                false
            }
        }
    }

    /// Send `request` and wait for the packet carrying the same
    /// correlation identifier.
    ///
    /// # Errors
    ///
    /// Returns [`CallError`] if the request was rejected, the connection
    /// closed, or no response arrived within `timeout`.
    pub async fn call(&self, mut request: P, timeout: Duration) -> Result<P, CallError> {
        let calls = &self.engine().calls;
        let (id, response) = calls.register();
        request.set_correlation_id(Some(id));
        if !self.send(request) {
            calls.cancel(id);
            return Err(CallError::Rejected);
        }
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                calls.cancel(id);
                Err(CallError::Timeout(timeout))
            }
        }
    }

    fn submit(&self, mut out: Outbound<P>) -> bool {
        if !self.is_active() {
            warn!(
                "send rejected: id={}, state={:?}, code={}",
                self.id(),
                self.state(),
                self.close_code()
            );
            out.complete(false);
            return false;
        }
        {
            let mut tls = self.inner.tls.lock();
            if let Some(state) = tls.as_mut()
                && !out.is_tls_encrypted()
                && !state.session.is_established()
            {
                debug!("parking message until TLS handshake completes: id={}", self.id());
                state.backlog.push_back(out);
                return true;
            }
            self.inner.queue.lock().push_back(out);
        }
        self.kick();
        true
    }

    /// Start the writer unless one is already running.
    pub(crate) fn kick(&self) {
        if self
            .inner
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let conn = self.clone();
            self.engine().runtime.spawn(conn.drain());
        }
    }

    async fn drain(self) {
        loop {
            loop {
                let next = self.inner.queue.lock().pop_front();
                let Some(out) = next else { break };
                self.write_outbound(out).await;
            }
            self.inner.sending.store(false, Ordering::Release);
            // A sender may have enqueued after the last pop but before the
            // flag flipped; its own CAS may have lost to us.
            if self.inner.queue.lock().is_empty()
                || self
                    .inner
                    .sending
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    async fn write_outbound(&self, mut out: Outbound<P>) {
        if !self.check_before_io("write") {
            if !out.is_tls_flush() {
                self.after_sent(out, false);
            }
            return;
        }
        let bytes = match self.prepare(&mut out) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(PrepareError::Encode(e)) => {
                error!("encode failed: id={}, error={e}", self.id());
                self.after_sent(out, false);
                return;
            }
            Err(PrepareError::Tls(e)) => {
                self.after_sent(out, false);
                self.close_with_request(
                    CloseRequest::new("TLS encryption failed")
                        .code(e.close_code())
                        .cause(&e),
                );
                return;
            }
        };

        let mut result = self.write_all(&bytes, None).await;
        if result.is_ok()
            && let Some(path) = out.file_body().map(std::path::Path::to_path_buf)
        {
            result = self.write_file(&path).await.map(|sent| {
                out.set_byte_count(out.byte_count() + usize::try_from(sent).unwrap_or(usize::MAX));
            });
        }

        match result {
            Ok(()) => {
                if !out.is_tls_flush() {
                    self.after_sent(out, true);
                }
            }
            Err(e) => {
                if !out.is_tls_flush() {
                    self.after_sent(out, false);
                }
                self.close_with_request(
                    CloseRequest::new("write failed")
                        .code(CloseCode::WriteError)
                        .cause(&e),
                );
            }
        }
    }

    /// Encode and, when needed, encrypt a message. `None` means there is
    /// nothing to write.
    fn prepare(&self, out: &mut Outbound<P>) -> Result<Option<Bytes>, PrepareError> {
        let plain = match &out.body {
            Body::Packet(packet) => Some(
                self.engine()
                    .codec
                    .encode(packet, self)
                    .map_err(PrepareError::Encode)?,
            ),
            Body::Encoded(bytes) => Some(bytes.clone()),
            Body::TlsFlush => None,
        };
        if let Some(bytes) = &plain {
            out.set_byte_count(bytes.len());
        }

        let mut tls = self.inner.tls.lock();
        let Some(state) = tls.as_mut() else {
            return Ok(plain);
        };
        let sealed = match plain {
            Some(bytes) if !out.is_tls_encrypted() => state.session.wrap(&bytes),
            Some(bytes) => state.session.drain_records().map(|records| {
                let mut joined = records.to_vec();
                joined.extend_from_slice(&bytes);
                Bytes::from(joined)
            }),
            None => state.session.drain_records(),
        }
        .map_err(PrepareError::Tls)?;
        Ok((!sealed.is_empty()).then_some(sealed))
    }

    /// Encrypt a chunk of plaintext outside the queue, for file bodies.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Result<Option<Bytes>, TlsError> {
        match self.inner.tls.lock().as_mut() {
            Some(state) => state.session.wrap(plaintext).map(Some),
            None => Ok(None),
        }
    }

    /// Write `bytes` completely, resuming after partial writes.
    ///
    /// With `backoff`, a write that accepts zero bytes is retried after an
    /// exponentially growing pause; without it, it fails. Cancellation of the
    /// connection's I/O token aborts the write, including a pending flush.
    pub(crate) async fn write_all(
        &self,
        bytes: &[u8],
        backoff: Option<&BackoffConfig>,
    ) -> io::Result<()> {
        let mut guard = self.inner.writer.lock().await;
        // Read under the writer lock so that token and writer belong to the
        // same socket.
        let token = self.io_token();
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection writer released",
            ));
        };
        self.write_fully(writer, bytes, backoff, &token).await
    }

    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    async fn write_fully(
        &self,
        writer: &mut BoxWriter,
        bytes: &[u8],
        backoff: Option<&BackoffConfig>,
        token: &CancellationToken,
    ) -> io::Result<()> {
        let aborted = || {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed while writing",
            )
        };
        let mut written = 0;
        let mut stalls = 0;
        let mut delay = backoff.map(|b| b.initial_delay);
        while written < bytes.len() {
            let result = tokio::select! {
                biased;

                () = token.cancelled() => return Err(aborted()),
                res = writer.write(&bytes[written..]) => res,
            };
            match result? {
                0 => match (backoff, delay) {
                    (Some(cfg), Some(current)) if stalls < MAX_WRITE_STALLS => {
                        stalls += 1;
                        sleep(current).await;
                        delay = Some(cfg.next_delay(current));
                    }
                    _ => return Err(io::ErrorKind::WriteZero.into()),
                },
                n => {
                    written += n;
                    stalls = 0;
                    self.inner.stats.record_sent_bytes();
                }
            }
        }
        tokio::select! {
            biased;

            () = token.cancelled() => Err(aborted()),
            res = writer.flush() => res,
        }
    }

    /// After-send hook: statistics, completion signal, listener, and close
    /// when the message does not keep the connection.
    pub(crate) fn after_sent(&self, mut out: Outbound<P>, success: bool) {
        let engine = self.engine();
        if engine.config.stat_on {
            self.inner.stats.record_sent_packet(out.byte_count(), success);
            if success {
                engine.stats.record_sent(out.byte_count());
            }
        }
        if success {
            metrics::record_packet(Direction::Outbound, out.byte_count());
        }
        out.complete(success);
        guarded("on_after_sent", self.id(), || {
            engine.listener.on_after_sent(self, &out, success);
        });
        if success && !out.keeps_connection() {
            self.close("message does not keep the connection");
        }
    }
}
