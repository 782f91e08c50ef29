//! Activation and teardown.

use std::{net::SocketAddr, sync::atomic::Ordering};

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{BoxWriter, Connection, TlsState, Transport, read};
use crate::{
    close::{CloseCode, CloseMeta, CloseRequest},
    connection::Role,
    error::ActivateError,
    hooks::guarded,
    metrics,
    packet::{Outbound, Packet},
    tls::{TlsError, TlsEvents, TlsSession, TlsSettings},
};

impl<P: Packet> Connection<P> {
    /// Close the connection. Client connections may be reconnected.
    pub fn close(&self, remark: impl Into<String>) {
        self.close_with_request(CloseRequest::new(remark));
    }

    /// Close the connection with an explicit code.
    pub fn close_with(&self, code: CloseCode, remark: impl Into<String>) {
        self.close_with_request(CloseRequest::new(remark).code(code));
    }

    /// Close the connection and purge it from every registry. It is never
    /// reconnected.
    pub fn remove(&self, remark: impl Into<String>) {
        self.close_with_request(CloseRequest::new(remark).force_remove());
    }

    /// Single teardown entry point.
    ///
    /// Idempotent: a close already in progress, or a second close of a
    /// closed connection, returns immediately. Removing a closed client
    /// connection purges it from the registries.
    pub fn close_with_request(&self, request: CloseRequest) {
        {
            let _guard = self.inner.close_lock.lock();
            let flags = &self.inner.flags;
            if flags.removed.load(Ordering::Acquire)
                || (flags.closed.load(Ordering::Acquire) && !request.force_remove)
                || flags.waiting_close.swap(true, Ordering::AcqRel)
            {
                return;
            }
        }
        self.teardown(request);
    }

    fn teardown(&self, request: CloseRequest) {
        let inner = &self.inner;
        let engine = &inner.engine;
        let was_closed = inner.flags.closed.load(Ordering::Acquire);

        let code = {
            let mut code = inner.close_code.lock();
            match request.code {
                Some(c) => *code = c,
                None if *code == CloseCode::InitStatus => *code = CloseCode::NoCode,
                None => {}
            }
            *code
        };

        self.shutdown_io();

        let need_remove =
            request.force_remove || inner.role == Role::Server || !engine.wants_reconnect(self);
        *inner.close_meta.lock() = CloseMeta {
            remark: request.remark.clone(),
            cause: request.cause.clone(),
            need_remove,
        };
        info!(
            "closing connection: id={}, peer={:?}, code={code}, remark={}, cause={:?}, \
             need_remove={need_remove}",
            self.id(),
            self.peer_addr(),
            request.remark,
            request.cause
        );

        guarded("on_before_close", self.id(), || {
            engine.listener.on_before_close(
                self,
                request.cause.as_deref(),
                &request.remark,
                need_remove,
            );
        });

        inner.flags.closed.store(true, Ordering::Release);
        if need_remove {
            inner.flags.removed.store(true, Ordering::Release);
            engine.registry.remove(self);
        } else {
            engine.registry.mark_closed(self);
        }
        if !was_closed {
            inner.stats.mark_closed();
            engine.stats.record_closed();
            metrics::record_close(code);
        }
        inner.ready.send_replace(false);

        self.fail_pending();
        inner.flags.waiting_close.store(false, Ordering::Release);

        if !need_remove && let Some(reconnector) = &engine.reconnector {
            reconnector.schedule(self.clone());
        }
    }

    /// Stop the reader and release the writer. Errors are ignored.
    ///
    /// When the writer is busy, its release is deferred to a task that waits
    /// for the lock. That task only shuts the writer down if the I/O token
    /// read under the lock is cancelled, so a socket attached by a later
    /// reconnect is left alone.
    fn shutdown_io(&self) {
        self.inner.io_token.lock().cancel();
        let engine = &self.inner.engine;
        match self.inner.writer.try_lock() {
            Ok(mut guard) => {
                if let Some(writer) = guard.take() {
                    engine
                        .tracker
                        .spawn_on(shutdown_writer(writer), &engine.runtime);
                }
            }
            Err(_) => {
                let conn = self.clone();
                engine.tracker.spawn_on(
                    async move {
                        let writer = {
                            let mut guard = conn.inner.writer.lock().await;
                            if conn.io_token().is_cancelled() {
                                guard.take()
                            } else {
                                None
                            }
                        };
                        if let Some(writer) = writer {
                            debug!("released busy writer: id={}", conn.id());
                            shutdown_writer(writer).await;
                        }
                    },
                    &engine.runtime,
                );
            }
        }
        if let Some(tls) = self.inner.tls.lock().as_mut() {
            tls.session.close();
        }
    }

    /// Complete every queued or parked message with failure.
    fn fail_pending(&self) {
        let mut pending: Vec<Outbound<P>> = self.inner.queue.lock().drain(..).collect();
        if let Some(tls) = self.inner.tls.lock().as_mut() {
            pending.extend(tls.backlog.drain(..));
        }
        for out in pending.into_iter().filter(|o| !o.is_tls_flush()) {
            self.after_sent(out, false);
        }
    }

    /// Attach a freshly established socket and start its I/O tasks.
    ///
    /// Used for accepted server sockets, first client connects and
    /// reconnects alike. The state flip runs under the close lock, so a
    /// concurrent close either sees the connection active and tears it down
    /// or has already removed it, in which case the socket is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ActivateError::Tls`] if the TLS session cannot be created
    /// and [`ActivateError::Removed`] if the connection was removed or is
    /// being closed.
    pub(crate) async fn activate<S>(
        &self,
        stream: S,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        is_reconnect: bool,
    ) -> Result<(), ActivateError>
    where
        S: Transport + 'static,
    {
        let inner = &self.inner;
        let engine = &inner.engine;

        let session = match &engine.tls {
            None => None,
            Some(TlsSettings::Server(cfg)) => Some(cfg.session()?),
            Some(TlsSettings::Client(cfg)) => {
                let (explicit, host) = match self.target() {
                    Some(target) => (target.tls_host.as_deref(), target.server.host().to_owned()),
                    None => (None, peer.map(|p| p.ip().to_string()).unwrap_or_default()),
                };
                Some(cfg.session(explicit, &host)?)
            }
        };

        let boxed: Box<dyn Transport> = Box::new(stream);
        let (reader, writer) = tokio::io::split(boxed);
        let mut writer_slot = inner.writer.lock().await;
        let tls = {
            let _guard = inner.close_lock.lock();
            let flags = &inner.flags;
            if flags.removed.load(Ordering::Acquire) || flags.waiting_close.load(Ordering::Acquire) {
                debug!("dropping socket of removed connection: id={}", self.id());
                return Err(ActivateError::Removed);
            }
            *writer_slot = Some(writer);
            drop(writer_slot);

            {
                let mut addrs = inner.addrs.lock();
                addrs.peer = peer;
                addrs.local = local;
            }
            let token = CancellationToken::new();
            *inner.io_token.lock() = token.clone();
            *inner.close_code.lock() = CloseCode::InitStatus;
            self.set_packet_needed_length(None);
            let tls = session.is_some();
            *inner.tls.lock() = session.map(|session| TlsState {
                session,
                backlog: std::collections::VecDeque::new(),
            });
            inner.reconnect_attempts.store(0, Ordering::Release);
            flags.reconnect.store(is_reconnect, Ordering::Release);
            flags.closed.store(false, Ordering::Release);
            inner.stats.mark_connected();
            inner.ready.send_replace(!tls);

            engine.registry.mark_connected(self);
            engine.stats.record_accepted();

            let conn = self.clone();
            engine
                .tracker
                .spawn_on(read::run(conn, reader, token), &engine.runtime);
            tls
        };

        if tls {
            if let Some(result) = self.with_tls_session(TlsSession::begin_handshake) {
                self.apply_tls_events(result);
            }
        } else {
            self.notify_connected(true);
        }
        Ok(())
    }

    /// Run `op` on the TLS session under its lock.
    ///
    /// Record flushes requested by the session are queued and, when the
    /// handshake completes, the parked backlog moves to the send queue in
    /// the same critical section, ahead of any later send.
    pub(crate) fn with_tls_session<F>(&self, op: F) -> Option<Result<TlsEvents, TlsError>>
    where
        F: FnOnce(&mut TlsSession) -> Result<TlsEvents, TlsError>,
    {
        let mut tls = self.inner.tls.lock();
        let state = tls.as_mut()?;
        let result = op(&mut state.session);
        if let Ok(events) = &result {
            let mut queue = self.inner.queue.lock();
            if events.flush {
                queue.push_back(Outbound::tls_flush());
            }
            if events.completed {
                queue.extend(state.backlog.drain(..));
            }
        }
        Some(result)
    }

    /// Record a failed client connect attempt. Returns `true` when the
    /// connection was parked for another attempt.
    pub(crate) fn on_connect_failed(
        &self,
        cause: &dyn std::error::Error,
        is_reconnect: bool,
    ) -> bool {
        let inner = &self.inner;
        let engine = &inner.engine;
        *inner.close_code.lock() = CloseCode::ClientConnectionFail;
        *inner.close_meta.lock() = CloseMeta {
            remark: "connect failed".to_owned(),
            cause: Some(cause.to_string()),
            need_remove: false,
        };
        inner.flags.reconnect.store(is_reconnect, Ordering::Release);
        self.notify_connected(false);
        if !engine.wants_reconnect(self) {
            return false;
        }
        engine.registry.mark_closed(self);
        if let Some(reconnector) = &engine.reconnector {
            reconnector.schedule(self.clone());
        }
        true
    }

    pub(crate) fn notify_connected(&self, connected: bool) {
        let is_reconnect = self.is_reconnect();
        let engine = &self.inner.engine;
        guarded("on_after_connected", self.id(), || {
            engine.listener.on_after_connected(self, connected, is_reconnect);
        });
    }

    /// React to the outcome of a TLS operation run by the reader. Returns
    /// the events on success so that the caller can consume the plaintext;
    /// closes the connection and returns `None` on failure.
    pub(crate) fn apply_tls_events(
        &self,
        result: Result<TlsEvents, TlsError>,
    ) -> Option<TlsEvents> {
        match result {
            Ok(events) => {
                if events.flush || events.completed {
                    self.kick();
                }
                if events.completed {
                    self.on_handshake_completed();
                }
                Some(events)
            }
            Err(e) => {
                warn!("TLS failure: id={}, error={e}", self.id());
                self.close_with_request(
                    CloseRequest::new("TLS failure")
                        .code(e.close_code())
                        .cause(&e),
                );
                None
            }
        }
    }

    fn on_handshake_completed(&self) {
        info!(
            "TLS handshake completed: id={}, peer={:?}",
            self.id(),
            self.peer_addr()
        );
        self.inner.ready.send_replace(true);
        self.notify_connected(true);
    }
}

async fn shutdown_writer(mut writer: BoxWriter) { let _ = writer.shutdown().await; }
