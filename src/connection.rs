//! Connections.
//!
//! A [`Connection`] is a cheap, clonable handle to one TCP connection owned
//! by a server or client engine. It carries the lifecycle flags, the
//! outbound queue, the decode hint, the optional TLS session and the
//! statistics of the connection. I/O runs on Tokio tasks: one reader task
//! per connection incarnation and at most one writer task at a time.
//!
//! The lifecycle is `Active -> WaitingClose -> Closed | Removed`. Client
//! connections may go from `Closed` back to `Active` through the
//! reconnector; a removed connection never comes back.

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncWrite, WriteHalf},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    client::ConnectTarget,
    close::{CloseCode, CloseMeta},
    engine::Engine,
    node::Node,
    packet::{Outbound, Packet},
    registry::{Bindings, ConnectionRegistry},
    stats::ConnectionStats,
    tls::{HandshakePhase, TlsSession},
};

mod decode;
mod dispatch;
mod file;
mod lifecycle;
mod read;
mod send;

pub(crate) use decode::DecodeLoop;

/// Identifier assigned to a connection. Stable across reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    /// Create a new [`ConnectionId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Side of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Accepted by a server.
    Server,
    /// Opened by a client.
    Client,
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing.
    Active,
    /// A close is in progress.
    WaitingClose,
    /// Closed but still registered; a client may reconnect it.
    Closed,
    /// Closed and purged from every registry.
    Removed,
}

type BoxWriter = WriteHalf<Box<dyn Transport>>;

/// Byte stream a connection runs over.
pub(crate) trait Transport: tokio::io::AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: tokio::io::AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

#[derive(Debug, Default)]
struct Flags {
    waiting_close: AtomicBool,
    closed: AtomicBool,
    removed: AtomicBool,
    bound: AtomicBool,
    reconnect: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default)]
struct Addrs {
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

/// TLS session plus the messages parked until its handshake completes.
pub(crate) struct TlsState<P> {
    pub(crate) session: TlsSession,
    pub(crate) backlog: VecDeque<Outbound<P>>,
}

pub(crate) struct Inner<P: Packet> {
    id: ConnectionId,
    role: Role,
    engine: Arc<Engine<P>>,
    target: Option<ConnectTarget>,
    addrs: Mutex<Addrs>,
    flags: Flags,
    close_lock: Mutex<()>,
    close_code: Mutex<CloseCode>,
    close_meta: Mutex<CloseMeta>,
    queue: Mutex<VecDeque<Outbound<P>>>,
    sending: AtomicBool,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    io_token: Mutex<CancellationToken>,
    packet_needed_length: AtomicUsize,
    tls: Mutex<Option<TlsState<P>>>,
    ready: watch::Sender<bool>,
    stats: ConnectionStats,
    properties: DashMap<String, String>,
    bindings: Mutex<Bindings>,
    heartbeat_timeout: Mutex<Option<Duration>>,
    reconnect_attempts: AtomicU32,
}

/// Handle to a connection.
pub struct Connection<P: Packet> {
    inner: Arc<Inner<P>>,
}

impl<P: Packet> Clone for Connection<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Packet> fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer", &self.peer_addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<P: Packet> Connection<P> {
    /// Create a connection that is not yet attached to a socket. It starts
    /// out closed and becomes active with `activate`.
    pub(crate) fn new(engine: &Arc<Engine<P>>, target: Option<ConnectTarget>) -> Self {
        let (ready, _) = watch::channel(false);
        let flags = Flags::default();
        flags.closed.store(true, Ordering::Relaxed);
        Self {
            inner: Arc::new(Inner {
                id: engine.next_id(),
                role: engine.role,
                engine: Arc::clone(engine),
                target,
                addrs: Mutex::new(Addrs::default()),
                flags,
                close_lock: Mutex::new(()),
                close_code: Mutex::new(CloseCode::InitStatus),
                close_meta: Mutex::new(CloseMeta::default()),
                queue: Mutex::new(VecDeque::new()),
                sending: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                io_token: Mutex::new(CancellationToken::new()),
                packet_needed_length: AtomicUsize::new(0),
                tls: Mutex::new(None),
                ready,
                stats: ConnectionStats::new(),
                properties: DashMap::new(),
                bindings: Mutex::new(Bindings::default()),
                heartbeat_timeout: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(engine: &Arc<Engine<P>>, peer: Option<SocketAddr>) -> Self {
        let conn = Self::new(engine, None);
        conn.inner.addrs.lock().peer = peer;
        conn.inner.flags.closed.store(false, Ordering::Relaxed);
        conn
    }

    pub(crate) fn engine(&self) -> &Arc<Engine<P>> { &self.inner.engine }

    pub(crate) fn target(&self) -> Option<&ConnectTarget> { self.inner.target.as_ref() }

    pub(crate) fn bindings(&self) -> &Mutex<Bindings> { &self.inner.bindings }

    /// Identifier of the connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.inner.id }

    /// Whether the connection was accepted by a server or opened by a
    /// client.
    #[must_use]
    pub fn role(&self) -> Role { self.inner.role }

    /// Address of the remote end of the current socket.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> { self.inner.addrs.lock().peer }

    /// Local address of the current socket.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.inner.addrs.lock().local }

    /// Server a client connection targets.
    #[must_use]
    pub fn server_node(&self) -> Option<&Node> { self.inner.target.as_ref().map(|t| &t.server) }

    /// Registry the connection belongs to.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry<P>> { &self.inner.engine.registry }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let flags = &self.inner.flags;
        if flags.removed.load(Ordering::Acquire) {
            ConnectionState::Removed
        } else if flags.waiting_close.load(Ordering::Acquire) {
            ConnectionState::WaitingClose
        } else if flags.closed.load(Ordering::Acquire) {
            ConnectionState::Closed
        } else {
            ConnectionState::Active
        }
    }

    /// Whether the connection can carry traffic.
    #[must_use]
    pub fn is_active(&self) -> bool { self.state() == ConnectionState::Active }

    /// Whether the connection is closed (removed connections are closed too).
    #[must_use]
    pub fn is_closed(&self) -> bool { self.inner.flags.closed.load(Ordering::Acquire) }

    /// Whether the connection was purged from the registries.
    #[must_use]
    pub fn is_removed(&self) -> bool { self.inner.flags.removed.load(Ordering::Acquire) }

    /// Whether a close is in progress.
    #[must_use]
    pub fn is_waiting_close(&self) -> bool {
        self.inner.flags.waiting_close.load(Ordering::Acquire)
    }

    /// Whether the current socket was established by the reconnector.
    #[must_use]
    pub fn is_reconnect(&self) -> bool { self.inner.flags.reconnect.load(Ordering::Acquire) }

    /// Reconnect attempts since the connection was last established.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }

    /// Code of the most recent close, or [`CloseCode::InitStatus`].
    #[must_use]
    pub fn close_code(&self) -> CloseCode { *self.inner.close_code.lock() }

    /// Metadata of the most recent close.
    #[must_use]
    pub fn close_meta(&self) -> CloseMeta { self.inner.close_meta.lock().clone() }

    /// Traffic counters and timestamps.
    #[must_use]
    pub fn stats(&self) -> &ConnectionStats { &self.inner.stats }

    /// Store an application property.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.properties.insert(key.into(), value.into());
    }

    /// Read an application property.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<String> {
        self.inner.properties.get(key).map(|v| v.clone())
    }

    /// Remove an application property.
    pub fn remove_property(&self, key: &str) -> Option<String> {
        self.inner.properties.remove(key).map(|(_, v)| v)
    }

    /// Bytes the codec needs before the pending packet can be decoded.
    #[must_use]
    pub fn packet_needed_length(&self) -> Option<usize> {
        match self.inner.packet_needed_length.load(Ordering::Acquire) {
            0 => None,
            n => Some(n),
        }
    }

    /// Record how many bytes the pending packet needs. Called by codecs.
    pub fn set_packet_needed_length(&self, len: Option<usize>) {
        self.inner
            .packet_needed_length
            .store(len.unwrap_or(0), Ordering::Release);
    }

    /// Override the engine's heartbeat timeout for this connection.
    pub fn set_heartbeat_timeout(&self, timeout: Option<Duration>) {
        *self.inner.heartbeat_timeout.lock() = timeout;
    }

    /// Heartbeat timeout override, if any.
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Option<Duration> { *self.inner.heartbeat_timeout.lock() }

    /// Whether the connection runs over TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool { self.inner.engine.tls.is_some() }

    /// TLS state, or `None` for plain connections.
    #[must_use]
    pub fn tls_phase(&self) -> Option<HandshakePhase> {
        self.inner.tls.lock().as_ref().map(|t| t.session.phase())
    }

    /// SNI host name sent by a TLS client, on server connections.
    #[must_use]
    pub fn sni_hostname(&self) -> Option<String> {
        self.inner
            .tls
            .lock()
            .as_ref()
            .and_then(|t| t.session.sni_hostname().map(str::to_owned))
    }

    /// Wait until the connection can carry application data: immediately
    /// for plain connections, after the handshake for TLS ones.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.inner.ready.subscribe();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        )
    }

    /// User the connection is bound to.
    #[must_use]
    pub fn user(&self) -> Option<String> { self.inner.bindings.lock().user.clone() }

    /// Token the connection is bound to.
    #[must_use]
    pub fn token(&self) -> Option<String> { self.inner.bindings.lock().token.clone() }

    /// Groups the connection belongs to.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.inner.bindings.lock().groups.iter().cloned().collect()
    }

    /// Bind the connection to `user`.
    pub fn bind_user(&self, user: impl Into<String>) { self.registry().bind_user(self, user); }

    /// Bind the connection to `token`.
    pub fn bind_token(&self, token: impl Into<String>) { self.registry().bind_token(self, token); }

    /// Add the connection to `group`.
    pub fn bind_group(&self, group: impl Into<String>) { self.registry().bind_group(self, group); }

    /// Remove the connection from `group`.
    pub fn unbind_group(&self, group: &str) { self.registry().unbind_group(self, group); }

    /// Guard run right before touching the socket.
    pub(crate) fn check_before_io(&self, op: &str) -> bool {
        let ok = self.is_active();
        if !ok {
            debug!(
                "skipping {op}: id={}, state={:?}, code={}",
                self.id(),
                self.state(),
                self.close_code()
            );
        }
        ok
    }

    pub(crate) fn io_token(&self) -> CancellationToken { self.inner.io_token.lock().clone() }

    pub(crate) fn record_reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }
}
