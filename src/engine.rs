//! State shared by every connection of one server or client.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    client::Reconnector,
    codec::PacketCodec,
    config::EngineConfig,
    connection::{Connection, ConnectionId, Role},
    correlation::PendingCalls,
    hooks::{ConnectionListener, PacketHandler},
    ip::IpGuard,
    packet::Packet,
    registry::ConnectionRegistry,
    stats::GroupStat,
    tls::TlsSettings,
};

pub(crate) struct Engine<P: Packet> {
    pub(crate) config: EngineConfig,
    pub(crate) role: Role,
    pub(crate) codec: Arc<dyn PacketCodec<Packet = P>>,
    pub(crate) handler: Arc<dyn PacketHandler<P>>,
    pub(crate) listener: Arc<dyn ConnectionListener<P>>,
    pub(crate) registry: Arc<ConnectionRegistry<P>>,
    pub(crate) calls: PendingCalls<P>,
    pub(crate) ip_guard: Arc<IpGuard>,
    pub(crate) stats: Arc<GroupStat>,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) reconnector: Option<Reconnector>,
    pub(crate) tracker: TaskTracker,
    /// Cancelled when the owning server or client shuts down.
    pub(crate) closing: CancellationToken,
    pub(crate) runtime: Handle,
    next_id: AtomicU64,
}

/// Collaborators assembled by the server and client builders.
pub(crate) struct EngineParts<P: Packet> {
    pub(crate) config: EngineConfig,
    pub(crate) role: Role,
    pub(crate) codec: Arc<dyn PacketCodec<Packet = P>>,
    pub(crate) handler: Arc<dyn PacketHandler<P>>,
    pub(crate) listener: Arc<dyn ConnectionListener<P>>,
    pub(crate) registry: Arc<ConnectionRegistry<P>>,
    pub(crate) tls: Option<TlsSettings>,
    pub(crate) reconnector: Option<Reconnector>,
    pub(crate) runtime: Handle,
}

impl<P: Packet> Engine<P> {
    pub(crate) fn new(parts: EngineParts<P>) -> Arc<Self> {
        let config = parts.config.normalized();
        let ip_guard = Arc::new(IpGuard::new(
            config.max_decode_errors_per_ip,
            config.decode_error_window,
        ));
        Arc::new(Self {
            config,
            role: parts.role,
            codec: parts.codec,
            handler: parts.handler,
            listener: parts.listener,
            registry: parts.registry,
            calls: PendingCalls::default(),
            ip_guard,
            stats: Arc::new(GroupStat::default()),
            tls: parts.tls,
            reconnector: parts.reconnector,
            tracker: TaskTracker::new(),
            closing: CancellationToken::new(),
            runtime: parts.runtime,
            next_id: AtomicU64::new(1),
        })
    }

    pub(crate) fn next_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether a closing client connection should be kept for reconnection.
    pub(crate) fn wants_reconnect(&self, conn: &Connection<P>) -> bool {
        self.role == Role::Client
            && !self.config.short_connection
            && self
                .reconnector
                .as_ref()
                .is_some_and(|r| r.accepts(conn))
    }

    /// Close every registered connection and wait for their tasks.
    pub(crate) async fn shutdown(&self, remark: &str) {
        self.closing.cancel();
        for conn in self.registry.all() {
            conn.remove(remark);
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
pub(crate) fn test_engine<C: PacketCodec>(codec: C, role: Role) -> Arc<Engine<C::Packet>> {
    Engine::new(test_parts(codec, role))
}

/// Engine collaborators for unit tests: discarding handler, no listener,
/// no TLS and no reconnection. Tests adjust the fields they care about.
#[cfg(test)]
pub(crate) fn test_parts<C: PacketCodec>(codec: C, role: Role) -> EngineParts<C::Packet> {
    use async_trait::async_trait;

    use crate::hooks::{HandlerError, NoopListener};

    struct Discard;

    #[async_trait]
    impl<P: Packet> PacketHandler<P> for Discard {
        async fn handle(&self, _packet: &P, _conn: &Connection<P>) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    let runtime = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => test_runtime().handle().clone(),
    };
    EngineParts {
        config: EngineConfig::default(),
        role,
        codec: Arc::new(codec),
        handler: Arc::new(Discard),
        listener: Arc::new(NoopListener),
        registry: Arc::new(ConnectionRegistry::default()),
        tls: None,
        reconnector: None,
        runtime,
    }
}

#[cfg(test)]
fn test_runtime() -> &'static tokio::runtime::Runtime {
    use std::sync::OnceLock;

    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("test runtime")
    })
}
