//! Server side of the engine.
//!
//! A [`Server`] accepts TCP connections, optionally wraps them in TLS and
//! hands every decoded packet to the configured handler. A background scan
//! closes connections idle for longer than the heartbeat timeout.

use std::{
    future::Future,
    io,
    net::{IpAddr, SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    sync::Arc,
};

use log::{info, warn};
use tokio::{net::TcpListener, runtime::Handle};
use tokio_util::sync::CancellationToken;

mod accept;
mod error;
mod heartbeat;

pub use error::ServerError;

use crate::{
    close::{CloseCode, CloseRequest},
    codec::PacketCodec,
    config::{BackoffConfig, EngineConfig, engine_builder_setters},
    connection::Role,
    engine::{Engine, EngineParts},
    hooks::{ConnectionListener, NoopListener, PacketHandler},
    ip::IpGuard,
    packet::Packet,
    registry::ConnectionRegistry,
    stats::GroupStat,
    tls::{TlsServerConfig, TlsSettings},
};

/// Configures and binds a [`Server`].
///
/// ```no_run
/// use wirelink::{
///     Connection,
///     Frame,
///     LengthPrefixedCodec,
///     ServerBuilder,
///     hooks::{FnHandler, HandlerError},
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = ServerBuilder::new(
///     LengthPrefixedCodec::default(),
///     FnHandler::new(|frame: Frame, conn: Connection<Frame>| async move {
///         conn.send(frame);
///         Ok::<_, HandlerError>(())
///     }),
/// )
/// .name("echo")
/// .bind("127.0.0.1:7000")?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct ServerBuilder<P: Packet> {
    config: EngineConfig,
    codec: Arc<dyn PacketCodec<Packet = P>>,
    handler: Arc<dyn PacketHandler<P>>,
    listener: Arc<dyn ConnectionListener<P>>,
    registry: Arc<ConnectionRegistry<P>>,
    tls: Option<TlsServerConfig>,
    backoff: BackoffConfig,
}

impl<P: Packet> ServerBuilder<P> {
    /// Start a builder around the protocol codec and packet handler.
    #[must_use]
    pub fn new<C, H>(codec: C, handler: H) -> Self
    where
        C: PacketCodec<Packet = P>,
        H: PacketHandler<P>,
    {
        Self {
            config: EngineConfig::default(),
            codec: Arc::new(codec),
            handler: Arc::new(handler),
            listener: Arc::new(NoopListener),
            registry: Arc::new(ConnectionRegistry::default()),
            tls: None,
            backoff: BackoffConfig::default(),
        }
    }

    engine_builder_setters!();

    /// Terminate TLS on accepted connections.
    #[must_use]
    pub fn tls(mut self, tls: TlsServerConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Back-off applied after failed accepts.
    #[must_use]
    pub fn accept_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Bind a listener on `addr` and build the server.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound and
    /// [`ServerError::Build`] when called outside a Tokio runtime.
    pub fn bind(self, addr: impl ToSocketAddrs) -> Result<Server<P>, ServerError> {
        Handle::try_current().map_err(crate::error::BuildError::from)?;
        let std_listener = StdTcpListener::bind(addr)?;
        self.bind_listener(std_listener)
    }

    /// Build the server around an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be registered with
    /// the runtime and [`ServerError::Build`] when called outside one.
    pub fn bind_listener(self, std_listener: StdTcpListener) -> Result<Server<P>, ServerError> {
        let runtime = Handle::try_current().map_err(crate::error::BuildError::from)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        let engine = Engine::new(EngineParts {
            config: self.config,
            role: Role::Server,
            codec: self.codec,
            handler: self.handler,
            listener: self.listener,
            registry: self.registry,
            tls: self.tls.map(TlsSettings::Server),
            reconnector: None,
            runtime,
        });
        Ok(Server {
            engine,
            listener: Arc::new(listener),
            local_addr,
            backoff: self.backoff,
        })
    }
}

/// A bound server. Nothing is accepted until [`Server::run`] or
/// [`Server::run_with_shutdown`] is awaited.
pub struct Server<P: Packet> {
    engine: Arc<Engine<P>>,
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    backoff: BackoffConfig,
}

impl<P: Packet> Server<P> {
    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Registry of this server's connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry<P>> { &self.engine.registry }

    /// Aggregate statistics over every connection.
    #[must_use]
    pub fn stats(&self) -> &GroupStat { &self.engine.stats }

    /// Decode error counters and the address blacklist.
    #[must_use]
    pub fn ip_guard(&self) -> &IpGuard { &self.engine.ip_guard }

    /// Normalized configuration in effect.
    #[must_use]
    pub fn config(&self) -> &EngineConfig { &self.engine.config }

    /// Blacklist `ip` and remove its current connections.
    ///
    /// Returns the number of connections removed.
    pub fn blacklist(&self, ip: IpAddr) -> usize {
        self.engine.ip_guard.add(ip);
        let victims = self.engine.registry.by_peer_ip(ip);
        for conn in &victims {
            conn.close_with_request(
                CloseRequest::new("peer blacklisted")
                    .code(CloseCode::IpInBlacklist)
                    .force_remove(),
            );
        }
        victims.len()
    }

    /// Accept connections until Ctrl+C is received.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if the signal handler cannot be installed.
    pub async fn run(&self) -> io::Result<()> {
        let mut failure = None;
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl_c: {e}");
                failure = Some(e);
            }
        })
        .await;
        failure.map_or(Ok(()), Err)
    }

    /// Accept connections until `shutdown` completes, then close every
    /// connection and wait for their tasks.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<F>(&self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let engine = &self.engine;
        let token = CancellationToken::new();
        info!(
            "server listening: name={}, addr={}, tls={}",
            engine.config.name,
            self.local_addr,
            engine.tls.is_some()
        );
        engine.tracker.spawn_on(
            heartbeat::run(Arc::clone(engine), token.clone()),
            &engine.runtime,
        );

        tokio::select! {
            () = shutdown => info!("shutdown requested: name={}", engine.config.name),
            () = accept::accept_loop(
                Arc::clone(&self.listener),
                Arc::clone(engine),
                token.clone(),
                self.backoff,
            ) => {}
        }

        token.cancel();
        engine.shutdown("server stopped").await;
        info!("server stopped: name={}", engine.config.name);
    }
}
