//! Builder for [`Client`].

use std::{sync::Arc, time::Duration};

use tokio::runtime::Handle;

use super::{Client, DEFAULT_CONNECT_TIMEOUT, ProxyConfig, Reconnector};
use crate::{
    codec::PacketCodec,
    config::{EngineConfig, ReconnectConfig, engine_builder_setters},
    connection::Role,
    engine::{Engine, EngineParts},
    error::BuildError,
    hooks::{ConnectionListener, NoopListener, PacketHandler},
    packet::Packet,
    registry::ConnectionRegistry,
    tls::{TlsClientConfig, TlsSettings},
};

/// Configures and builds a [`Client`].
///
/// ```no_run
/// use std::time::Duration;
///
/// use wirelink::{
///     ClientBuilder,
///     Connection,
///     Frame,
///     LengthPrefixedCodec,
///     Node,
///     ReconnectConfig,
///     hooks::{FnHandler, HandlerError},
/// };
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClientBuilder::new(
///     LengthPrefixedCodec::default(),
///     FnHandler::new(|frame: Frame, _conn: Connection<Frame>| async move {
///         println!("received {} bytes", frame.body().len());
///         Ok::<_, HandlerError>(())
///     }),
/// )
/// .reconnect(ReconnectConfig::new(Duration::from_secs(1), 0))
/// .build()?;
/// let conn = client.connect(Node::new("127.0.0.1", 7000)).await?;
/// conn.send(Frame::new("hello"));
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder<P: Packet> {
    config: EngineConfig,
    codec: Arc<dyn PacketCodec<Packet = P>>,
    handler: Arc<dyn PacketHandler<P>>,
    listener: Arc<dyn ConnectionListener<P>>,
    registry: Arc<ConnectionRegistry<P>>,
    tls: Option<TlsClientConfig>,
    reconnect: Option<ReconnectConfig>,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl<P: Packet> ClientBuilder<P> {
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
            reconnect: None,
            proxy: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    engine_builder_setters!();

    /// Run connections over TLS.
    #[must_use]
    pub fn tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Reconnect closed connections with `policy`.
    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectConfig) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Dial servers through `proxy`.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Limit of a connect attempt, proxy negotiation included.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the client on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::NoRuntime`] when called outside a runtime.
    pub fn build(self) -> Result<Client<P>, BuildError> {
        let runtime = Handle::try_current()?;
        let engine = Engine::new(EngineParts {
            config: self.config,
            role: Role::Client,
            codec: self.codec,
            handler: self.handler,
            listener: self.listener,
            registry: self.registry,
            tls: self.tls.map(TlsSettings::Client),
            reconnector: self.reconnect.map(Reconnector::new),
            runtime,
        });
        Ok(Client {
            engine,
            proxy: self.proxy,
            connect_timeout: self.connect_timeout,
        })
    }
}
