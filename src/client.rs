//! Client side of the engine.
//!
//! A [`Client`] opens connections to servers and owns the state they share:
//! codec, handler, listener, registry and statistics. Connections closed
//! without being removed are reconnected when a [`ReconnectConfig`] is set.
//!
//! [`ReconnectConfig`]: crate::config::ReconnectConfig

use std::{net::SocketAddr, sync::Arc, time::Duration};

use log::warn;

mod builder;
mod connect;
mod error;
mod proxy;
mod reconnect;

pub use builder::ClientBuilder;
pub use error::ClientError;
pub use proxy::{ProxyConfig, ProxyError, ProxyKind};
pub(crate) use reconnect::Reconnector;

use crate::{
    config::EngineConfig,
    connection::Connection,
    engine::Engine,
    node::Node,
    packet::Packet,
    registry::ConnectionRegistry,
    stats::GroupStat,
};

/// Default limit of a connect attempt, proxy negotiation included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to dial a server again.
#[derive(Clone, Debug)]
pub(crate) struct ConnectTarget {
    pub(crate) server: Node,
    pub(crate) bind: Option<SocketAddr>,
    pub(crate) tls_host: Option<String>,
    pub(crate) proxy: Option<ProxyConfig>,
    pub(crate) timeout: Duration,
}

/// Per-connection options of [`Client::connect_with`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    server: Node,
    bind: Option<SocketAddr>,
    tls_host: Option<String>,
    timeout: Option<Duration>,
}

impl ConnectOptions {
    /// Connect to `server`.
    #[must_use]
    pub fn new(server: Node) -> Self {
        Self {
            server,
            bind: None,
            tls_host: None,
            timeout: None,
        }
    }

    /// Bind the local end of the socket to `addr` before connecting.
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Host name sent as TLS SNI and verified against the server
    /// certificate. Takes precedence over the client's TLS configuration.
    #[must_use]
    pub fn tls_host(mut self, host: impl Into<String>) -> Self {
        self.tls_host = Some(host.into());
        self
    }

    /// Override the client's connect timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Connection factory sharing one engine.
pub struct Client<P: Packet> {
    engine: Arc<Engine<P>>,
    proxy: Option<ProxyConfig>,
    connect_timeout: Duration,
}

impl<P: Packet> Client<P> {
    /// Connect to `server`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the connect fails and no reconnection is
    /// configured. With reconnection configured a failed first attempt
    /// still returns the (closed) connection, which the reconnector keeps
    /// dialling.
    pub async fn connect(&self, server: Node) -> Result<Connection<P>, ClientError> {
        self.connect_with(ConnectOptions::new(server)).await
    }

    /// Connect with per-connection options.
    ///
    /// # Errors
    ///
    /// See [`Client::connect`].
    pub async fn connect_with(
        &self,
        options: ConnectOptions,
    ) -> Result<Connection<P>, ClientError> {
        let target = ConnectTarget {
            server: options.server,
            bind: options.bind,
            tls_host: options.tls_host,
            proxy: self.proxy.clone(),
            timeout: options.timeout.unwrap_or(self.connect_timeout),
        };
        let conn = Connection::new(&self.engine, Some(target));
        match connect::establish(&conn, false).await {
            Ok(()) => Ok(conn),
            Err(e) => {
                warn!(
                    "connect failed: id={}, server={:?}, error={e}",
                    conn.id(),
                    conn.server_node()
                );
                if conn.on_connect_failed(&e, false) {
                    Ok(conn)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Registry holding this client's connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry<P>> { &self.engine.registry }

    /// Statistics shared by this client's connections.
    #[must_use]
    pub fn stats(&self) -> &GroupStat { &self.engine.stats }

    /// Effective engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig { &self.engine.config }

    /// Remove every connection, cancel pending reconnects and wait for the
    /// connection tasks to finish.
    pub async fn stop(&self) { self.engine.shutdown("client stopped").await; }
}
