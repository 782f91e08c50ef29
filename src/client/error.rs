//! Error types for client operations.

use std::{io, time::Duration};

use super::ProxyError;
use crate::{node::Node, tls::TlsError};

/// Errors emitted by [`crate::client::Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket creation, binding or connecting failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// The host name did not resolve to any address.
    #[error("could not resolve {0}")]
    Unresolved(Node),
    /// The TCP connect or proxy negotiation took too long.
    #[error("connecting to {server} timed out after {timeout:?}")]
    Timeout {
        /// Target of the attempt.
        server: Node,
        /// Configured limit.
        timeout: Duration,
    },
    /// The proxy refused or failed the tunnel.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    /// The TLS session could not be created.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The connection was removed while the attempt was in flight.
    #[error("connection was removed")]
    Removed,
}
