//! TLS material for servers and clients.

use std::sync::Arc;

use rustls::{
    ClientConfig,
    RootCertStore,
    ServerConfig,
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer},
};

use super::{TlsError, TlsSession};

fn provider() -> Arc<CryptoProvider> { Arc::new(ring::default_provider()) }

/// Server side TLS settings.
#[derive(Clone, Debug)]
pub struct TlsServerConfig {
    config: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// Use an existing rustls configuration.
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self { Self { config } }

    /// Build a configuration presenting `cert_chain` without client
    /// authentication.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Config`] if rustls rejects the key or chain.
    pub fn from_der(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Config)?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(TlsError::Config)?;
        Ok(Self::new(Arc::new(config)))
    }

    pub(crate) fn session(&self) -> Result<TlsSession, TlsError> {
        TlsSession::server(Arc::clone(&self.config))
    }
}

/// Client side TLS settings.
///
/// The SNI host defaults to the host of the connect target. Set it
/// explicitly with [`TlsClientConfig::server_name`] when the target differs
/// from the name on the certificate, for example behind a proxy.
#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    config: Arc<ClientConfig>,
    server_name: Option<String>,
}

impl TlsClientConfig {
    /// Use an existing rustls configuration.
    #[must_use]
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Build a configuration trusting `roots`.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::Config`] if no protocol version is usable.
    pub fn with_root_certificates(roots: RootCertStore) -> Result<Self, TlsError> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(TlsError::Config)?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::new(Arc::new(config)))
    }

    /// Override the SNI host.
    #[must_use]
    pub fn server_name(mut self, host: impl Into<String>) -> Self {
        self.server_name = Some(host.into());
        self
    }

    /// SNI host: the per-connection override, then the configured
    /// override, then the connect target.
    pub(crate) fn sni_host<'a>(&'a self, explicit: Option<&'a str>, target_host: &'a str) -> &'a str {
        explicit
            .or(self.server_name.as_deref())
            .unwrap_or(target_host)
    }

    pub(crate) fn session(
        &self,
        explicit: Option<&str>,
        target_host: &str,
    ) -> Result<TlsSession, TlsError> {
        TlsSession::client(Arc::clone(&self.config), self.sni_host(explicit, target_host))
    }
}

/// TLS role of an engine.
#[derive(Clone, Debug)]
pub(crate) enum TlsSettings {
    Server(TlsServerConfig),
    Client(TlsClientConfig),
}
