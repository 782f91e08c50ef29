//! TLS layer.
//!
//! Built on the sans-I/O [`rustls::Connection`]: the engine owns the socket,
//! feeds received ciphertext into the session and writes whatever records the
//! session produces. The handshake is driven by a small status machine; see
//! [`HandshakePhase`] for the externally visible states.

use std::io;

use thiserror::Error;

use crate::close::CloseCode;

mod config;
mod session;

pub(crate) use config::TlsSettings;
pub use config::{TlsClientConfig, TlsServerConfig};
pub use session::HandshakePhase;
pub(crate) use session::{TlsEvents, TlsSession};

/// Errors raised by the TLS layer.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] rustls::Error),

    /// Received records could not be decrypted.
    #[error("TLS decrypt failed: {0}")]
    Decrypt(#[source] rustls::Error),

    /// Outbound plaintext could not be encrypted.
    #[error("TLS encryption failed: {0}")]
    Encrypt(#[source] io::Error),

    /// Application data was offered before the handshake completed.
    #[error("TLS session is not established")]
    NotEstablished,

    /// The SNI host is not a valid DNS name or IP address.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// The rustls configuration was rejected.
    #[error("TLS configuration error: {0}")]
    Config(#[source] rustls::Error),
}

impl TlsError {
    /// Close code used when this error tears a connection down.
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::Handshake(_) | Self::InvalidServerName(_) | Self::Config(_) => {
                CloseCode::TlsHandshakeError
            }
            Self::Decrypt(_) => CloseCode::TlsDecryptError,
            Self::Encrypt(_) | Self::NotEstablished => CloseCode::TlsEncryptionError,
        }
    }
}
