//! Errors shared across the engine.
//!
//! Layer specific errors live next to their layer: [`crate::codec::CodecError`],
//! [`crate::tls::TlsError`], [`crate::client::ClientError`],
//! [`crate::client::ProxyError`] and [`crate::server::ServerError`].

use std::time::Duration;

use thiserror::Error;

use crate::{codec::CodecError, tls::TlsError};

/// Failure of the incremental decode loop. Always closes the connection
/// with [`CloseCode::DecodeError`](crate::CloseCode::DecodeError).
#[derive(Debug, Error)]
pub enum DecodeLoopError {
    /// The peer keeps sending fragments too small to ever form a packet.
    #[error(
        "failed to decode {failures} times in a row, averaging {average} bytes per attempt; \
         possible slow attack"
    )]
    SlowAttack {
        /// Consecutive decode attempts without a packet.
        failures: usize,
        /// Readable bytes divided by `failures`.
        average: usize,
    },

    /// The codec rejected the bytes.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl DecodeLoopError {
    /// Whether the failure counts against the peer address.
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        match self {
            Self::SlowAttack { .. } => true,
            Self::Codec(e) => e.is_protocol(),
        }
    }
}

/// Failure of [`Connection::call`](crate::Connection::call).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The connection refused the request because it is closing or closed.
    #[error("connection is not active")]
    Rejected,
    /// No correlated response arrived in time.
    #[error("no response within {0:?}")]
    Timeout(Duration),
    /// The connection closed before the response arrived.
    #[error("connection closed while waiting for the response")]
    Closed,
}

/// Failure to attach a socket to a connection.
#[derive(Debug, Error)]
pub(crate) enum ActivateError {
    /// The TLS session could not be created.
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// The connection was removed before the socket could be attached.
    #[error("connection was removed")]
    Removed,
}

/// Builder misconfiguration.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No Tokio runtime is available on the calling thread.
    #[error("a Tokio runtime is required: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

#[cfg(test)]
mod tests {
    use super::DecodeLoopError;
    use crate::{codec::CodecError, tls::TlsError};

    #[test]
    fn slow_attacks_count_against_peer() {
        let err = DecodeLoopError::SlowAttack {
            failures: 11,
            average: 1,
        };
        assert!(err.is_protocol());
        assert!(err.to_string().contains("slow attack"));
    }

    #[test]
    fn io_failures_do_not_count_against_peer() {
        let err = DecodeLoopError::from(CodecError::Io(std::io::Error::other("reset")));
        assert!(!err.is_protocol());
    }
}
