//! Errors raised by [`Server`](super::Server) operations.

use std::io;

use thiserror::Error;

use crate::error::BuildError;

/// Errors that may occur while binding or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[from] io::Error),
    /// The server was built outside a Tokio runtime.
    #[error(transparent)]
    Build(#[from] BuildError),
}
