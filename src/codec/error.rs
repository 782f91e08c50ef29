//! Error types for packet codecs.
//!
//! Codec failures split into framing errors (the byte stream cannot be cut
//! into packets), protocol errors (a packet was cut but its content is
//! invalid) and transport errors. Framing and protocol errors are the
//! "decode class" that counts against the peer address.

use std::io;

use thiserror::Error;

/// Errors raised while locating packet boundaries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// A packet exceeds the codec's maximum length.
    #[error("packet too large: {size} bytes exceeds maximum of {max} bytes")]
    OversizedFrame {
        /// Declared or observed size of the packet.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// The length header is malformed.
    #[error("invalid length encoding: declared {declared} bytes, header needs {minimum}")]
    InvalidLengthEncoding {
        /// Length found in the header.
        declared: usize,
        /// Smallest value the header may carry.
        minimum: usize,
    },

    /// The packet content is not valid for the codec.
    #[error("malformed packet: {0}")]
    Malformed(String),
}

/// Top-level codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The byte stream could not be split into packets.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A packet was extracted but its content violates the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether the error belongs to the decode class counted per peer
    /// address by the blacklist.
    ///
    /// ```
    /// use wirelink::codec::{CodecError, FramingError};
    ///
    /// let err = CodecError::Framing(FramingError::Malformed("bad".into()));
    /// assert!(err.is_protocol());
    /// assert!(!CodecError::Io(std::io::Error::other("reset")).is_protocol());
    /// ```
    #[must_use]
    pub fn is_protocol(&self) -> bool { matches!(self, Self::Framing(_) | Self::Protocol(_)) }

    /// Whether the failure is a packet exceeding the configured maximum.
    #[must_use]
    pub fn is_oversized(&self) -> bool {
        matches!(self, Self::Framing(FramingError::OversizedFrame { .. }))
    }

    /// Error category for logging and metrics: `framing`, `protocol` or `io`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CodecError::Framing(FramingError::OversizedFrame { size: 10, max: 5 }), "framing", true)]
    #[case(CodecError::Protocol("bad tag".into()), "protocol", true)]
    #[case(CodecError::Io(io::Error::other("reset")), "io", false)]
    fn classifies_errors(#[case] err: CodecError, #[case] kind: &str, #[case] protocol: bool) {
        assert_eq!(err.error_type(), kind);
        assert_eq!(err.is_protocol(), protocol);
    }

    #[test]
    fn converts_to_invalid_data() {
        let err: io::Error = CodecError::Protocol("bad".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
