//! Close codes and close metadata.
//!
//! Every teardown carries a [`CloseCode`]. The numeric values are stable and
//! are exposed to observers so that they can be logged or forwarded to other
//! systems unchanged.

use std::fmt;

/// Reason a connection was torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// No reason was supplied.
    NoCode,
    /// Reading from the socket failed.
    ReadError,
    /// Writing to the socket failed.
    WriteError,
    /// The codec rejected the inbound bytes or the peer trickled data.
    DecodeError,
    /// The socket was found closed before an I/O operation.
    ChannelNotOpen,
    /// A read completed with zero bytes.
    ReadCountIsZero,
    /// The peer closed its side of the connection.
    ClosedByPeer,
    /// A read completed with a negative length.
    ReadCountIsNegative,
    /// A write completed without transferring any bytes.
    WriteCountIsNegative,
    /// No traffic was observed within the heartbeat timeout.
    HeartbeatTimeout,
    /// The TLS handshake failed.
    TlsHandshakeError,
    /// The TLS peer sent `close_notify`.
    TlsSessionClosed,
    /// Encrypting outbound data failed.
    TlsEncryptionError,
    /// Decrypting inbound data failed.
    TlsDecryptError,
    /// A client connection could not be established.
    ClientConnectionFail,
    /// Application defined code in the range `100..=110`.
    User(u8),
    /// Initial value before any close happened.
    InitStatus,
    /// Any other failure.
    OtherError,
    /// A packet exceeded the configured maximum length.
    PacketTooLarge,
    /// Closed because of an application error.
    CloseByError,
    /// The peer address is blacklisted.
    IpInBlacklist,
}

impl CloseCode {
    /// First value reserved for application codes.
    pub const USER_MIN: u8 = 100;
    /// Last value reserved for application codes.
    pub const USER_MAX: u8 = 110;

    /// Stable numeric value of this code.
    ///
    /// ```
    /// use wirelink::CloseCode;
    ///
    /// assert_eq!(CloseCode::ClosedByPeer.value(), 7);
    /// assert_eq!(CloseCode::User(3).value(), 103);
    /// ```
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::NoCode => 1,
            Self::ReadError => 2,
            Self::WriteError => 3,
            Self::DecodeError => 4,
            Self::ChannelNotOpen => 5,
            Self::ReadCountIsZero => 6,
            Self::ClosedByPeer => 7,
            Self::ReadCountIsNegative => 8,
            Self::WriteCountIsNegative => 9,
            Self::HeartbeatTimeout => 10,
            Self::TlsHandshakeError => 50,
            Self::TlsSessionClosed => 51,
            Self::TlsEncryptionError => 52,
            Self::TlsDecryptError => 53,
            Self::ClientConnectionFail => 80,
            Self::User(n) => Self::USER_MIN + n.min(Self::USER_MAX - Self::USER_MIN),
            Self::InitStatus => 199,
            Self::OtherError => 200,
            Self::PacketTooLarge => 201,
            Self::CloseByError => 202,
            Self::IpInBlacklist => 203,
        }
    }

    /// Look up a code from its numeric value.
    #[must_use]
    pub fn from_value(value: u8) -> Option<Self> {
        let code = match value {
            1 => Self::NoCode,
            2 => Self::ReadError,
            3 => Self::WriteError,
            4 => Self::DecodeError,
            5 => Self::ChannelNotOpen,
            6 => Self::ReadCountIsZero,
            7 => Self::ClosedByPeer,
            8 => Self::ReadCountIsNegative,
            9 => Self::WriteCountIsNegative,
            10 => Self::HeartbeatTimeout,
            50 => Self::TlsHandshakeError,
            51 => Self::TlsSessionClosed,
            52 => Self::TlsEncryptionError,
            53 => Self::TlsDecryptError,
            80 => Self::ClientConnectionFail,
            Self::USER_MIN..=Self::USER_MAX => Self::User(value - Self::USER_MIN),
            199 => Self::InitStatus,
            200 => Self::OtherError,
            201 => Self::PacketTooLarge,
            202 => Self::CloseByError,
            203 => Self::IpInBlacklist,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.value())
    }
}

/// Parameters of a single close request.
///
/// Built with [`CloseRequest::new`] and the chained setters; passed to
/// [`crate::Connection::close_with_request`].
#[derive(Clone, Debug)]
pub struct CloseRequest {
    pub(crate) code: Option<CloseCode>,
    pub(crate) remark: String,
    pub(crate) cause: Option<String>,
    pub(crate) force_remove: bool,
}

impl CloseRequest {
    /// Create a request carrying only a remark.
    #[must_use]
    pub fn new(remark: impl Into<String>) -> Self {
        Self {
            code: None,
            remark: remark.into(),
            cause: None,
            force_remove: false,
        }
    }

    /// Attach a close code.
    #[must_use]
    pub fn code(mut self, code: CloseCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the error that caused the close.
    #[must_use]
    pub fn cause(mut self, cause: &dyn std::error::Error) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Purge the connection from every registry even when it could be
    /// reconnected.
    #[must_use]
    pub fn force_remove(mut self) -> Self {
        self.force_remove = true;
        self
    }
}

/// Metadata recorded by the most recent close.
#[derive(Clone, Debug, Default)]
pub struct CloseMeta {
    /// Free form remark supplied by the closer.
    pub remark: String,
    /// Rendered error that triggered the close, if any.
    pub cause: Option<String>,
    /// Whether the connection was purged from the registries.
    pub need_remove: bool,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::CloseCode;

    #[rstest]
    #[case(CloseCode::NoCode)]
    #[case(CloseCode::WriteError)]
    #[case(CloseCode::TlsSessionClosed)]
    #[case(CloseCode::User(0))]
    #[case(CloseCode::User(10))]
    #[case(CloseCode::IpInBlacklist)]
    fn values_are_stable_and_reversible(#[case] code: CloseCode) {
        assert_eq!(CloseCode::from_value(code.value()), Some(code));
    }

    #[test]
    fn unknown_values_are_rejected() {
        assert_eq!(CloseCode::from_value(0), None);
        assert_eq!(CloseCode::from_value(111), None);
    }

    #[test]
    fn user_codes_saturate() {
        assert_eq!(CloseCode::User(42).value(), CloseCode::USER_MAX);
    }
}
