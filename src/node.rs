//! Network endpoint addressed by host name and port.

use std::{fmt, str::FromStr};

use thiserror::Error;

/// A `host:port` pair. The host may be a DNS name or an IP literal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    host: String,
    port: u16,
}

impl Node {
    /// Create a node. An empty host means every local interface.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = if host.trim().is_empty() {
            "0.0.0.0".to_owned()
        } else {
            host
        };
        Self { host, port }
    }

    /// Host name or IP literal.
    #[must_use]
    pub fn host(&self) -> &str { &self.host }

    /// Port number.
    #[must_use]
    pub fn port(&self) -> u16 { self.port }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Error parsing a [`Node`] from a string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid node {0:?}: expected host:port")]
pub struct ParseNodeError(String);

impl FromStr for Node {
    type Err = ParseNodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseNodeError(s.to_owned()))?;
        let port = port.parse().map_err(|_| ParseNodeError(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Node {
    fn from(addr: std::net::SocketAddr) -> Self { Self::new(addr.ip().to_string(), addr.port()) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::Node;

    #[rstest]
    #[case("example.com:443", "example.com", 443)]
    #[case("127.0.0.1:8080", "127.0.0.1", 8080)]
    #[case("[::1]:9000", "::1", 9000)]
    fn parses_host_and_port(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let node: Node = input.parse().expect("valid node");
        assert_eq!(node.host(), host);
        assert_eq!(node.port(), port);
        assert_eq!(node.to_string(), input);
    }

    #[rstest]
    #[case("example.com")]
    #[case("example.com:http")]
    fn rejects_malformed_input(#[case] input: &str) {
        assert!(input.parse::<Node>().is_err());
    }

    #[test]
    fn blank_host_means_any_interface() {
        assert_eq!(Node::new(" ", 80).host(), "0.0.0.0");
    }
}
