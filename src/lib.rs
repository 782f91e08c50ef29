#![doc(html_root_url = "https://docs.rs/wirelink/latest")]
//! Public API for the `wirelink` library.
//!
//! `wirelink` is a TCP communication engine for long-lived connections. A
//! [`Server`] or [`Client`] owns a codec turning bytes into packets, a handler
//! receiving every decoded packet and an optional listener observing the
//! connection lifecycle. Connections can be addressed by user, token, group
//! or peer address through the shared [`ConnectionRegistry`], run over TLS,
//! and, on the client side, be reconnected when the link drops.

pub mod close;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
mod engine;
pub mod error;
pub mod hooks;
pub mod ip;
pub mod metrics;
pub mod node;
pub mod packet;
pub mod registry;
pub mod stats;
pub mod tls;

pub mod client;
pub mod server;

pub use client::{Client, ClientBuilder, ClientError, ConnectOptions, ProxyConfig, ProxyKind};
pub use close::{CloseCode, CloseMeta, CloseRequest};
pub use codec::{CodecError, Frame, LengthPrefixedCodec, LineCodec, PacketCodec};
pub use config::{BackoffConfig, EngineConfig, ReconnectConfig};
pub use connection::{Connection, ConnectionId, ConnectionState, Role};
pub use correlation::CorrelatableFrame;
pub use error::{BuildError, CallError, DecodeLoopError};
pub use hooks::{ConnectionListener, PacketHandler};
pub use ip::IpGuard;
pub use node::Node;
pub use packet::{Outbound, Packet};
pub use registry::ConnectionRegistry;
pub use server::{Server, ServerBuilder, ServerError};
pub use stats::{ConnectionStats, GroupStat};
pub use tls::{HandshakePhase, TlsClientConfig, TlsError, TlsServerConfig};
