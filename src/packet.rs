//! Application packets and the outbound message envelope.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::correlation::CorrelatableFrame;

/// Application message type handled by the engine.
pub trait Packet: CorrelatableFrame + Send + Sync + 'static {
    /// Whether the connection stays open after this packet is written or
    /// handled. Defaults to `true`.
    fn keep_connection(&self) -> bool { true }
}

pub(crate) enum Body<P> {
    Packet(P),
    Encoded(Bytes),
    /// Pending TLS records produced by the handshake.
    TlsFlush,
}

/// A message queued on a connection's send pipeline.
///
/// Usually built implicitly from a packet (`conn.send(packet)`), or from
/// pre-encoded bytes with [`Outbound::encoded`].
pub struct Outbound<P> {
    pub(crate) body: Body<P>,
    keep_connection: bool,
    tls_encrypted: bool,
    completion: Option<oneshot::Sender<bool>>,
    file_body: Option<PathBuf>,
    byte_count: usize,
}

impl<P: Packet> Outbound<P> {
    /// Wrap a packet for sending.
    #[must_use]
    pub fn new(packet: P) -> Self {
        let keep_connection = packet.keep_connection();
        Self::with_body(Body::Packet(packet), keep_connection)
    }
}

impl<P> Outbound<P> {
    fn with_body(body: Body<P>, keep_connection: bool) -> Self {
        Self {
            body,
            keep_connection,
            tls_encrypted: false,
            completion: None,
            file_body: None,
            byte_count: 0,
        }
    }

    /// Send bytes that are already encoded by the application.
    #[must_use]
    pub fn encoded(bytes: impl Into<Bytes>) -> Self {
        Self::with_body(Body::Encoded(bytes.into()), true)
    }

    pub(crate) fn tls_flush() -> Self {
        let mut out = Self::with_body(Body::TlsFlush, true);
        out.tls_encrypted = true;
        out
    }

    /// Override whether the connection stays open after this message.
    #[must_use]
    pub fn keep_connection(mut self, keep: bool) -> Self {
        self.keep_connection = keep;
        self
    }

    /// Mark pre-encoded bytes as already encrypted for the TLS session.
    #[must_use]
    pub fn already_encrypted(mut self) -> Self {
        self.tls_encrypted = true;
        self
    }

    /// Stream the file at `path` after the encoded message.
    #[must_use]
    pub fn with_file_body(mut self, path: impl AsRef<Path>) -> Self {
        self.file_body = Some(path.as_ref().to_path_buf());
        self
    }

    /// The packet carried by this message, if it was built from one.
    #[must_use]
    pub fn packet(&self) -> Option<&P> {
        match &self.body {
            Body::Packet(p) => Some(p),
            Body::Encoded(_) | Body::TlsFlush => None,
        }
    }

    /// Number of bytes the message occupied on the wire once encoded.
    #[must_use]
    pub fn byte_count(&self) -> usize { self.byte_count }

    /// Whether the connection stays open after this message is written.
    #[must_use]
    pub fn keeps_connection(&self) -> bool { self.keep_connection }

    /// Whether the payload bypasses TLS encryption.
    #[must_use]
    pub fn is_tls_encrypted(&self) -> bool { self.tls_encrypted }

    pub(crate) fn is_tls_flush(&self) -> bool { matches!(self.body, Body::TlsFlush) }

    pub(crate) fn file_body(&self) -> Option<&Path> { self.file_body.as_deref() }

    pub(crate) fn set_byte_count(&mut self, count: usize) { self.byte_count = count; }

    pub(crate) fn attach_completion(&mut self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        rx
    }

    /// Signal the sender blocked in `send_sync`, if any. Runs at most once.
    pub(crate) fn complete(&mut self, success: bool) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(success);
        }
    }
}

impl<P: Packet> From<P> for Outbound<P> {
    fn from(packet: P) -> Self { Self::new(packet) }
}

#[cfg(test)]
mod tests {
    use super::Outbound;
    use crate::codec::Frame;

    #[test]
    fn inherits_keep_connection_from_packet() {
        let out = Outbound::new(Frame::new("bye").close_after_send());
        assert!(!out.keeps_connection());
        assert!(out.packet().is_some());
    }

    #[tokio::test]
    async fn completion_fires_once() {
        let mut out = Outbound::<Frame>::encoded("raw");
        let rx = out.attach_completion();
        out.complete(true);
        out.complete(false);
        assert_eq!(rx.await.ok(), Some(true));
    }

    #[test]
    fn flush_marker_is_pre_encrypted() {
        let out = Outbound::<Frame>::tls_flush();
        assert!(out.is_tls_flush());
        assert!(out.is_tls_encrypted());
    }
}
