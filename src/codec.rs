//! Packet codecs.
//!
//! A [`PacketCodec`] turns the raw byte stream of a connection into
//! application packets and back. Decoding is incremental: the codec inspects
//! the accumulated window and either consumes exactly one packet from its
//! front or leaves the window untouched and returns `Ok(None)`. When the codec
//! already knows how many bytes the pending packet needs it records that
//! length with [`Connection::set_packet_needed_length`] so the decode loop can
//! skip pointless attempts until enough data has arrived.
//!
//! Two codecs ship with the crate: [`LengthPrefixedCodec`] for binary
//! protocols and [`LineCodec`] for newline delimited text. Both produce
//! [`Frame`] packets.

use bytes::{Bytes, BytesMut};

use crate::{connection::Connection, correlation::CorrelatableFrame, packet::Packet};

pub mod error;
mod length_prefixed;
mod line;

pub use error::{CodecError, FramingError};
pub use length_prefixed::{LENGTH_HEADER_SIZE, LengthPrefixedCodec};
pub use line::LineCodec;

/// Smallest accepted maximum packet length.
pub const MIN_FRAME_LENGTH: usize = 64;
/// Largest accepted maximum packet length.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Application protocol codec consumed by the engine.
///
/// Implementations must be stateless with respect to a single connection's
/// byte stream: the leftover window belongs to the engine, and any
/// per-connection state lives on the [`Connection`] (its properties or its
/// decode hint).
pub trait PacketCodec: Send + Sync + 'static {
    /// Packet type produced and consumed by the codec.
    type Packet: Packet;

    /// Try to decode one packet from the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` does not yet
    /// hold a complete packet.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the bytes can never form a valid packet.
    fn decode(
        &self,
        src: &mut BytesMut,
        conn: &Connection<Self::Packet>,
    ) -> Result<Option<Self::Packet>, CodecError>;

    /// Encode `packet` into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the packet cannot be represented.
    fn encode(
        &self,
        packet: &Self::Packet,
        conn: &Connection<Self::Packet>,
    ) -> Result<Bytes, CodecError>;
}

/// Generic packet produced by the bundled codecs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    correlation_id: Option<u64>,
    keep_connection: bool,
    body: Bytes,
}

impl Frame {
    /// Create a frame carrying `body`.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: None,
            keep_connection: true,
            body: body.into(),
        }
    }

    /// Attach a correlation identifier.
    #[must_use]
    pub fn with_correlation_id(mut self, id: u64) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Close the connection once this frame has been written.
    #[must_use]
    pub fn close_after_send(mut self) -> Self {
        self.keep_connection = false;
        self
    }

    /// Payload of the frame.
    #[must_use]
    pub fn body(&self) -> &Bytes { &self.body }

    /// Consume the frame and return its payload.
    #[must_use]
    pub fn into_body(self) -> Bytes { self.body }
}

impl CorrelatableFrame for Frame {
    fn correlation_id(&self) -> Option<u64> { self.correlation_id }

    fn set_correlation_id(&mut self, correlation_id: Option<u64>) {
        self.correlation_id = correlation_id;
    }
}

impl Packet for Frame {
    fn keep_connection(&self) -> bool { self.keep_connection }
}

#[cfg(test)]
mod tests;
