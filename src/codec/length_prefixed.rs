//! Length-prefixed binary codec.
//!
//! Wire layout: a big-endian `u32` length followed by that many bytes. The
//! first eight bytes of the payload carry the correlation identifier (zero
//! when absent); the rest is the frame body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecError, Frame, FramingError, PacketCodec, clamp_frame_length};
use crate::{connection::Connection, correlation::CorrelatableFrame};

/// Size of the length header in bytes.
pub const LENGTH_HEADER_SIZE: usize = 4;
const CORRELATION_SIZE: usize = 8;
const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Codec for `u32` length-prefixed [`Frame`]s.
///
/// Once the header of a packet is available the codec records the full
/// packet size as the connection's decode hint.
///
/// ```
/// use wirelink::codec::LengthPrefixedCodec;
///
/// let codec = LengthPrefixedCodec::new(1);
/// assert_eq!(codec.max_frame_length(), wirelink::codec::MIN_FRAME_LENGTH);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct LengthPrefixedCodec {
    max_frame_length: usize,
}

impl LengthPrefixedCodec {
    /// Create a codec accepting payloads up to `max_frame_length` bytes.
    ///
    /// The value is clamped to
    /// [`MIN_FRAME_LENGTH`](super::MIN_FRAME_LENGTH)..=[`MAX_FRAME_LENGTH`](super::MAX_FRAME_LENGTH).
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
        }
    }

    /// Maximum accepted payload length.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

impl PacketCodec for LengthPrefixedCodec {
    type Packet = Frame;

    fn decode(
        &self,
        src: &mut BytesMut,
        conn: &Connection<Frame>,
    ) -> Result<Option<Frame>, CodecError> {
        if src.len() < LENGTH_HEADER_SIZE {
            return Ok(None);
        }
        let declared = (&src[..LENGTH_HEADER_SIZE]).get_u32() as usize;
        if declared < CORRELATION_SIZE {
            return Err(FramingError::InvalidLengthEncoding {
                declared,
                minimum: CORRELATION_SIZE,
            }
            .into());
        }
        if declared > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: declared,
                max: self.max_frame_length,
            }
            .into());
        }
        let total = LENGTH_HEADER_SIZE + declared;
        if src.len() < total {
            conn.set_packet_needed_length(Some(total));
            return Ok(None);
        }

        let mut packet = src.split_to(total);
        packet.advance(LENGTH_HEADER_SIZE);
        let correlation = packet.get_u64();
        let mut frame = Frame::new(packet.freeze());
        frame.set_correlation_id((correlation != 0).then_some(correlation));
        Ok(Some(frame))
    }

    fn encode(&self, packet: &Frame, _conn: &Connection<Frame>) -> Result<Bytes, CodecError> {
        let declared = CORRELATION_SIZE + packet.body().len();
        if declared > self.max_frame_length {
            return Err(FramingError::OversizedFrame {
                size: declared,
                max: self.max_frame_length,
            }
            .into());
        }
        let header = u32::try_from(declared).map_err(|_| FramingError::OversizedFrame {
            size: declared,
            max: self.max_frame_length,
        })?;
        let mut dst = BytesMut::with_capacity(LENGTH_HEADER_SIZE + declared);
        dst.put_u32(header);
        dst.put_u64(packet.correlation_id().unwrap_or(0));
        dst.put_slice(packet.body());
        Ok(dst.freeze())
    }
}
