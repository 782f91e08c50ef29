//! Newline delimited text codec.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, Frame, FramingError, PacketCodec, clamp_frame_length};
use crate::connection::Connection;

/// Codec splitting the stream on `\n`.
///
/// A trailing `\r` is stripped from each line. The codec never knows the
/// length of a pending line, so it never sets a decode hint.
#[derive(Clone, Copy, Debug)]
pub struct LineCodec {
    max_length: usize,
}

impl LineCodec {
    /// Create a codec rejecting lines longer than `max_length` bytes.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length: clamp_frame_length(max_length),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self { Self::new(8 * 1024) }
}

impl PacketCodec for LineCodec {
    type Packet = Frame;

    fn decode(
        &self,
        src: &mut BytesMut,
        _conn: &Connection<Frame>,
    ) -> Result<Option<Frame>, CodecError> {
        let Some(pos) = src.iter().position(|b| *b == b'\n') else {
            if src.len() > self.max_length {
                return Err(FramingError::OversizedFrame {
                    size: src.len(),
                    max: self.max_length,
                }
                .into());
            }
            return Ok(None);
        };
        if pos > self.max_length {
            return Err(FramingError::OversizedFrame {
                size: pos,
                max: self.max_length,
            }
            .into());
        }
        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }
        Ok(Some(Frame::new(line.freeze())))
    }

    fn encode(&self, packet: &Frame, _conn: &Connection<Frame>) -> Result<Bytes, CodecError> {
        let body = packet.body();
        if body.contains(&b'\n') {
            return Err(FramingError::Malformed("line body contains a newline".into()).into());
        }
        let mut dst = BytesMut::with_capacity(body.len() + 1);
        dst.put_slice(body);
        dst.put_u8(b'\n');
        Ok(dst.freeze())
    }
}
