//! Sockets and raw wire helpers.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener},
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Shared result type for integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Create a TCP listener bound to a free local port.
///
/// # Errors
///
/// Returns any IO error encountered while binding to an ephemeral localhost
/// port.
pub fn unused_listener() -> io::Result<StdTcpListener> {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr)
}

/// Bytes a [`LengthPrefixedCodec`](wirelink::LengthPrefixedCodec) peer
/// expects for a frame with `correlation` (zero for none) and `body`.
#[must_use]
pub fn encode_frame(correlation: u64, body: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::with_capacity(12 + body.len());
    dst.put_u32(u32::try_from(8 + body.len()).unwrap_or(u32::MAX));
    dst.put_u64(correlation);
    dst.put_slice(body);
    dst.to_vec()
}

/// Read one length-prefixed frame and return its correlation and body.
///
/// # Errors
///
/// Returns any IO error from the stream, or [`io::ErrorKind::InvalidData`]
/// when the declared length cannot hold a correlation identifier.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<(u64, Vec<u8>)> {
    let declared = stream.read_u32().await? as usize;
    if declared < 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared length {declared} is too short"),
        ));
    }
    let correlation = stream.read_u64().await?;
    let mut body = vec![0; declared - 8];
    stream.read_exact(&mut body).await?;
    Ok((correlation, body))
}
