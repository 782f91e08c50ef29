//! Streaming file bodies.

use std::{io, path::Path};

use tokio::{fs::File, io::AsyncReadExt};

use super::Connection;
use crate::packet::Packet;

/// Bytes read from disk per write.
pub(crate) const FILE_CHUNK_SIZE: usize = 64 * 1024;

impl<P: Packet> Connection<P> {
    /// Stream the file at `path` after an already written header. Chunks are
    /// encrypted when the connection runs over TLS. Returns the number of
    /// plaintext bytes sent.
    pub(crate) async fn write_file(&self, path: &Path) -> io::Result<u64> {
        let mut file = File::open(path).await?;
        let backoff = self.engine().config.write_backoff;
        let mut buf = vec![0; FILE_CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            let chunk = &buf[..n];
            match self.seal(chunk).map_err(io::Error::other)? {
                Some(sealed) => self.write_all(&sealed, Some(&backoff)).await?,
                None => self.write_all(chunk, Some(&backoff)).await?,
            }
            total += n as u64;
        }
    }
}
