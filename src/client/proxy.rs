//! Tunnel negotiation with HTTP and SOCKS5 proxies.
//!
//! Negotiation runs on the raw socket before the connection exists, so TLS
//! and the codec only ever see the tunnelled stream.

use std::io;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::node::Node;

/// Upper bound of an HTTP `CONNECT` response header.
const MAX_HTTP_HEADER: usize = 64 * 1024;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_NO_AUTH: u8 = 0x00;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

/// Protocol spoken by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    /// HTTP `CONNECT` tunnel.
    Http,
    /// SOCKS5 without authentication.
    Socks5,
}

/// Proxy a client dials instead of the target server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyConfig {
    addr: Node,
    kind: ProxyKind,
    credentials: Option<(String, String)>,
}

impl ProxyConfig {
    /// HTTP `CONNECT` proxy at `addr`.
    #[must_use]
    pub fn http(addr: Node) -> Self {
        Self {
            addr,
            kind: ProxyKind::Http,
            credentials: None,
        }
    }

    /// SOCKS5 proxy at `addr`.
    #[must_use]
    pub fn socks5(addr: Node) -> Self {
        Self {
            addr,
            kind: ProxyKind::Socks5,
            credentials: None,
        }
    }

    /// Send `Proxy-Authorization: Basic` credentials. Only used by HTTP
    /// proxies.
    #[must_use]
    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// Address of the proxy.
    #[must_use]
    pub fn addr(&self) -> &Node { &self.addr }

    /// Protocol spoken by the proxy.
    #[must_use]
    pub fn kind(&self) -> ProxyKind { self.kind }
}

/// Failure to open a tunnel through a proxy.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Reading from or writing to the proxy failed.
    #[error("proxy i/o error: {0}")]
    Io(#[from] io::Error),
    /// The proxy closed the socket before answering.
    #[error("proxy closed the connection during negotiation")]
    NoResponse,
    /// The HTTP response header exceeded the size limit.
    #[error("proxy CONNECT response header exceeds {MAX_HTTP_HEADER} bytes")]
    HeaderTooLarge,
    /// The HTTP proxy answered with something other than `200`.
    #[error("proxy CONNECT failed: {0}")]
    Rejected(String),
    /// The SOCKS5 proxy did not accept the no-authentication method.
    #[error("socks5 method not accepted: version={version}, method={method}")]
    MethodRejected {
        /// Version byte of the reply.
        version: u8,
        /// Method selected by the proxy.
        method: u8,
    },
    /// The SOCKS5 proxy reported a connect failure.
    #[error("socks5 connect failed: reply={0}")]
    ConnectFailed(u8),
    /// The SOCKS5 reply used an unknown address type.
    #[error("socks5 reply has unknown address type {0}")]
    UnknownAddressType(u8),
    /// The target host does not fit a SOCKS5 domain field.
    #[error("host name too long for socks5: {0} bytes")]
    HostTooLong(usize),
}

/// Open a tunnel to `target` over `stream`.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    proxy: &ProxyConfig,
    target: &Node,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!(
        "negotiating proxy tunnel: proxy={}, kind={:?}, target={target}",
        proxy.addr, proxy.kind
    );
    match proxy.kind {
        ProxyKind::Http => http_connect(stream, target, proxy.credentials.as_ref()).await,
        ProxyKind::Socks5 => socks5_connect(stream, target).await,
    }
}

async fn http_connect<S>(
    stream: &mut S,
    target: &Node,
    credentials: Option<&(String, String)>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some((user, password)) = credentials {
        let token = base64_encode(format!("{user}:{password}").as_bytes());
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte by byte: anything past the header belongs to the tunnel.
    let mut header = Vec::with_capacity(256);
    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_HTTP_HEADER {
            return Err(ProxyError::HeaderTooLarge);
        }
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await? == 0 {
            return Err(ProxyError::NoResponse);
        }
        header.push(byte[0]);
    }
    let header = String::from_utf8_lossy(&header[..header.len() - 4]).into_owned();
    let status = header.lines().next().unwrap_or_default();
    if !status.starts_with("HTTP/") || !format!("{status} ").contains(" 200 ") {
        return Err(ProxyError::Rejected(header));
    }
    Ok(())
}

async fn socks5_connect<S>(stream: &mut S, target: &Node) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    read_exact(stream, &mut choice).await?;
    if choice != [SOCKS_VERSION, SOCKS_NO_AUTH] {
        return Err(ProxyError::MethodRejected {
            version: choice[0],
            method: choice[1],
        });
    }

    let host = target.host().as_bytes();
    let host_len = u8::try_from(host.len()).map_err(|_| ProxyError::HostTooLong(host.len()))?;
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[
        SOCKS_VERSION,
        SOCKS_CMD_CONNECT,
        0x00,
        SOCKS_ATYP_DOMAIN,
        host_len,
    ]);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    read_exact(stream, &mut reply).await?;
    if reply[0] != SOCKS_VERSION || reply[1] != 0x00 {
        return Err(ProxyError::ConnectFailed(reply[1]));
    }
    let addr_len = match reply[3] {
        SOCKS_ATYP_IPV4 => 4,
        SOCKS_ATYP_IPV6 => 16,
        SOCKS_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_exact(stream, &mut len).await?;
            usize::from(len[0])
        }
        other => return Err(ProxyError::UnknownAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_exact(stream, &mut bound).await?;
    Ok(())
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ProxyError::NoResponse),
        Err(e) => Err(e.into()),
    }
}

/// Standard base64 with padding, as used by HTTP basic authentication.
fn base64_encode(input: &[u8]) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        for (i, shift) in [18u32, 12, 6, 0].into_iter().enumerate() {
            if i <= chunk.len() {
                out.push(char::from(ALPHABET[((n >> shift) & 0x3f) as usize]));
            } else {
                out.push('=');
            }
        }
    }
    out
}
