//! Dialling client sockets.

use std::io;

use log::info;
use tokio::net::{TcpSocket, TcpStream, lookup_host};

use super::{ClientError, ConnectTarget, ProxyConfig, proxy};
use crate::{connection::Connection, error::ActivateError, packet::Packet};

/// Dial the connection's target and attach the new socket.
///
/// Used for the first connect and for every reconnect attempt; the
/// connection keeps its identifier, properties and bindings.
pub(crate) async fn establish<P: Packet>(
    conn: &Connection<P>,
    is_reconnect: bool,
) -> Result<(), ClientError> {
    let Some(target) = conn.target() else {
        let e = io::Error::new(io::ErrorKind::InvalidInput, "connection has no target");
        return Err(e.into());
    };
    let stream = dial(target).await?;
    if conn.is_removed() {
        return Err(ClientError::Removed);
    }
    let peer = stream.peer_addr().ok();
    let local = stream.local_addr().ok();
    conn.activate(stream, peer, local, is_reconnect)
        .await
        .map_err(|e| match e {
            ActivateError::Tls(e) => ClientError::Tls(e),
            ActivateError::Removed => ClientError::Removed,
        })?;
    info!(
        "client connected: id={}, server={}, local={local:?}, reconnect={is_reconnect}",
        conn.id(),
        target.server
    );
    Ok(())
}

/// Open a TCP stream to the target, through the proxy when one is set.
async fn dial(target: &ConnectTarget) -> Result<TcpStream, ClientError> {
    let attempt = async {
        let hop = target.proxy.as_ref().map_or(&target.server, ProxyConfig::addr);
        let addr = lookup_host((hop.host(), hop.port()))
            .await?
            .next()
            .ok_or_else(|| ClientError::Unresolved(hop.clone()))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(bind) = target.bind {
            socket.set_reuseaddr(true)?;
            socket.bind(bind)?;
        }
        let mut stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        if let Some(proxy) = &target.proxy {
            proxy::negotiate(&mut stream, proxy, &target.server).await?;
        }
        Ok::<_, ClientError>(stream)
    };
    tokio::time::timeout(target.timeout, attempt)
        .await
        .map_err(|_| ClientError::Timeout {
            server: target.server.clone(),
            timeout: target.timeout,
        })?
}
