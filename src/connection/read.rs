//! Reader task: socket -> TLS -> decode loop -> dispatch.

use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use log::{debug, error, warn};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio_util::sync::CancellationToken;

use super::{Connection, DecodeLoop, Transport};
use crate::{
    close::{CloseCode, CloseRequest},
    error::DecodeLoopError,
    hooks::{PanicMessage, guarded},
    metrics,
    packet::Packet,
    stats::ActiveConnection,
};

/// Run the reader of one connection incarnation until the socket fails or
/// `token` is cancelled.
pub(crate) async fn run<P: Packet>(
    conn: Connection<P>,
    reader: ReadHalf<Box<dyn Transport>>,
    token: CancellationToken,
) {
    let engine = Arc::clone(conn.engine());
    let _active = ActiveConnection::new(&engine.stats);
    let outcome = AssertUnwindSafe(read_loop(&conn, reader, &token))
        .catch_unwind()
        .await;
    if let Err(panic) = outcome {
        let panic = PanicMessage(panic.as_ref());
        error!("reader panicked: id={}, panic={panic}", conn.id());
        tracing::error!(id = %conn.id(), %panic, "reader panicked");
        conn.close_with(CloseCode::OtherError, "reader panicked");
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn read_loop<P: Packet>(
    conn: &Connection<P>,
    mut reader: ReadHalf<Box<dyn Transport>>,
    token: &CancellationToken,
) {
    let engine = conn.engine();
    let mut buf = vec![0; engine.config.read_buffer_size];
    let mut decoder = DecodeLoop::default();
    loop {
        let read = tokio::select! {
            biased;

            () = token.cancelled() => break,
            res = reader.read(&mut buf) => res,
        };
        match read {
            Ok(0) => {
                conn.close_with(CloseCode::ClosedByPeer, "connection closed by peer");
                break;
            }
            Ok(n) => {
                record_received(conn, n);
                if !process_inbound(conn, &mut decoder, &buf[..n]).await {
                    break;
                }
            }
            Err(e) => {
                conn.close_with_request(
                    CloseRequest::new("read failed")
                        .code(CloseCode::ReadError)
                        .cause(&e),
                );
                break;
            }
        }
        if token.is_cancelled() {
            break;
        }
    }
    debug!(
        "reader finished: id={}, leftover={}, failures={}",
        conn.id(),
        decoder.buffered(),
        decoder.failures()
    );
}

fn record_received<P: Packet>(conn: &Connection<P>, n: usize) {
    let engine = conn.engine();
    if engine.config.stat_on {
        conn.inner.stats.record_received_bytes(n);
        engine.stats.record_received_bytes(n);
    }
    guarded("on_after_received_bytes", conn.id(), || {
        engine.listener.on_after_received_bytes(conn, n);
    });
}

/// Push one chunk through the inbound stages. Returns `false` once the
/// connection is closing.
async fn process_inbound<P: Packet>(
    conn: &Connection<P>,
    decoder: &mut DecodeLoop,
    chunk: &[u8],
) -> bool {
    let Some(result) = conn.with_tls_session(|session| session.unwrap(chunk)) else {
        return decode(conn, decoder, chunk).await;
    };
    let Some(events) = conn.apply_tls_events(result) else {
        return false;
    };
    if !events.plaintext.is_empty() && !decode(conn, decoder, &events.plaintext).await {
        return false;
    }
    if events.session_closed {
        conn.close_with(CloseCode::TlsSessionClosed, "TLS session closed by peer");
        return false;
    }
    true
}

async fn decode<P: Packet>(conn: &Connection<P>, decoder: &mut DecodeLoop, bytes: &[u8]) -> bool {
    match decoder.feed(conn, bytes).await {
        Ok(()) => conn.is_active(),
        Err(e) => {
            on_decode_error(conn, &e);
            false
        }
    }
}

fn on_decode_error<P: Packet>(conn: &Connection<P>, e: &DecodeLoopError) {
    let engine = conn.engine();
    conn.set_packet_needed_length(None);
    engine.stats.record_decode_error();
    metrics::inc_decode_errors();
    warn!(
        "decode failed: id={}, peer={:?}, error={e}",
        conn.id(),
        conn.peer_addr()
    );

    let blacklisted = e.is_protocol()
        && conn
            .peer_addr()
            .is_some_and(|peer| engine.ip_guard.record_decode_error(peer.ip()));

    conn.close_with_request(
        CloseRequest::new("decode failed")
            .code(CloseCode::DecodeError)
            .cause(e),
    );

    if blacklisted && let Some(peer) = conn.peer_addr() {
        for other in engine.registry.by_peer_ip(peer.ip()) {
            other.close_with_request(
                CloseRequest::new("peer address blacklisted")
                    .code(CloseCode::IpInBlacklist)
                    .force_remove(),
            );
        }
    }
}
