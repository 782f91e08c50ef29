//! Integration tests for the client: calls, reconnection and its retry
//! ceiling.

use std::time::Duration;

use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
};
use wirelink::{
    ClientBuilder,
    ClientError,
    CloseCode,
    Frame,
    LengthPrefixedCodec,
    Node,
    ReconnectConfig,
    ServerBuilder,
};
use wirelink_testing::{
    Event,
    Recorder,
    RunningServer,
    TestResult,
    encode_frame,
    eventually,
    unused_listener,
};

const WAIT: Duration = Duration::from_secs(5);

fn echo_server() -> TestResult<(RunningServer<Frame>, Recorder)> {
    let recorder = Recorder::default();
    let server = ServerBuilder::new(LengthPrefixedCodec::default(), recorder.echo_handler())
        .listener(recorder.listener())
        .bind_listener(unused_listener()?)?;
    Ok((RunningServer::start(server), recorder))
}

/// A port nothing listens on.
fn closed_port() -> TestResult<Node> {
    let listener = unused_listener()?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(Node::new("127.0.0.1", port))
}

#[tokio::test]
async fn call_returns_correlated_echo() -> TestResult {
    let (server, _) = echo_server()?;
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler()).build()?;
    let conn = client.connect(server.node()).await?;
    assert!(conn.wait_ready(WAIT).await);

    let reply = conn.call(Frame::new("ping"), WAIT).await?;

    assert_eq!(reply.body().as_ref(), b"ping");
    // Correlated replies resolve the call instead of reaching the handler.
    assert!(recorder.bodies().is_empty());

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn uncorrelated_frames_reach_the_handler() -> TestResult {
    let (server, _) = echo_server()?;
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler()).build()?;
    let conn = client.connect(server.node()).await?;

    assert!(conn.send_sync(Frame::new("one")).await);
    assert!(conn.send(Frame::new("two")));

    assert!(recorder.wait_frames(2, WAIT).await);
    assert_eq!(recorder.bodies(), vec![b"one".to_vec(), b"two".to_vec()]);

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn connect_without_reconnect_reports_failure() -> TestResult {
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), Recorder::default().handler())
        .build()?;

    let err = client
        .connect(closed_port()?)
        .await
        .expect_err("nothing listens on the port");

    assert!(matches!(err, ClientError::Io(_)));
    assert!(client.registry().is_empty());
    Ok(())
}

#[tokio::test]
async fn reconnect_keeps_identity_and_bindings() -> TestResult {
    let (server, server_events) = echo_server()?;
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
        .listener(recorder.listener())
        .reconnect(ReconnectConfig::new(Duration::from_millis(20), 0))
        .build()?;
    let conn = client.connect(server.node()).await?;
    conn.bind_user("alice");
    conn.bind_group("room");
    conn.set_property("session", "s-1");
    assert!(eventually(WAIT, || server.registry().connected_count() == 1).await);

    for server_side in server.registry().all() {
        server_side.remove("kick");
    }

    assert!(
        recorder
            .wait_events(WAIT, |events| events.iter().any(|e| matches!(
                e,
                Event::Connected {
                    connected: true,
                    reconnect: true,
                    ..
                }
            )))
            .await
    );
    assert!(conn.is_active());
    assert!(conn.is_reconnect());
    assert_eq!(client.registry().by_user("alice")[0].id(), conn.id());
    assert_eq!(client.registry().group_size("room"), 1);
    assert_eq!(conn.property("session").as_deref(), Some("s-1"));
    assert_eq!(conn.reconnect_attempts(), 0);
    assert!(recorder.close_codes().contains(&CloseCode::ClosedByPeer));

    assert!(conn.send(Frame::new("after")));
    assert!(server_events.wait_frames(1, WAIT).await);

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn failed_first_connect_is_retried_until_server_appears() -> TestResult {
    let listener = unused_listener()?;
    let addr = listener.local_addr()?;
    drop(listener);

    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
        .listener(recorder.listener())
        .reconnect(ReconnectConfig::new(Duration::from_millis(20), 0))
        .build()?;
    let conn = client
        .connect(Node::new("127.0.0.1", addr.port()))
        .await?;
    assert!(!conn.is_active());
    assert_eq!(conn.close_code(), CloseCode::ClientConnectionFail);
    assert_eq!(client.registry().closed_count(), 1);

    let late = TcpListener::bind(addr).await?;
    let (mut peer, _) = tokio::time::timeout(WAIT, late.accept()).await??;
    peer.write_all(&encode_frame(0, b"welcome")).await?;

    assert!(recorder.wait_frames(1, WAIT).await);
    assert!(conn.is_active());
    assert_eq!(client.registry().connected_count(), 1);

    client.stop().await;
    Ok(())
}

#[tokio::test]
async fn retry_ceiling_removes_the_connection() -> TestResult {
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
        .listener(recorder.listener())
        .reconnect(ReconnectConfig::new(Duration::from_millis(10), 2))
        .build()?;

    let conn = client.connect(closed_port()?).await?;

    assert!(eventually(WAIT, || conn.is_removed()).await);
    assert_eq!(conn.reconnect_attempts(), 2);
    assert_eq!(conn.close_code(), CloseCode::ClientConnectionFail);
    assert!(client.registry().is_empty());
    let failures = recorder
        .events()
        .into_iter()
        .filter(|e| matches!(e, Event::Connected { connected: false, .. }))
        .count();
    assert_eq!(failures, 3);
    Ok(())
}

#[tokio::test]
async fn stop_cancels_pending_reconnects() -> TestResult {
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), Recorder::default().handler())
        .reconnect(ReconnectConfig::new(Duration::from_secs(60), 0))
        .build()?;
    let conn = client.connect(closed_port()?).await?;
    assert!(!conn.is_removed());

    tokio::time::timeout(WAIT, client.stop()).await?;

    assert!(conn.is_removed());
    Ok(())
}
