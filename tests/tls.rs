//! Integration tests for TLS between wirelink peers and against
//! tokio-rustls.

use std::{sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use rstest::rstest;
use rustls::{
    ClientConfig,
    ServerConfig,
    crypto::ring,
    pki_types::ServerName,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use wirelink::{
    ClientBuilder,
    CloseCode,
    ConnectOptions,
    Frame,
    HandshakePhase,
    LengthPrefixedCodec,
    Node,
    Outbound,
    ServerBuilder,
};
use wirelink_testing::{
    Event,
    Recorder,
    RunningServer,
    TestResult,
    TlsFixture,
    encode_frame,
    eventually,
    read_frame,
    tls_fixture,
    unused_listener,
};

const WAIT: Duration = Duration::from_secs(5);

fn tls_echo_server(tls: &TlsFixture) -> TestResult<(RunningServer<Frame>, Recorder)> {
    let recorder = Recorder::default();
    let server = ServerBuilder::new(LengthPrefixedCodec::default(), recorder.echo_handler())
        .listener(recorder.listener())
        .tls(tls.server()?)
        .bind_listener(unused_listener()?)?;
    Ok((RunningServer::start(server), recorder))
}

fn localhost(server: &RunningServer<Frame>) -> ConnectOptions {
    ConnectOptions::new(Node::new("127.0.0.1", server.addr().port())).tls_host("localhost")
}

#[rstest]
#[tokio::test]
async fn wirelink_peers_exchange_calls(tls_fixture: TlsFixture) -> TestResult {
    let (server, server_events) = tls_echo_server(&tls_fixture)?;
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
        .tls(tls_fixture.client()?)
        .build()?;

    let conn = client.connect_with(localhost(&server)).await?;
    assert!(conn.wait_ready(WAIT).await);
    assert_eq!(conn.tls_phase(), Some(HandshakePhase::Established));

    let reply = conn.call(Frame::new("secret"), WAIT).await?;
    assert_eq!(reply.body().as_ref(), b"secret");

    let accepted = server.registry().connected();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].sni_hostname().as_deref(), Some("localhost"));
    assert!(
        server_events
            .events()
            .iter()
            .any(|e| matches!(e, Event::Connected { connected: true, .. }))
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn sends_before_handshake_are_delivered_in_order(tls_fixture: TlsFixture) -> TestResult {
    let (server, server_events) = tls_echo_server(&tls_fixture)?;
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), Recorder::default().handler())
        .tls(tls_fixture.client()?)
        .build()?;

    let conn = client.connect_with(localhost(&server)).await?;
    assert!(conn.send(Frame::new("early-1")));
    assert!(conn.send(Frame::new("early-2")));

    assert!(server_events.wait_frames(2, WAIT).await);
    assert_eq!(
        server_events.bodies(),
        vec![b"early-1".to_vec(), b"early-2".to_vec()]
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn tokio_rustls_client_talks_to_wirelink_server(tls_fixture: TlsFixture) -> TestResult {
    let (server, _) = tls_echo_server(&tls_fixture)?;
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(tls_fixture.roots())
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(server.addr()).await?;
    let mut stream = connector
        .connect(ServerName::try_from("example.com")?, tcp)
        .await?;
    stream.write_all(&encode_frame(3, b"from tokio-rustls")).await?;

    assert_eq!(
        read_frame(&mut stream).await?,
        (3, b"from tokio-rustls".to_vec())
    );
    assert!(eventually(WAIT, || {
        server
            .registry()
            .connected()
            .iter()
            .any(|c| c.sni_hostname().as_deref() == Some("example.com"))
    })
    .await);

    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn wirelink_client_talks_to_tokio_rustls_server(tls_fixture: TlsFixture) -> TestResult {
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![tls_fixture.cert().clone()], tls_fixture.key())?;
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::from_std({
        let std = unused_listener()?;
        std.set_nonblocking(true)?;
        std
    })?;
    let port = listener.local_addr()?.port();

    let peer = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        let mut stream = acceptor.accept(tcp).await?;
        let (correlation, body) = read_frame(&mut stream).await?;
        stream.write_all(&encode_frame(correlation, &body)).await?;
        stream.flush().await?;
        Ok::<_, std::io::Error>(stream)
    });

    let client = ClientBuilder::new(LengthPrefixedCodec::default(), Recorder::default().handler())
        .tls(tls_fixture.client()?)
        .build()?;
    let conn = client
        .connect_with(ConnectOptions::new(Node::new("127.0.0.1", port)).tls_host("localhost"))
        .await?;

    let reply = conn.call(Frame::new("hello rustls"), WAIT).await?;
    assert_eq!(reply.body().as_ref(), b"hello rustls");

    let _stream = peer.await??;
    client.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn certificate_name_mismatch_fails_the_handshake(tls_fixture: TlsFixture) -> TestResult {
    let (server, _) = tls_echo_server(&tls_fixture)?;
    let recorder = Recorder::default();
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
        .listener(recorder.listener())
        .tls(tls_fixture.client()?)
        .build()?;

    let conn = client
        .connect_with(
            ConnectOptions::new(Node::new("127.0.0.1", server.addr().port()))
                .tls_host("wrong.test"),
        )
        .await?;

    assert!(!conn.wait_ready(Duration::from_millis(500)).await);
    assert!(
        recorder
            .wait_events(WAIT, |events| events.iter().any(|e| matches!(
                e,
                Event::Closed {
                    code: CloseCode::TlsHandshakeError,
                    ..
                }
            )))
            .await
    );
    assert!(
        !recorder
            .events()
            .iter()
            .any(|e| matches!(e, Event::Connected { connected: true, .. }))
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}

#[rstest]
#[tokio::test]
async fn file_bodies_are_encrypted_chunk_by_chunk(tls_fixture: TlsFixture) -> TestResult {
    const FILE_LEN: usize = 150_000;
    let recorder = Recorder::default();
    let server = ServerBuilder::new(LengthPrefixedCodec::new(FILE_LEN + 64), recorder.handler())
        .tls(tls_fixture.server()?)
        .bind_listener(unused_listener()?)?;
    let server = RunningServer::start(server);
    let client = ClientBuilder::new(LengthPrefixedCodec::default(), Recorder::default().handler())
        .tls(tls_fixture.client()?)
        .build()?;
    let conn = client.connect_with(localhost(&server)).await?;
    assert!(conn.wait_ready(WAIT).await);

    let contents: Vec<u8> = (0..=u8::MAX).cycle().take(FILE_LEN).collect();
    let path = std::env::temp_dir().join(format!("wirelink-tls-file-{}.bin", std::process::id()));
    tokio::fs::write(&path, &contents).await?;
    let mut header = BytesMut::new();
    header.put_u32(u32::try_from(8 + FILE_LEN)?);
    header.put_u64(0);
    let sent = conn
        .send_sync(Outbound::<Frame>::encoded(header.freeze()).with_file_body(&path))
        .await;
    tokio::fs::remove_file(&path).await?;
    assert!(sent);

    assert!(recorder.wait_frames(1, WAIT).await);
    assert_eq!(recorder.bodies(), vec![contents]);
    assert_eq!(conn.stats().sent_bytes(), (12 + FILE_LEN) as u64);

    client.stop().await;
    server.stop().await;
    Ok(())
}
