//! Client for the `echo` demo.
//!
//! Start `demos/echo.rs` first. The client sends a correlated request, waits
//! for the echo and keeps reconnecting if the server restarts.

use std::time::Duration;

use tracing::{error, info};
use wirelink::{
    ClientBuilder,
    Connection,
    Frame,
    LengthPrefixedCodec,
    Node,
    ReconnectConfig,
    hooks::{FnHandler, HandlerError},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let client = ClientBuilder::new(
        LengthPrefixedCodec::default(),
        FnHandler::new(|frame: Frame, conn: Connection<Frame>| async move {
            info!(id = %conn.id(), bytes = frame.body().len(), "unsolicited frame");
            Ok::<_, HandlerError>(())
        }),
    )
    .name("echo-client")
    .reconnect(ReconnectConfig::new(Duration::from_secs(1), 5))
    .build()?;

    let conn = client.connect(Node::new("127.0.0.1", 7878)).await?;
    if !conn.wait_ready(Duration::from_secs(10)).await {
        error!("server did not become reachable");
        client.stop().await;
        return Err(std::io::Error::other("echo server unreachable").into());
    }

    let reply = conn.call(Frame::new("hello"), Duration::from_secs(5)).await?;
    info!(
        body = %String::from_utf8_lossy(reply.body()),
        "echo received",
    );

    client.stop().await;
    Ok(())
}
