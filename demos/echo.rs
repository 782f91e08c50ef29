//! Minimal echo server.
//!
//! Every length-prefixed frame is sent back unchanged. Connections idle for
//! thirty seconds are dropped. Stop with Ctrl+C.

use std::time::Duration;

use tracing::info;
use wirelink::{
    Connection,
    Frame,
    LengthPrefixedCodec,
    ServerBuilder,
    hooks::{FnHandler, HandlerError},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = ServerBuilder::new(
        LengthPrefixedCodec::default(),
        FnHandler::new(|frame: Frame, conn: Connection<Frame>| async move {
            info!(id = %conn.id(), bytes = frame.body().len(), "echo request received");
            conn.send(frame);
            Ok::<_, HandlerError>(())
        }),
    )
    .name("echo")
    .heartbeat_timeout(Duration::from_secs(30))
    .bind("127.0.0.1:7878")?;

    server.run().await?;
    Ok(())
}
