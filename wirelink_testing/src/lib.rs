//! Utilities for exercising `wirelink` servers and clients in tests.
//!
//! The [`Recorder`] observes handlers and lifecycle callbacks so that tests
//! can wait for events instead of sleeping; [`TlsFixture`] issues a
//! self-signed certificate and matching client trust store; the wire helpers
//! let a plain socket talk to a [`LengthPrefixedCodec`] peer.
//!
//! ```rust,no_run
//! use wirelink::{LengthPrefixedCodec, ServerBuilder};
//! use wirelink_testing::{Recorder, TestResult, unused_listener};
//!
//! async fn example() -> TestResult {
//!     let recorder = Recorder::default();
//!     let server = ServerBuilder::new(LengthPrefixedCodec::default(), recorder.handler())
//!         .listener(recorder.listener())
//!         .bind_listener(unused_listener()?)?;
//!     assert!(server.local_addr().port() > 0);
//!     Ok(())
//! }
//! ```
//!
//! [`LengthPrefixedCodec`]: wirelink::LengthPrefixedCodec

pub mod logging;
pub mod net;
pub mod recording;
pub mod server;
pub mod tls;
pub mod wait;

pub use logging::{LoggerHandle, logger};
pub use net::{TestResult, encode_frame, read_frame, unused_listener};
pub use recording::{Event, Recorder, RecordingHandler, RecordingListener};
pub use server::RunningServer;
pub use tls::{TlsFixture, tls_fixture};
pub use wait::eventually;
