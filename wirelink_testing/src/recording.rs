//! Handlers and listeners recording what they observe.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{sync::Notify, time::timeout};
use wirelink::{
    CloseCode,
    Connection,
    ConnectionId,
    ConnectionListener,
    Frame,
    PacketHandler,
    hooks::HandlerError,
};

/// Lifecycle event seen by a [`RecordingListener`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// `on_after_connected` ran.
    Connected {
        id: ConnectionId,
        connected: bool,
        reconnect: bool,
    },
    /// `on_before_close` ran.
    Closed {
        id: ConnectionId,
        code: CloseCode,
        removed: bool,
    },
    /// `on_heartbeat_timeout` ran.
    HeartbeatTimeout { id: ConnectionId, count: u64 },
}

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<Event>>,
    frames: Mutex<Vec<(ConnectionId, Frame)>>,
    keep_on_heartbeat: AtomicBool,
    changed: Notify,
}

/// Shared log of frames and lifecycle events.
///
/// Cloning yields another handle to the same log.
#[derive(Clone, Default)]
pub struct Recorder {
    shared: Arc<Shared>,
}

impl Recorder {
    /// Handler recording every frame.
    #[must_use]
    pub fn handler(&self) -> RecordingHandler {
        RecordingHandler {
            shared: Arc::clone(&self.shared),
            echo: false,
        }
    }

    /// Handler recording every frame and sending it back unchanged.
    #[must_use]
    pub fn echo_handler(&self) -> RecordingHandler {
        RecordingHandler {
            shared: Arc::clone(&self.shared),
            echo: true,
        }
    }

    /// Listener recording lifecycle events.
    #[must_use]
    pub fn listener(&self) -> RecordingListener {
        RecordingListener {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Answer heartbeat timeouts with `keep`.
    pub fn keep_on_heartbeat(&self, keep: bool) {
        self.shared.keep_on_heartbeat.store(keep, Ordering::Release);
    }

    /// Snapshot of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> { self.shared.events.lock().clone() }

    /// Snapshot of the recorded frame bodies.
    #[must_use]
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.shared
            .frames
            .lock()
            .iter()
            .map(|(_, frame)| frame.body().to_vec())
            .collect()
    }

    /// Close events recorded so far, in order.
    #[must_use]
    pub fn close_codes(&self) -> Vec<CloseCode> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Closed { code, .. } => Some(code),
                _ => None,
            })
            .collect()
    }

    /// Wait until `check` holds for the recorded events, or `limit` elapses.
    pub async fn wait_events<F>(&self, limit: Duration, check: F) -> bool
    where
        F: Fn(&[Event]) -> bool,
    {
        self.wait(limit, || check(&self.shared.events.lock())).await
    }

    /// Wait until at least `count` frames were recorded.
    pub async fn wait_frames(&self, count: usize, limit: Duration) -> bool {
        self.wait(limit, || self.shared.frames.lock().len() >= count)
            .await
    }

    async fn wait(&self, limit: Duration, check: impl Fn() -> bool) -> bool {
        timeout(limit, async {
            loop {
                let changed = self.shared.changed.notified();
                if check() {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }
}

fn push_event(shared: &Shared, event: Event) {
    shared.events.lock().push(event);
    shared.changed.notify_waiters();
}

/// [`PacketHandler`] feeding a [`Recorder`].
pub struct RecordingHandler {
    shared: Arc<Shared>,
    echo: bool,
}

#[async_trait]
impl PacketHandler<Frame> for RecordingHandler {
    async fn handle(&self, packet: &Frame, conn: &Connection<Frame>) -> Result<(), HandlerError> {
        self.shared.frames.lock().push((conn.id(), packet.clone()));
        self.shared.changed.notify_waiters();
        if self.echo {
            conn.send(packet.clone());
        }
        Ok(())
    }
}

/// [`ConnectionListener`] feeding a [`Recorder`].
pub struct RecordingListener {
    shared: Arc<Shared>,
}

impl ConnectionListener<Frame> for RecordingListener {
    fn on_after_connected(&self, conn: &Connection<Frame>, connected: bool, is_reconnect: bool) {
        push_event(
            &self.shared,
            Event::Connected {
                id: conn.id(),
                connected,
                reconnect: is_reconnect,
            },
        );
    }

    fn on_before_close(
        &self,
        conn: &Connection<Frame>,
        _cause: Option<&str>,
        _remark: &str,
        need_remove: bool,
    ) {
        push_event(
            &self.shared,
            Event::Closed {
                id: conn.id(),
                code: conn.close_code(),
                removed: need_remove,
            },
        );
    }

    fn on_heartbeat_timeout(&self, conn: &Connection<Frame>, _idle: Duration, count: u64) -> bool {
        push_event(
            &self.shared,
            Event::HeartbeatTimeout {
                id: conn.id(),
                count,
            },
        );
        self.shared.keep_on_heartbeat.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wirelink::ConnectionId;

    use super::{Event, Recorder, push_event};

    #[tokio::test]
    async fn waiters_see_events_pushed_later() {
        let recorder = Recorder::default();
        let pusher = recorder.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            push_event(
                &pusher.shared,
                Event::HeartbeatTimeout {
                    id: ConnectionId::new(1),
                    count: 1,
                },
            );
        });
        let seen = recorder
            .wait_events(Duration::from_secs(1), |events| !events.is_empty())
            .await;
        handle.await.expect("pusher");
        assert!(seen);
    }

    #[tokio::test]
    async fn wait_gives_up_after_limit() {
        let recorder = Recorder::default();
        assert!(!recorder.wait_frames(1, Duration::from_millis(20)).await);
    }
}
