//! Running a [`Server`] in the background.

use std::{net::SocketAddr, ops::Deref, sync::Arc};

use tokio::{sync::oneshot, task::JoinHandle};
use wirelink::{Node, Packet, Server};

/// A server accepting on a background task until [`RunningServer::stop`].
pub struct RunningServer<P: Packet> {
    server: Arc<Server<P>>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<P: Packet> RunningServer<P> {
    /// Start accepting on `server`.
    #[must_use]
    pub fn start(server: Server<P>) -> Self {
        let server = Arc::new(server);
        let (stop, stopped) = oneshot::channel::<()>();
        let runner = Arc::clone(&server);
        let task = tokio::spawn(async move {
            runner
                .run_with_shutdown(async {
                    let _ = stopped.await;
                })
                .await;
        });
        Self { server, stop, task }
    }

    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr { self.server.local_addr() }

    /// Bound address as a [`Node`].
    #[must_use]
    pub fn node(&self) -> Node {
        let addr = self.addr();
        Node::new(addr.ip().to_string(), addr.port())
    }

    /// Stop accepting, close every connection and wait for the server.
    ///
    /// # Panics
    ///
    /// Panics if the server task panicked.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.expect("server task panicked");
    }
}

impl<P: Packet> Deref for RunningServer<P> {
    type Target = Server<P>;

    fn deref(&self) -> &Self::Target { &self.server }
}
