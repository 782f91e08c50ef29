//! Handshake status machine over a sans-I/O rustls session.

use std::{
    io::{Read, Write},
    sync::Arc,
};

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use rustls::{
    ClientConfig,
    ClientConnection,
    Connection,
    ServerConfig,
    ServerConnection,
    pki_types::ServerName,
};

use super::TlsError;

/// Plaintext is handed to rustls in chunks of this size.
pub(crate) const WRAP_CHUNK_SIZE: usize = 8 * 1024;

/// Externally visible TLS state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    /// The session exists but the handshake has not been started.
    NotStarted,
    /// Handshake records are being exchanged.
    Handshaking,
    /// Application data may flow.
    Established,
    /// The peer sent `close_notify` or the connection was closed.
    Closed,
}

/// Next step of the handshake driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Step {
    /// Established and idle.
    NotHandshaking,
    /// The handshake just completed.
    Finished,
    /// Records are waiting to be written.
    NeedWrap,
    /// More ciphertext from the peer is required.
    NeedUnwrap,
    /// Buffered records must be processed.
    NeedTask,
}

/// Outcome of feeding the session.
#[derive(Debug, Default)]
pub(crate) struct TlsEvents {
    /// Records are pending and a flush must be scheduled.
    pub(crate) flush: bool,
    /// The handshake completed during this call. Reported once per session.
    pub(crate) completed: bool,
    /// The peer closed the session.
    pub(crate) session_closed: bool,
    /// Decrypted application data.
    pub(crate) plaintext: BytesMut,
}

pub(crate) struct TlsSession {
    conn: Connection,
    phase: HandshakePhase,
    task_pending: bool,
    flush_scheduled: bool,
    ciphertext: BytesMut,
}

impl TlsSession {
    pub(crate) fn client(config: Arc<ClientConfig>, host: &str) -> Result<Self, TlsError> {
        let name = ServerName::try_from(host.to_owned())
            .map_err(|_| TlsError::InvalidServerName(host.to_owned()))?;
        let mut conn = ClientConnection::new(config, name).map_err(TlsError::Config)?;
        conn.set_buffer_limit(None);
        Ok(Self::new(conn.into()))
    }

    pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let mut conn = ServerConnection::new(config).map_err(TlsError::Config)?;
        conn.set_buffer_limit(None);
        Ok(Self::new(conn.into()))
    }

    fn new(conn: Connection) -> Self {
        Self {
            conn,
            phase: HandshakePhase::NotStarted,
            task_pending: false,
            flush_scheduled: false,
            ciphertext: BytesMut::new(),
        }
    }

    pub(crate) fn phase(&self) -> HandshakePhase { self.phase }

    pub(crate) fn is_established(&self) -> bool { self.phase == HandshakePhase::Established }

    /// SNI host received from a client, on server sessions.
    pub(crate) fn sni_hostname(&self) -> Option<&str> {
        match &self.conn {
            Connection::Server(server) => server.server_name(),
            Connection::Client(_) => None,
        }
    }

    /// Start the handshake. A client produces its hello immediately; a
    /// server waits for one.
    pub(crate) fn begin_handshake(&mut self) -> Result<TlsEvents, TlsError> {
        let mut events = TlsEvents::default();
        if self.phase == HandshakePhase::NotStarted {
            self.phase = HandshakePhase::Handshaking;
            self.drive(&mut events)?;
        }
        Ok(events)
    }

    /// Feed received ciphertext.
    pub(crate) fn unwrap(&mut self, ciphertext: &[u8]) -> Result<TlsEvents, TlsError> {
        let mut events = TlsEvents::default();
        self.ciphertext.extend_from_slice(ciphertext);
        if self.phase == HandshakePhase::Handshaking {
            self.drive(&mut events)?;
        }
        while self.phase == HandshakePhase::Established {
            if self.task_pending {
                self.run_task(&mut events)?;
            } else if !self.feed()? {
                break;
            }
        }
        self.schedule_flush(&mut events);
        Ok(events)
    }

    /// Encrypt `plaintext` and return every pending record.
    pub(crate) fn wrap(&mut self, plaintext: &[u8]) -> Result<Bytes, TlsError> {
        if !self.is_established() {
            return Err(TlsError::NotEstablished);
        }
        for chunk in plaintext.chunks(WRAP_CHUNK_SIZE) {
            self.conn
                .writer()
                .write_all(chunk)
                .map_err(TlsError::Encrypt)?;
        }
        self.drain_records()
    }

    /// Take every record the session wants written.
    pub(crate) fn drain_records(&mut self) -> Result<Bytes, TlsError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out).map_err(TlsError::Encrypt)?;
        }
        self.flush_scheduled = false;
        Ok(Bytes::from(out))
    }

    pub(crate) fn close(&mut self) { self.phase = HandshakePhase::Closed; }

    fn step(&self) -> Step {
        if self.task_pending {
            Step::NeedTask
        } else if self.conn.wants_write() && !self.flush_scheduled {
            Step::NeedWrap
        } else if self.conn.is_handshaking() {
            Step::NeedUnwrap
        } else if self.phase == HandshakePhase::Handshaking {
            Step::Finished
        } else {
            Step::NotHandshaking
        }
    }

    fn drive(&mut self, events: &mut TlsEvents) -> Result<(), TlsError> {
        while self.phase == HandshakePhase::Handshaking {
            match self.step() {
                Step::NeedTask => self.run_task(events)?,
                Step::NeedWrap => {
                    self.flush_scheduled = true;
                    events.flush = true;
                }
                Step::NeedUnwrap => {
                    if !self.feed()? {
                        return Ok(());
                    }
                }
                Step::Finished | Step::NotHandshaking => self.mark_established(events),
            }
        }
        Ok(())
    }

    fn mark_established(&mut self, events: &mut TlsEvents) {
        if self.phase == HandshakePhase::Handshaking {
            self.phase = HandshakePhase::Established;
            events.completed = true;
            debug!(
                "TLS handshake completed: protocol={:?}, sni={:?}",
                self.conn.protocol_version(),
                self.sni_hostname()
            );
        }
    }

    /// Move buffered ciphertext into rustls. Returns `false` when nothing
    /// was buffered.
    fn feed(&mut self) -> Result<bool, TlsError> {
        // An empty read would be taken as EOF by rustls.
        if self.ciphertext.is_empty() {
            return Ok(false);
        }
        let mut pending = &self.ciphertext[..];
        let consumed = self.conn.read_tls(&mut pending).map_err(|e| {
            TlsError::Decrypt(rustls::Error::General(format!("buffering records failed: {e}")))
        })?;
        self.ciphertext.advance(consumed);
        if consumed > 0 {
            self.task_pending = true;
        }
        Ok(consumed > 0)
    }

    /// Process buffered records: the delegated task of the handshake.
    fn run_task(&mut self, events: &mut TlsEvents) -> Result<(), TlsError> {
        self.task_pending = false;
        let handshaking = self.conn.is_handshaking();
        let state = self.conn.process_new_packets().map_err(|e| {
            if handshaking {
                TlsError::Handshake(e)
            } else {
                TlsError::Decrypt(e)
            }
        })?;
        let readable = state.plaintext_bytes_to_read();
        if readable > 0 {
            let start = events.plaintext.len();
            events.plaintext.resize(start + readable, 0);
            self.conn
                .reader()
                .read_exact(&mut events.plaintext[start..])
                .map_err(|e| TlsError::Decrypt(rustls::Error::General(e.to_string())))?;
        }
        if state.peer_has_closed() {
            self.phase = HandshakePhase::Closed;
            events.session_closed = true;
        }
        Ok(())
    }

    fn schedule_flush(&mut self, events: &mut TlsEvents) {
        if self.conn.wants_write() && !self.flush_scheduled {
            self.flush_scheduled = true;
            events.flush = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use rcgen::{CertifiedKey, generate_simple_self_signed};
    use rstest::{fixture, rstest};
    use rustls::{
        RootCertStore,
        pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    };

    use super::{HandshakePhase, TlsSession};
    use crate::tls::{TlsClientConfig, TlsError, TlsServerConfig};

    struct Pair {
        client: TlsSession,
        server: TlsSession,
        client_completions: usize,
        server_completions: usize,
    }

    impl Pair {
        /// Shuttle records between both ends until neither has output left.
        fn pump(&mut self) -> (Vec<u8>, Vec<u8>) {
            let mut to_client = Vec::new();
            let mut to_server = Vec::new();
            for _ in 0..16 {
                let c2s = self.client.drain_records().expect("client records");
                let server_events = self.server.unwrap(&c2s).expect("server unwrap");
                self.server_completions += usize::from(server_events.completed);
                to_server.extend_from_slice(&server_events.plaintext);

                let s2c = self.server.drain_records().expect("server records");
                let client_events = self.client.unwrap(&s2c).expect("client unwrap");
                self.client_completions += usize::from(client_events.completed);
                to_client.extend_from_slice(&client_events.plaintext);

                if c2s.is_empty() && s2c.is_empty() {
                    break;
                }
            }
            (to_client, to_server)
        }
    }

    #[fixture]
    fn pair() -> Pair {
        let CertifiedKey { cert, key_pair } =
            generate_simple_self_signed(vec!["example.com".to_owned()]).expect("certificate");
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server = TlsServerConfig::from_der(vec![cert.der().clone()], key).expect("server config");
        let mut roots = RootCertStore::empty();
        roots.add(cert.der().clone()).expect("root");
        let client = TlsClientConfig::with_root_certificates(roots).expect("client config");
        Pair {
            client: client.session(None, "example.com").expect("client session"),
            server: server.session().expect("server session"),
            client_completions: 0,
            server_completions: 0,
        }
    }

    #[rstest]
    fn client_hello_is_scheduled_on_begin(mut pair: Pair) {
        let events = pair.client.begin_handshake().expect("begin");
        assert!(events.flush);
        assert!(!events.completed);
        let server_events = pair.server.begin_handshake().expect("begin");
        assert!(!server_events.flush);
        assert_eq!(pair.server.phase(), HandshakePhase::Handshaking);
    }

    #[rstest]
    fn handshake_completes_once_per_side(mut pair: Pair) {
        pair.client.begin_handshake().expect("begin");
        pair.server.begin_handshake().expect("begin");
        pair.pump();
        pair.pump();
        assert_eq!(pair.client_completions, 1);
        assert_eq!(pair.server_completions, 1);
        assert!(pair.client.is_established());
        assert_eq!(pair.server.sni_hostname(), Some("example.com"));
    }

    #[rstest]
    fn wraps_large_payloads_in_chunks(mut pair: Pair) {
        pair.client.begin_handshake().expect("begin");
        pair.server.begin_handshake().expect("begin");
        pair.pump();

        let payload = b"abcdefghij".repeat(2_000);
        let sealed = pair.client.wrap(&payload).expect("wrap");
        assert!(sealed.len() > payload.len());
        let events = pair.server.unwrap(&sealed).expect("unwrap");
        assert_eq!(&events.plaintext[..], &payload[..]);
    }

    #[rstest]
    fn partial_records_are_buffered(mut pair: Pair) {
        pair.client.begin_handshake().expect("begin");
        pair.server.begin_handshake().expect("begin");
        pair.pump();

        let sealed = pair.server.wrap(b"hello").expect("wrap");
        let (head, tail) = sealed.split_at(3);
        assert!(pair.client.unwrap(head).expect("head").plaintext.is_empty());
        assert_eq!(&pair.client.unwrap(tail).expect("tail").plaintext[..], b"hello");
    }

    #[rstest]
    fn application_data_requires_established_session(mut pair: Pair) {
        assert!(matches!(pair.client.wrap(b"early"), Err(TlsError::NotEstablished)));
    }

    #[rstest]
    fn garbage_fails_the_handshake(mut pair: Pair) {
        pair.server.begin_handshake().expect("begin");
        let err = pair
            .server
            .unwrap(&[0x99, 0x03, 0x03, 0x00, 0x01, 0x00])
            .err()
            .expect("handshake error");
        assert_eq!(err.close_code(), crate::CloseCode::TlsHandshakeError);
    }

    #[test]
    fn invalid_server_names_are_rejected() {
        let roots = RootCertStore::empty();
        let client = TlsClientConfig::with_root_certificates(roots).expect("config");
        assert!(matches!(
            client.session(None, "not a host name"),
            Err(TlsError::InvalidServerName(_))
        ));
    }
}
