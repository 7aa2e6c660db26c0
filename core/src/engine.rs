//! The TLS engine: a buffer-in/buffer-out state machine.
//!
//! An engine never touches a socket. Callers feed it ciphertext
//! received from the peer and drain ciphertext to send; plaintext is
//! exchanged on the application side. All progress is synchronous and
//! bounded by the caller-supplied buffers; undersized outbound buffers
//! are reported through `pending` flags, never by blocking or
//! reallocating the caller's buffer.

use std::io::{Read, Write};
use std::sync::Arc;

use log::debug;
use rustls::{ClientConfig, ClientConnection};
use rustls_pki_types::{CertificateDer, ServerName};

use crate::error::{classify_rustls, TlsError};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake traffic exchanged yet.
    Before,
    /// Handshake in flight.
    Continue,
    /// Handshake finished; application data may flow.
    Complete,
    /// The engine failed and is one-shot until [`TlsEngine::reset`].
    Error,
}

/// Scheduling outcome of [`TlsEngine::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Plaintext may have been produced; nothing further without more
    /// peer bytes.
    Ok,
    /// Plaintext was produced and buffered data can produce more on an
    /// immediate re-call, without socket I/O.
    MoreAvailable,
    /// The engine needs ciphertext flushed to the peer before it can
    /// make progress.
    HasWrite,
    /// The peer closed cleanly with close_notify and all plaintext has
    /// been drained.
    Eof,
    /// The caller supplied no bytes and the engine has nothing
    /// buffered.
    ReadAgain,
}

#[derive(Debug, Clone, Copy)]
pub struct HandshakeOutcome {
    pub state: HandshakeState,
    /// Ciphertext bytes written into the caller's outbound buffer.
    pub produced: usize,
    /// More outbound ciphertext is queued than the buffer could take.
    pub pending: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOutcome {
    pub status: ReadStatus,
    /// Plaintext bytes written into the caller's buffer.
    pub produced: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    /// Ciphertext bytes written into the caller's outbound buffer.
    pub produced: usize,
    /// More outbound ciphertext is queued than the buffer could take.
    pub pending: bool,
}

/// The uniform engine contract. The shipped backend is
/// [`RustlsEngine`]; an alternative cryptographic library would be a
/// second implementor behind the same operations.
pub trait TlsEngine {
    fn handshake_state(&self) -> HandshakeState;

    /// Feed peer ciphertext (may be empty) and drive the handshake,
    /// filling `outbound` with ciphertext to send.
    fn handshake(
        &mut self,
        inbound: &[u8],
        outbound: &mut [u8],
    ) -> Result<HandshakeOutcome, TlsError>;

    /// Feed peer ciphertext (may be empty) and decrypt into
    /// `plaintext`.
    fn read(&mut self, inbound: &[u8], plaintext: &mut [u8]) -> Result<ReadOutcome, TlsError>;

    /// Encrypt `plaintext`, filling `outbound` with ciphertext. Fails
    /// unless the handshake is complete.
    fn write(&mut self, plaintext: &[u8], outbound: &mut [u8]) -> Result<WriteOutcome, TlsError>;

    /// Drain queued outbound ciphertext without feeding new data; used
    /// to service [`ReadStatus::HasWrite`] and `pending` flags.
    fn drain_outbound(&mut self, outbound: &mut [u8]) -> WriteOutcome;

    /// Queue close_notify and drain it. After [`HandshakeState::Error`]
    /// this produces nothing.
    fn close(&mut self, outbound: &mut [u8]) -> usize;

    /// Return to [`HandshakeState::Before`]. An established session has
    /// reached the session cache and the next handshake offers it for
    /// resumption.
    fn reset(&mut self) -> Result<(), TlsError>;

    /// Negotiated ALPN protocol, only after
    /// [`HandshakeState::Complete`].
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// The last error string, stable until the next error on this
    /// engine.
    fn last_error(&self) -> Option<&str>;
}

/// Owned contiguous byte queue with a read cursor.
#[derive(Debug, Default)]
struct ByteQueue {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteQueue {
    fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.compact();
        self.buf.extend_from_slice(bytes);
    }

    fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let n = self.pending().min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        self.compact();
        n
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }

    fn compact(&mut self) {
        if self.pos == self.buf.len() {
            self.clear();
        } else if self.pos > 4096 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl Read for ByteQueue {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(self.drain_into(buf))
    }
}

impl Write for ByteQueue {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The rustls-backed engine.
pub struct RustlsEngine {
    conn: ClientConnection,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    inbound: ByteQueue,
    outbound: ByteQueue,
    state: HandshakeState,
    last_error: Option<String>,
    close_notify_sent: bool,
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("server_name", &self.server_name)
            .field("state", &self.state)
            .finish()
    }
}

impl RustlsEngine {
    pub(crate) fn new(config: Arc<ClientConfig>, hostname: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|e| TlsError::Config(format!("invalid hostname {hostname:?}: {e}")))?;
        let conn = ClientConnection::new(Arc::clone(&config), server_name.clone())
            .map_err(|e| TlsError::Config(e.to_string()))?;
        Ok(Self {
            conn,
            config,
            server_name,
            inbound: ByteQueue::default(),
            outbound: ByteQueue::default(),
            state: HandshakeState::Before,
            last_error: None,
            close_notify_sent: false,
        })
    }

    /// Leaf certificate the peer presented, available after the
    /// handshake completed.
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.clone().into_owned())
    }

    /// Export keying material from the established session (RFC 5705),
    /// e.g. for channel binding.
    pub fn export_keying_material(
        &self,
        output: &mut [u8],
        label: &[u8],
        context: Option<&[u8]>,
    ) -> Result<(), TlsError> {
        self.conn
            .export_keying_material(&mut *output, label, context)
            .map(|_| ())
            .map_err(|e| TlsError::Handshake(format!("keying material unavailable: {e}")))
    }

    fn fail(&mut self, err: &TlsError) {
        self.state = HandshakeState::Error;
        self.last_error = Some(err.to_string());
    }

    fn error_state(&self) -> TlsError {
        TlsError::Handshake(
            self.last_error
                .clone()
                .unwrap_or_else(|| "engine is in the error state".into()),
        )
    }

    fn process(&mut self) -> Result<rustls::IoState, TlsError> {
        match self.conn.process_new_packets() {
            Ok(io_state) => Ok(io_state),
            Err(e) => {
                let err = classify_rustls(e);
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Move buffered ciphertext through the connection in both
    /// directions.
    fn pump(&mut self) -> Result<rustls::IoState, TlsError> {
        let mut io_state = self.process()?;
        while self.inbound.pending() > 0 && self.conn.wants_read() {
            let before = self.inbound.pending();
            self.conn.read_tls(&mut self.inbound).map_err(TlsError::Io)?;
            if self.inbound.pending() == before {
                break;
            }
            io_state = self.process()?;
        }
        self.pump_writes();
        Ok(io_state)
    }

    fn pump_writes(&mut self) {
        while self.conn.wants_write() {
            // The sink is an in-memory queue; this cannot fail.
            let _ = self.conn.write_tls(&mut self.outbound);
        }
    }

    fn drain_reader(&mut self, out: &mut [u8]) -> Result<usize, TlsError> {
        let mut produced = 0;
        while produced < out.len() {
            match self.conn.reader().read(&mut out[produced..]) {
                Ok(0) => break,
                Ok(n) => produced += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let err = TlsError::Io(e);
                    self.fail(&err);
                    return Err(err);
                }
            }
        }
        Ok(produced)
    }
}

impl TlsEngine for RustlsEngine {
    fn handshake_state(&self) -> HandshakeState {
        self.state
    }

    fn handshake(
        &mut self,
        inbound: &[u8],
        outbound: &mut [u8],
    ) -> Result<HandshakeOutcome, TlsError> {
        match self.state {
            HandshakeState::Error => return Err(self.error_state()),
            HandshakeState::Complete => {
                // Late bytes (e.g. session tickets) are queued for the
                // next read call.
                self.inbound.push(inbound);
                let produced = self.outbound.drain_into(outbound);
                return Ok(HandshakeOutcome {
                    state: self.state,
                    produced,
                    pending: self.outbound.pending() > 0,
                });
            }
            HandshakeState::Before => self.state = HandshakeState::Continue,
            HandshakeState::Continue => {}
        }

        self.inbound.push(inbound);
        self.pump()?;

        if !self.conn.is_handshaking() {
            self.state = HandshakeState::Complete;
            debug!(
                "handshake complete for {:?}, alpn negotiated: {}",
                self.server_name,
                self.conn.alpn_protocol().is_some()
            );
        }

        let produced = self.outbound.drain_into(outbound);
        Ok(HandshakeOutcome {
            state: self.state,
            produced,
            pending: self.outbound.pending() > 0,
        })
    }

    fn read(&mut self, inbound: &[u8], plaintext: &mut [u8]) -> Result<ReadOutcome, TlsError> {
        if self.state == HandshakeState::Error {
            return Err(self.error_state());
        }
        let had_input = !inbound.is_empty();
        self.inbound.push(inbound);

        let mut io_state = self.process()?;
        let mut available = io_state.plaintext_bytes_to_read();
        let mut produced = 0;

        // Interleave decryption with draining: rustls caps its internal
        // plaintext buffer, so ciphertext stays queued until the caller
        // takes the plaintext out.
        loop {
            let n = self.drain_reader(&mut plaintext[produced..])?;
            produced += n;
            available = available.saturating_sub(n);

            if produced == plaintext.len()
                || self.inbound.pending() == 0
                || !self.conn.wants_read()
            {
                break;
            }
            let before = self.inbound.pending();
            match self.conn.read_tls(&mut self.inbound) {
                Ok(_) => {}
                // Plaintext backpressure: leave the rest queued.
                Err(ref e) if e.kind() == std::io::ErrorKind::Other => break,
                Err(e) => {
                    let err = TlsError::Io(e);
                    self.fail(&err);
                    return Err(err);
                }
            }
            if self.inbound.pending() == before {
                break;
            }
            io_state = self.process()?;
            available = io_state.plaintext_bytes_to_read();
        }
        self.pump_writes();

        let more_buffered = available > 0 || self.inbound.pending() > 0;
        let peer_closed = io_state.peer_has_closed();
        let status = if produced > 0 && more_buffered {
            ReadStatus::MoreAvailable
        } else if self.outbound.pending() > 0 {
            ReadStatus::HasWrite
        } else if peer_closed && produced == 0 && !more_buffered {
            ReadStatus::Eof
        } else if produced == 0 && !had_input && self.inbound.pending() == 0 && !peer_closed {
            ReadStatus::ReadAgain
        } else {
            ReadStatus::Ok
        };
        Ok(ReadOutcome { status, produced })
    }

    fn write(&mut self, plaintext: &[u8], outbound: &mut [u8]) -> Result<WriteOutcome, TlsError> {
        match self.state {
            HandshakeState::Complete => {}
            HandshakeState::Error => return Err(self.error_state()),
            _ => {
                return Err(TlsError::Handshake(
                    "write before handshake completion".into(),
                ))
            }
        }
        self.conn
            .writer()
            .write_all(plaintext)
            .map_err(TlsError::Io)?;
        self.pump_writes();
        let produced = self.outbound.drain_into(outbound);
        Ok(WriteOutcome {
            produced,
            pending: self.outbound.pending() > 0,
        })
    }

    fn drain_outbound(&mut self, outbound: &mut [u8]) -> WriteOutcome {
        if self.state != HandshakeState::Error {
            self.pump_writes();
        }
        let produced = self.outbound.drain_into(outbound);
        WriteOutcome {
            produced,
            pending: self.outbound.pending() > 0,
        }
    }

    fn close(&mut self, outbound: &mut [u8]) -> usize {
        if self.state == HandshakeState::Error {
            return 0;
        }
        if !self.close_notify_sent {
            self.conn.send_close_notify();
            self.close_notify_sent = true;
        }
        self.pump_writes();
        self.outbound.drain_into(outbound)
    }

    fn reset(&mut self) -> Result<(), TlsError> {
        // An established session already reached the shared session
        // cache; the fresh connection below offers it for resumption.
        self.conn = ClientConnection::new(Arc::clone(&self.config), self.server_name.clone())
            .map_err(|e| TlsError::Config(e.to_string()))?;
        self.inbound.clear();
        self.outbound.clear();
        self.state = HandshakeState::Before;
        self.last_error = None;
        self.close_notify_sent = false;
        Ok(())
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        if self.state != HandshakeState::Complete {
            return None;
        }
        self.conn.alpn_protocol()
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, TrustAnchors};
    use rustls::ServerConnection;

    struct TestPki {
        ca_pem: String,
        server_config: Arc<rustls::ServerConfig>,
    }

    fn test_pki(server_sans: Vec<String>, server_cn: Option<&str>, alpn: &[&str]) -> TestPki {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = rcgen::KeyPair::generate().unwrap();
        let mut server_params = rcgen::CertificateParams::new(server_sans).unwrap();
        if let Some(cn) = server_cn {
            server_params
                .distinguished_name
                .push(rcgen::DnType::CommonName, cn);
        }
        let server_cert = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let key_der = rustls_pki_types::PrivateKeyDer::try_from(
            server_key.serialize_der(),
        )
        .unwrap();
        let mut server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(server_cert.der().as_ref().to_vec())],
                key_der,
            )
            .unwrap();
        server_config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        TestPki {
            ca_pem: ca.pem(),
            server_config: Arc::new(server_config),
        }
    }

    fn client_context(pki: &TestPki, alpn: &[&str]) -> Context {
        Context::builder()
            .trust_anchors(TrustAnchors::Pem(pki.ca_pem.clone().into_bytes()))
            .alpn(alpn.iter().map(|p| p.as_bytes().to_vec()))
            .build()
            .unwrap()
    }

    fn server_flush(server: &mut ServerConnection) -> Vec<u8> {
        let mut out = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut out).unwrap();
        }
        out
    }

    fn server_feed(server: &mut ServerConnection, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = server.read_tls(&mut bytes).unwrap();
            assert!(n > 0);
            server.process_new_packets().unwrap();
        }
    }

    /// Drive engine and in-memory server to handshake completion.
    fn complete_handshake(engine: &mut RustlsEngine, server: &mut ServerConnection) {
        let mut to_engine = Vec::new();
        let mut buf = [0u8; 32 * 1024];
        for _ in 0..20 {
            let outcome = engine.handshake(&to_engine, &mut buf).unwrap();
            to_engine.clear();
            let mut to_server = buf[..outcome.produced].to_vec();
            let mut pending = outcome.pending;
            while pending {
                let more = engine.drain_outbound(&mut buf);
                to_server.extend_from_slice(&buf[..more.produced]);
                pending = more.pending;
            }
            server_feed(server, &to_server);
            to_engine = server_flush(server);
            if outcome.state == HandshakeState::Complete && !server.is_handshaking() {
                return;
            }
        }
        panic!("handshake did not converge");
    }

    fn established() -> (RustlsEngine, ServerConnection) {
        let pki = test_pki(vec!["localhost".into()], None, &["h2", "http/1.1"]);
        let ctx = client_context(&pki, &["h2", "http/1.1"]);
        let mut engine = ctx.new_engine("localhost").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
        (engine, server)
    }

    /// Encrypt `payload` on the server side and return the ciphertext.
    fn server_encrypt(server: &mut ServerConnection, payload: &[u8]) -> Vec<u8> {
        server.writer().write_all(payload).unwrap();
        server_flush(server)
    }

    #[test]
    fn test_handshake_completes_with_alpn() {
        let (engine, _server) = established();
        assert_eq!(engine.handshake_state(), HandshakeState::Complete);
        assert_eq!(engine.alpn_protocol(), Some(b"h2".as_slice()));
    }

    #[test]
    fn test_alpn_is_from_configured_list() {
        let pki = test_pki(vec!["localhost".into()], None, &["http/1.1"]);
        let ctx = client_context(&pki, &["h2", "http/1.1"]);
        let mut engine = ctx.new_engine("localhost").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
        let negotiated = engine.alpn_protocol().unwrap();
        assert!([b"h2".as_slice(), b"http/1.1".as_slice()].contains(&negotiated));
    }

    #[test]
    fn test_alpn_unavailable_before_complete() {
        let pki = test_pki(vec!["localhost".into()], None, &["h2"]);
        let ctx = client_context(&pki, &["h2"]);
        let engine = ctx.new_engine("localhost").unwrap();
        assert_eq!(engine.handshake_state(), HandshakeState::Before);
        assert_eq!(engine.alpn_protocol(), None);
    }

    #[test]
    fn test_write_then_server_reads_roundtrip() {
        let (mut engine, mut server) = established();

        let mut buf = [0u8; 32 * 1024];
        let outcome = engine.write(b"hello over tls", &mut buf).unwrap();
        assert!(outcome.produced > 0);
        assert!(!outcome.pending);
        server_feed(&mut server, &buf[..outcome.produced]);

        let mut plain = [0u8; 64];
        let n = server.reader().read(&mut plain).unwrap();
        assert_eq!(&plain[..n], b"hello over tls");
    }

    #[test]
    fn test_write_before_complete_fails() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("localhost").unwrap();
        let mut buf = [0u8; 1024];
        assert!(matches!(
            engine.write(b"too early", &mut buf),
            Err(TlsError::Handshake(_))
        ));
    }

    #[test]
    fn test_read_chunking_invariance() {
        // Feeding the ciphertext stream in arbitrary pieces must yield
        // the same plaintext as feeding it whole.
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

        for chunk in [1usize, 7, 1024, usize::MAX] {
            let (mut engine, mut server) = established();
            let ciphertext = server_encrypt(&mut server, &payload);

            let mut plaintext = Vec::new();
            let mut buf = [0u8; 4096];
            for piece in ciphertext.chunks(chunk.min(ciphertext.len())) {
                let mut outcome = engine.read(piece, &mut buf).unwrap();
                plaintext.extend_from_slice(&buf[..outcome.produced]);
                while outcome.status == ReadStatus::MoreAvailable {
                    outcome = engine.read(&[], &mut buf).unwrap();
                    plaintext.extend_from_slice(&buf[..outcome.produced]);
                }
            }
            assert_eq!(plaintext, payload, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_read_empty_input_is_read_again() {
        let (mut engine, _server) = established();
        let mut buf = [0u8; 1024];
        let outcome = engine.read(&[], &mut buf).unwrap();
        assert_eq!(outcome.status, ReadStatus::ReadAgain);
        assert_eq!(outcome.produced, 0);
    }

    #[test]
    fn test_clean_close_notify_is_eof() {
        let (mut engine, mut server) = established();

        server.writer().write_all(b"bye").unwrap();
        server.send_close_notify();
        let ciphertext = server_flush(&mut server);

        let mut buf = [0u8; 1024];
        let outcome = engine.read(&ciphertext, &mut buf).unwrap();
        assert_eq!(&buf[..outcome.produced], b"bye");

        let outcome = engine.read(&[], &mut buf).unwrap();
        assert_eq!(outcome.status, ReadStatus::Eof);
    }

    #[test]
    fn test_undersized_handshake_buffer_continues() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("localhost").unwrap();

        // The ClientHello does not fit in 16 bytes.
        let mut small = [0u8; 16];
        let outcome = engine.handshake(&[], &mut small).unwrap();
        assert_eq!(outcome.state, HandshakeState::Continue);
        assert_eq!(outcome.produced, 16);
        assert!(outcome.pending);

        // Draining the queue completes the flight.
        let mut hello = small[..].to_vec();
        let mut big = [0u8; 8 * 1024];
        loop {
            let more = engine.drain_outbound(&mut big);
            hello.extend_from_slice(&big[..more.produced]);
            if !more.pending {
                break;
            }
        }
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        server_feed(&mut server, &hello);
        assert!(server_flush(&mut server).len() > 0);
    }

    #[test]
    fn test_handshake_garbage_sets_error_state() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("localhost").unwrap();

        let mut buf = [0u8; 8 * 1024];
        engine.handshake(&[], &mut buf).unwrap();
        let garbage = vec![0x55u8; 512];
        let err = engine.handshake(&garbage, &mut buf).unwrap_err();
        assert!(matches!(err, TlsError::Handshake(_)));
        assert_eq!(engine.handshake_state(), HandshakeState::Error);
        assert!(engine.last_error().is_some());

        // Close after an error must stay silent.
        let n = engine.close(&mut buf);
        assert_eq!(n, 0);

        // And further reads report the stored error.
        assert!(engine.read(&[], &mut buf).is_err());
    }

    #[test]
    fn test_close_emits_close_notify_once() {
        let (mut engine, mut server) = established();
        let mut buf = [0u8; 1024];
        let n = engine.close(&mut buf);
        assert!(n > 0);
        // Idempotent: a second close produces nothing new.
        assert_eq!(engine.close(&mut buf), 0);

        server_feed(&mut server, &buf[..n]);
        let mut plain = [0u8; 16];
        // The server observes a clean EOF.
        assert_eq!(server.reader().read(&mut plain).unwrap(), 0);
    }

    #[test]
    fn test_reset_returns_to_before_and_reconnects() {
        let pki = test_pki(vec!["localhost".into()], None, &["h2"]);
        let ctx = client_context(&pki, &["h2"]);
        let mut engine = ctx.new_engine("localhost").unwrap();

        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);

        engine.reset().unwrap();
        assert_eq!(engine.handshake_state(), HandshakeState::Before);
        assert_eq!(engine.alpn_protocol(), None);

        // Full or resumed, the next handshake must converge again.
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
        assert_eq!(engine.alpn_protocol(), Some(b"h2".as_slice()));
    }

    #[test]
    fn test_reset_clears_error_state() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("localhost").unwrap();

        let mut buf = [0u8; 8 * 1024];
        engine.handshake(&[], &mut buf).unwrap();
        let _ = engine.handshake(&[0xAAu8; 64], &mut buf).unwrap_err();
        assert_eq!(engine.handshake_state(), HandshakeState::Error);

        engine.reset().unwrap();
        assert_eq!(engine.handshake_state(), HandshakeState::Before);
        assert_eq!(engine.last_error(), None);

        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
    }

    #[test]
    fn test_ip_san_certificate_accepted_for_ip_literal() {
        // Certificate has no matching CN, only an IP SAN.
        let pki = test_pki(vec!["127.0.0.1".into()], Some("something-else"), &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("127.0.0.1").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
        assert_eq!(engine.handshake_state(), HandshakeState::Complete);
    }

    #[test]
    fn test_hostname_mismatch_is_verify_error() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = client_context(&pki, &[]);
        let mut engine = ctx.new_engine("other.example").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();

        let mut buf = [0u8; 32 * 1024];
        let outcome = engine.handshake(&[], &mut buf).unwrap();
        server_feed(&mut server, &buf[..outcome.produced]);
        let reply = server_flush(&mut server);
        let err = engine.handshake(&reply, &mut buf).unwrap_err();
        assert!(matches!(err, TlsError::Verify(_)), "got: {err}");
        assert_eq!(engine.handshake_state(), HandshakeState::Error);
    }

    #[test]
    fn test_custom_verifier_rejection() {
        use x509_parser::prelude::parse_x509_certificate;

        let pki = test_pki(vec!["localhost".into()], Some("reject"), &[]);
        // Trust is delegated: reject leaves whose CN is "reject".
        let ctx = Context::builder()
            .verifier(|cert: &CertificateDer<'_>| {
                let Ok((_, parsed)) = parse_x509_certificate(cert.as_ref()) else {
                    return false;
                };
                let ok = parsed
                    .subject()
                    .iter_common_name()
                    .filter_map(|cn| cn.as_str().ok())
                    .all(|cn| cn != "reject");
                ok
            })
            .build()
            .unwrap();

        let mut engine = ctx.new_engine("localhost").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();

        let mut buf = [0u8; 32 * 1024];
        let outcome = engine.handshake(&[], &mut buf).unwrap();
        server_feed(&mut server, &buf[..outcome.produced]);
        let reply = server_flush(&mut server);
        let err = engine.handshake(&reply, &mut buf).unwrap_err();
        assert!(matches!(err, TlsError::Verify(_)), "got: {err}");
    }

    #[test]
    fn test_custom_verifier_accepts_self_signed() {
        let pki = test_pki(vec!["localhost".into()], None, &[]);
        let ctx = Context::builder().verifier(|_| true).build().unwrap();
        let mut engine = ctx.new_engine("localhost").unwrap();
        let mut server = ServerConnection::new(Arc::clone(&pki.server_config)).unwrap();
        complete_handshake(&mut engine, &mut server);
        assert!(engine.peer_certificate().is_some());
    }

    #[test]
    fn test_export_keying_material_after_handshake() {
        let (engine, _server) = established();
        let mut ekm = [0u8; 32];
        engine
            .export_keying_material(&mut ekm, b"EXPORTER-test", None)
            .unwrap();
        assert_ne!(ekm, [0u8; 32]);
    }

    #[test]
    fn test_byte_queue_cursor_discipline() {
        let mut q = ByteQueue::default();
        q.push(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(q.drain_into(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(q.pending(), 2);
        q.push(b"gh");
        let mut out = [0u8; 8];
        assert_eq!(q.drain_into(&mut out), 4);
        assert_eq!(&out[..4], b"efgh");
        assert_eq!(q.pending(), 0);
    }
}
