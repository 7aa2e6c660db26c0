//! Async stream adapter.
//!
//! [`TlsStream`] owns one TCP socket and one engine and moves bytes
//! between them: connect resolves the hostname, establishes TCP,
//! applies socket options, and drives the handshake to completion
//! before returning; afterwards the stream is a plain
//! `AsyncRead`/`AsyncWrite` carrying plaintext.
//!
//! Cancellation follows future ownership: dropping an unfinished
//! `connect` future closes the half-open socket and its completion is
//! never observed, so a replacement connect may start immediately.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};

use crate::context::Context;
use crate::engine::{HandshakeState, ReadStatus, RustlsEngine, TlsEngine};
use crate::error::TlsError;

// One full TLS record plus framing overhead.
const RECV_BUF: usize = 17 * 1024;

/// TCP socket options applied during connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TcpOptions {
    /// TCP keepalive delay in seconds; `None` leaves keepalive off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,

    /// Disable Nagle's algorithm.
    #[serde(default)]
    pub nodelay: bool,
}

/// A TLS-encrypted TCP stream driven through a [`TlsEngine`].
#[derive(Debug)]
pub struct TlsStream<E: TlsEngine = RustlsEngine> {
    io: TcpStream,
    engine: E,
    /// Scratch for socket reads.
    recv: Box<[u8]>,
    /// Scratch for engine ciphertext output.
    scratch: Box<[u8]>,
    /// Ciphertext staged for the socket, with a write cursor.
    staged: Vec<u8>,
    staged_pos: usize,
    /// The transport reported EOF.
    io_eof: bool,
}

impl TlsStream<RustlsEngine> {
    /// Resolve `host`, connect, apply `options`, and complete the TLS
    /// handshake. Any failure closes the half-open socket and surfaces
    /// exactly one error.
    pub async fn connect(
        context: &Context,
        host: &str,
        port: u16,
        options: &TcpOptions,
    ) -> Result<Self, TlsError> {
        let engine = context.new_engine(host)?;

        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(TlsError::Io)?
            .collect();

        let mut last_err = None;
        let mut io = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    io = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("connect to {addr} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        let io = io.ok_or_else(|| {
            TlsError::Io(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
            }))
        })?;
        apply_options(&io, options)?;

        let mut stream = Self::from_parts(io, engine);
        stream.drive_handshake().await?;
        debug!(
            "tls established to {host}:{port}, alpn: {:?}",
            stream
                .engine
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned())
        );
        Ok(stream)
    }
}

impl<E: TlsEngine> TlsStream<E> {
    /// Wire an already-connected socket to an engine. The handshake is
    /// not driven; use this to splice in a different backend.
    pub fn from_parts(io: TcpStream, engine: E) -> Self {
        Self {
            io,
            engine,
            recv: vec![0u8; RECV_BUF].into_boxed_slice(),
            scratch: vec![0u8; RECV_BUF].into_boxed_slice(),
            staged: Vec::new(),
            staged_pos: 0,
            io_eof: false,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.io
    }

    pub fn into_parts(self) -> (TcpStream, E) {
        (self.io, self.engine)
    }

    /// Drive the handshake to completion over the socket.
    pub async fn drive_handshake(&mut self) -> Result<(), TlsError> {
        let mut input: Vec<u8> = Vec::new();
        loop {
            let outcome = self.engine.handshake(&input, &mut self.scratch)?;
            input.clear();
            if outcome.produced > 0 {
                self.io
                    .write_all(&self.scratch[..outcome.produced])
                    .await
                    .map_err(TlsError::Io)?;
            }
            let mut pending = outcome.pending;
            while pending {
                let more = self.engine.drain_outbound(&mut self.scratch);
                if more.produced > 0 {
                    self.io
                        .write_all(&self.scratch[..more.produced])
                        .await
                        .map_err(TlsError::Io)?;
                }
                pending = more.pending;
            }

            if outcome.state == HandshakeState::Complete {
                return Ok(());
            }

            let n = self.io.read(&mut self.recv).await.map_err(TlsError::Io)?;
            if n == 0 {
                return Err(TlsError::Handshake(
                    "peer closed during the handshake".into(),
                ));
            }
            input.extend_from_slice(&self.recv[..n]);
        }
    }

    /// Move all queued engine ciphertext onto the staging buffer.
    fn stage_engine_output(&mut self) {
        loop {
            let outcome = self.engine.drain_outbound(&mut self.scratch);
            if outcome.produced > 0 {
                self.staged.extend_from_slice(&self.scratch[..outcome.produced]);
            }
            if !outcome.pending {
                break;
            }
        }
    }

    fn poll_flush_staged(&mut self, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        while self.staged_pos < self.staged.len() {
            match Pin::new(&mut self.io).poll_write(cx, &self.staged[self.staged_pos..]) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.staged_pos += n,
            }
        }
        self.staged.clear();
        self.staged_pos = 0;
        Poll::Ready(Ok(()))
    }

    fn poll_flush_engine(&mut self, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        self.stage_engine_output();
        self.poll_flush_staged(cx)
    }
}

impl<E: TlsEngine + Unpin> AsyncRead for TlsStream<E> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let dst = buf.initialize_unfilled();
            if dst.is_empty() {
                return Poll::Ready(Ok(()));
            }

            // Drain whatever the engine already holds.
            let outcome = this.engine.read(&[], dst).map_err(io::Error::from)?;
            if outcome.produced > 0 {
                buf.advance(outcome.produced);
                return Poll::Ready(Ok(()));
            }
            match outcome.status {
                ReadStatus::Eof => return Poll::Ready(Ok(())),
                ReadStatus::HasWrite => {
                    // Mid-read rekey or alert: flush before progress.
                    match this.poll_flush_engine(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => continue,
                    }
                }
                ReadStatus::MoreAvailable => continue,
                ReadStatus::Ok | ReadStatus::ReadAgain => {
                    if this.io_eof {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed without close_notify",
                        )));
                    }
                    let mut rb = ReadBuf::new(&mut this.recv);
                    match Pin::new(&mut this.io).poll_read(cx, &mut rb) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {}
                    }
                    let n = rb.filled().len();
                    if n == 0 {
                        // Let the engine classify clean vs dirty EOF.
                        this.io_eof = true;
                        continue;
                    }
                    let outcome = this
                        .engine
                        .read(&this.recv[..n], dst)
                        .map_err(io::Error::from)?;
                    if outcome.produced > 0 {
                        buf.advance(outcome.produced);
                        return Poll::Ready(Ok(()));
                    }
                    if outcome.status == ReadStatus::Eof {
                        return Poll::Ready(Ok(()));
                    }
                }
            }
        }
    }
}

impl<E: TlsEngine + Unpin> AsyncWrite for TlsStream<E> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Backpressure: at most one write's ciphertext stays staged.
        match this.poll_flush_staged(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let outcome = this
            .engine
            .write(data, &mut this.scratch)
            .map_err(io::Error::from)?;
        this.staged.extend_from_slice(&this.scratch[..outcome.produced]);
        if outcome.pending {
            this.stage_engine_output();
        }

        // Opportunistic flush; the bytes are accepted either way.
        if let Poll::Ready(Err(e)) = this.poll_flush_staged(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_engine(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Half-close: close_notify first, then the TCP write side.
        let produced = this.engine.close(&mut this.scratch);
        this.staged.extend_from_slice(&this.scratch[..produced]);
        this.stage_engine_output();

        match this.poll_flush_staged(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}

fn apply_options(io: &TcpStream, options: &TcpOptions) -> Result<(), TlsError> {
    if let Some(secs) = options.keepalive_secs {
        let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(secs));
        SockRef::from(io)
            .set_tcp_keepalive(&keepalive)
            .map_err(TlsError::Io)?;
    }
    io.set_nodelay(options.nodelay).map_err(TlsError::Io)?;
    Ok(())
}
