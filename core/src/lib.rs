//! Client-side TLS engine and async stream adapter.
//!
//! The crate splits TLS into two layers. The [`TlsEngine`] is a pure
//! buffer-in/buffer-out state machine: it consumes ciphertext received
//! from the peer, produces ciphertext to send, and exchanges plaintext
//! with the application, without ever touching a socket. The
//! [`TlsStream`] adapter splices an engine into a tokio TCP stream and
//! handles connect, resolve, cancellation, and half-close.
//!
//! Engines are minted by a [`Context`], which carries trust anchors,
//! ALPN preferences, an optional client identity (software or PKCS#11
//! token key), and an optional application-delegated certificate
//! verifier.
//!
//! # Example
//!
//! ```no_run
//! use tlsplice::{Context, TcpOptions, TlsStream, TrustAnchors};
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Context::builder()
//!     .trust_anchors(TrustAnchors::OsDefault)
//!     .alpn(["h2", "http/1.1"])
//!     .build()?;
//!
//! let mut stream =
//!     TlsStream::connect(&context, "example.com", 443, &TcpOptions::default()).await?;
//! stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

mod cert;
mod context;
mod csr;
mod engine;
mod error;
mod key;
mod logging;
mod stream;
mod verify;

pub use cert::{verify_signature, CertChain, HashAlgorithm};
pub use context::{Context, ContextBuilder, TrustAnchors};
pub use csr::generate_csr;
pub use engine::{
    HandshakeOutcome, HandshakeState, ReadOutcome, ReadStatus, RustlsEngine, TlsEngine,
    WriteOutcome,
};
pub use error::{TlsError, TokenError};
pub use key::{KeyAlgorithm, PrivateKey, PublicKey, SoftwareKey};
#[cfg(feature = "pkcs11")]
pub use key::{TokenKey, TokenKeyConfig};
pub use stream::{TcpOptions, TlsStream};
pub use verify::LeafVerifier;
