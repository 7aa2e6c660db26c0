//! Error types.

use thiserror::Error;

/// Errors produced by the context, engine, key, and stream layers.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Bad CA bundle, bad own certificate/key pairing, or an invalid
    /// hostname handed to [`crate::Context::new_engine`].
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS protocol failure: unsupported version, alert received,
    /// handshake aborted by the peer.
    #[error("handshake failure: {0}")]
    Handshake(String),

    /// Peer certificate rejected: chain invalid, hostname mismatch not
    /// satisfied by an IP SAN, or the delegated verifier said no.
    #[error("certificate verification failed: {0}")]
    Verify(String),

    /// Socket error surfaced through the engine's ciphertext sink/source.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed PEM or ASN.1 input.
    #[error("malformed input: {0}")]
    Protocol(String),

    /// Sign/verify failure or unavailable hash algorithm.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// PKCS#11 token failure.
    #[error(transparent)]
    Token(#[from] TokenError),
}

/// PKCS#11 token error kinds. Each carries the reason derived from the
/// driver's return value.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to load PKCS#11 driver {path}: {reason}")]
    DriverLoad { path: String, reason: String },

    #[error("failed to open session on slot {slot}: {reason}")]
    SessionOpen { slot: u64, reason: String },

    #[error("token object not found: {what}")]
    ObjectNotFound { what: String },

    #[error("token rejected PIN: {reason}")]
    PinFailure { reason: String },

    #[error("token {op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
}

impl From<TlsError> for std::io::Error {
    fn from(e: TlsError) -> Self {
        match e {
            TlsError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Classify a rustls error into the [`TlsError`] taxonomy.
///
/// Certificate problems (including rejections raised by the verifier
/// extension) map to `Verify`; everything else that happens while
/// driving the connection is a `Handshake` failure.
pub(crate) fn classify_rustls(err: rustls::Error) -> TlsError {
    match &err {
        rustls::Error::InvalidCertificate(_) | rustls::Error::InvalidCertRevocationList(_) => {
            TlsError::Verify(err.to_string())
        }
        _ => TlsError::Handshake(err.to_string()),
    }
}
