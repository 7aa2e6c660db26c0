//! Cryptographic context: the engine factory.
//!
//! A [`Context`] is built once, carries trust anchors, ALPN preference,
//! an optional client identity, and an optional delegated verifier, and
//! mints one engine per connection. It is cheap to clone: clones share
//! the underlying rustls configuration and its session cache.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::debug;
use rustls::client::ResolvesClientCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, SignatureScheme};
use rustls_pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_parser::prelude::parse_x509_certificate;

use crate::cert::CertChain;
use crate::engine::RustlsEngine;
use crate::error::TlsError;
use crate::key::PrivateKey;
use crate::verify::{EngineCertVerifier, LeafVerifier};

/// Bundle files probed for [`TrustAnchors::OsDefault`] on Unix, in
/// order.
#[cfg(not(windows))]
const CA_BUNDLE_PATHS: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
];

/// Where the context's trust anchors come from.
#[derive(Debug, Clone)]
pub enum TrustAnchors {
    /// A PEM buffer. A buffer that holds a filesystem path instead of
    /// PEM is followed to that file.
    Pem(Vec<u8>),
    /// A PEM bundle file.
    File(PathBuf),
    /// The platform default: the system `ROOT` store on Windows, the
    /// first readable well-known bundle file elsewhere.
    OsDefault,
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    trust: TrustAnchors,
    alpn: Vec<Vec<u8>>,
    identity: Option<(Option<CertChain>, PrivateKey)>,
    verifier: Option<Arc<LeafVerifier>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            trust: TrustAnchors::OsDefault,
            alpn: Vec::new(),
            identity: None,
            verifier: None,
        }
    }

    pub fn trust_anchors(mut self, trust: TrustAnchors) -> Self {
        self.trust = trust;
        self
    }

    /// Ordered ALPN protocol identifiers, presented verbatim.
    pub fn alpn<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        self.alpn = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Client identity for mutual TLS. `chain` may be `None` for a
    /// token key that carries its own certificate. Staging a new
    /// identity replaces any previously staged pair wholesale.
    pub fn identity(mut self, chain: Option<CertChain>, key: PrivateKey) -> Self {
        self.identity = Some((chain, key));
        self
    }

    /// Delegate leaf-certificate trust to the application. When set,
    /// intermediates are trusted unconditionally and the closure's
    /// verdict decides the handshake.
    pub fn verifier<F>(mut self, verifier: F) -> Self
    where
        F: Fn(&CertificateDer<'_>) -> bool + Send + Sync + 'static,
    {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn build(self) -> Result<Context, TlsError> {
        crate::logging::init();

        for proto in &self.alpn {
            if proto.is_empty() || proto.len() > 255 {
                return Err(TlsError::Config(
                    "ALPN identifiers must be 1-255 bytes".into(),
                ));
            }
        }

        let roots = match (&self.verifier, &self.trust) {
            // A delegate owns trust; skip bundle loading entirely so a
            // missing OS bundle cannot fail the build.
            (Some(_), TrustAnchors::OsDefault) => RootCertStore::empty(),
            _ => resolve_trust(&self.trust)?,
        };
        let verifier = EngineCertVerifier::new(roots, self.verifier)?;

        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let mut config = match self.identity {
            Some((chain, key)) => {
                let resolver = client_identity(chain, &key)?;
                builder.with_client_cert_resolver(Arc::new(resolver))
            }
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = self.alpn.clone();

        Ok(Context {
            inner: Arc::new(ContextInner {
                config: Arc::new(config),
            }),
        })
    }
}

/// Engine factory. Read-only after construction; shareable across
/// tasks and event loops.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: Arc<ClientConfig>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("alpn", &self.inner.config.alpn_protocols)
            .finish()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Mint an engine targeting `hostname` (DNS name or IP literal).
    pub fn new_engine(&self, hostname: &str) -> Result<RustlsEngine, TlsError> {
        if hostname.is_empty() {
            return Err(TlsError::Config("hostname must not be empty".into()));
        }
        RustlsEngine::new(Arc::clone(&self.inner.config), hostname)
    }
}

fn resolve_trust(trust: &TrustAnchors) -> Result<RootCertStore, TlsError> {
    match trust {
        TrustAnchors::Pem(bytes) => {
            match CertChain::from_pem(bytes) {
                Ok(chain) => store_from_chain(chain),
                Err(parse_err) => {
                    // The buffer may hold a path instead of PEM.
                    let text = std::str::from_utf8(bytes)
                        .map(str::trim)
                        .unwrap_or_default();
                    if !text.is_empty() && Path::new(text).is_file() {
                        store_from_chain(CertChain::from_pem_file(text)?)
                    } else {
                        Err(TlsError::Config(format!("bad CA bundle: {parse_err}")))
                    }
                }
            }
        }
        TrustAnchors::File(path) => store_from_chain(CertChain::from_pem_file(path)?),
        TrustAnchors::OsDefault => os_default_roots(),
    }
}

fn store_from_chain(chain: CertChain) -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(chain.into_der());
    if added == 0 {
        return Err(TlsError::Config(
            "no usable trust anchors in CA bundle".into(),
        ));
    }
    if ignored > 0 {
        debug!("ignored {ignored} unusable certificates in CA bundle");
    }
    Ok(store)
}

#[cfg(windows)]
fn os_default_roots() -> Result<RootCertStore, TlsError> {
    let mut store = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| TlsError::Config(format!("system ROOT store unavailable: {e}")))?;
    let (added, _) = store.add_parsable_certificates(certs);
    if added == 0 {
        debug!("system ROOT store yielded no anchors, using compiled-in bundle");
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }
    Ok(store)
}

#[cfg(not(windows))]
fn os_default_roots() -> Result<RootCertStore, TlsError> {
    for path in CA_BUNDLE_PATHS {
        let Ok(chain) = CertChain::from_pem_file(path) else {
            continue;
        };
        debug!("loaded trust anchors from {path}");
        return store_from_chain(chain);
    }
    // No bundle file on this system; fall back to the compiled-in
    // Mozilla roots.
    debug!("no CA bundle file found, using compiled-in bundle");
    let mut store = RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(store)
}

fn client_identity(
    chain: Option<CertChain>,
    key: &PrivateKey,
) -> Result<IdentityResolver, TlsError> {
    let chain = match chain {
        Some(chain) if !chain.is_empty() => chain,
        _ => key.token_certificate().ok_or_else(|| {
            TlsError::Config("client identity requires a certificate".into())
        })?,
    };

    // The leaf must carry the public half of the key.
    let leaf = chain
        .leaf()
        .ok_or_else(|| TlsError::Config("client identity requires a certificate".into()))?;
    let (_, parsed) = parse_x509_certificate(leaf.as_ref())
        .map_err(|_| TlsError::Config("client certificate is not valid DER".into()))?;
    let cert_bits = parsed.public_key().subject_public_key.data.as_ref();
    if Sha256::digest(cert_bits) != Sha256::digest(key.public_key_bits()) {
        return Err(TlsError::Config(
            "client certificate public key does not match the private key".into(),
        ));
    }

    let certified = CertifiedKey::new(chain.into_der(), key.signing_key());
    Ok(IdentityResolver {
        certified: Arc::new(certified),
    })
}

#[derive(Debug)]
struct IdentityResolver {
    certified: Arc<CertifiedKey>,
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.certified))
    }

    fn has_certs(&self) -> bool {
        true
    }
}
