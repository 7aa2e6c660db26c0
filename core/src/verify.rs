//! Server certificate verification extension.
//!
//! Wraps the stock webpki verifier with two behaviors the engine needs:
//! IP-address subjectAltName matching for connections made to IP
//! literals, and application-delegated leaf verification. TLS
//! proof-of-possession signature checks always go to the crypto
//! provider regardless of which trust path is active.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme,
};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

use crate::error::TlsError;

/// Application-delegated leaf verifier. The closure carries whatever
/// context it captured when it was installed on the Context.
pub type LeafVerifier = dyn Fn(&CertificateDer<'_>) -> bool + Send + Sync;

pub(crate) struct EngineCertVerifier {
    /// Present when chain trust is anchored in a root store; absent
    /// when a delegate owns leaf trust.
    webpki: Option<Arc<WebPkiServerVerifier>>,
    delegate: Option<Arc<LeafVerifier>>,
    supported_algs: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for EngineCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCertVerifier")
            .field("webpki", &self.webpki.is_some())
            .field("delegate", &self.delegate.is_some())
            .finish()
    }
}

impl EngineCertVerifier {
    pub(crate) fn new(
        roots: RootCertStore,
        delegate: Option<Arc<LeafVerifier>>,
    ) -> Result<Self, TlsError> {
        let supported_algs = rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms;

        // With a delegate installed, intermediates are trusted
        // unconditionally and no chain is built, so the root store may
        // legitimately be empty.
        let webpki = if delegate.is_some() {
            None
        } else {
            if roots.is_empty() {
                return Err(TlsError::Config("no trust anchors configured".into()));
            }
            let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TlsError::Config(format!("trust store rejected: {e}")))?;
            Some(verifier)
        };

        Ok(Self {
            webpki,
            delegate,
            supported_algs,
        })
    }
}

impl ServerCertVerifier for EngineCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        if let Some(delegate) = &self.delegate {
            // Application-owned trust: the leaf goes to the delegate,
            // intermediates are not chained at all.
            return if delegate(end_entity) {
                Ok(ServerCertVerified::assertion())
            } else {
                debug!("delegated verifier rejected leaf certificate");
                Err(RustlsError::InvalidCertificate(
                    CertificateError::ApplicationVerificationFailure,
                ))
            };
        }

        // Constructed with either a delegate or a webpki verifier.
        let Some(webpki) = self.webpki.as_ref() else {
            return Err(RustlsError::General("no trust path configured".into()));
        };

        match webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(verified) => Ok(verified),
            Err(RustlsError::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                if let ServerName::IpAddress(ip) = server_name {
                    if leaf_matches_ip_san(end_entity, IpAddr::from(*ip)) {
                        debug!("name mismatch cleared by IP SAN match for {ip:?}");
                        return Ok(ServerCertVerified::assertion());
                    }
                }
                Err(RustlsError::InvalidCertificate(err))
            }
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        // The server must prove possession of the key even when a
        // delegate owns trust.
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// Walk the leaf's subjectAltName entries for an IP address whose raw
/// bytes (4 for v4, 16 for v6) equal the connection target.
fn leaf_matches_ip_san(leaf: &CertificateDer<'_>, target: IpAddr) -> bool {
    let Ok((_, cert)) = parse_x509_certificate(leaf.as_ref()) else {
        return false;
    };
    let Ok(Some(san)) = cert.subject_alternative_name() else {
        return false;
    };
    let target_octets: Vec<u8> = match target {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    san.value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(raw) if *raw == target_octets.as_slice()))
}
