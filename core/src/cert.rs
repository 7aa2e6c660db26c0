//! Certificate chains: PEM parsing and emission, PKCS#7 transport, and
//! signature verification against arbitrary data.
//!
//! Chains are leaf-first. PKCS#7 input is the certificates-only
//! signed-data profile (no signers required).

use std::io::BufRead;
use std::path::Path;

use base64::Engine as _;
use rustls_pki_types::CertificateDer;
use asn1_rs::{Any, Class, FromDer, Integer, Oid, Sequence, Tag, ToDer};
use asn1_rs::oid;
use x509_parser::prelude::parse_x509_certificate;

use crate::error::TlsError;

const PKCS7_SIGNED_DATA: Oid<'static> = oid!(1.2.840.113549.1.7.2);
const PKCS7_DATA: Oid<'static> = oid!(1.2.840.113549.1.7.1);

/// Hash algorithms accepted by [`verify_signature`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

/// An ordered X.509 certificate chain, leaf first.
#[derive(Debug, Clone, Default)]
pub struct CertChain {
    certs: Vec<CertificateDer<'static>>,
}

impl CertChain {
    /// Parse concatenated PEM certificates.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, TlsError> {
        let mut reader = std::io::BufReader::new(bytes);
        Self::from_pem_reader(&mut reader)
    }

    /// Parse a PEM bundle file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let file = std::fs::File::open(path.as_ref()).map_err(TlsError::Io)?;
        let mut reader = std::io::BufReader::new(file);
        Self::from_pem_reader(&mut reader)
    }

    fn from_pem_reader(reader: &mut dyn BufRead) -> Result<Self, TlsError> {
        let mut certs = Vec::new();
        for cert in rustls_pemfile::certs(reader) {
            let cert = cert.map_err(|e| TlsError::Protocol(format!("invalid PEM: {e}")))?;
            certs.push(cert);
        }
        if certs.is_empty() {
            return Err(TlsError::Protocol("no certificates in PEM input".into()));
        }
        Ok(Self { certs })
    }

    /// Wrap a single DER certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, TlsError> {
        parse_x509_certificate(&der)
            .map_err(|_| TlsError::Protocol("invalid DER certificate".into()))?;
        Ok(Self {
            certs: vec![CertificateDer::from(der)],
        })
    }

    /// Parse a Base64-encoded PKCS#7 signed-data blob carrying a
    /// certificate chain.
    ///
    /// The expected structure is
    /// `SEQUENCE → OID(signedData) → [0] → SEQUENCE → INTEGER → SET →
    /// SEQUENCE(OID(data)) → [0] → certificates`; anything else fails
    /// with [`TlsError::Protocol`].
    pub fn from_pkcs7_base64(blob: &str) -> Result<Self, TlsError> {
        let compact: String = blob.chars().filter(|c| !c.is_whitespace()).collect();
        let der = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| TlsError::Protocol(format!("invalid Base64: {e}")))?;
        let certs = parse_pkcs7_certs(&der)?;
        Ok(Self { certs })
    }

    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.certs.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateDer<'static>> {
        self.certs.iter()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Emit the whole chain as concatenated PEM, leaf first.
    pub fn to_pem(&self) -> String {
        self.certs
            .iter()
            .map(|c| pem::encode(&pem::Pem::new("CERTIFICATE", c.as_ref().to_vec())))
            .collect()
    }

    /// Emit only the leaf certificate as PEM.
    pub fn leaf_to_pem(&self) -> Option<String> {
        self.leaf()
            .map(|c| pem::encode(&pem::Pem::new("CERTIFICATE", c.as_ref().to_vec())))
    }

    pub fn into_der(self) -> Vec<CertificateDer<'static>> {
        self.certs
    }

    /// Verify `signature` over `data` against the leaf's public key.
    ///
    /// See [`verify_signature`] for the ECDSA raw-signature fallback.
    pub fn verify_data(
        &self,
        algorithm: HashAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), TlsError> {
        let leaf = self
            .leaf()
            .ok_or_else(|| TlsError::Crypto("empty certificate chain".into()))?;
        verify_signature(leaf, algorithm, data, signature)
    }
}

impl From<Vec<CertificateDer<'static>>> for CertChain {
    fn from(certs: Vec<CertificateDer<'static>>) -> Self {
        Self { certs }
    }
}

/// Hash `data` with `algorithm` and verify `signature` against the
/// certificate's public key.
///
/// ECDSA signatures are first tried as given (DER). On failure the
/// signature is rewrapped as `SEQUENCE { INTEGER r, INTEGER s }` by
/// splitting the raw buffer in half and the verification is retried,
/// which accepts the raw fixed-width form hardware tokens produce.
pub fn verify_signature(
    cert: &CertificateDer<'_>,
    algorithm: HashAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<(), TlsError> {
    let (_, parsed) = parse_x509_certificate(cert.as_ref())
        .map_err(|_| TlsError::Protocol("invalid DER certificate".into()))?;
    let spki = parsed.public_key();
    let key_bits = spki.subject_public_key.data.as_ref();

    let alg = spki_verification_algorithm(
        &spki.algorithm.algorithm,
        spki.algorithm.parameters.as_ref(),
        algorithm,
    )?;
    let key = aws_lc_rs::signature::UnparsedPublicKey::new(alg, key_bits);

    if key.verify(data, signature).is_ok() {
        return Ok(());
    }

    if is_ec_key(&spki.algorithm.algorithm) {
        let der = ecdsa_raw_to_der(signature)?;
        if key.verify(data, &der).is_ok() {
            return Ok(());
        }
    }

    Err(TlsError::Crypto("signature verification failed".into()))
}

fn is_ec_key(alg: &Oid<'_>) -> bool {
    *alg == oid!(1.2.840.10045.2.1)
}

fn spki_verification_algorithm(
    alg: &Oid<'_>,
    params: Option<&Any<'_>>,
    hash: HashAlgorithm,
) -> Result<&'static dyn aws_lc_rs::signature::VerificationAlgorithm, TlsError> {
    use aws_lc_rs::signature::*;

    if *alg == oid!(1.2.840.113549.1.1.1) {
        return Ok(match hash {
            HashAlgorithm::Sha256 => &RSA_PKCS1_2048_8192_SHA256,
            HashAlgorithm::Sha384 => &RSA_PKCS1_2048_8192_SHA384,
            HashAlgorithm::Sha512 => &RSA_PKCS1_2048_8192_SHA512,
        });
    }

    if is_ec_key(alg) {
        let curve = params
            .and_then(|p| p.as_oid().ok())
            .ok_or_else(|| TlsError::Crypto("EC key without named curve".into()))?;
        let p256 = oid!(1.2.840.10045.3.1.7);
        let p384 = oid!(1.3.132.0.34);
        let p521 = oid!(1.3.132.0.35);
        return match (curve, hash) {
            (c, HashAlgorithm::Sha256) if c == p256 => Ok(&ECDSA_P256_SHA256_ASN1),
            (c, HashAlgorithm::Sha384) if c == p256 => Ok(&ECDSA_P256_SHA384_ASN1),
            (c, HashAlgorithm::Sha256) if c == p384 => Ok(&ECDSA_P384_SHA256_ASN1),
            (c, HashAlgorithm::Sha384) if c == p384 => Ok(&ECDSA_P384_SHA384_ASN1),
            (c, HashAlgorithm::Sha512) if c == p521 => Ok(&ECDSA_P521_SHA512_ASN1),
            _ => Err(TlsError::Crypto("unsupported curve/hash combination".into())),
        };
    }

    Err(TlsError::Crypto("unsupported public key algorithm".into()))
}

/// Rewrap a raw fixed-width ECDSA signature (`r || s`) as DER
/// `SEQUENCE { INTEGER r, INTEGER s }`.
pub(crate) fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, TlsError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(TlsError::Crypto("raw ECDSA signature has odd length".into()));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let mut content = der_unsigned_integer(r)?;
    content.extend(der_unsigned_integer(s)?);
    Sequence::new(content.into())
        .to_der_vec()
        .map_err(|e| TlsError::Crypto(format!("DER encoding failed: {e}")))
}

/// Encode a big-endian unsigned value as a DER INTEGER.
pub(crate) fn der_unsigned_integer(bytes: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut start = 0;
    while start < bytes.len() - 1 && bytes[start] == 0 {
        start += 1;
    }
    let trimmed = &bytes[start..];
    let mut content = Vec::with_capacity(trimmed.len() + 1);
    if trimmed[0] & 0x80 != 0 {
        content.push(0);
    }
    content.extend_from_slice(trimmed);
    Integer::new(&content)
        .to_der_vec()
        .map_err(|e| TlsError::Crypto(format!("DER encoding failed: {e}")))
}

fn bad_pkcs7(what: &str) -> TlsError {
    TlsError::Protocol(format!("invalid PKCS#7: expected {what}"))
}

fn parse_pkcs7_certs(der: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    // ContentInfo ::= SEQUENCE { contentType OID, content [0] EXPLICIT }
    let (_, content_info) =
        Sequence::from_der(der).map_err(|_| bad_pkcs7("outer SEQUENCE"))?;
    let body = content_info.content.as_ref();

    let (rest, content_type) =
        Oid::from_der(body).map_err(|_| bad_pkcs7("content-type OID"))?;
    if content_type != PKCS7_SIGNED_DATA {
        return Err(bad_pkcs7("pkcs7-signedData content type"));
    }

    let (_, tagged) = Any::from_der(rest).map_err(|_| bad_pkcs7("[0] content"))?;
    expect_context_zero(&tagged)?;

    // SignedData ::= SEQUENCE { version, digestAlgorithms, contentInfo, certificates [0], ... }
    let (_, signed_data) =
        Sequence::from_der(tagged.data).map_err(|_| bad_pkcs7("SignedData SEQUENCE"))?;
    let body = signed_data.content.as_ref();

    let (rest, _version) = Integer::from_der(body).map_err(|_| bad_pkcs7("version INTEGER"))?;

    let (rest, digest_algs) =
        Any::from_der(rest).map_err(|_| bad_pkcs7("digest-algorithms SET"))?;
    if digest_algs.header.tag() != Tag::Set {
        return Err(bad_pkcs7("digest-algorithms SET"));
    }

    let (rest, enc_content) =
        Sequence::from_der(rest).map_err(|_| bad_pkcs7("encapsulated content SEQUENCE"))?;
    let (_, inner_type) = Oid::from_der(enc_content.content.as_ref())
        .map_err(|_| bad_pkcs7("encapsulated content OID"))?;
    if inner_type != PKCS7_DATA {
        return Err(bad_pkcs7("pkcs7-data inner content type"));
    }

    let (_, certs_tagged) = Any::from_der(rest).map_err(|_| bad_pkcs7("[0] certificates"))?;
    expect_context_zero(&certs_tagged)?;

    let mut certs = Vec::new();
    let mut input = certs_tagged.data;
    while !input.is_empty() {
        let (rem, cert) = Any::from_der(input).map_err(|_| bad_pkcs7("certificate SEQUENCE"))?;
        if cert.header.tag() != Tag::Sequence {
            return Err(bad_pkcs7("certificate SEQUENCE"));
        }
        let tlv = &input[..input.len() - rem.len()];
        parse_x509_certificate(tlv).map_err(|_| bad_pkcs7("X.509 certificate"))?;
        certs.push(CertificateDer::from(tlv.to_vec()));
        input = rem;
    }
    if certs.is_empty() {
        return Err(bad_pkcs7("at least one certificate"));
    }
    Ok(certs)
}

fn expect_context_zero(any: &Any<'_>) -> Result<(), TlsError> {
    if any.header.class() != Class::ContextSpecific || any.header.tag().0 != 0 {
        return Err(bad_pkcs7("[0] tag"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Self-signed P-256 certificate generated for these tests.
    fn test_cert_pem() -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["test.local".into()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        cert.pem()
    }

    #[test]
    fn test_pem_roundtrip_preserves_der() {
        let pem_in = test_cert_pem();
        let chain = CertChain::from_pem(pem_in.as_bytes()).unwrap();
        assert_eq!(chain.len(), 1);

        let pem_out = chain.to_pem();
        let reparsed = CertChain::from_pem(pem_out.as_bytes()).unwrap();
        assert_eq!(
            chain.leaf().unwrap().as_ref(),
            reparsed.leaf().unwrap().as_ref()
        );
    }

    #[test]
    fn test_pem_rejects_garbage() {
        assert!(matches!(
            CertChain::from_pem(b"not pem at all"),
            Err(TlsError::Protocol(_))
        ));
    }

    #[test]
    fn test_pkcs7_two_cert_chain() {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf_params = rcgen::CertificateParams::new(vec!["leaf.local".into()]).unwrap();
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        let blob = build_pkcs7(&[leaf.der().as_ref(), ca.der().as_ref()]);
        let chain = CertChain::from_pkcs7_base64(&blob).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.leaf().unwrap().as_ref(), leaf.der().as_ref());
    }

    #[test]
    fn test_pkcs7_rejects_wrong_content_type() {
        // pkcs7-data instead of signedData at the top level.
        let oid_der = PKCS7_DATA.to_der_vec().unwrap();
        let outer = Sequence::new(oid_der.into()).to_der_vec().unwrap();
        let blob = base64::engine::general_purpose::STANDARD.encode(outer);
        assert!(matches!(
            CertChain::from_pkcs7_base64(&blob),
            Err(TlsError::Protocol(_))
        ));
    }

    #[test]
    fn test_pkcs7_rejects_bad_base64() {
        assert!(matches!(
            CertChain::from_pkcs7_base64("!!!not base64!!!"),
            Err(TlsError::Protocol(_))
        ));
    }

    #[test]
    fn test_ecdsa_raw_to_der_shape() {
        // 0x80 high bits force zero-padding of both integers.
        let raw = [0x80u8; 64];
        let der = ecdsa_raw_to_der(&raw).unwrap();
        assert_eq!(der[0], 0x30);
        // INTEGER, length 33, leading zero.
        assert_eq!(&der[2..6], &[0x02, 0x21, 0x00, 0x80]);
    }

    #[test]
    fn test_ecdsa_raw_to_der_rejects_odd_length() {
        assert!(ecdsa_raw_to_der(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_verify_signature_ecdsa_raw_and_der() {
        use aws_lc_rs::rand::SystemRandom;
        use aws_lc_rs::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};

        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, doc.as_ref()).unwrap();

        let rc_key = rcgen::KeyPair::try_from(doc.as_ref()).unwrap();
        let params = rcgen::CertificateParams::new(vec!["sig.local".into()]).unwrap();
        let cert = params.self_signed(&rc_key).unwrap();
        let cert_der = CertificateDer::from(cert.der().as_ref().to_vec());

        let data = b"signed payload";
        let raw_sig = key_pair.sign(&rng, data).unwrap();

        // Raw fixed-width signature only verifies through the DER rewrap.
        verify_signature(&cert_der, HashAlgorithm::Sha256, data, raw_sig.as_ref()).unwrap();

        // Pre-wrapped DER verifies on the first attempt.
        let der_sig = ecdsa_raw_to_der(raw_sig.as_ref()).unwrap();
        verify_signature(&cert_der, HashAlgorithm::Sha256, data, &der_sig).unwrap();

        // Tampered data fails both paths.
        assert!(
            verify_signature(&cert_der, HashAlgorithm::Sha256, b"other", raw_sig.as_ref())
                .is_err()
        );
    }

    // Minimal certs-only SignedData builder for tests.
    fn build_pkcs7(certs: &[&[u8]]) -> String {
        let mut cert_blob = Vec::new();
        for c in certs {
            cert_blob.extend_from_slice(c);
        }

        let mut signed_data = Integer::new(&[1]).to_der_vec().unwrap();
        signed_data.extend(der_context(0x31, &[])); // empty SET of digest algs
        let eci = PKCS7_DATA.to_der_vec().unwrap();
        signed_data.extend(Sequence::new(eci.into()).to_der_vec().unwrap());
        signed_data.extend(der_context(0xa0, &cert_blob));
        let signed_data = Sequence::new(signed_data.into()).to_der_vec().unwrap();

        let mut content_info = PKCS7_SIGNED_DATA.to_der_vec().unwrap();
        content_info.extend(der_context(0xa0, &signed_data));
        let der = Sequence::new(content_info.into()).to_der_vec().unwrap();

        base64::engine::general_purpose::STANDARD.encode(der)
    }

    // Raw TLV with the given leading byte (SET or context tag).
    fn der_context(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 128 {
            out.push(len as u8);
        } else if len < 256 {
            out.extend([0x81, len as u8]);
        } else {
            out.extend([0x82, (len >> 8) as u8, (len & 0xff) as u8]);
        }
        out.extend_from_slice(content);
        out
    }
}
