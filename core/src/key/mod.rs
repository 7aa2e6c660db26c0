//! Private key abstraction.
//!
//! A [`PrivateKey`] is a uniform signing capability: the software
//! variant holds key material in memory, the token variant (feature
//! `pkcs11`) drives a key that never leaves a PKCS#11 device. Both
//! plug into rustls client authentication and into CSR generation.

use std::path::Path;
use std::sync::Arc;

use rustls::sign::SigningKey;
use rustls::SignatureScheme;
use asn1_rs::{oid, BitString, Null, Sequence, ToDer};

use crate::cert::HashAlgorithm;
use crate::error::TlsError;

mod software;
#[cfg(feature = "pkcs11")]
mod token;

pub use software::{PublicKey, SoftwareKey};
#[cfg(feature = "pkcs11")]
pub use token::{TokenKey, TokenKeyConfig};

/// Key algorithm families the engine can authenticate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    EcdsaP256,
    EcdsaP384,
}

/// A client private key: in-memory material or a PKCS#11 token handle.
pub enum PrivateKey {
    Software(SoftwareKey),
    #[cfg(feature = "pkcs11")]
    Token(TokenKey),
}

impl PrivateKey {
    /// Load a software key from PEM (PKCS#8, PKCS#1, or SEC1 framing).
    pub fn from_pem(bytes: &[u8]) -> Result<Self, TlsError> {
        Ok(Self::Software(SoftwareKey::from_pem(bytes)?))
    }

    /// Load a software key from a PEM file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        Ok(Self::Software(SoftwareKey::from_pem_file(path)?))
    }

    /// Load a software key from DER.
    pub fn from_der(der: rustls_pki_types::PrivateKeyDer<'static>) -> Result<Self, TlsError> {
        Ok(Self::Software(SoftwareKey::from_der(der)?))
    }

    /// Open a key on a PKCS#11 token.
    #[cfg(feature = "pkcs11")]
    pub fn from_token(config: &TokenKeyConfig) -> Result<Self, TlsError> {
        Ok(Self::Token(TokenKey::load(config)?))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Software(k) => k.algorithm(),
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.algorithm(),
        }
    }

    /// The matching public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Software(k) => k.public_key().clone(),
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.public_key(),
        }
    }

    /// Sign `data`, hashing it with `algorithm` first. The signature is
    /// returned in the underlying library's native format: DER for
    /// software ECDSA keys, the token's output (usually raw `r || s`)
    /// for token ECDSA keys.
    pub fn sign(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        match self {
            Self::Software(k) => k.sign(algorithm, data),
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.sign(algorithm, data).map_err(TlsError::Token),
        }
    }

    /// The certificate stored alongside a token key, if any.
    pub fn token_certificate(&self) -> Option<crate::cert::CertChain> {
        match self {
            Self::Software(_) => None,
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.certificate(),
        }
    }

    pub(crate) fn signing_key(&self) -> Arc<dyn SigningKey> {
        match self {
            Self::Software(k) => k.signing_key(),
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.signing_key(),
        }
    }

    /// Raw subjectPublicKey bits, used to pair the key with its
    /// certificate.
    pub(crate) fn public_key_bits(&self) -> &[u8] {
        match self {
            Self::Software(k) => k.public_key().bits(),
            #[cfg(feature = "pkcs11")]
            Self::Token(k) => k.public_key_bits(),
        }
    }

    /// Bridge into rcgen so both key variants can sign CSRs.
    pub(crate) fn rcgen_key_pair(&self) -> Result<rcgen::KeyPair, TlsError> {
        let remote = RemoteSigner {
            signing: self.signing_key(),
            public: self.public_key_bits().to_vec(),
            algorithm: self.algorithm(),
        };
        rcgen::KeyPair::from_remote(Box::new(remote))
            .map_err(|e| TlsError::Crypto(format!("key not usable for CSR signing: {e}")))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Software(_) => f.write_str("PrivateKey::Software"),
            #[cfg(feature = "pkcs11")]
            Self::Token(_) => f.write_str("PrivateKey::Token"),
        }
    }
}

/// rcgen remote-key adapter over the rustls signing object.
struct RemoteSigner {
    signing: Arc<dyn SigningKey>,
    public: Vec<u8>,
    algorithm: KeyAlgorithm,
}

impl rcgen::RemoteKeyPair for RemoteSigner {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let scheme = match self.algorithm {
            KeyAlgorithm::Rsa => SignatureScheme::RSA_PKCS1_SHA256,
            KeyAlgorithm::EcdsaP256 => SignatureScheme::ECDSA_NISTP256_SHA256,
            KeyAlgorithm::EcdsaP384 => SignatureScheme::ECDSA_NISTP384_SHA384,
        };
        let signer = self
            .signing
            .choose_scheme(&[scheme])
            .ok_or(rcgen::Error::RemoteKeyError)?;
        signer.sign(msg).map_err(|_| rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self.algorithm {
            KeyAlgorithm::Rsa => &rcgen::PKCS_RSA_SHA256,
            KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

/// Build a subjectPublicKeyInfo for an RSA public key given its PKCS#1
/// encoding.
pub(crate) fn rsa_spki(pkcs1: &[u8]) -> Result<Vec<u8>, TlsError> {
    let mut alg = oid!(1.2.840.113549.1.1.1)
        .to_der_vec()
        .map_err(spki_err)?;
    alg.extend(Null::new().to_der_vec().map_err(spki_err)?);
    let mut body = Sequence::new(alg.into()).to_der_vec().map_err(spki_err)?;
    body.extend(BitString::new(0, pkcs1).to_der_vec().map_err(spki_err)?);
    Sequence::new(body.into()).to_der_vec().map_err(spki_err)
}

/// Build a subjectPublicKeyInfo for an EC public key given the
/// uncompressed point.
pub(crate) fn ec_spki(algorithm: KeyAlgorithm, point: &[u8]) -> Result<Vec<u8>, TlsError> {
    let curve = match algorithm {
        KeyAlgorithm::EcdsaP256 => oid!(1.2.840.10045.3.1.7),
        KeyAlgorithm::EcdsaP384 => oid!(1.3.132.0.34),
        KeyAlgorithm::Rsa => {
            return Err(TlsError::Crypto("RSA key passed to EC SPKI builder".into()))
        }
    };
    let mut alg = oid!(1.2.840.10045.2.1).to_der_vec().map_err(spki_err)?;
    alg.extend(curve.to_der_vec().map_err(spki_err)?);
    let mut body = Sequence::new(alg.into()).to_der_vec().map_err(spki_err)?;
    body.extend(BitString::new(0, point).to_der_vec().map_err(spki_err)?);
    Sequence::new(body.into()).to_der_vec().map_err(spki_err)
}

fn spki_err<E: std::fmt::Display>(e: E) -> TlsError {
    TlsError::Crypto(format!("SPKI encoding failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::FromDer;
    use x509_parser::x509::SubjectPublicKeyInfo;

    #[test]
    fn test_ec_spki_parses_back() {
        let point = vec![0x04; 65];
        let spki = ec_spki(KeyAlgorithm::EcdsaP256, &point).unwrap();
        let (_, parsed) = SubjectPublicKeyInfo::from_der(&spki).unwrap();
        assert_eq!(parsed.subject_public_key.data.as_ref(), point.as_slice());
    }

    #[test]
    fn test_rcgen_bridge_signs_for_software_keys() {
        let pem = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let key = PrivateKey::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(key.algorithm(), KeyAlgorithm::EcdsaP256);
        key.rcgen_key_pair().unwrap();
    }
}
