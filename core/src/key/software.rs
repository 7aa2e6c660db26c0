//! In-memory private keys.

use std::path::Path;
use std::sync::Arc;

use aws_lc_rs::signature::{
    EcdsaKeyPair, KeyPair as _, RsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING,
    ECDSA_P384_SHA384_ASN1_SIGNING,
};
use rustls::sign::SigningKey;
use rustls::SignatureScheme;
use rustls_pki_types::PrivateKeyDer;

use crate::cert::{ecdsa_raw_to_der, HashAlgorithm};
use crate::error::TlsError;
use crate::key::{ec_spki, rsa_spki, KeyAlgorithm};

/// A software key loaded from PEM or DER.
pub struct SoftwareKey {
    signing: Arc<dyn SigningKey>,
    public: PublicKey,
    algorithm: KeyAlgorithm,
}

impl SoftwareKey {
    /// Load from PEM. PKCS#8, PKCS#1 (`RSA PRIVATE KEY`), and SEC1
    /// (`EC PRIVATE KEY`) framings are accepted.
    pub fn from_pem(bytes: &[u8]) -> Result<Self, TlsError> {
        let mut reader = std::io::BufReader::new(bytes);
        let der = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| TlsError::Protocol(format!("invalid PEM: {e}")))?
            .ok_or_else(|| TlsError::Protocol("no private key in PEM input".into()))?;
        Self::from_der(der)
    }

    /// Load from a PEM file.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TlsError> {
        let bytes = std::fs::read(path.as_ref()).map_err(TlsError::Io)?;
        Self::from_pem(&bytes)
    }

    /// Load from DER key material.
    pub fn from_der(der: PrivateKeyDer<'static>) -> Result<Self, TlsError> {
        let signing = rustls::crypto::aws_lc_rs::sign::any_supported_type(&der)
            .map_err(|e| TlsError::Crypto(format!("unusable private key: {e}")))?;
        let (algorithm, bits) = derive_public(&der)?;
        let spki = match algorithm {
            KeyAlgorithm::Rsa => rsa_spki(&bits)?,
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => ec_spki(algorithm, &bits)?,
        };
        Ok(Self {
            signing,
            public: PublicKey {
                spki,
                bits,
                algorithm,
            },
            algorithm,
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Sign `data` (hashed with `algorithm`) in the library-native
    /// format: PKCS#1 v1.5 for RSA, DER for ECDSA.
    pub fn sign(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, TlsError> {
        let scheme = match (self.algorithm, algorithm) {
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha256) => SignatureScheme::RSA_PKCS1_SHA256,
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha384) => SignatureScheme::RSA_PKCS1_SHA384,
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha512) => SignatureScheme::RSA_PKCS1_SHA512,
            (KeyAlgorithm::EcdsaP256, HashAlgorithm::Sha256) => {
                SignatureScheme::ECDSA_NISTP256_SHA256
            }
            (KeyAlgorithm::EcdsaP384, HashAlgorithm::Sha384) => {
                SignatureScheme::ECDSA_NISTP384_SHA384
            }
            _ => {
                return Err(TlsError::Crypto(
                    "hash algorithm not supported for this key".into(),
                ))
            }
        };
        let signer = self
            .signing
            .choose_scheme(&[scheme])
            .ok_or_else(|| TlsError::Crypto("key rejected signature scheme".into()))?;
        signer
            .sign(data)
            .map_err(|e| TlsError::Crypto(format!("signing failed: {e}")))
    }

    pub(crate) fn signing_key(&self) -> Arc<dyn SigningKey> {
        Arc::clone(&self.signing)
    }
}

/// The public half of a key: emits PEM and verifies signatures.
#[derive(Debug, Clone)]
pub struct PublicKey {
    spki: Vec<u8>,
    bits: Vec<u8>,
    algorithm: KeyAlgorithm,
}

impl PublicKey {
    pub(crate) fn new(spki: Vec<u8>, bits: Vec<u8>, algorithm: KeyAlgorithm) -> Self {
        Self {
            spki,
            bits,
            algorithm,
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Raw subjectPublicKey bits.
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// subjectPublicKeyInfo DER.
    pub fn spki(&self) -> &[u8] {
        &self.spki
    }

    /// Emit as a `PUBLIC KEY` PEM block.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("PUBLIC KEY", self.spki.clone()))
    }

    /// Verify `signature` over `data` hashed with `algorithm`. ECDSA
    /// signatures may be DER or raw `r || s`; the raw form is rewrapped
    /// and retried the same way certificate verification does it.
    pub fn verify(
        &self,
        algorithm: HashAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), TlsError> {
        use aws_lc_rs::signature::*;

        let alg: &'static dyn VerificationAlgorithm = match (self.algorithm, algorithm) {
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha256) => &RSA_PKCS1_2048_8192_SHA256,
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha384) => &RSA_PKCS1_2048_8192_SHA384,
            (KeyAlgorithm::Rsa, HashAlgorithm::Sha512) => &RSA_PKCS1_2048_8192_SHA512,
            (KeyAlgorithm::EcdsaP256, HashAlgorithm::Sha256) => &ECDSA_P256_SHA256_ASN1,
            (KeyAlgorithm::EcdsaP256, HashAlgorithm::Sha384) => &ECDSA_P256_SHA384_ASN1,
            (KeyAlgorithm::EcdsaP384, HashAlgorithm::Sha256) => &ECDSA_P384_SHA256_ASN1,
            (KeyAlgorithm::EcdsaP384, HashAlgorithm::Sha384) => &ECDSA_P384_SHA384_ASN1,
            _ => {
                return Err(TlsError::Crypto(
                    "hash algorithm not supported for this key".into(),
                ))
            }
        };

        let key = UnparsedPublicKey::new(alg, &self.bits);
        if key.verify(data, signature).is_ok() {
            return Ok(());
        }
        if self.algorithm != KeyAlgorithm::Rsa {
            let der = ecdsa_raw_to_der(signature)?;
            if key.verify(data, &der).is_ok() {
                return Ok(());
            }
        }
        Err(TlsError::Crypto("signature verification failed".into()))
    }
}

fn derive_public(der: &PrivateKeyDer<'static>) -> Result<(KeyAlgorithm, Vec<u8>), TlsError> {
    match der {
        PrivateKeyDer::Pkcs1(key) => {
            let pair = RsaKeyPair::from_der(key.secret_pkcs1_der())
                .map_err(|e| TlsError::Crypto(format!("invalid RSA key: {e}")))?;
            Ok((KeyAlgorithm::Rsa, pair.public_key().as_ref().to_vec()))
        }
        PrivateKeyDer::Pkcs8(key) => {
            let bytes = key.secret_pkcs8_der();
            if let Ok(pair) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, bytes) {
                return Ok((KeyAlgorithm::EcdsaP256, pair.public_key().as_ref().to_vec()));
            }
            if let Ok(pair) = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_ASN1_SIGNING, bytes) {
                return Ok((KeyAlgorithm::EcdsaP384, pair.public_key().as_ref().to_vec()));
            }
            if let Ok(pair) = RsaKeyPair::from_pkcs8(bytes) {
                return Ok((KeyAlgorithm::Rsa, pair.public_key().as_ref().to_vec()));
            }
            Err(TlsError::Crypto("unsupported PKCS#8 key type".into()))
        }
        PrivateKeyDer::Sec1(key) => {
            let bytes = key.secret_sec1_der();
            if let Ok(pair) =
                EcdsaKeyPair::from_private_key_der(&ECDSA_P256_SHA256_ASN1_SIGNING, bytes)
            {
                return Ok((KeyAlgorithm::EcdsaP256, pair.public_key().as_ref().to_vec()));
            }
            if let Ok(pair) =
                EcdsaKeyPair::from_private_key_der(&ECDSA_P384_SHA384_ASN1_SIGNING, bytes)
            {
                return Ok((KeyAlgorithm::EcdsaP384, pair.public_key().as_ref().to_vec()));
            }
            Err(TlsError::Crypto("unsupported SEC1 curve".into()))
        }
        _ => Err(TlsError::Crypto("unsupported private key encoding".into())),
    }
}
