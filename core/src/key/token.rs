//! PKCS#11 token keys.
//!
//! The driver library is process-global: it is loaded and initialized
//! at most once per path and kept alive by every key that came from it,
//! so dropping one key never finalizes a driver another key still uses.
//! Each key owns one session, serialized behind a mutex; distinct keys
//! may sign concurrently on the same driver.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{
    Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use log::debug;
use rustls::sign::{Signer, SigningKey};
use rustls::{SignatureAlgorithm, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use asn1_rs::oid;
use asn1_rs::{FromDer, OctetString, Oid, Sequence, ToDer};
use x509_parser::prelude::parse_x509_certificate;

use crate::cert::{der_unsigned_integer, ecdsa_raw_to_der, CertChain, HashAlgorithm};
use crate::error::{TlsError, TokenError};
use crate::key::{ec_spki, rsa_spki, KeyAlgorithm, PublicKey};

// DigestInfo prefixes for PKCS#1 v1.5 signing.
const DIGEST_INFO_SHA256: &[u8] = &[
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const DIGEST_INFO_SHA384: &[u8] = &[
    0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];
const DIGEST_INFO_SHA512: &[u8] = &[
    0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// Identity of a key on a PKCS#11 token.
///
/// `slot` is a numeric string; exactly one of `id` (hex object id) or
/// `label` (UTF-8) must be non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenKeyConfig {
    /// Path to the driver shared library.
    pub driver: PathBuf,

    /// Slot id, numeric string.
    pub slot: String,

    /// User PIN.
    pub pin: String,

    /// Hex-encoded object id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Object label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TokenKeyConfig {
    fn selector(&self) -> Result<Selector, TlsError> {
        let id = self.id.as_deref().filter(|s| !s.is_empty());
        let label = self.label.as_deref().filter(|s| !s.is_empty());
        match (id, label) {
            (Some(id), None) => {
                let bytes = hex::decode(id)
                    .map_err(|_| TlsError::Config(format!("key id is not hex: {id}")))?;
                Ok(Selector::Id(bytes))
            }
            (None, Some(label)) => Ok(Selector::Label(label.to_string())),
            _ => Err(TlsError::Config(
                "exactly one of key id or label must be set".into(),
            )),
        }
    }

    fn slot_id(&self) -> Result<u64, TlsError> {
        self.slot
            .trim()
            .parse::<u64>()
            .map_err(|_| TlsError::Config(format!("slot id must be numeric: {}", self.slot)))
    }
}

#[derive(Debug, Clone)]
enum Selector {
    Id(Vec<u8>),
    Label(String),
}

impl Selector {
    fn attribute(&self) -> Attribute {
        match self {
            Self::Id(id) => Attribute::Id(id.clone()),
            Self::Label(label) => Attribute::Label(label.as_bytes().to_vec()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {}", hex::encode(id)),
            Self::Label(label) => write!(f, "label {label:?}"),
        }
    }
}

static DRIVERS: OnceLock<Mutex<HashMap<PathBuf, Arc<Pkcs11>>>> = OnceLock::new();

/// Load and initialize a driver, once per process per path.
fn load_driver(path: &Path) -> Result<Arc<Pkcs11>, TokenError> {
    let registry = DRIVERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(driver) = registry.get(path) {
        return Ok(Arc::clone(driver));
    }

    let driver_load = |e: &dyn fmt::Display| TokenError::DriverLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let pkcs11 = Pkcs11::new(path).map_err(|e| driver_load(&e))?;
    match pkcs11.initialize(CInitializeArgs::OsThreads) {
        Ok(()) | Err(CkError::AlreadyInitialized) => {}
        Err(e) => return Err(driver_load(&e)),
    }

    let driver = Arc::new(pkcs11);
    registry.insert(path.to_path_buf(), Arc::clone(&driver));
    Ok(driver)
}

/// A private key resident on a PKCS#11 token.
pub struct TokenKey {
    inner: Arc<TokenKeyInner>,
}

struct TokenKeyInner {
    // Keeps the driver registered while any key is alive.
    _driver: Arc<Pkcs11>,
    session: Mutex<Session>,
    private: ObjectHandle,
    algorithm: KeyAlgorithm,
    public_bits: Vec<u8>,
    spki: Vec<u8>,
    certificate: Option<Vec<u8>>,
    selector: Selector,
}

impl fmt::Debug for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenKey")
            .field("algorithm", &self.inner.algorithm)
            .field("selector", &self.inner.selector.to_string())
            .finish()
    }
}

impl TokenKey {
    /// Open the driver, log into the slot, and locate the key pair.
    pub fn load(config: &TokenKeyConfig) -> Result<Self, TlsError> {
        let selector = config.selector()?;
        let slot_id = config.slot_id()?;
        let driver = load_driver(&config.driver)?;

        let session_err = |reason: String| TokenError::SessionOpen {
            slot: slot_id,
            reason,
        };
        let slot = driver
            .get_slots_with_token()
            .map_err(|e| session_err(e.to_string()))?
            .into_iter()
            .find(|s| s.id() == slot_id)
            .ok_or_else(|| session_err("no token present in slot".into()))?;
        let session = driver
            .open_rw_session(slot)
            .map_err(|e| session_err(e.to_string()))?;

        match session.login(UserType::User, Some(&AuthPin::new(config.pin.clone()))) {
            Ok(()) | Err(CkError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
            Err(e) => return Err(pin_error(e).into()),
        }

        let private = find_object(&session, ObjectClass::PRIVATE_KEY, &selector)?
            .ok_or_else(|| TokenError::ObjectNotFound {
                what: format!("private key with {selector}"),
            })?;
        let key_type = key_type_of(&session, private)?;

        let certificate = find_object(&session, ObjectClass::CERTIFICATE, &selector)?
            .map(|handle| attribute_value(&session, handle))
            .transpose()?;

        let (algorithm, public_bits, spki) =
            lookup_public(&session, &selector, key_type, certificate.as_deref())?;

        debug!("token key located ({selector}, {algorithm:?})");

        Ok(Self {
            inner: Arc::new(TokenKeyInner {
                _driver: driver,
                session: Mutex::new(session),
                private,
                algorithm,
                public_bits,
                spki,
                certificate,
                selector,
            }),
        })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.inner.algorithm
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::new(
            self.inner.spki.clone(),
            self.inner.public_bits.clone(),
            self.inner.algorithm,
        )
    }

    pub(crate) fn public_key_bits(&self) -> &[u8] {
        &self.inner.public_bits
    }

    /// The companion certificate stored on the token, if present.
    pub fn certificate(&self) -> Option<CertChain> {
        let der = self.inner.certificate.clone()?;
        CertChain::from_der(der).ok()
    }

    /// Store a certificate on the token under this key's id or label.
    pub fn store_certificate(&self, chain: &CertChain) -> Result<(), TlsError> {
        let leaf = chain
            .leaf()
            .ok_or_else(|| TlsError::Config("cannot store an empty chain".into()))?;
        let session = self.inner.lock_session()?;
        let template = [
            Attribute::Class(ObjectClass::CERTIFICATE),
            Attribute::CertificateType(CertificateType::X_509),
            Attribute::Token(true),
            self.inner.selector.attribute(),
            Attribute::Value(leaf.as_ref().to_vec()),
        ];
        session
            .create_object(&template)
            .map_err(|e| TokenError::Operation {
                op: "certificate store",
                reason: e.to_string(),
            })?;
        Ok(())
    }

    /// Sign `data` hashed with `algorithm`, returning the token's
    /// native output: PKCS#1 for RSA, raw `r || s` for ECDSA. Raw
    /// ECDSA output is accepted downstream through the DER rewrap in
    /// signature verification.
    pub fn sign(&self, algorithm: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let digest = hash(algorithm, data);
        match self.inner.algorithm {
            KeyAlgorithm::Rsa => {
                let prefix = match algorithm {
                    HashAlgorithm::Sha256 => DIGEST_INFO_SHA256,
                    HashAlgorithm::Sha384 => DIGEST_INFO_SHA384,
                    HashAlgorithm::Sha512 => DIGEST_INFO_SHA512,
                };
                let mut message = prefix.to_vec();
                message.extend_from_slice(&digest);
                self.inner.raw_sign(&Mechanism::RsaPkcs, &message)
            }
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => {
                self.inner.raw_sign(&Mechanism::Ecdsa, &digest)
            }
        }
    }

    pub(crate) fn signing_key(&self) -> Arc<dyn SigningKey> {
        Arc::new(TokenSigningKey {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl TokenKeyInner {
    fn lock_session(&self) -> Result<std::sync::MutexGuard<'_, Session>, TokenError> {
        self.session.lock().map_err(|_| TokenError::Operation {
            op: "session lock",
            reason: "session mutex poisoned".into(),
        })
    }

    fn raw_sign(&self, mechanism: &Mechanism, data: &[u8]) -> Result<Vec<u8>, TokenError> {
        let session = self.lock_session()?;
        session
            .sign(mechanism, self.private, data)
            .map_err(|e| TokenError::Operation {
                op: "sign",
                reason: e.to_string(),
            })
    }

    /// Sign for a TLS scheme, converting the output to what rustls
    /// puts on the wire (DER for ECDSA).
    fn sign_tls(&self, scheme: SignatureScheme, message: &[u8]) -> Result<Vec<u8>, TokenError> {
        match scheme {
            SignatureScheme::RSA_PKCS1_SHA256
            | SignatureScheme::RSA_PKCS1_SHA384
            | SignatureScheme::RSA_PKCS1_SHA512 => {
                let (prefix, digest) = match scheme {
                    SignatureScheme::RSA_PKCS1_SHA256 => {
                        (DIGEST_INFO_SHA256, hash(HashAlgorithm::Sha256, message))
                    }
                    SignatureScheme::RSA_PKCS1_SHA384 => {
                        (DIGEST_INFO_SHA384, hash(HashAlgorithm::Sha384, message))
                    }
                    _ => (DIGEST_INFO_SHA512, hash(HashAlgorithm::Sha512, message)),
                };
                let mut data = prefix.to_vec();
                data.extend_from_slice(&digest);
                self.raw_sign(&Mechanism::RsaPkcs, &data)
            }
            SignatureScheme::RSA_PSS_SHA256
            | SignatureScheme::RSA_PSS_SHA384
            | SignatureScheme::RSA_PSS_SHA512 => {
                let (hash_alg, mgf, digest) = match scheme {
                    SignatureScheme::RSA_PSS_SHA256 => (
                        MechanismType::SHA256,
                        PkcsMgfType::MGF1_SHA256,
                        hash(HashAlgorithm::Sha256, message),
                    ),
                    SignatureScheme::RSA_PSS_SHA384 => (
                        MechanismType::SHA384,
                        PkcsMgfType::MGF1_SHA384,
                        hash(HashAlgorithm::Sha384, message),
                    ),
                    _ => (
                        MechanismType::SHA512,
                        PkcsMgfType::MGF1_SHA512,
                        hash(HashAlgorithm::Sha512, message),
                    ),
                };
                let params = PkcsPssParams {
                    hash_alg,
                    mgf,
                    s_len: (digest.len() as u64).into(),
                };
                self.raw_sign(&Mechanism::RsaPkcsPss(params), &digest)
            }
            SignatureScheme::ECDSA_NISTP256_SHA256 | SignatureScheme::ECDSA_NISTP384_SHA384 => {
                let digest = if scheme == SignatureScheme::ECDSA_NISTP256_SHA256 {
                    hash(HashAlgorithm::Sha256, message)
                } else {
                    hash(HashAlgorithm::Sha384, message)
                };
                let sig = self.raw_sign(&Mechanism::Ecdsa, &digest)?;
                // Some drivers hand back DER already.
                if sig.first() == Some(&0x30) {
                    return Ok(sig);
                }
                ecdsa_raw_to_der(&sig).map_err(|e| TokenError::Operation {
                    op: "signature encoding",
                    reason: e.to_string(),
                })
            }
            other => Err(TokenError::Operation {
                op: "sign",
                reason: format!("unsupported signature scheme {other:?}"),
            }),
        }
    }
}

struct TokenSigningKey {
    inner: Arc<TokenKeyInner>,
}

impl fmt::Debug for TokenSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigningKey")
            .field("algorithm", &self.inner.algorithm)
            .finish()
    }
}

impl SigningKey for TokenSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        let supported: &[SignatureScheme] = match self.inner.algorithm {
            KeyAlgorithm::Rsa => &[
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::RSA_PKCS1_SHA512,
            ],
            KeyAlgorithm::EcdsaP256 => &[SignatureScheme::ECDSA_NISTP256_SHA256],
            KeyAlgorithm::EcdsaP384 => &[SignatureScheme::ECDSA_NISTP384_SHA384],
        };
        for scheme in supported {
            if offered.contains(scheme) {
                return Some(Box::new(TokenSigner {
                    inner: Arc::clone(&self.inner),
                    scheme: *scheme,
                }));
            }
        }
        None
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        match self.inner.algorithm {
            KeyAlgorithm::Rsa => SignatureAlgorithm::RSA,
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => SignatureAlgorithm::ECDSA,
        }
    }
}

struct TokenSigner {
    inner: Arc<TokenKeyInner>,
    scheme: SignatureScheme,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl Signer for TokenSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        self.inner
            .sign_tls(self.scheme, message)
            .map_err(|e| rustls::Error::General(e.to_string()))
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}

fn pin_error(e: CkError) -> TokenError {
    match &e {
        CkError::Pkcs11(rv, _)
            if matches!(
                rv,
                RvError::PinIncorrect
                    | RvError::PinInvalid
                    | RvError::PinExpired
                    | RvError::PinLocked
                    | RvError::PinLenRange
            ) =>
        {
            TokenError::PinFailure {
                reason: e.to_string(),
            }
        }
        _ => TokenError::Operation {
            op: "login",
            reason: e.to_string(),
        },
    }
}

fn find_object(
    session: &Session,
    class: ObjectClass,
    selector: &Selector,
) -> Result<Option<ObjectHandle>, TokenError> {
    let template = [Attribute::Class(class), selector.attribute()];
    let objects = session
        .find_objects(&template)
        .map_err(|e| TokenError::Operation {
            op: "object search",
            reason: e.to_string(),
        })?;
    Ok(objects.into_iter().next())
}

fn key_type_of(session: &Session, handle: ObjectHandle) -> Result<KeyType, TokenError> {
    let attrs = session
        .get_attributes(handle, &[AttributeType::KeyType])
        .map_err(|e| TokenError::Operation {
            op: "attribute read",
            reason: e.to_string(),
        })?;
    for attr in attrs {
        if let Attribute::KeyType(kt) = attr {
            return Ok(kt);
        }
    }
    Err(TokenError::Operation {
        op: "attribute read",
        reason: "private key exposes no key type".into(),
    })
}

fn attribute_value(session: &Session, handle: ObjectHandle) -> Result<Vec<u8>, TokenError> {
    let attrs = session
        .get_attributes(handle, &[AttributeType::Value])
        .map_err(|e| TokenError::Operation {
            op: "attribute read",
            reason: e.to_string(),
        })?;
    for attr in attrs {
        if let Attribute::Value(v) = attr {
            return Ok(v);
        }
    }
    Err(TokenError::Operation {
        op: "attribute read",
        reason: "object exposes no value".into(),
    })
}

/// Recover the public key material: from a public-key object when the
/// token stores one, otherwise from the companion certificate.
fn lookup_public(
    session: &Session,
    selector: &Selector,
    key_type: KeyType,
    certificate: Option<&[u8]>,
) -> Result<(KeyAlgorithm, Vec<u8>, Vec<u8>), TokenError> {
    if let Some(handle) = find_object(session, ObjectClass::PUBLIC_KEY, selector)? {
        match key_type {
            KeyType::RSA => {
                let attrs = session
                    .get_attributes(
                        handle,
                        &[AttributeType::Modulus, AttributeType::PublicExponent],
                    )
                    .map_err(|e| TokenError::Operation {
                        op: "attribute read",
                        reason: e.to_string(),
                    })?;
                let mut modulus = None;
                let mut exponent = None;
                for attr in attrs {
                    match attr {
                        Attribute::Modulus(m) => modulus = Some(m),
                        Attribute::PublicExponent(e) => exponent = Some(e),
                        _ => {}
                    }
                }
                let (modulus, exponent) = modulus.zip(exponent).ok_or_else(|| {
                    TokenError::Operation {
                        op: "attribute read",
                        reason: "RSA public key lacks modulus or exponent".into(),
                    }
                })?;
                let pkcs1 = rsa_pkcs1(&modulus, &exponent)?;
                let spki = rsa_spki(&pkcs1).map_err(encoding_err)?;
                return Ok((KeyAlgorithm::Rsa, pkcs1, spki));
            }
            KeyType::EC => {
                let attrs = session
                    .get_attributes(handle, &[AttributeType::EcPoint, AttributeType::EcParams])
                    .map_err(|e| TokenError::Operation {
                        op: "attribute read",
                        reason: e.to_string(),
                    })?;
                let mut point = None;
                let mut params = None;
                for attr in attrs {
                    match attr {
                        Attribute::EcPoint(p) => point = Some(p),
                        Attribute::EcParams(p) => params = Some(p),
                        _ => {}
                    }
                }
                let (point, params) = point.zip(params).ok_or_else(|| TokenError::Operation {
                    op: "attribute read",
                    reason: "EC public key lacks point or parameters".into(),
                })?;
                let algorithm = curve_from_params(&params)?;
                // CKA_EC_POINT is a DER OCTET STRING around the point.
                let point = match OctetString::from_der(&point) {
                    Ok((_, os)) => os.as_ref().to_vec(),
                    Err(_) => point,
                };
                let spki = ec_spki(algorithm, &point).map_err(encoding_err)?;
                return Ok((algorithm, point, spki));
            }
            other => {
                return Err(TokenError::Operation {
                    op: "key inspection",
                    reason: format!("unsupported key type {other:?}"),
                })
            }
        }
    }

    // No public-key object; fall back to the companion certificate.
    let cert = certificate.ok_or_else(|| TokenError::ObjectNotFound {
        what: format!("public key or certificate with {selector}"),
    })?;
    let (_, parsed) = parse_x509_certificate(cert).map_err(|_| TokenError::Operation {
        op: "certificate parse",
        reason: "token certificate is not valid DER".into(),
    })?;
    let spki = parsed.public_key();
    let bits = spki.subject_public_key.data.as_ref().to_vec();
    let algorithm = match key_type {
        KeyType::RSA => KeyAlgorithm::Rsa,
        KeyType::EC => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .ok_or_else(|| TokenError::Operation {
                    op: "certificate parse",
                    reason: "EC certificate without curve parameters".into(),
                })?;
            curve_to_algorithm(&curve)?
        }
        other => {
            return Err(TokenError::Operation {
                op: "key inspection",
                reason: format!("unsupported key type {other:?}"),
            })
        }
    };
    Ok((algorithm, bits, spki.raw.to_vec()))
}

fn curve_from_params(params: &[u8]) -> Result<KeyAlgorithm, TokenError> {
    let (_, curve) = Oid::from_der(params).map_err(|_| TokenError::Operation {
        op: "key inspection",
        reason: "EC parameters are not a named curve".into(),
    })?;
    curve_to_algorithm(&curve)
}

fn curve_to_algorithm(curve: &Oid<'_>) -> Result<KeyAlgorithm, TokenError> {
    if *curve == oid!(1.2.840.10045.3.1.7) {
        Ok(KeyAlgorithm::EcdsaP256)
    } else if *curve == oid!(1.3.132.0.34) {
        Ok(KeyAlgorithm::EcdsaP384)
    } else {
        Err(TokenError::Operation {
            op: "key inspection",
            reason: format!("unsupported curve {}", curve.to_id_string()),
        })
    }
}

fn rsa_pkcs1(modulus: &[u8], exponent: &[u8]) -> Result<Vec<u8>, TokenError> {
    let mut content = der_unsigned_integer(modulus).map_err(encoding_err)?;
    content.extend(der_unsigned_integer(exponent).map_err(encoding_err)?);
    Sequence::new(content.into())
        .to_der_vec()
        .map_err(|e| TokenError::Operation {
            op: "key encoding",
            reason: e.to_string(),
        })
}

fn encoding_err(e: TlsError) -> TokenError {
    TokenError::Operation {
        op: "key encoding",
        reason: e.to_string(),
    }
}

fn hash(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
    }
}
