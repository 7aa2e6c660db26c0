//! Certificate signing request generation.

use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType};

use crate::error::TlsError;
use crate::key::PrivateKey;

/// Netscape cert-type, BIT STRING with only the SSL client bit set.
const NETSCAPE_CERT_TYPE_OID: &[u64] = &[2, 16, 840, 1, 113730, 1, 1];
const NETSCAPE_CERT_TYPE_SSL_CLIENT: &[u8] = &[0x03, 0x02, 0x07, 0x80];

/// Generate a PEM CSR with the given subject, signed with SHA-256 by
/// `key` (software or token).
///
/// `subject` is an ordered list of RDN key/value pairs, e.g.
/// `[("CN", "client"), ("O", "test")]`. Key usage is left empty; the
/// Netscape cert-type extension marks the request as an SSL client.
pub fn generate_csr(key: &PrivateKey, subject: &[(&str, &str)]) -> Result<String, TlsError> {
    if subject.is_empty() {
        return Err(TlsError::Config("CSR subject must not be empty".into()));
    }

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(subject)?;
    params.custom_extensions.push(CustomExtension::from_oid_content(
        NETSCAPE_CERT_TYPE_OID,
        NETSCAPE_CERT_TYPE_SSL_CLIENT.to_vec(),
    ));

    let key_pair = key.rcgen_key_pair()?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| TlsError::Crypto(format!("CSR signing failed: {e}")))?;
    csr.pem()
        .map_err(|e| TlsError::Crypto(format!("CSR encoding failed: {e}")))
}

fn distinguished_name(subject: &[(&str, &str)]) -> Result<DistinguishedName, TlsError> {
    let mut dn = DistinguishedName::new();
    for (kind, value) in subject {
        let dn_type = match kind.to_ascii_uppercase().as_str() {
            "CN" => DnType::CommonName,
            "O" => DnType::OrganizationName,
            "OU" => DnType::OrganizationalUnitName,
            "C" => DnType::CountryName,
            "ST" => DnType::StateOrProvinceName,
            "L" => DnType::LocalityName,
            other => {
                return Err(TlsError::Config(format!("unsupported RDN key: {other}")));
            }
        };
        dn.push(dn_type, *value);
    }
    Ok(dn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::{FromDer, X509CertificationRequest};

    #[test]
    fn test_csr_subject_and_signature() {
        let pem_key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let key = PrivateKey::from_pem(pem_key.as_bytes()).unwrap();

        let csr_pem = generate_csr(&key, &[("CN", "client"), ("O", "test")]).unwrap();

        let parsed = pem::parse(&csr_pem).unwrap();
        let (_, csr) = X509CertificationRequest::from_der(parsed.contents()).unwrap();
        csr.verify_signature().unwrap();

        let subject = csr.certification_request_info.subject.to_string();
        assert!(subject.contains("CN=client"), "subject: {subject}");
        assert!(subject.contains("O=test"), "subject: {subject}");
    }

    #[test]
    fn test_csr_rejects_unknown_rdn() {
        let pem_key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let key = PrivateKey::from_pem(pem_key.as_bytes()).unwrap();
        assert!(matches!(
            generate_csr(&key, &[("XX", "nope")]),
            Err(TlsError::Config(_))
        ));
    }

    #[test]
    fn test_csr_rejects_empty_subject() {
        let pem_key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let key = PrivateKey::from_pem(pem_key.as_bytes()).unwrap();
        assert!(generate_csr(&key, &[]).is_err());
    }
}
