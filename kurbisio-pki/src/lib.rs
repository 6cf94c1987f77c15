//! # kurbisio-pki — X.509 issuance for device credentialing
//!
//! Mints the client certificate a thing receives when it provisions itself
//! into a device: a fresh 4096-bit RSA key pair and a leaf certificate with
//! the device UUID as subject common name, signed by the configured CA. The
//! MQTT broker later binds exactly that common name to the MQTT client id.
//!
//! Key generation is CPU-bound and takes noticeable wall time by design;
//! callers run it on a blocking thread.

use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use tracing::debug;
use uuid::Uuid;

/// Leaf key size. The credential is minted once per device lifetime, so the
/// generation cost is acceptable.
const LEAF_KEY_BITS: usize = 4096;

/// Validity window of issued device certificates, in days. Devices are
/// retired by deleting the device row, not by certificate expiry.
const LEAF_VALIDITY_DAYS: i64 = 365 * 100;

/// Errors raised while loading CA material or issuing a certificate.
#[derive(Debug)]
pub enum PkiError {
    /// CA certificate or key could not be parsed.
    InvalidCa(String),
    /// Leaf key generation failed.
    KeyGeneration(String),
    /// Certificate construction or signing failed.
    Issuance(String),
}

impl std::fmt::Display for PkiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkiError::InvalidCa(msg) => write!(f, "invalid CA material: {msg}"),
            PkiError::KeyGeneration(msg) => write!(f, "key generation failed: {msg}"),
            PkiError::Issuance(msg) => write!(f, "certificate issuance failed: {msg}"),
        }
    }
}

impl std::error::Error for PkiError {}

/// A freshly minted credential: certificate and private key, PEM-encoded.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The signing authority for device certificates.
pub struct CertificateAuthority {
    issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
}

impl CertificateAuthority {
    /// Load the CA from PEM-encoded certificate and private key.
    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self, PkiError> {
        let key = rcgen::KeyPair::from_pem(ca_key_pem)
            .map_err(|e| PkiError::InvalidCa(e.to_string()))?;
        let issuer = rcgen::Issuer::from_ca_cert_pem(ca_cert_pem, key)
            .map_err(|e| PkiError::InvalidCa(e.to_string()))?;
        Ok(Self { issuer })
    }

    /// Issue the one-shot device credential: 4096-bit RSA key, leaf
    /// certificate with the device UUID as common name.
    pub fn issue_device_certificate(
        &self,
        device_id: Uuid,
    ) -> Result<IssuedCertificate, PkiError> {
        self.issue(device_id, LEAF_KEY_BITS)
    }

    fn issue(&self, device_id: Uuid, key_bits: usize) -> Result<IssuedCertificate, PkiError> {
        let mut rng = rand::thread_rng();
        let private_key = rsa::RsaPrivateKey::new(&mut rng, key_bits)
            .map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
        let key_pair =
            rcgen::KeyPair::from_pem_and_sign_algo(&key_pem, &rcgen::PKCS_RSA_SHA256)
                .map_err(|e| PkiError::KeyGeneration(e.to_string()))?;

        let mut params = rcgen::CertificateParams::new(Vec::new())
            .map_err(|e| PkiError::Issuance(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, device_id.to_string());
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| PkiError::Issuance(e.to_string()))?;
        debug!(%device_id, "issued device certificate");

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pem.as_str().to_owned(),
        })
    }
}

/// Generate a self-signed CA for development and tests. Production
/// deployments bring their own CA files.
pub fn generate_dev_ca() -> Result<(String, String), PkiError> {
    let key = rcgen::KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
    let mut params = rcgen::CertificateParams::new(Vec::new())
        .map_err(|e| PkiError::Issuance(e.to_string()))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "kurbisio dev ca");
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let cert = params
        .self_signed(&key)
        .map_err(|e| PkiError::Issuance(e.to_string()))?;
    Ok((cert.pem(), key.serialize_pem()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        let (cert_pem, key_pem) = generate_dev_ca().unwrap();
        CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap()
    }

    #[test]
    fn issues_pem_encoded_credentials() {
        let ca = test_ca();
        let device_id = Uuid::new_v4();
        // Small key to keep the test fast; the public entry point uses 4096.
        let issued = ca.issue(device_id, 2048).unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn common_name_is_the_device_uuid() {
        let ca = test_ca();
        let device_id = Uuid::new_v4();
        let issued = ca.issue(device_id, 2048).unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap();
        assert_eq!(cn, device_id.to_string());
    }

    #[test]
    fn dev_ca_roundtrips() {
        let (cert_pem, key_pem) = generate_dev_ca().unwrap();
        assert!(CertificateAuthority::from_pem(&cert_pem, &key_pem).is_ok());
    }
}
