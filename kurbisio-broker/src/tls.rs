//! Server TLS configuration and client-certificate identity.
//!
//! The broker accepts only connections that present a client certificate
//! chaining to the configured CA; the subject common name of the leaf must
//! parse as the device UUID. Identity extraction mirrors the rest of the
//! system: the certificate is the credential, nothing else.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use uuid::Uuid;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::error::BrokerError;

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Tls(format!("cannot parse {}: {e}", path.display())))
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::Tls(format!("cannot open {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| BrokerError::Tls(format!("cannot parse {}: {e}", path.display())))?
        .ok_or_else(|| BrokerError::Tls(format!("no private key in {}", path.display())))
}

/// Build the rustls server configuration with mandatory client-certificate
/// verification against the CA file.
pub fn server_config(
    ca_cert: &Path,
    server_cert: &Path,
    server_key: &Path,
) -> Result<ServerConfig, BrokerError> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_cert)? {
        roots
            .add(cert)
            .map_err(|e| BrokerError::Tls(format!("bad CA certificate: {e}")))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| BrokerError::Tls(format!("client verifier: {e}")))?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(read_certs(server_cert)?, read_key(server_key)?)
        .map_err(|e| BrokerError::Tls(format!("server certificate: {e}")))
}

/// Extract the device id from the peer's leaf certificate: the subject
/// common name, which must parse as a UUID.
pub fn device_id_from_certs(certs: &[CertificateDer<'_>]) -> Result<Uuid, BrokerError> {
    let leaf = certs
        .first()
        .ok_or_else(|| BrokerError::CertificateRejected("no client certificate".into()))?;
    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| BrokerError::CertificateRejected(format!("unparseable certificate: {e}")))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| BrokerError::CertificateRejected("no common name".into()))?;
    Uuid::parse_str(cn)
        .map_err(|_| BrokerError::CertificateRejected(format!("common name {cn:?} is not a UUID")))
}
