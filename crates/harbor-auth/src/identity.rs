//! Certificate identity: fingerprints, subject UID, and CRL membership.
//!
//! A client's protocol identity is the UID attribute of its certificate
//! subject; the certificate itself is pinned by SHA-256 fingerprint
//! against the enrolled copy, and revocation is a serial-number lookup.

use sha2::{Digest, Sha256};
use x509_parser::der_parser::oid;
use x509_parser::prelude::*;

use harbor_core::error::{Error, Result};

use crate::tls::certs_from_pem;

/// SHA-256 fingerprint of DER-encoded certificate bytes, lowercase hex
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Fingerprint of the first certificate in a PEM bundle
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the PEM holds no certificate.
pub fn fingerprint_pem(pem: &str) -> Result<String> {
    let certs = certs_from_pem(pem)?;
    Ok(fingerprint(certs[0].as_ref()))
}

/// Extract the subject UID attribute, the client's protocol identity
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the certificate cannot be parsed
/// or carries no UID attribute.
pub fn client_id_from_der(der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("cannot parse peer certificate: {e}")))?;

    let uid = oid!(0.9.2342.19200300.100.1.1);
    for attr in cert.subject().iter_attributes() {
        if attr.attr_type() == &uid {
            return attr
                .as_str()
                .map(str::to_string)
                .map_err(|e| Error::Certificate(format!("UID attribute is not a string: {e}")));
        }
    }

    Err(Error::Certificate(
        "certificate subject carries no UID attribute".to_string(),
    ))
}

/// Big-endian serial bytes with leading zeros stripped
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the certificate cannot be parsed.
pub fn serial_bytes(der: &[u8]) -> Result<Vec<u8>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("cannot parse peer certificate: {e}")))?;
    let raw = cert.raw_serial();
    let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
    Ok(raw[start..].to_vec())
}

/// Whether the certificate's serial appears in the revocation list
///
/// # Errors
///
/// Returns [`Error::Certificate`] when the certificate cannot be parsed.
pub fn serial_in_crl(der: &[u8], crl: &[u64]) -> Result<bool> {
    let serial = serial_bytes(der)?;
    Ok(crl.iter().any(|&revoked| {
        let bytes = revoked.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        bytes[start..] == serial[..]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID_OID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 1];

    fn client_cert(client_id: &str, serial: u64) -> (rcgen::Certificate, rcgen::KeyPair) {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Client");
        params.distinguished_name.push(
            rcgen::DnType::CustomDnType(UID_OID.to_vec()),
            client_id,
        );
        params.serial_number = Some(rcgen::SerialNumber::from(serial));
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn cert_der(cert: &rcgen::Certificate) -> Vec<u8> {
        cert.der().as_ref().to_vec()
    }

    #[test]
    fn test_client_id_extraction() {
        let (cert, _) = client_cert("client-7f3a", 100);
        let id = client_id_from_der(&cert_der(&cert)).unwrap();
        assert_eq!(id, "client-7f3a");
    }

    #[test]
    fn test_missing_uid_rejected() {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "No UID Here");
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        let err = client_id_from_der(&cert_der(&cert)).unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_garbage_der_rejected() {
        assert!(client_id_from_der(&[0u8; 64]).is_err());
        assert!(serial_bytes(&[]).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let (a, _) = client_cert("a", 1);
        let (b, _) = client_cert("b", 2);

        let fp_a = fingerprint(&cert_der(&a));
        assert_eq!(fp_a.len(), 64);
        assert_eq!(fp_a, fingerprint(&cert_der(&a)));
        assert_ne!(fp_a, fingerprint(&cert_der(&b)));
    }

    #[test]
    fn test_fingerprint_pem_matches_der() {
        let (cert, _) = client_cert("c", 3);
        let from_pem = fingerprint_pem(&cert.pem()).unwrap();
        assert_eq!(from_pem, fingerprint(&cert_der(&cert)));
    }

    #[test]
    fn test_serial_in_crl() {
        let (cert, _) = client_cert("client-x", 4242);
        let der = cert_der(&cert);

        assert!(serial_in_crl(&der, &[4242]).unwrap());
        assert!(serial_in_crl(&der, &[1, 2, 4242, 9]).unwrap());
        assert!(!serial_in_crl(&der, &[4241]).unwrap());
        assert!(!serial_in_crl(&der, &[]).unwrap());
    }
}
