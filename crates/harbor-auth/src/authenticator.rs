//! Application-level authentication run at HANDSHAKE.
//!
//! The TLS layer has already proven the peer holds a key the CA signed;
//! this layer binds that certificate to an enrolled client record and the
//! requested library.

use std::sync::Arc;

use harbor_core::config::{LibraryConfig, ServerConfig};
use harbor_core::error::{Error, Result};

use crate::identity;

/// Validates peer certificates against the server configuration
pub struct Authenticator {
    config: Arc<ServerConfig>,
}

impl Authenticator {
    /// Create an authenticator over the server configuration
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Validate a peer certificate and return the client id.
    ///
    /// Enforced in order: the subject UID names an enrolled client, the
    /// peer's fingerprint equals the enrolled certificate's, and neither
    /// the revocation flag nor the CRL lists the certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Certificate`], [`Error::Authentication`], or
    /// [`Error::CertificateRevoked`]; all are terminal for the session.
    pub fn authenticate(&self, peer_der: &[u8]) -> Result<String> {
        let client_id = identity::client_id_from_der(peer_der)?;

        let record = self.config.clients.get(&client_id).ok_or_else(|| {
            Error::Authentication(format!("client not enrolled: {client_id}"))
        })?;

        let enrolled = identity::fingerprint_pem(&record.certificate)?;
        if identity::fingerprint(peer_der) != enrolled {
            return Err(Error::Certificate(format!(
                "fingerprint mismatch for client {client_id}"
            )));
        }

        if record.revoked {
            return Err(Error::CertificateRevoked(client_id));
        }
        if identity::serial_in_crl(peer_der, &self.config.security.crl)? {
            return Err(Error::CertificateRevoked(client_id));
        }

        tracing::debug!(client_id = %client_id, "peer certificate validated");
        Ok(client_id)
    }

    /// Check that `client_id` may bind `library_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LibraryAccessDenied`] for unknown libraries and
    /// unauthorised clients.
    pub fn authorize<'a>(&'a self, client_id: &str, library_id: &str) -> Result<&'a LibraryConfig> {
        let library = self.config.libraries.get(library_id).ok_or_else(|| {
            Error::LibraryAccessDenied(format!("library not found: {library_id}"))
        })?;

        if !library.authorized_clients.contains(client_id) {
            return Err(Error::LibraryAccessDenied(format!(
                "client '{}' has no access to library '{}'",
                self.client_name(client_id),
                library.name
            )));
        }

        Ok(library)
    }

    /// Display name for a client id, for logs
    #[must_use]
    pub fn client_name(&self, client_id: &str) -> &str {
        self.config
            .clients
            .get(client_id)
            .map_or("unknown", |record| record.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harbor_core::config::{ClientRecord, LibraryConfig, NetworkConfig, SecurityConfig};
    use std::collections::{HashMap, HashSet};

    const UID_OID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 1];

    fn mint_client(client_id: &str, serial: u64) -> (Vec<u8>, String) {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CustomDnType(UID_OID.to_vec()), client_id);
        params.serial_number = Some(rcgen::SerialNumber::from(serial));
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.der().as_ref().to_vec(), cert.pem())
    }

    fn config_with(clients: HashMap<String, ClientRecord>, crl: Vec<u64>) -> Arc<ServerConfig> {
        let mut libraries = HashMap::new();
        libraries.insert(
            "lib-1".to_string(),
            LibraryConfig {
                name: "Documents".to_string(),
                path: "/srv/lib".into(),
                authorized_clients: HashSet::from(["client-a".to_string()]),
                rate_limit_bps: 0,
                idle_timeout_s: 300,
            },
        );
        Arc::new(ServerConfig {
            server: NetworkConfig::default(),
            security: SecurityConfig {
                ca_certificate: String::new(),
                ca_private_key: String::new(),
                crl,
            },
            libraries,
            clients,
            logging: Default::default(),
        })
    }

    fn record(name: &str, pem: String, revoked: bool) -> ClientRecord {
        ClientRecord {
            name: name.to_string(),
            certificate: pem,
            revoked,
            rate_limit_bps: 0,
        }
    }

    #[test]
    fn test_authenticate_happy_path() {
        let (der, pem) = mint_client("client-a", 10);
        let mut clients = HashMap::new();
        clients.insert("client-a".to_string(), record("Workstation", pem, false));

        let auth = Authenticator::new(config_with(clients, vec![]));
        assert_eq!(auth.authenticate(&der).unwrap(), "client-a");
    }

    #[test]
    fn test_unknown_client_rejected() {
        let (der, _) = mint_client("client-ghost", 11);
        let auth = Authenticator::new(config_with(HashMap::new(), vec![]));

        let err = auth.authenticate(&der).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_fingerprint_mismatch_rejected() {
        let (der, _) = mint_client("client-a", 12);
        // Enrolled with a different certificate for the same id.
        let (_, other_pem) = mint_client("client-a", 13);
        let mut clients = HashMap::new();
        clients.insert("client-a".to_string(), record("Workstation", other_pem, false));

        let auth = Authenticator::new(config_with(clients, vec![]));
        let err = auth.authenticate(&der).unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_revoked_flag_rejected() {
        let (der, pem) = mint_client("client-a", 14);
        let mut clients = HashMap::new();
        clients.insert("client-a".to_string(), record("Workstation", pem, true));

        let auth = Authenticator::new(config_with(clients, vec![]));
        let err = auth.authenticate(&der).unwrap_err();
        assert!(matches!(err, Error::CertificateRevoked(_)));
    }

    #[test]
    fn test_crl_serial_rejected() {
        let (der, pem) = mint_client("client-a", 77);
        let mut clients = HashMap::new();
        clients.insert("client-a".to_string(), record("Workstation", pem, false));

        let auth = Authenticator::new(config_with(clients, vec![77]));
        let err = auth.authenticate(&der).unwrap_err();
        assert!(matches!(err, Error::CertificateRevoked(_)));
    }

    #[test]
    fn test_authorize() {
        let (_, pem) = mint_client("client-a", 15);
        let mut clients = HashMap::new();
        clients.insert("client-a".to_string(), record("Workstation", pem, false));
        let auth = Authenticator::new(config_with(clients, vec![]));

        assert!(auth.authorize("client-a", "lib-1").is_ok());

        let err = auth.authorize("client-b", "lib-1").unwrap_err();
        assert!(matches!(err, Error::LibraryAccessDenied(_)));

        let err = auth.authorize("client-a", "lib-missing").unwrap_err();
        assert!(matches!(err, Error::LibraryAccessDenied(_)));
    }
}
