//! Encrypted envelope for configuration files at rest.
//!
//! The envelope is AES-256-GCM under a PBKDF2-SHA256 key (600 000
//! iterations, 32-byte salt, 12-byte nonce), serialized as JSON with
//! base64 fields. Decryption yields the plaintext JSON configuration.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use harbor_core::error::{Error, Result};

/// PBKDF2-SHA256 iteration count
pub const KEY_ITERATIONS: u32 = 600_000;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Serialize, Deserialize)]
struct Envelope {
    salt: String,
    nonce: String,
    ciphertext: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KEY_ITERATIONS, key.as_mut());
    key
}

/// Encrypt plaintext into an envelope JSON string
///
/// # Errors
///
/// Returns [`Error::Internal`] if encryption fails.
pub fn seal(plaintext: &[u8], passphrase: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Internal(format!("config encryption failed: {e}")))?;

    let envelope = Envelope {
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
    };
    serde_json::to_string_pretty(&envelope)
        .map_err(|e| Error::Internal(format!("envelope serialization: {e}")))
}

/// Decrypt an envelope JSON string back into plaintext
///
/// # Errors
///
/// Returns [`Error::InvalidMessage`] for a malformed envelope and
/// [`Error::Authentication`] when the passphrase is wrong or the
/// ciphertext was tampered with.
pub fn open(envelope_json: &str, passphrase: &str) -> Result<Vec<u8>> {
    let envelope: Envelope = serde_json::from_str(envelope_json)
        .map_err(|e| Error::InvalidMessage(format!("malformed config envelope: {e}")))?;

    let salt = decode_field(&envelope.salt, "salt")?;
    let nonce = decode_field(&envelope.nonce, "nonce")?;
    let ciphertext = decode_field(&envelope.ciphertext, "ciphertext")?;

    if nonce.len() != NONCE_LEN {
        return Err(Error::InvalidMessage(format!(
            "envelope nonce is {} bytes, expected {NONCE_LEN}",
            nonce.len()
        )));
    }

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_ref()));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| Error::Authentication("wrong passphrase or corrupt envelope".to_string()))
}

fn decode_field(value: &str, name: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| Error::InvalidMessage(format!("envelope {name}: {e}")))
}

/// Whether a configuration file body looks like an encrypted envelope
#[must_use]
pub fn is_envelope(text: &str) -> bool {
    serde_json::from_str::<Envelope>(text).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let plaintext = br#"{"libraries": {}, "clients": {}}"#;
        let sealed = seal(plaintext, "correct horse").unwrap();

        assert!(is_envelope(&sealed));
        let opened = open(&sealed, "correct horse").unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        let sealed = seal(b"secret config", "right").unwrap();
        let err = open(&sealed, "wrong").unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let sealed = seal(b"secret config", "pass").unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&sealed).unwrap();

        let mut ct = BASE64
            .decode(envelope["ciphertext"].as_str().unwrap())
            .unwrap();
        ct[0] ^= 0xFF;
        envelope["ciphertext"] = serde_json::Value::String(BASE64.encode(ct));

        let err = open(&envelope.to_string(), "pass").unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn test_fresh_salt_and_nonce_each_seal() {
        let a = seal(b"same plaintext", "pass").unwrap();
        let b = seal(b"same plaintext", "pass").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_envelope_rejected() {
        assert!(matches!(
            open("not json", "pass").unwrap_err(),
            Error::InvalidMessage(_)
        ));
        assert!(matches!(
            open(r#"{"salt": "!!", "nonce": "", "ciphertext": ""}"#, "pass").unwrap_err(),
            Error::InvalidMessage(_)
        ));
    }

    #[test]
    fn test_plain_config_is_not_an_envelope() {
        assert!(!is_envelope(r#"{"libraries": {}}"#));
        assert!(!is_envelope("not json at all"));
    }
}
