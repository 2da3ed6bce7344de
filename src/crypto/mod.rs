//! Symmetric encryption for secrets at rest and for export bundles.

mod bundle;

pub use bundle::{EncryptedBundle, decrypt_bundle, encrypt_bundle};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher keyed by `SHA-256(secret)`.
///
/// Ciphertexts are `base64(nonce || ciphertext || tag)` with a fresh nonce per call.
#[derive(Clone)]
pub struct Crypto {
    key: [u8; 32],
}

impl Crypto {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let sealed = seal(&self.key, plaintext.as_bytes())?;
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Ok(String::new());
        }

        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("invalid ciphertext encoding: {e}")))?;
        let plaintext = open(&self.key, &sealed)?;
        String::from_utf8(plaintext).map_err(|_| Error::Crypto("plaintext is not utf-8".into()))
    }
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))?;

    let mut out = nonce_bytes.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Crypto("ciphertext too short".into()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let crypto = Crypto::new("0123456789abcdef-secret");
        let encrypted = crypto.encrypt("hunter2").unwrap();
        assert_ne!(encrypted, "hunter2");
        assert_eq!(crypto.decrypt(&encrypted).unwrap(), "hunter2");
    }

    #[test]
    fn test_nonce_randomness() {
        let crypto = Crypto::new("0123456789abcdef-secret");
        let a = crypto.encrypt("same").unwrap();
        let b = crypto.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_passes_through() {
        let crypto = Crypto::new("0123456789abcdef-secret");
        assert_eq!(crypto.encrypt("").unwrap(), "");
        assert_eq!(crypto.decrypt("").unwrap(), "");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = Crypto::new("first-secret-0000").encrypt("payload").unwrap();
        let result = Crypto::new("second-secret-000").decrypt(&encrypted);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = Crypto::new("0123456789abcdef-secret");
        let encrypted = crypto.encrypt("payload").unwrap();
        let mut raw = STANDARD.decode(&encrypted).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let result = crypto.decrypt(&STANDARD.encode(raw));
        assert!(matches!(result, Err(Error::Crypto(_))));
    }
}
