use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;

/// Passphrase-protected export payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBundle {
    pub salt: String,
    pub iv: String,
    pub data: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

pub fn encrypt_bundle(passphrase: &str, plaintext: &[u8]) -> Result<EncryptedBundle> {
    if passphrase.is_empty() {
        return Err(Error::BadRequest("passphrase cannot be empty".into()));
    }

    let mut rng = rand::thread_rng();
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rng.fill(&mut salt);
    rng.fill(&mut iv);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
    let data = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::Crypto("bundle encryption failed".into()))?;

    Ok(EncryptedBundle {
        salt: STANDARD.encode(salt),
        iv: STANDARD.encode(iv),
        data: STANDARD.encode(data),
    })
}

pub fn decrypt_bundle(passphrase: &str, bundle: &EncryptedBundle) -> Result<Vec<u8>> {
    let decode = |field: &str, value: &str| {
        STANDARD
            .decode(value)
            .map_err(|e| Error::Crypto(format!("invalid bundle {field}: {e}")))
    };
    let salt = decode("salt", &bundle.salt)?;
    let iv = decode("iv", &bundle.iv)?;
    let data = decode("data", &bundle.data)?;

    if iv.len() != IV_LEN {
        return Err(Error::Crypto("invalid bundle iv length".into()));
    }

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(&iv), data.as_slice())
        .map_err(|_| Error::Crypto("wrong passphrase or corrupted bundle".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_round_trip() {
        let bundle = encrypt_bundle("correct horse", b"{\"users\":[]}").unwrap();
        assert_eq!(STANDARD.decode(&bundle.salt).unwrap().len(), SALT_LEN);

        let plaintext = decrypt_bundle("correct horse", &bundle).unwrap();
        assert_eq!(plaintext, b"{\"users\":[]}");
    }

    #[test]
    fn test_bundle_wrong_passphrase() {
        let bundle = encrypt_bundle("correct horse", b"secret").unwrap();
        assert!(decrypt_bundle("battery staple", &bundle).is_err());
    }
}
