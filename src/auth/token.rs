use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const ARGON2_MEMORY: u32 = 64 * 1024; // 64KB
const ARGON2_ITERATIONS: u32 = 1;
const ARGON2_PARALLELISM: u32 = 4;
const ARGON2_OUTPUT_LEN: usize = 32;

pub const API_KEY_PREFIX: &str = "berth";
const LOOKUP_LENGTH: usize = 8;
const SECRET_LENGTH: usize = 32;
const SECRET_BYTES: usize = 16;
const AGENT_TOKEN_BYTES: usize = 32;

pub struct ApiKeyGenerator {
    argon2: Argon2<'static>,
}

impl Default for ApiKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiKeyGenerator {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .expect("invalid argon2 params");

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Generates a new key with the format: berth_<prefix>_<secret>
    /// Returns (raw_key, prefix, hash)
    pub fn generate(&self) -> Result<(String, String, String)> {
        let prefix = generate_lookup();
        let secret = generate_secret();
        let raw_key = build_key(&prefix, &secret);
        let hash = self.hash(&raw_key)?;
        Ok((raw_key, prefix, hash))
    }

    /// Hashes a raw key using Argon2id
    pub fn hash(&self, key: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(key.as_bytes(), &salt)
            .map_err(|e| Error::Crypto(format!("failed to hash api key: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verifies a raw key against a stored hash
    pub fn verify(&self, key: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| Error::Crypto(format!("invalid hash format: {e}")))?;

        match self.argon2.verify_password(key.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Crypto(format!("failed to verify api key: {e}"))),
        }
    }
}

/// Generates the lookup portion of the key (first 8 chars of a UUID)
#[must_use]
fn generate_lookup() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.simple().to_string()[..LOOKUP_LENGTH].to_string()
}

#[must_use]
fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[must_use]
fn build_key(prefix: &str, secret: &str) -> String {
    format!("{API_KEY_PREFIX}_{prefix}_{secret}")
}

/// True if a bearer credential has the API key shape rather than a JWT.
#[must_use]
pub fn is_api_key(token: &str) -> bool {
    token.starts_with(&format!("{API_KEY_PREFIX}_"))
}

/// Parses a key string into its components (prefix, secret)
pub fn parse_api_key(key: &str) -> Result<(String, String)> {
    let rest = key
        .strip_prefix(API_KEY_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or(Error::InvalidTokenFormat)?;

    let (prefix, secret) = rest.split_once('_').ok_or(Error::InvalidTokenFormat)?;

    if prefix.len() != LOOKUP_LENGTH || secret.len() != SECRET_LENGTH || secret.contains('_') {
        return Err(Error::InvalidTokenFormat);
    }

    Ok((prefix.to_string(), secret.to_string()))
}

/// Bearer token the control plane presents to an agent.
#[must_use]
pub fn generate_agent_token() -> String {
    let mut bytes = [0u8; AGENT_TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Refresh tokens and session cookies are stored as their SHA-256.
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_format() {
        let generator = ApiKeyGenerator::new();
        let (key, prefix, _hash) = generator.generate().unwrap();

        assert!(key.starts_with("berth_"));
        assert_eq!(prefix.len(), 8);

        let parts: Vec<&str> = key.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "berth");
        assert_eq!(parts[1], prefix);
        assert_eq!(parts[2].len(), 32);
    }

    #[test]
    fn test_key_verification_correct() {
        let generator = ApiKeyGenerator::new();
        let (key, _, hash) = generator.generate().unwrap();

        assert!(generator.verify(&key, &hash).unwrap());
    }

    #[test]
    fn test_key_verification_wrong_secret() {
        let generator = ApiKeyGenerator::new();
        let (key, _, hash) = generator.generate().unwrap();

        let wrong_key = format!("{}0000", &key[..key.len() - 4]);
        assert_ne!(wrong_key, key);
        assert!(!generator.verify(&wrong_key, &hash).unwrap());
    }

    #[test]
    fn test_parse_api_key_valid() {
        let (prefix, secret) =
            parse_api_key("berth_12345678_0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(prefix, "12345678");
        assert_eq!(secret, "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn test_parse_api_key_invalid_prefix() {
        let result = parse_api_key("other_12345678_0123456789abcdef0123456789abcdef");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_api_key_wrong_parts() {
        assert!(parse_api_key("berth_12345678").is_err());
        assert!(parse_api_key("berth_12345678_short").is_err());
    }

    #[test]
    fn test_hash_is_phc_format() {
        let generator = ApiKeyGenerator::new();
        let (_, _, hash) = generator.generate().unwrap();

        assert!(hash.starts_with("$argon2id$"));
        let configured = format!(
            "$m={ARGON2_MEMORY},t={ARGON2_ITERATIONS},p={ARGON2_PARALLELISM}$"
        );
        assert!(hash.contains(&configured), "{hash}");
    }

    #[test]
    fn test_detects_api_key_shape() {
        assert!(is_api_key("berth_abc"));
        assert!(!is_api_key("eyJhbGciOiJIUzI1NiJ9.e30.sig"));
    }

    #[test]
    fn test_agent_token_is_random_hex() {
        let a = generate_agent_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, generate_agent_token());
    }
}
