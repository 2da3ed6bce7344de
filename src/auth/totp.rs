//! RFC 6238 time-based one-time passwords: HMAC-SHA1, 6 digits, 30 second steps.

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

const STEP_SECONDS: i64 = 30;
const DIGITS: u32 = 6;
const SECRET_BYTES: usize = 20;
/// Windows either side of now that still verify.
const SKEW: i64 = 1;
const ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill(&mut bytes);
    base32::encode(ALPHABET, &bytes)
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    let cleaned: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .collect::<String>()
        .to_ascii_uppercase();
    base32::decode(ALPHABET, &cleaned).ok_or_else(|| Error::Crypto("invalid TOTP secret".into()))
}

#[must_use]
pub fn window_for(unix_seconds: i64) -> i64 {
    unix_seconds.div_euclid(STEP_SECONDS)
}

fn hotp(key: &[u8], counter: u64) -> Result<u32> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("invalid TOTP key: {e}")))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset]) & 0x7f) << 24
        | u32::from(digest[offset + 1]) << 16
        | u32::from(digest[offset + 2]) << 8
        | u32::from(digest[offset + 3]);

    Ok(binary % 10u32.pow(DIGITS))
}

/// The code for a given window, zero-padded.
pub fn code_for_window(secret: &str, window: i64) -> Result<String> {
    let key = decode_secret(secret)?;
    let counter = u64::try_from(window).map_err(|_| Error::Crypto("negative TOTP window".into()))?;
    Ok(format!("{:0width$}", hotp(&key, counter)?, width = DIGITS as usize))
}

/// Returns the matching window if `code` is valid within the allowed skew.
pub fn verify(secret: &str, code: &str, unix_seconds: i64) -> Result<Option<i64>> {
    let code = code.trim();
    if code.len() != DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }

    let now = window_for(unix_seconds);
    let mut matched = None;
    for window in (now - SKEW)..=(now + SKEW) {
        let expected = code_for_window(secret, window)?;
        if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) && matched.is_none() {
            matched = Some(window);
        }
    }
    Ok(matched)
}

#[must_use]
pub fn otpauth_url(issuer: &str, account: &str, secret: &str) -> String {
    let label = format!("{issuer}:{account}");
    format!(
        "otpauth://totp/{}?secret={secret}&issuer={}&algorithm=SHA1&digits={DIGITS}&period={STEP_SECONDS}",
        percent_encode(&label),
        percent_encode(issuer)
    )
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
