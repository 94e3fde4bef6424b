//! Masked token primitives.
//!
//! A masked token is `key ++ (token ^ key)`, twice the length of the token,
//! carried as padded URL-safe base64. Every issuance uses a fresh key, so the
//! value a client sees changes while the secret behind it stays the same.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use rand::rngs::OsRng;

use crate::Error;

/// Reads one byte from the OS random source.
pub(crate) fn check_random_source() -> Result<(), Error> {
    let mut probe = [0u8; 1];
    OsRng.try_fill_bytes(&mut probe)?;
    Ok(())
}

pub(crate) fn generate(length: usize) -> Result<Vec<u8>, rand::Error> {
    let mut bytes = vec![0u8; length];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes)
}

/// # Panics
///
/// Panics if `token` and `key` differ in length.
pub(crate) fn mask(token: &[u8], key: &[u8]) -> Vec<u8> {
    assert_eq!(token.len(), key.len(), "token and key must have the same length");
    let mut masked = Vec::with_capacity(token.len() * 2);
    masked.extend_from_slice(key);
    masked.extend(token.iter().zip(key).map(|(t, k)| t ^ k));
    masked
}

/// Inverse of [`mask`]. Returns half the input length; a trailing odd byte is
/// ignored.
pub(crate) fn unmask(masked: &[u8]) -> Vec<u8> {
    let half = masked.len() / 2;
    let (key, token) = masked.split_at(half);
    key.iter().zip(token).map(|(k, t)| k ^ t).collect()
}

pub(crate) fn encode(masked: &[u8]) -> String {
    URL_SAFE.encode(masked)
}

pub(crate) fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE.decode(encoded)
}

/// Whether two encoded tokens carry the same secret, whatever their keys.
/// Empty or undecodable input never matches.
pub(crate) fn token_equal(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let (Ok(a), Ok(b)) = (decode(a), decode(b)) else {
        return false;
    };
    let (a, b) = (unmask(&a), unmask(&b));

    // Constant time over equal lengths.
    a.len() == b.len() && a.iter().zip(&b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// A fresh masked token of `length` secret bytes, ready to store and hand out.
pub(crate) fn issue(length: usize) -> Result<String, rand::Error> {
    let token = generate(length)?;
    let key = generate(length)?;
    Ok(encode(&mask(&token, &key)))
}
