//! Operator credentials
//!
//! Password hashing for user records, random bearer values for the admin and session
//! tokens, and the digest under which session tokens are stored.
//!
//! Password hashes are PBKDF2-HMAC-SHA256 encoded as
//! `pbkdf2-sha256$<iterations>$<salt>$<hash>` with standard base64 fields, so the
//! iteration count can be raised without invalidating stored hashes.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD};
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::rand::rand_bytes;

use crate::error::{Error, Result};

const HASH_SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: usize = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const TOKEN_BYTES: usize = 32;

fn derive(password: &str, salt: &[u8], iterations: usize) -> Result<Vec<u8>> {
    let mut hash = vec![0u8; HASH_LEN];
    pbkdf2_hmac(
        password.as_bytes(),
        salt,
        iterations,
        MessageDigest::sha256(),
        &mut hash,
    )
    .map_err(|e| Error::GenerationFailed(format!("password hashing failed: {}", e)))?;
    Ok(hash)
}

/// Hash a password with a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::InvalidInput("password must not be empty".to_string()));
    }
    let mut salt = [0u8; SALT_LEN];
    rand_bytes(&mut salt)
        .map_err(|e| Error::GenerationFailed(format!("failed to generate salt: {}", e)))?;
    let hash = derive(password, &salt, PBKDF2_ITERATIONS)?;
    Ok(format!(
        "{}${}${}${}",
        HASH_SCHEME,
        PBKDF2_ITERATIONS,
        BASE64.encode(salt),
        BASE64.encode(hash)
    ))
}

/// Check a password against a stored hash. Unparseable hashes never verify.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut fields = stored.split('$');
    let (Some(HASH_SCHEME), Some(iterations), Some(salt), Some(expected), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return false;
    };
    let (Ok(iterations), Ok(salt), Ok(expected)) = (
        iterations.parse::<usize>(),
        BASE64.decode(salt),
        BASE64.decode(expected),
    ) else {
        return false;
    };

    match derive(password, &salt, iterations) {
        Ok(actual) => {
            actual.len() == expected.len() && openssl::memcmp::eq(&actual, &expected)
        }
        Err(_) => false,
    }
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn random_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand_bytes(&mut bytes)
        .map_err(|e| Error::GenerationFailed(format!("failed to generate token: {}", e)))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hex SHA-256 of a session token; only this digest is persisted.
pub fn token_digest(token: &str) -> String {
    openssl::sha::sha256(token.as_bytes())
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Constant-time comparison of two bearer values.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && openssl::memcmp::eq(provided.as_bytes(), expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("pbkdf2-sha256$100000$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("correct horse ", &hash));
        assert!(!verify_password("", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let first = hash_password("same").unwrap();
        let second = hash_password("same").unwrap();
        assert_ne!(first, second);
        assert!(verify_password("same", &second));
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        for stored in ["", "plain", "pbkdf2-sha256$x$AA==$AA==", "md5$1$AA==$AA==", "pbkdf2-sha256$1$AA==$AA==$extra"] {
            assert!(!verify_password("anything", stored), "{}", stored);
        }
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(hash_password(""), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_random_tokens() {
        let token = random_token().unwrap();
        assert_eq!(token.len(), 43);
        assert_ne!(token, random_token().unwrap());
    }

    #[test]
    fn test_token_digest_is_stable_hex() {
        let digest = token_digest("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("ab", "abc"));
    }
}
