//! Password hashing, password policy, and bearer-token issuance
//!
//! Passwords are hashed with scrypt using a configurable work factor;
//! digests carry their own cost so the factor can be raised without
//! invalidating existing accounts. Bearer tokens are HS256 JWTs that
//! stay opaque to clients.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use scrypt::{scrypt, Params};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Symbols accepted by the password policy.
pub const PASSWORD_SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:'\",.<>/?`~\\";

/// scrypt block size and parallelism; only the work factor is tunable.
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Check the password policy: 8-128 code points with at least one
/// lowercase, one uppercase, one digit and one symbol from the fixed set.
pub fn validate_password(password: &str) -> Result<(), String> {
    let length = password.chars().count();
    if !(8..=128).contains(&length) {
        return Err("password must be 8-128 characters".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err("password must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err("password must contain a digit".to_string());
    }
    if !password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
        return Err("password must contain a symbol".to_string());
    }
    Ok(())
}

/// Hash a password with scrypt at the given work factor (log2 N).
///
/// Output format: `cost:hex(salt):hex(key)`.
pub fn hash_password(password: &str, log_n: u8) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let key = derive_key(password, &salt, log_n)?;
    Ok(format!("{}:{}:{}", log_n, hex::encode(salt), hex::encode(key)))
}

/// Verify a password against a digest produced by [`hash_password`].
/// Comparison over the derived key is constant-time.
pub fn verify_password(digest: &str, password: &str) -> Result<bool> {
    let mut parts = digest.splitn(3, ':');
    let (cost, salt_hex, key_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(c), Some(s), Some(k)) => (c, s, k),
        _ => return Err(anyhow!("malformed password digest")),
    };

    let log_n: u8 = cost.parse().map_err(|_| anyhow!("malformed password digest"))?;
    let salt = hex::decode(salt_hex).map_err(|_| anyhow!("malformed password digest"))?;
    let expected = hex::decode(key_hex).map_err(|_| anyhow!("malformed password digest"))?;

    let derived = derive_key(password, &salt, log_n)?;
    Ok(derived.ct_eq(&expected).into())
}

fn derive_key(password: &str, salt: &[u8], log_n: u8) -> Result<Vec<u8>> {
    let params = Params::new(log_n, SCRYPT_R, SCRYPT_P, SCRYPT_KEY_LEN)
        .map_err(|e| anyhow!("invalid scrypt params: {}", e))?;
    let mut output = vec![0u8; SCRYPT_KEY_LEN];
    scrypt(password.as_bytes(), salt, &params, &mut output)
        .map_err(|e| anyhow!("scrypt failed: {}", e))?;
    Ok(output)
}

/// Generate a fresh per-workspace proxy credential: 256 bits, hex.
pub fn generate_proxy_credential() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Bearer-token claims; opaque to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// A token failed verification. Deliberately carries no detail: the same
/// error covers malformed, tampered, expired and unknown-key tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidToken;

impl std::fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid or expired token")
    }
}

impl std::error::Error for InvalidToken {}

/// Issues and verifies bearer tokens with a process-wide secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_hours: i64,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            ttl_hours,
        }
    }

    /// Issue a token for the user. Returns the token and its lifetime in
    /// seconds.
    pub fn issue(&self, user_id: Uuid) -> Result<(String, i64)> {
        let now = Utc::now();
        let expires = now + Duration::hours(self.ttl_hours);
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok((token, self.ttl_hours * 3600))
    }

    /// Verify a token and return the user id it names.
    pub fn verify(&self, token: &str) -> Result<Uuid, InvalidToken> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| InvalidToken)?;
        Uuid::parse_str(&data.claims.sub).map_err(|_| InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Low cost keeps the test suite fast; production uses >= 10.
    const TEST_COST: u8 = 10;

    #[test]
    fn test_password_policy_accepts_valid() {
        assert!(validate_password("Abcd1234!").is_ok());
        assert!(validate_password("xY9?longerpassword").is_ok());
    }

    #[test]
    fn test_password_policy_rejects_each_missing_class() {
        assert!(validate_password("abcd1234!").is_err()); // no uppercase
        assert!(validate_password("ABCD1234!").is_err()); // no lowercase
        assert!(validate_password("Abcdefgh!").is_err()); // no digit
        assert!(validate_password("Abcd12345").is_err()); // no symbol
        assert!(validate_password("Ab1!").is_err()); // too short
        let long = format!("Aa1!{}", "x".repeat(130));
        assert!(validate_password(&long).is_err()); // too long
    }

    #[test]
    fn test_hash_and_verify_roundtrip() {
        let digest = hash_password("Abcd1234!", TEST_COST).unwrap();
        assert!(digest.starts_with("10:"));
        assert!(verify_password(&digest, "Abcd1234!").unwrap());
        assert!(!verify_password(&digest, "Abcd1234?").unwrap());
    }

    #[test]
    fn test_hashes_are_salted() {
        let a = hash_password("Abcd1234!", TEST_COST).unwrap();
        let b = hash_password("Abcd1234!", TEST_COST).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_verify_rejects_malformed_digest() {
        assert!(verify_password("no-separators", "pw").is_err());
        assert!(verify_password("xx:nothex:nothex", "pw").is_err());
    }

    #[test]
    fn test_proxy_credential_is_64_hex() {
        let cred = generate_proxy_credential();
        assert_eq!(cred.len(), 64);
        assert!(cred.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cred, generate_proxy_credential());
    }

    #[test]
    fn test_token_roundtrip() {
        let signer = TokenSigner::new("test-secret", 24);
        let user_id = Uuid::new_v4();
        let (token, expires_in) = signer.issue(user_id).unwrap();
        assert_eq!(expires_in, 24 * 3600);
        assert_eq!(signer.verify(&token).unwrap(), user_id);
    }

    #[test]
    fn test_token_tamper_fails() {
        let signer = TokenSigner::new("test-secret", 24);
        let (token, _) = signer.issue(Uuid::new_v4()).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        assert_eq!(signer.verify(&tampered), Err(InvalidToken));
        assert_eq!(signer.verify("not.a.token"), Err(InvalidToken));
    }

    #[test]
    fn test_token_wrong_secret_fails() {
        let signer = TokenSigner::new("secret-one", 24);
        let (token, _) = signer.issue(Uuid::new_v4()).unwrap();
        let other = TokenSigner::new("secret-two", 24);
        assert_eq!(other.verify(&token), Err(InvalidToken));
    }
}
