//! Tenant token minting, parsing, and verification.
//!
//! Wire form: `tenant:{tenantId}:{secret}` where the secret is 32 bytes of
//! OS randomness, URL-safe base64 without padding. Only the hex SHA-256 of
//! the secret is ever persisted; the plaintext token is returned exactly once
//! at create or rotate time. Verification hashes the presented secret and
//! compares digests in constant time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Number of random bytes in a freshly minted secret.
const SECRET_BYTES: usize = 32;

/// Prefix shared by every tenant token.
pub const TOKEN_PREFIX: &str = "tenant:";

/// A parsed (but unverified) tenant token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub tenant_id: String,
    pub secret: String,
}

/// Check a candidate tenant id against `^[a-z0-9][a-z0-9_-]{0,31}$`.
pub fn is_valid_tenant_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
        return false;
    }
    if id.len() > 32 {
        return false;
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// Mint a new secret and return `(plaintext_token, secret_hash_hex)`.
pub fn mint_token(tenant_id: &str) -> (String, String) {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let secret = URL_SAFE_NO_PAD.encode(bytes);
    let hash = hash_secret(&secret);
    (format!("{TOKEN_PREFIX}{tenant_id}:{secret}"), hash)
}

/// Parse the three-part wire form. Rejects tokens whose tenant-id segment
/// fails the id pattern or whose secret segment is empty.
pub fn parse_token(token: &str) -> Option<ParsedToken> {
    let after = token.strip_prefix(TOKEN_PREFIX)?;
    let (tenant_id, secret) = after.split_once(':')?;
    if !is_valid_tenant_id(tenant_id) || secret.is_empty() {
        return None;
    }
    Some(ParsedToken {
        tenant_id: tenant_id.to_string(),
        secret: secret.to_string(),
    })
}

/// Hex-encoded SHA-256 of a secret string.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{digest:x}")
}

/// Constant-time check of a presented secret against a stored hex digest.
///
/// The presented secret is hashed first so both sides are equal-length byte
/// strings; the comparison itself never short-circuits.
pub fn verify_secret(presented: &str, stored_hash_hex: &str) -> bool {
    let presented_hash = hash_secret(presented);
    presented_hash
        .as_bytes()
        .ct_eq(stored_hash_hex.as_bytes())
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_pattern() {
        assert!(is_valid_tenant_id("demo"));
        assert!(is_valid_tenant_id("tenant-a"));
        assert!(is_valid_tenant_id("0abc_def"));
        assert!(!is_valid_tenant_id(""));
        assert!(!is_valid_tenant_id("-demo"));
        assert!(!is_valid_tenant_id("_demo"));
        assert!(!is_valid_tenant_id("Demo"));
        assert!(!is_valid_tenant_id("has space"));
        assert!(!is_valid_tenant_id(&"a".repeat(33)));
        assert!(is_valid_tenant_id(&"a".repeat(32)));
    }

    #[test]
    fn test_mint_and_parse_roundtrip() {
        let (token, hash) = mint_token("demo");
        assert!(token.starts_with("tenant:demo:"));
        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.tenant_id, "demo");
        // URL-safe base64 of 32 bytes, no padding.
        assert!(parsed.secret.len() >= 32);
        assert!(parsed
            .secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(verify_secret(&parsed.secret, &hash));
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        assert!(parse_token("demo:secret").is_none());
        assert!(parse_token("tenant:demo").is_none());
        assert!(parse_token("tenant:demo:").is_none());
        assert!(parse_token("tenant:Bad-Id:secret").is_none());
    }

    #[test]
    fn test_verify_rejects_flipped_byte() {
        let (token, hash) = mint_token("demo");
        let parsed = parse_token(&token).unwrap();
        let mut bad = parsed.secret.into_bytes();
        bad[0] = if bad[0] == b'A' { b'B' } else { b'A' };
        let bad = String::from_utf8(bad).unwrap();
        assert!(!verify_secret(&bad, &hash));
    }
}
