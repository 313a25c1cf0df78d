//! Auth gate: bearer-token verification at connect time, refresh-credential
//! hashing, and invite-token minting.
//!
//! Access tokens are HMAC-SHA256 signed, `base64url(payload).base64url(mac)`.
//! Token *issuance* lives in an external service that shares the secret;
//! this module only needs to verify. Refresh credentials are opaque random
//! values stored as SHA-256 digests — the raw value is never persisted.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Access tokens expire after 15 minutes.
pub const ACCESS_TOKEN_TTL_MINUTES: i64 = 15;

/// Refresh credentials expire after 30 days.
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 30;

/// Why a connect-time credential was rejected. Both close the session with
/// code 4001; the close reason distinguishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFault {
    Missing,
    Invalid,
    Expired,
}

impl CredentialFault {
    pub fn close_reason(&self) -> &'static str {
        match self {
            CredentialFault::Missing => "missing credential",
            CredentialFault::Invalid => "invalid credential",
            CredentialFault::Expired => "expired credential",
        }
    }
}

/// Claims carried by a signed access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AccessClaims {
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            issued_at: now,
            expires_at: now + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

/// Sign an access token: `base64url(json claims).base64url(hmac)`.
pub fn sign_access_token(claims: &AccessClaims, secret: &str) -> Result<String> {
    let payload = serde_json::to_string(claims)?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AppError::Internal(format!("hmac key setup failed: {e}")))?;
    mac.update(payload_b64.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{payload_b64}.{signature_b64}"))
}

/// Verify signature and expiry of an access token.
pub fn verify_access_token(token: &str, secret: &str) -> std::result::Result<AccessClaims, CredentialFault> {
    let (payload_b64, signature_b64) = token
        .split_once('.')
        .ok_or(CredentialFault::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CredentialFault::Invalid)?;
    mac.update(payload_b64.as_bytes());

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| CredentialFault::Invalid)?;
    mac.verify_slice(&signature)
        .map_err(|_| CredentialFault::Invalid)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| CredentialFault::Invalid)?;
    let claims: AccessClaims =
        serde_json::from_slice(&payload).map_err(|_| CredentialFault::Invalid)?;

    if claims.is_expired() {
        return Err(CredentialFault::Expired);
    }

    Ok(claims)
}

/// Mint an opaque refresh credential (256 random bits, base64url).
pub fn mint_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Digest a refresh credential for at-rest storage.
pub fn hash_refresh_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Mint an invite token (128 random bits, base64url). Constant per
/// conversation once stored; reusable; never expires.
pub fn mint_invite_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_access_token_round_trip() {
        let user_id = Uuid::new_v4();
        let claims = AccessClaims::new(user_id);
        let token = sign_access_token(&claims, SECRET).unwrap();

        let verified = verify_access_token(&token, SECRET).unwrap();
        assert_eq!(verified.user_id, user_id);
        assert_eq!(verified.expires_at, claims.expires_at);
    }

    #[test]
    fn test_tampered_token_fails() {
        let claims = AccessClaims::new(Uuid::new_v4());
        let token = sign_access_token(&claims, SECRET).unwrap();

        // Flip a character in the payload half.
        let mut chars: Vec<char> = token.chars().collect();
        chars[4] = if chars[4] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();

        assert_eq!(
            verify_access_token(&tampered, SECRET),
            Err(CredentialFault::Invalid)
        );
    }

    #[test]
    fn test_wrong_secret_fails() {
        let claims = AccessClaims::new(Uuid::new_v4());
        let token = sign_access_token(&claims, SECRET).unwrap();
        assert_eq!(
            verify_access_token(&token, "another-secret"),
            Err(CredentialFault::Invalid)
        );
    }

    #[test]
    fn test_expired_token_fails() {
        let now = Utc::now();
        let claims = AccessClaims {
            user_id: Uuid::new_v4(),
            issued_at: now - Duration::minutes(30),
            expires_at: now - Duration::minutes(15),
        };
        let token = sign_access_token(&claims, SECRET).unwrap();
        assert_eq!(
            verify_access_token(&token, SECRET),
            Err(CredentialFault::Expired)
        );
    }

    #[test]
    fn test_garbage_token_fails() {
        assert_eq!(
            verify_access_token("not-a-token", SECRET),
            Err(CredentialFault::Invalid)
        );
        assert_eq!(
            verify_access_token("a.b.c", SECRET),
            Err(CredentialFault::Invalid)
        );
    }

    #[test]
    fn test_refresh_token_hashing_is_stable_and_opaque() {
        let token = mint_refresh_token();
        let hash = hash_refresh_token(&token);

        assert_eq!(hash, hash_refresh_token(&token));
        assert_ne!(hash, token);
        assert_eq!(hash.len(), 64); // hex-encoded SHA-256

        let other = mint_refresh_token();
        assert_ne!(token, other);
        assert_ne!(hash, hash_refresh_token(&other));
    }

    #[test]
    fn test_invite_token_is_128_bits() {
        let token = mint_invite_token();
        let bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_ne!(token, mint_invite_token());
    }
}
