//! Signed session tokens.
//!
//! The controller does not mint sessions for end users — the web tier does.
//! It only verifies the HMAC-signed token from the session cookie and
//! enforces the CSRF nonce it carries. `mint` exists for the web tier and
//! for tests.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Cookie the session token travels in.
pub const SESSION_COOKIE: &str = "gpuops_session";

/// Permission bits carried by power-user sessions.
pub const PERM_VIEW_BOARD: u32 = 1;
pub const PERM_VIEW_NODES: u32 = 2;
pub const PERM_REVIEW_REQUESTS: u32 = 4;

pub const ALL_PERMS: u32 = PERM_VIEW_BOARD | PERM_VIEW_NODES | PERM_REVIEW_REQUESTS;

/// Claims inside a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Authenticated username.
    pub sub: String,
    /// "user", "power_user" or "admin".
    pub role: String,
    /// Permission bitmask; full for admins.
    pub perms: u32,
    /// CSRF nonce; must match `X-CSRF-Token` on non-GET requests.
    pub csrf: String,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies (and for the web tier, mints) session tokens.
pub struct SessionKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_secs: i64,
}

impl SessionKeys {
    /// `session_hours == 0` disables cookie auth; callers should not build
    /// keys in that case.
    pub fn new(secret: &[u8], session_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_secs: session_hours * 3600,
        }
    }

    /// Issue a session token with a fresh CSRF nonce.
    pub fn mint(
        &self,
        username: &str,
        role: &str,
        perms: u32,
        now: i64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = SessionClaims {
            sub: username.to_string(),
            role: role.to_string(),
            perms,
            csrf: uuid::Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl_secs,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
    }

    /// Validate a token (signature and expiry) and return its claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        let data = jsonwebtoken::decode::<SessionClaims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        SessionKeys::new(b"test-secret-key-for-testing", 72)
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn mint_and_verify() {
        let token = keys().mint("alice", "admin", ALL_PERMS, now()).unwrap();
        let claims = keys().verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.role, "admin");
        assert_eq!(claims.perms, ALL_PERMS);
        assert!(!claims.csrf.is_empty());
    }

    #[test]
    fn wrong_secret_fails() {
        let token = keys().mint("alice", "user", 0, now()).unwrap();
        let other = SessionKeys::new(b"different-secret", 72);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_token_fails() {
        let token = keys().mint("alice", "user", 0, now() - 100 * 3600 - 100).unwrap();
        assert!(keys().verify(&token).is_err());
    }

    #[test]
    fn garbage_fails() {
        assert!(keys().verify("not-a-token").is_err());
    }
}
