//! Identity verification.
//!
//! Token issuance lives outside this crate; the core only resolves an opaque
//! token to a [`UserId`]. Every failure collapses to
//! [`AuthError::Unauthenticated`].

use crate::error::AuthError;
use crate::model::UserId;
use dashmap::DashMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A user whose token was accepted by an [`IdentityVerifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    user_id: UserId,
}

impl AuthenticatedUser {
    /// Wrap a verified user id. Only verifier implementations should call this.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn into_user_id(self) -> UserId {
        self.user_id
    }
}

/// Resolves opaque tokens to users.
///
/// Implementations must be pure: the request path and the connection
/// admission path call them identically.
pub trait IdentityVerifier: Send + Sync {
    /// Verify `token`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] for any malformed, expired or
    /// mis-signed token.
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Claims carried by an HS256 access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id. Tokens minted with a standard `sub` claim are accepted too.
    #[serde(alias = "sub")]
    pub id: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// Verifies HS256-signed JWTs against a shared secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for `secret` allowing `leeway_secs` of clock skew.
    #[must_use]
    pub fn new(secret: &[u8], leeway_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            trace!(error = %e, "Token rejected");
            AuthError::Unauthenticated
        })?;

        if data.claims.id.is_empty() {
            return Err(AuthError::Unauthenticated);
        }
        Ok(AuthenticatedUser::new(UserId::new(data.claims.id)))
    }
}

/// Fixed token table, for tests and local development.
#[derive(Debug, Default)]
pub struct StaticVerifier {
    tokens: DashMap<String, UserId>,
}

impl StaticVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user`.
    pub fn insert(&self, token: impl Into<String>, user: impl Into<UserId>) {
        self.tokens.insert(token.into(), user.into());
    }

    /// Stop accepting `token`.
    pub fn revoke(&self, token: &str) {
        self.tokens.remove(token);
    }
}

impl IdentityVerifier for StaticVerifier {
    fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.tokens
            .get(token)
            .map(|user| AuthenticatedUser::new(user.clone()))
            .ok_or(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &[u8] = b"test-secret";

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn token(id: &str, exp: u64, secret: &[u8]) -> String {
        let claims = Claims {
            id: id.to_string(),
            exp,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let verifier = JwtVerifier::new(SECRET, 0);
        let user = verifier.verify(&token("user-1", now() + 3600, SECRET)).unwrap();
        assert_eq!(user.user_id().as_str(), "user-1");
    }

    #[test]
    fn test_failures_are_indistinguishable() {
        let verifier = JwtVerifier::new(SECRET, 0);

        let expired = verifier.verify(&token("user-1", now() - 3600, SECRET));
        let wrong_key = verifier.verify(&token("user-1", now() + 3600, b"other"));
        let garbage = verifier.verify("not.a.jwt");
        let empty = verifier.verify("   ");

        for result in [expired, wrong_key, garbage, empty] {
            assert_eq!(result, Err(AuthError::Unauthenticated));
        }
    }

    #[test]
    fn test_sub_claim_alias() {
        #[derive(Serialize)]
        struct SubClaims {
            sub: String,
            exp: u64,
        }
        let token = encode(
            &Header::default(),
            &SubClaims {
                sub: "user-2".into(),
                exp: now() + 60,
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let verifier = JwtVerifier::new(SECRET, 0);
        assert_eq!(verifier.verify(&token).unwrap().user_id().as_str(), "user-2");
    }

    #[test]
    fn test_static_verifier() {
        let verifier = StaticVerifier::new();
        verifier.insert("tok-a", "alice");
        assert_eq!(verifier.verify("tok-a").unwrap().user_id().as_str(), "alice");

        verifier.revoke("tok-a");
        assert!(verifier.verify("tok-a").is_err());
    }
}
