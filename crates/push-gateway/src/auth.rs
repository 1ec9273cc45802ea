//! Credential validation for the upgrade endpoint.
//!
//! Tokens are HS256 JWTs carrying `{uid, exp, iss}`. Validation is a trait so
//! the upgrade handler does not care where identities come from.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::UserId;

/// Issuer stamped into and required from every token.
pub const ISSUER: &str = "diting-go";

/// Default token lifetime: 360 days.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(360 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: i64,
    pub exp: i64,
    pub iss: String,
}

/// The authenticated caller of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("credential expired")]
    Expired,

    #[error("invalid credential: {0}")]
    Invalid(String),
}

impl AuthError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Expired => "expired",
            AuthError::Invalid(_) => "invalid",
        }
    }
}

/// Turns an opaque credential into an identity.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HS256 JWT validator with a shared secret.
pub struct JwtValidator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl CredentialValidator for JwtValidator {
    fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        Ok(Identity {
            user_id: UserId(data.claims.uid),
            expires_at: DateTime::from_timestamp(data.claims.exp, 0),
        })
    }
}

/// Mint a token for `uid` valid for `ttl` from now.
pub fn issue_token(
    secret: &[u8],
    uid: i64,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        uid,
        exp: Utc::now().timestamp() + ttl.as_secs() as i64,
        iss: ISSUER.to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
