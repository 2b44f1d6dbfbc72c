//! Bearer-token authentication

use crate::handlers::{ApiError, AppState};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Claims carried by access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<serde_json::Value>,

    pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authorization header required")]
    MissingHeader,

    #[error("authorization header must contain Bearer token")]
    NotBearer,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token carries no email claim")]
    MissingEmail,
}

/// Validates HS256 tokens signed with the shared secret
#[derive(Clone)]
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens are not audience-scoped
        validation.validate_aud = false;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate an `Authorization` header value and return the caller
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthUser, AuthError> {
        let header = header.ok_or(AuthError::MissingHeader)?;
        let token = header.strip_prefix("Bearer ").ok_or(AuthError::NotBearer)?;

        let data = decode::<UserClaims>(token.trim(), &self.key, &self.validation)?;
        let email = data
            .claims
            .email
            .clone()
            .filter(|email| !email.is_empty())
            .ok_or(AuthError::MissingEmail)?;

        Ok(AuthUser {
            email,
            claims: data.claims,
        })
    }
}

/// The authenticated caller; owner of everything it creates
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
    pub claims: UserClaims,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        state.authenticator.authenticate(header).map_err(|e| {
            warn!("Failed to authenticate user: {}", e);
            ApiError {
                status: StatusCode::UNAUTHORIZED,
                message: format!("Unauthorized: {}", e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(email: Option<&str>, exp_offset: i64, secret: &str) -> String {
        let claims = UserClaims {
            sub: Some("user-1".to_string()),
            email: email.map(str::to_string),
            role: Some("authenticated".to_string()),
            user_metadata: None,
            exp: (chrono::Utc::now().timestamp() + exp_offset) as u64,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn test_valid_token() {
        let auth = Authenticator::new(SECRET);
        let header = format!("Bearer {}", token(Some("alice@example.com"), 3600, SECRET));

        let user = auth.authenticate(Some(&header)).unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.claims.role.as_deref(), Some("authenticated"));
    }

    #[test]
    fn test_rejections() {
        let auth = Authenticator::new(SECRET);

        assert!(matches!(auth.authenticate(None), Err(AuthError::MissingHeader)));
        assert!(matches!(auth.authenticate(Some("Basic abc")), Err(AuthError::NotBearer)));

        let forged = format!("Bearer {}", token(Some("alice@example.com"), 3600, "other-secret"));
        assert!(matches!(auth.authenticate(Some(&forged)), Err(AuthError::InvalidToken(_))));

        let expired = format!("Bearer {}", token(Some("alice@example.com"), -3600, SECRET));
        assert!(matches!(auth.authenticate(Some(&expired)), Err(AuthError::InvalidToken(_))));

        let anonymous = format!("Bearer {}", token(None, 3600, SECRET));
        assert!(matches!(auth.authenticate(Some(&anonymous)), Err(AuthError::MissingEmail)));
    }
}
