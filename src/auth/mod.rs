//! Authentication: argon2 password hashing, HS256 JWT issue/verify, and the
//! `CurrentUser` extractor for protected routes.

mod claims;

pub use claims::{Claims, TokenType};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::users::Role;

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing secret. Must be at least 32 bytes.
    pub jwt_secret: String,
    /// Access token lifetime in minutes.
    pub access_token_minutes: i64,
    /// Refresh token lifetime in days.
    pub refresh_token_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_minutes: 60,
            refresh_token_days: 7,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.jwt_secret.len() < 32 {
            return Err(AuthError::Config(
                "auth.jwt_secret must be at least 32 characters".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing or malformed authorization header")]
    MissingBearer,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has expired")]
    TokenExpired,
    #[error("token is not a {0:?} token")]
    WrongTokenType(TokenType),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("auth configuration error: {0}")]
    Config(String),
    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Shared authentication state: signing keys and token policy.
#[derive(Clone)]
pub struct AuthState {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl AuthState {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            access_ttl: Duration::minutes(config.access_token_minutes),
            refresh_ttl: Duration::days(config.refresh_token_days),
        }
    }

    fn issue(&self, subject: &str, role: Role, token_type: TokenType) -> Result<String, AuthError> {
        let now = Utc::now();
        let ttl = match token_type {
            TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: subject.to_string(),
            role,
            token_type,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    pub fn create_access_token(&self, subject: &str, role: Role) -> Result<String, AuthError> {
        self.issue(subject, role, TokenType::Access)
    }

    pub fn create_refresh_token(&self, subject: &str, role: Role) -> Result<String, AuthError> {
        self.issue(subject, role, TokenType::Refresh)
    }

    /// Issue a fresh access + refresh pair. Refresh tokens rotate on use.
    pub fn create_token_pair(&self, subject: &str, role: Role) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.create_access_token(subject, role)?,
            refresh_token: self.create_refresh_token(subject, role)?,
        })
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &self.decoding,
            &Validation::new(jsonwebtoken::Algorithm::HS256),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken(e.to_string()),
        })?;
        Ok(data.claims)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.verify(token)?;
        if claims.token_type != TokenType::Access {
            return Err(AuthError::WrongTokenType(TokenType::Access));
        }
        Ok(claims)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.verify(token)?;
        if claims.token_type != TokenType::Refresh {
            return Err(AuthError::WrongTokenType(TokenType::Refresh));
        }
        Ok(claims)
    }
}

/// Access + refresh token pair returned by login and refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

// ── Passwords ────────────────────────────────────────────────────────────────

/// Hash a plaintext password with argon2id.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Internal(e.to_string()))
}

/// Verify a plaintext password against a stored argon2 hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// The authenticated analyst, extracted from the bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub role: Role,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    AuthState: axum::extract::FromRef<S>,
    S: Send + Sync,
{
    type Rejection = crate::api::ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthState::from_ref(state);
        let token = bearer_token(parts).ok_or(AuthError::MissingBearer)?;
        let claims = auth.verify_access_token(&token)?;
        Ok(CurrentUser {
            username: claims.sub,
            role: claims.role,
        })
    }
}

use axum::extract::FromRef;

/// Pull the bearer token from the Authorization header, falling back to the
/// `token` query parameter (used by the WebSocket handshake).
pub fn bearer_token(parts: &Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(axum::http::header::AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
        return Some(token.to_string());
    }
    let query = parts.uri.query()?;
    for pair in query.split('&') {
        if let Some(token) = pair.strip_prefix("token=") {
            return Some(token.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AuthState {
        AuthState::new(&AuthConfig {
            jwt_secret: "test-secret-for-auth-tests-minimum-32-chars".into(),
            ..Default::default()
        })
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
    }

    #[test]
    fn access_token_round_trip() {
        let auth = state();
        let token = auth.create_access_token("alice", Role::Admin).unwrap();
        let claims = auth.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert!(claims.is_admin());
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let auth = state();
        let token = auth.create_refresh_token("alice", Role::Analyst).unwrap();
        assert!(matches!(
            auth.verify_access_token(&token),
            Err(AuthError::WrongTokenType(TokenType::Access))
        ));
        assert!(auth.verify_refresh_token(&token).is_ok());
    }

    #[test]
    fn tampered_token_rejected() {
        let auth = state();
        let mut token = auth.create_access_token("alice", Role::Analyst).unwrap();
        token.push('x');
        assert!(auth.verify_access_token(&token).is_err());
    }

    #[test]
    fn short_secret_rejected() {
        let config = AuthConfig {
            jwt_secret: "short".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn refresh_rotation_issues_distinct_jti() {
        let auth = state();
        let a = auth.create_refresh_token("alice", Role::Analyst).unwrap();
        let b = auth.create_refresh_token("alice", Role::Analyst).unwrap();
        let ca = auth.verify_refresh_token(&a).unwrap();
        let cb = auth.verify_refresh_token(&b).unwrap();
        assert_ne!(ca.jti, cb.jti);
    }
}
