//! JWT Authentication
//!
//! Validates tokens issued by the external login service. The server never
//! issues tokens; it only checks them and maps the subject to a [`PlayerId`].

use jsonwebtoken::{decode, DecodingKey, Validation, Algorithm, TokenData};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Digest};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::game::state::PlayerId;
use crate::network::protocol::ErrorCode;

/// Authentication configuration.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Expected issuer claim ("iss"). If None, any issuer accepted.
    pub issuer: Option<String>,
    /// Expected audience claim ("aud"). If None, any audience accepted.
    pub audience: Option<String>,
    /// RS256 public key in PEM format.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret.
    pub secret: Option<String>,
    /// Skip expiry validation (testing only).
    pub skip_expiry: bool,
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
            skip_expiry: std::env::var("AUTH_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Check if authentication is configured.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }
}

/// Claims expected from the login service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the account id in the login service.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    #[serde(default)]
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Grants admin commands.
    #[serde(default)]
    pub admin: bool,
}

impl TokenClaims {
    /// Derive a stable PlayerId from the subject claim.
    ///
    /// A subject that is itself a UUID maps to that UUID; anything else is
    /// hashed.
    pub fn player_id(&self) -> PlayerId {
        if let Some(id) = PlayerId::from_uuid_str(&self.sub) {
            return id;
        }

        let mut hasher = Sha256::new();
        hasher.update(b"dice-round-player:");
        hasher.update(self.sub.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        PlayerId::new(id)
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No authentication configured on server.
    #[error("authentication not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Audience claim doesn't match expected value.
    #[error("invalid audience")]
    InvalidAudience,
    /// Required claim is missing.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// JWT decoding error.
    #[error("decode error: {0}")]
    DecodeError(String),
}

impl AuthError {
    /// Wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::Expired => ErrorCode::TokenExpired,
            AuthError::NotConfigured | AuthError::DecodeError(_) => ErrorCode::AuthFailed,
            _ => ErrorCode::InvalidToken,
        }
    }
}

/// Validate a JWT token and extract claims.
pub fn validate_token(token: &str, config: &AuthConfig) -> Result<TokenClaims, AuthError> {
    let mut validation = if config.public_key_pem.is_some() {
        Validation::new(Algorithm::RS256)
    } else if config.secret.is_some() {
        Validation::new(Algorithm::HS256)
    } else {
        return Err(AuthError::NotConfigured);
    };

    // Only the claims configured below are enforced
    validation.required_spec_claims = std::collections::HashSet::new();

    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    if let Some(ref audience) = config.audience {
        validation.set_audience(&[audience]);
    } else {
        validation.validate_aud = false;
    }

    if config.skip_expiry {
        validation.validate_exp = false;
    }

    let token_data: TokenData<TokenClaims> = if let Some(ref pem) = config.public_key_pem {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::DecodeError(format!("invalid public key: {}", e)))?;
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else if let Some(ref secret) = config.secret {
        let key = DecodingKey::from_secret(secret.as_bytes());
        decode(token, &key, &validation).map_err(map_jwt_error)?
    } else {
        return Err(AuthError::NotConfigured);
    };

    let claims = token_data.claims;

    if claims.sub.is_empty() {
        return Err(AuthError::MissingClaim("sub".into()));
    }

    // Library leeway aside, an exp in the past is rejected outright
    if !config.skip_expiry && claims.exp > 0 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now > claims.exp {
            return Err(AuthError::Expired);
        }
    }

    Ok(claims)
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::DecodeError(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================
