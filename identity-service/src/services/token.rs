use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::TokenConfig;
use crate::models::{Role, User};

/// Minimum accepted length of the signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Values that have shipped in sample configuration files at some point.
const KNOWN_INSECURE_SECRETS: &[&str] = &[
    "secret",
    "changeme",
    "change-me",
    "your-secret-key",
    "your-256-bit-secret",
    "your-secret-key-change-in-production",
    "dev-secret-change-in-production-at-least-32-bytes",
    "supersecretkeythatshouldbechanged",
];

const ALGORITHM: Algorithm = Algorithm::HS256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Token service is not initialized")]
    NotInitialized,

    #[error("Signing secret is too short or a known default")]
    InsecureSecret,

    #[error("Token has expired")]
    Expired,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token is malformed")]
    Malformed,

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

/// Identity carried by every session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionClaims {
    /// User id
    pub sub: Uuid,
    /// Absent for global users not yet assigned to an organization
    pub org_id: Option<Uuid>,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    pub fn user_id(&self) -> Uuid {
        self.sub
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SessionClaims,
    /// Seconds until expiry
    pub expires_in: i64,
}

/// Issues and validates HS256 session tokens.
///
/// Constructed once at startup; a value of this type is proof that the
/// signing secret was loaded and passed the strength checks.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    lifetime: Duration,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(config: &TokenConfig) -> Result<Self, TokenError> {
        let secret = check_secret(&config.signing_secret)?;

        if config.expiration_hours <= 0 {
            return Err(TokenError::Signing(
                "token expiration must be positive".to_string(),
            ));
        }

        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);

        tracing::info!(issuer = %config.issuer, "Token service initialized with HS256 key");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer: config.issuer.clone(),
            lifetime: Duration::hours(config.expiration_hours),
        })
    }

    /// Lifetime of issued tokens in seconds.
    pub fn expires_in(&self) -> i64 {
        self.lifetime.num_seconds()
    }

    /// Mint a session token for `user` in the given organization context.
    pub fn issue(
        &self,
        user: &User,
        organization_id: Option<Uuid>,
    ) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: user.id,
            org_id: organization_id,
            email: user.email.clone(),
            role: user.role,
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            claims,
            expires_in: self.expires_in(),
        })
    }

    pub fn validate(&self, token: &str) -> Result<SessionClaims, TokenError> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                _ => TokenError::Malformed,
            })
    }
}

fn check_secret(secret: &SecretString) -> Result<&[u8], TokenError> {
    let value = secret.expose_secret();
    if value.trim().is_empty() {
        return Err(TokenError::NotInitialized);
    }

    let insecure = KNOWN_INSECURE_SECRETS
        .iter()
        .any(|known| value.eq_ignore_ascii_case(known));

    if insecure || value.len() < MIN_SECRET_LEN {
        return Err(TokenError::InsecureSecret);
    }

    Ok(value.as_bytes())
}
