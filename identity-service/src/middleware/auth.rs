use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::ErrorBody;
use thiserror::Error;

use crate::services::{SessionClaims, TokenError, TokenService};
use crate::AppState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization header is missing")]
    MissingHeader,

    #[error("Authorization header is not a Bearer token")]
    MalformedHeader,

    #[error("Session token rejected: {0}")]
    InvalidToken(#[from] TokenError),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match &self {
            AuthError::MissingHeader | AuthError::MalformedHeader => {
                tracing::debug!(reason = %self, "Request not authenticated");
                "Missing or invalid Authorization header"
            }
            AuthError::InvalidToken(reason) => {
                tracing::warn!(reason = %reason, "Session token rejected");
                "Invalid or expired token"
            }
        };

        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: message.to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}

/// Validate the `Authorization: Bearer <token>` header.
pub fn authenticate(tokens: &TokenService, headers: &HeaderMap) -> Result<SessionClaims, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("Bearer") || token.is_empty() || token.contains(' ') {
        return Err(AuthError::MalformedHeader);
    }

    Ok(tokens.validate(token)?)
}

/// Middleware to require a valid session token. Claims are placed in the
/// request extensions for [`AuthUser`].
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let claims = authenticate(&state.tokens, req.headers())?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Extractor for the claims of the authenticated session.
pub struct AuthUser(pub SessionClaims);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionClaims>()
            .cloned()
            .map(AuthUser)
            .ok_or(AuthError::MissingHeader)
    }
}
