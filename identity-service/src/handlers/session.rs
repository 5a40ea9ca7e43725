use axum::{extract::State, http::StatusCode, Json};
use chrono::{Duration, Utc};
use secrecy::SecretString;
use service_core::error::AppError;
use tracing::instrument;

use crate::dtos::{LoginRequest, SessionResponse, TokenResponse};
use crate::middleware::AuthUser;
use crate::services::notification::dispatch;
use crate::services::SecurityEvent;
use crate::store::UserStore;
use crate::utils::{verify_against_decoy, verify_password, ValidatedJson};
use crate::AppState;

fn invalid_credentials() -> AppError {
    AppError::Unauthorized(anyhow::anyhow!("Invalid email or password"))
}

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = TokenResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account temporarily locked"),
        (status = 422, description = "Validation error")
    ),
    tag = "Authentication"
)]
#[instrument(skip(state, req), fields(organization_id = ?req.organization_id))]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    let email = req.email.trim().to_lowercase();
    let password = SecretString::new(req.password);

    let Some(user) = state
        .store
        .find_user_by_email(req.organization_id, &email)
        .await?
    else {
        verify_against_decoy(&password);
        return Err(invalid_credentials());
    };

    if !user.is_active || user.is_federation_only() {
        tracing::info!(user_id = %user.id, "Password login refused for inactive or federated account");
        verify_against_decoy(&password);
        return Err(invalid_credentials());
    }

    let now = Utc::now();
    if user.is_locked(now) {
        tracing::warn!(user_id = %user.id, "Login attempt on locked account");
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Account is temporarily locked"
        )));
    }

    if !verify_password(&password, &user.password_hash) {
        let policy = &state.config.password;
        let updated = state
            .store
            .record_failed_login(
                user.id,
                policy.max_failed_attempts,
                now + Duration::minutes(policy.lockout_minutes),
            )
            .await?;

        if updated.is_locked(now) {
            tracing::warn!(user_id = %user.id, "Account locked after repeated failed logins");
            if let Some(lockout_until) = updated.lockout_until {
                dispatch(
                    &state.notifier,
                    SecurityEvent::AccountLocked {
                        user_id: updated.id,
                        organization_id: updated.organization_id,
                        lockout_until,
                    },
                );
            }
        }
        return Err(invalid_credentials());
    }

    if user.failed_login_attempts > 0 || user.lockout_until.is_some() {
        state.store.reset_failed_logins(user.id).await?;
    }

    let issued = state
        .tokens
        .issue(&user, user.organization_id)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to issue token: {}", e)))?;

    tracing::info!(user_id = %user.id, "Password login succeeded");
    Ok((
        StatusCode::OK,
        Json(TokenResponse {
            access_token: issued.token,
            token_type: "Bearer".to_string(),
            expires_in: issued.expires_in,
        }),
    ))
}

/// Current session as seen by the auth middleware
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Session of the bearer token", body = SessionResponse),
        (status = 401, description = "Missing, invalid or expired token")
    ),
    tag = "Authentication",
    security(
        ("bearer_auth" = [])
    )
)]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(claims): AuthUser,
) -> Result<Json<SessionResponse>, AppError> {
    let display_name = state
        .store
        .find_user_by_id(claims.user_id())
        .await?
        .and_then(|user| user.display_name);

    Ok(Json(SessionResponse {
        user_id: claims.sub,
        organization_id: claims.org_id,
        email: claims.email,
        role: claims.role,
        display_name,
        issued_at: claims.iat,
        expires_at: claims.exp,
    }))
}
