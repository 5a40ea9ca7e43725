//! Terminal states of the federation flows and their HTTP mapping.
//!
//! The public message is fixed per variant. Reasons are written to the log
//! (with the request span's correlation id) and never to the response.

use axum::response::{IntoResponse, Response};
use service_core::error::AppError;
use thiserror::Error;

use crate::models::ProviderConfigError;
use crate::saml::assertion::AssertionError;
use crate::services::registry::RegistryError;
use crate::services::provisioning::ProvisioningError;
use crate::services::state::StateError;
use crate::services::token::TokenError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum FederationError {
    #[error("Identity provider not found")]
    IdPNotFound,

    #[error("Identity provider is disabled")]
    IdPInactive,

    #[error("SAML assertion rejected: {0}")]
    AssertionInvalid(String),

    #[error("OAuth2 state mismatch: {0}")]
    StateMismatch(String),

    #[error("Authorization code exchange failed: {0}")]
    CodeExchangeFailed(String),

    #[error("Identity provider did not supply an email address")]
    EmailMissing,

    #[error("Provisioning refused: {0}")]
    Provisioning(ProvisioningError),

    #[error("Session token error: {0}")]
    Token(#[from] TokenError),

    #[error("Identity provider misconfigured: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl FederationError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationError::IdPNotFound => "idp_not_found",
            FederationError::IdPInactive => "idp_inactive",
            FederationError::AssertionInvalid(_) => "assertion_invalid",
            FederationError::StateMismatch(_) => "state_mismatch",
            FederationError::CodeExchangeFailed(_) => "code_exchange_failed",
            FederationError::EmailMissing => "email_missing",
            FederationError::Provisioning(ProvisioningError::ProvisioningDenied) => {
                "provisioning_denied"
            }
            FederationError::Provisioning(ProvisioningError::RegistrationDisabled) => {
                "registration_disabled"
            }
            FederationError::Provisioning(ProvisioningError::OrganizationMismatch) => {
                "organization_mismatch"
            }
            FederationError::Provisioning(_) => "provisioning_failed",
            FederationError::Token(_) => "token",
            FederationError::Configuration(_) => "configuration",
            FederationError::Internal(_) => "internal",
        }
    }
}

impl From<ProvisioningError> for FederationError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::InvalidIdentity => FederationError::EmailMissing,
            ProvisioningError::Store(e) => e.into(),
            other => FederationError::Provisioning(other),
        }
    }
}

impl From<StoreError> for FederationError {
    fn from(err: StoreError) -> Self {
        FederationError::Internal(anyhow::anyhow!(err))
    }
}

impl From<ProviderConfigError> for FederationError {
    fn from(err: ProviderConfigError) -> Self {
        FederationError::Configuration(err.to_string())
    }
}

impl From<RegistryError> for FederationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Store(e) => e.into(),
            RegistryError::InvalidConfiguration(e) => e.into(),
        }
    }
}

impl From<AssertionError> for FederationError {
    fn from(err: AssertionError) -> Self {
        FederationError::AssertionInvalid(err.to_string())
    }
}

impl From<StateError> for FederationError {
    fn from(err: StateError) -> Self {
        FederationError::StateMismatch(err.to_string())
    }
}

impl From<FederationError> for AppError {
    fn from(err: FederationError) -> Self {
        let kind = err.kind();
        match &err {
            FederationError::Configuration(_) | FederationError::Internal(_) => {}
            FederationError::Token(TokenError::Signing(_) | TokenError::NotInitialized) => {}
            _ => tracing::warn!(kind, reason = %err, "Federation flow failed"),
        }

        let public = |msg: &str| anyhow::anyhow!(msg.to_string());
        match err {
            FederationError::IdPNotFound => AppError::NotFound(public("Identity provider not found")),
            FederationError::IdPInactive => {
                AppError::Forbidden(public("Identity provider is disabled"))
            }
            FederationError::AssertionInvalid(_) => {
                AppError::Unauthorized(public("Authentication failed"))
            }
            FederationError::StateMismatch(_) => {
                AppError::BadRequest(public("Invalid or expired login state"))
            }
            FederationError::CodeExchangeFailed(_) => {
                AppError::Unauthorized(public("Authentication failed"))
            }
            FederationError::EmailMissing => AppError::Unauthorized(public(
                "Identity provider did not supply an email address",
            )),
            FederationError::Provisioning(ProvisioningError::RegistrationDisabled) => {
                AppError::Forbidden(public("Registration is disabled"))
            }
            FederationError::Provisioning(ProvisioningError::OrganizationMismatch) => {
                AppError::Forbidden(public("Account belongs to a different organization"))
            }
            FederationError::Provisioning(_) => {
                AppError::Forbidden(public("Account provisioning is not permitted"))
            }
            FederationError::Token(TokenError::Signing(reason)) => {
                AppError::InternalError(anyhow::anyhow!(reason))
            }
            FederationError::Token(TokenError::NotInitialized) => {
                AppError::InternalError(anyhow::anyhow!("token service not initialized"))
            }
            FederationError::Token(_) => AppError::Unauthorized(public("Invalid or expired token")),
            FederationError::Configuration(reason) => AppError::ConfigError(anyhow::anyhow!(
                "identity provider configuration: {}",
                reason
            )),
            FederationError::Internal(e) => AppError::InternalError(e),
        }
    }
}

impl IntoResponse for FederationError {
    fn into_response(self) -> Response {
        AppError::from(self).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status(err: FederationError) -> StatusCode {
        AppError::from(err).status()
    }

    #[test]
    fn policy_and_protocol_errors_are_distinct() {
        assert_eq!(status(FederationError::IdPNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(FederationError::IdPInactive), StatusCode::FORBIDDEN);
        assert_eq!(
            status(FederationError::AssertionInvalid("bad signature".into())),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(FederationError::StateMismatch("cookie missing".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(ProvisioningError::RegistrationDisabled.into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status(ProvisioningError::InvalidIdentity.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(FederationError::Configuration("bad certificate".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn reasons_stay_out_of_the_message() {
        let app: AppError = FederationError::AssertionInvalid("secret detail".into()).into();
        assert!(!app.to_string().contains("secret detail"));
    }
}
