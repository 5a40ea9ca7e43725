//! SP-initiated SAML 2.0 login: metadata, AuthnRequest redirect and the
//! assertion consumer service.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::{IntoResponse, Redirect, Response},
    Form,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use super::{frontend_redirect, issue_session};
use crate::dtos::{AcsForm, FederationLoginQuery};
use crate::error::FederationError;
use crate::models::{IdentityProvider, ProviderSettings, SamlSettings};
use crate::saml::assertion::{decode_post_binding, validate_response, AssertionExpectations};
use crate::saml::attributes::map_identity;
use crate::saml::authn_request::AuthnRequest;
use crate::saml::{acs_url, default_sp_entity_id, metadata::sp_metadata};
use crate::services::state::sanitize_redirect;
use crate::services::{ProvisioningPolicy, ProvisioningScope, StatePurpose};
use crate::store::AssertionReplayStore;
use crate::AppState;

/// RelayState contents; ties the Response to the AuthnRequest we sent.
#[derive(Debug, Serialize, Deserialize)]
struct SamlRelayState {
    request_id: String,
    idp_id: Uuid,
    redirect_to: Option<String>,
}

async fn load_provider(
    state: &AppState,
    idp_id: Uuid,
) -> Result<Arc<IdentityProvider>, FederationError> {
    let provider = state
        .providers
        .get(idp_id)
        .await?
        .ok_or(FederationError::IdPNotFound)?;

    if !matches!(provider.settings, ProviderSettings::Saml(_)) {
        return Err(FederationError::IdPNotFound);
    }
    Ok(provider)
}

fn saml_settings(provider: &IdentityProvider) -> Result<&SamlSettings, FederationError> {
    match &provider.settings {
        ProviderSettings::Saml(settings) => Ok(settings),
        _ => Err(FederationError::IdPNotFound),
    }
}

fn sp_entity_id(state: &AppState, provider: &IdentityProvider, settings: &SamlSettings) -> String {
    settings
        .sp_entity_id
        .clone()
        .unwrap_or_else(|| default_sp_entity_id(&state.config.federation.app_root_url, provider.id))
}

/// SP metadata for one organization's SAML identity provider.
#[utoipa::path(
    get,
    path = "/auth/saml/{idp_id}/metadata",
    params(("idp_id" = Uuid, Path, description = "Identity provider id")),
    responses(
        (status = 200, description = "SAML SP metadata", content_type = "application/samlmetadata+xml"),
        (status = 404, description = "Unknown SAML identity provider")
    ),
    tag = "SAML"
)]
#[instrument(skip(state))]
pub async fn metadata(
    State(state): State<AppState>,
    Path(idp_id): Path<Uuid>,
) -> Result<Response, FederationError> {
    let provider = load_provider(&state, idp_id).await?;
    let settings = saml_settings(&provider)?;

    let xml = sp_metadata(
        &sp_entity_id(&state, &provider, settings),
        &acs_url(&state.config.federation.app_root_url, provider.id),
        settings.name_id_format.as_deref(),
    );

    Ok(([(header::CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response())
}

/// Start SP-initiated login: redirect to the IdP with an AuthnRequest.
#[utoipa::path(
    get,
    path = "/auth/saml/{idp_id}/login",
    params(("idp_id" = Uuid, Path, description = "Identity provider id"), FederationLoginQuery),
    responses(
        (status = 303, description = "Redirect to the IdP single sign-on endpoint"),
        (status = 403, description = "Identity provider is disabled"),
        (status = 404, description = "Unknown SAML identity provider")
    ),
    tag = "SAML"
)]
#[instrument(skip(state, query))]
pub async fn login(
    State(state): State<AppState>,
    Path(idp_id): Path<Uuid>,
    Query(query): Query<FederationLoginQuery>,
) -> Result<Redirect, FederationError> {
    let provider = load_provider(&state, idp_id).await?;
    if !provider.is_active {
        return Err(FederationError::IdPInactive);
    }
    let settings = saml_settings(&provider)?;

    let request = AuthnRequest::new(
        &sp_entity_id(&state, &provider, settings),
        &acs_url(&state.config.federation.app_root_url, provider.id),
        &settings.sso_url,
        settings.name_id_format.as_deref(),
        Utc::now(),
    );

    let relay_state = state.state_signer.sign(
        StatePurpose::SamlRelay,
        &SamlRelayState {
            request_id: request.id.clone(),
            idp_id: provider.id,
            redirect_to: sanitize_redirect(query.redirect_to.as_deref()),
        },
    )?;

    let url = request
        .redirect_url(&settings.sso_url, &relay_state)
        .map_err(|e| FederationError::Internal(anyhow::anyhow!("AuthnRequest encoding: {}", e)))?;

    tracing::info!(request_id = %request.id, "Redirecting to SAML identity provider");
    Ok(Redirect::to(&url))
}

/// Assertion consumer service (HTTP-POST binding).
#[utoipa::path(
    post,
    path = "/auth/saml/{idp_id}/acs",
    params(("idp_id" = Uuid, Path, description = "Identity provider id")),
    responses(
        (status = 303, description = "Redirect to the frontend with a session token"),
        (status = 401, description = "Assertion rejected"),
        (status = 403, description = "Identity provider disabled or provisioning refused"),
        (status = 404, description = "Unknown SAML identity provider")
    ),
    tag = "SAML"
)]
#[instrument(skip(state, form))]
pub async fn acs(
    State(state): State<AppState>,
    Path(idp_id): Path<Uuid>,
    Form(form): Form<AcsForm>,
) -> Result<Redirect, FederationError> {
    let provider = load_provider(&state, idp_id).await?;
    if !provider.is_active {
        return Err(FederationError::IdPInactive);
    }
    let settings = saml_settings(&provider)?;
    let organization_id = provider.organization_id.ok_or_else(|| {
        FederationError::Configuration("SAML provider has no organization".to_string())
    })?;

    let relay: SamlRelayState = form
        .relay_state
        .as_deref()
        .ok_or_else(|| FederationError::AssertionInvalid("RelayState missing".to_string()))
        .and_then(|value| {
            state
                .state_signer
                .verify(StatePurpose::SamlRelay, value)
                .map_err(|e| FederationError::AssertionInvalid(format!("RelayState: {}", e)))
        })?;
    if relay.idp_id != provider.id {
        return Err(FederationError::AssertionInvalid(
            "RelayState was issued for another provider".to_string(),
        ));
    }

    let xml = decode_post_binding(&form.saml_response)?;
    let sp_entity_id = sp_entity_id(&state, &provider, settings);
    let acs = acs_url(&state.config.federation.app_root_url, provider.id);
    let expectations = AssertionExpectations {
        idp_entity_id: &settings.idp_entity_id,
        sp_entity_id: &sp_entity_id,
        acs_url: &acs,
        request_id: &relay.request_id,
        clock_skew: Duration::seconds(state.config.federation.saml_clock_skew_secs),
        now: Utc::now(),
    };
    let assertion = validate_response(&xml, &settings.signing_key, &expectations)?;

    let fresh = state
        .store
        .consume_assertion_id(provider.id, &assertion.assertion_id, assertion.expires_at)
        .await?;
    if !fresh {
        return Err(FederationError::AssertionInvalid(format!(
            "assertion {} was already consumed",
            assertion.assertion_id
        )));
    }

    let identity = map_identity(
        &assertion,
        &provider.attribute_mapping,
        &format!("saml:{}", provider.id),
    )
    .ok_or(FederationError::EmailMissing)?;

    let provisioned = state
        .provisioning
        .resolve(
            &identity,
            ProvisioningScope::Organization(organization_id),
            ProvisioningPolicy {
                auto_create: settings.auto_provision,
                allow_reassignment: state.config.provisioning.allow_reassignment,
            },
        )
        .await?;

    let issued = issue_session(&state, &provisioned.user)?;
    tracing::info!(
        user_id = %provisioned.user.id,
        created = provisioned.created,
        "SAML login completed"
    );

    Ok(frontend_redirect(
        &state.config.federation.frontend_callback_url,
        &issued.token,
        relay.redirect_to.as_deref(),
    ))
}
