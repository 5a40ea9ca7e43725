//! OAuth2 authorization-code login (PKCE) against the global or an
//! organization's provider.

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use subtle::ConstantTimeEq;
use tracing::instrument;

use super::{frontend_redirect, issue_session};
use crate::dtos::{FederationLoginQuery, OAuth2CallbackQuery};
use crate::error::FederationError;
use crate::models::{OAuth2ProviderKind, ProviderSettings};
use crate::oauth2::{
    callback_path, code_challenge, random_token, redirect_uri, sso_provider_label, IdpSelector,
    OAuth2LoginState, ResolvedProvider, STATE_COOKIE,
};
use crate::services::state::sanitize_redirect;
use crate::services::{FederatedIdentity, ProvisioningPolicy, ProvisioningScope, StatePurpose};
use crate::AppState;

/// A provider ready for the authorization-code flow plus the scope users
/// from it are provisioned into.
struct FlowTarget {
    provider: ResolvedProvider,
    scope: ProvisioningScope,
    policy: ProvisioningPolicy,
}

fn parse_path(provider: &str, idp_id: &str) -> Result<(OAuth2ProviderKind, IdpSelector), FederationError> {
    let kind = provider
        .parse::<OAuth2ProviderKind>()
        .map_err(|_| FederationError::IdPNotFound)?;
    let selector = idp_id
        .parse::<IdpSelector>()
        .map_err(|_| FederationError::IdPNotFound)?;
    Ok((kind, selector))
}

async fn resolve_target(
    state: &AppState,
    kind: OAuth2ProviderKind,
    selector: IdpSelector,
) -> Result<FlowTarget, FederationError> {
    match selector {
        IdpSelector::Global => {
            let global = &state.config.global_oauth2;
            let settings = match kind {
                OAuth2ProviderKind::Google => global.google.as_ref(),
                OAuth2ProviderKind::Github => global.github.as_ref(),
                OAuth2ProviderKind::Microsoft => global.microsoft.as_ref(),
            }
            .ok_or(FederationError::IdPNotFound)?;

            Ok(FlowTarget {
                provider: ResolvedProvider::new(kind, settings),
                scope: ProvisioningScope::Global {
                    default_organization_id: global.default_organization_id,
                },
                policy: ProvisioningPolicy {
                    auto_create: global.allow_registration,
                    allow_reassignment: false,
                },
            })
        }
        IdpSelector::Organization(idp_id) => {
            let provider = state
                .providers
                .get(idp_id)
                .await?
                .ok_or(FederationError::IdPNotFound)?;

            let settings = match &provider.settings {
                ProviderSettings::OAuth2 {
                    kind: configured,
                    settings,
                } if *configured == kind => settings,
                _ => return Err(FederationError::IdPNotFound),
            };
            if !provider.is_active {
                return Err(FederationError::IdPInactive);
            }
            let organization_id = provider.organization_id.ok_or_else(|| {
                FederationError::Configuration(
                    "organization-scoped OAuth2 provider has no organization".to_string(),
                )
            })?;

            Ok(FlowTarget {
                provider: ResolvedProvider::new(kind, settings),
                scope: ProvisioningScope::Organization(organization_id),
                policy: ProvisioningPolicy {
                    auto_create: settings.auto_provision,
                    allow_reassignment: state.config.provisioning.allow_reassignment,
                },
            })
        }
    }
}

fn state_cookie(state: &AppState, path: String, value: String) -> Cookie<'static> {
    Cookie::build((STATE_COOKIE, value))
        .path(path)
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.config.federation.secure_cookies)
        .max_age(time::Duration::seconds(state.state_signer.ttl_secs()))
        .build()
}

/// Redirect to the provider's authorization endpoint.
#[utoipa::path(
    get,
    path = "/auth/oauth2/{provider}/{idp_id}/login",
    params(
        ("provider" = String, Path, description = "google, github or microsoft"),
        ("idp_id" = String, Path, description = "Identity provider id, or `global`"),
        FederationLoginQuery
    ),
    responses(
        (status = 303, description = "Redirect to the provider; sets the state cookie"),
        (status = 403, description = "Identity provider is disabled"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "OAuth2"
)]
#[instrument(skip(state, jar, query))]
pub async fn login(
    State(state): State<AppState>,
    Path((provider, idp_id)): Path<(String, String)>,
    Query(query): Query<FederationLoginQuery>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), FederationError> {
    let (kind, selector) = parse_path(&provider, &idp_id)?;
    let target = resolve_target(&state, kind, selector).await?;

    let login_state = OAuth2LoginState {
        nonce: random_token(),
        selector,
        provider: kind,
        code_verifier: random_token(),
        redirect_to: sanitize_redirect(query.redirect_to.as_deref()),
    };
    let sealed = state.state_signer.sign(StatePurpose::OAuth2, &login_state)?;

    let url = target.provider.authorization_redirect(
        &redirect_uri(&state.config.federation.app_root_url, kind, selector),
        &login_state.nonce,
        &code_challenge(&login_state.code_verifier),
    );

    let jar = jar.add(state_cookie(&state, callback_path(kind, selector), sealed));
    tracing::info!(provider = %kind, idp = %selector, "Redirecting to OAuth2 provider");
    Ok((jar, Redirect::to(&url)))
}

/// Provider callback. The state cookie is cleared whatever the outcome.
#[utoipa::path(
    get,
    path = "/auth/oauth2/{provider}/{idp_id}/callback",
    params(
        ("provider" = String, Path, description = "google, github or microsoft"),
        ("idp_id" = String, Path, description = "Identity provider id, or `global`"),
        OAuth2CallbackQuery
    ),
    responses(
        (status = 303, description = "Redirect to the frontend with a session token"),
        (status = 400, description = "State missing, expired or mismatched"),
        (status = 401, description = "Code exchange failed or no email supplied"),
        (status = 403, description = "Provisioning refused by policy"),
        (status = 404, description = "Unknown provider")
    ),
    tag = "OAuth2"
)]
#[instrument(skip(state, jar, query))]
pub async fn callback(
    State(state): State<AppState>,
    Path((provider, idp_id)): Path<(String, String)>,
    Query(query): Query<OAuth2CallbackQuery>,
    jar: CookieJar,
) -> (CookieJar, Result<Redirect, FederationError>) {
    let cookie = jar.get(STATE_COOKIE).map(|c| c.value().to_string());
    let outcome = complete_login(&state, &provider, &idp_id, cookie.as_deref(), query).await;

    let removal = match parse_path(&provider, &idp_id) {
        Ok((kind, selector)) => Cookie::build((STATE_COOKIE, "")).path(callback_path(kind, selector)),
        Err(_) => Cookie::build((STATE_COOKIE, "")),
    };
    (jar.remove(removal.build()), outcome)
}

async fn complete_login(
    state: &AppState,
    provider: &str,
    idp_id: &str,
    cookie: Option<&str>,
    query: OAuth2CallbackQuery,
) -> Result<Redirect, FederationError> {
    let (kind, selector) = parse_path(provider, idp_id)?;

    let sealed = cookie.ok_or_else(|| FederationError::StateMismatch("state cookie absent".into()))?;
    let login_state: OAuth2LoginState = state.state_signer.verify(StatePurpose::OAuth2, sealed)?;

    let presented = query.state.as_deref().unwrap_or_default();
    if !bool::from(login_state.nonce.as_bytes().ct_eq(presented.as_bytes())) {
        return Err(FederationError::StateMismatch(
            "state parameter does not match cookie".into(),
        ));
    }
    if login_state.selector != selector || login_state.provider != kind {
        return Err(FederationError::StateMismatch(
            "state was issued for another provider".into(),
        ));
    }

    if let Some(error) = query.error.as_deref() {
        return Err(FederationError::CodeExchangeFailed(format!(
            "provider returned error: {}",
            error
        )));
    }
    let code = query
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FederationError::CodeExchangeFailed("authorization code missing".into()))?;

    let target = resolve_target(state, kind, selector).await?;
    let access_token = state
        .oauth2
        .exchange_code(
            &target.provider,
            code,
            &redirect_uri(&state.config.federation.app_root_url, kind, selector),
            &login_state.code_verifier,
        )
        .await
        .map_err(|e| FederationError::CodeExchangeFailed(e.to_string()))?;

    let profile = state
        .oauth2
        .fetch_user(&target.provider, &access_token)
        .await
        .map_err(|e| FederationError::CodeExchangeFailed(e.to_string()))?;
    let email = profile.email.ok_or(FederationError::EmailMissing)?;

    let identity = FederatedIdentity {
        email,
        display_name: profile.display_name,
        given_name: profile.given_name,
        family_name: profile.family_name,
        external_subject_id: profile.subject,
        sso_provider: sso_provider_label(selector, kind),
    };

    let provisioned = state
        .provisioning
        .resolve(&identity, target.scope, target.policy)
        .await?;
    let issued = issue_session(state, &provisioned.user)?;

    tracing::info!(
        user_id = %provisioned.user.id,
        organization_id = ?provisioned.user.organization_id,
        created = provisioned.created,
        provider = %kind,
        "OAuth2 login completed"
    );

    Ok(frontend_redirect(
        &state.config.federation.frontend_callback_url,
        &issued.token,
        login_state.redirect_to.as_deref(),
    ))
}
