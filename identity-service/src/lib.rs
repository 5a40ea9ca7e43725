pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod oauth2;
pub mod saml;
pub mod services;
pub mod store;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{request_id_middleware, security_headers_middleware, REQUEST_ID_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::IdentityConfig;
use crate::dtos::HealthResponse;
use crate::oauth2::OAuth2Client;
use crate::services::{
    registry::DEFAULT_CACHE_TTL, FederationStateSigner, ProviderRegistry, ProvisioningEngine,
    SecurityNotifier, TokenService,
};
use crate::store::IdentityStore;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::session::login,
        handlers::session::me,
        handlers::saml::metadata,
        handlers::saml::login,
        handlers::saml::acs,
        handlers::oauth2::login,
        handlers::oauth2::callback,
    ),
    components(
        schemas(
            dtos::LoginRequest,
            dtos::TokenResponse,
            dtos::SessionResponse,
            dtos::HealthResponse,
            models::Role,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Password login and session inspection"),
        (name = "SAML", description = "SAML 2.0 service provider endpoints"),
        (name = "OAuth2", description = "OAuth2 authorization-code federation"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<IdentityConfig>,
    pub store: Arc<dyn IdentityStore>,
    pub tokens: TokenService,
    pub state_signer: FederationStateSigner,
    pub providers: ProviderRegistry,
    pub provisioning: ProvisioningEngine,
    pub oauth2: OAuth2Client,
    pub notifier: Arc<dyn SecurityNotifier>,
}

impl AppState {
    /// Wire the services over `store`. Fails when the signing secret is
    /// missing or too weak.
    pub fn new(
        config: IdentityConfig,
        store: Arc<dyn IdentityStore>,
        notifier: Arc<dyn SecurityNotifier>,
    ) -> anyhow::Result<Self> {
        let tokens = TokenService::new(&config.token)?;
        let state_signer = FederationStateSigner::new(
            &config.token.signing_secret,
            config.federation.state_ttl_secs,
        )?;
        let oauth2 = OAuth2Client::new(Duration::from_secs(config.federation.http_timeout_secs))?;

        Ok(Self {
            providers: ProviderRegistry::new(Arc::clone(&store), DEFAULT_CACHE_TTL),
            provisioning: ProvisioningEngine::new(Arc::clone(&store), Arc::clone(&notifier)),
            config: Arc::new(config),
            store,
            tokens,
            state_signer,
            oauth2,
            notifier,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/auth/me", get(handlers::session::me))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .route("/auth/login", post(handlers::session::login))
        .route("/auth/saml/:idp_id/metadata", get(handlers::saml::metadata))
        .route("/auth/saml/:idp_id/login", get(handlers::saml::login))
        .route("/auth/saml/:idp_id/acs", post(handlers::saml::acs))
        .route(
            "/auth/oauth2/:provider/:idp_id/login",
            get(handlers::oauth2::login),
        )
        .route(
            "/auth/oauth2/:provider/:idp_id/callback",
            get(handlers::oauth2::callback),
        )
        .merge(authenticated)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Store is unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Store health check failed");
        AppError::ServiceUnavailable
    })?;

    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: state.config.service_version.clone(),
    }))
}
