use identity_service::{
    build_router,
    config::IdentityConfig,
    db,
    services::{SecurityNotifier, TracingNotifier, WebhookNotifier},
    store::{IdentityStore, InMemoryIdentityStore, OrganizationStore, PgIdentityStore},
    AppState,
};
use service_core::error::AppError;
use service_core::observability::logging::{init_tracing, shutdown_tracing};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    let store: Arc<dyn IdentityStore> = match &config.database.url {
        Some(url) => {
            let pool = db::create_pool(url, &config.database)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::DatabaseError(anyhow::anyhow!(e)))?;
            Arc::new(PgIdentityStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(InMemoryIdentityStore::new())
        }
    };

    if let Some(org_id) = config.global_oauth2.default_organization_id {
        if store.find_organization(org_id).await?.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "GLOBAL_OAUTH2_DEFAULT_ORGANIZATION_ID {} does not exist",
                org_id
            )));
        }
    }

    let notifier: Arc<dyn SecurityNotifier> = match &config.notification.webhook_url {
        Some(url) => {
            tracing::info!("Security notifications delivered to webhook");
            Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(config.federation.http_timeout_secs),
            )?)
        }
        None => Arc::new(TracingNotifier),
    };

    let bind_address = config.common.bind_address();
    let grace = Duration::from_secs(config.common.shutdown_grace_secs);
    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );

    let state = AppState::new(config, store, notifier).map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize services");
        AppError::ConfigError(e)
    })?;
    let app = build_router(state);

    let _guard = service_span.enter();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(grace))
    .await?;

    tracing::info!("Service shutdown complete");
    shutdown_tracing();
    Ok(())
}

async fn shutdown_signal(grace: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    // Let load balancers stop routing here before the listener closes
    tokio::time::sleep(grace).await;
}
