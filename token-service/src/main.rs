use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use token_service::{
    build_router,
    config::TokenServiceConfig,
    db,
    services::{build_providers, spawn_pruner, Metrics, PgTokenStore, PgUserDirectory, RedisService},
    AppState, Backends,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Fail fast on invalid configuration
    let config = TokenServiceConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(AppError::ConfigError)?;

    let metrics = Metrics::new().map_err(|e| AppError::InternalError(e.into()))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting token service"
    );

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.into()))?;

    let redis = RedisService::new(&config.redis).await?;
    tracing::info!("Redis service initialized");

    let providers = build_providers(&config.oauth).map_err(AppError::ConfigError)?;
    tracing::info!(providers = providers.len(), "OAuth providers initialized");

    let backends = Backends {
        store: Arc::new(PgTokenStore::new(pool.clone())),
        users: Arc::new(PgUserDirectory::new(pool)),
        ephemeral: Arc::new(redis),
        providers,
    };

    let state = AppState::new(config.clone(), backends, metrics).map_err(AppError::ConfigError)?;

    let pruner = spawn_pruner(
        state.blacklist.clone(),
        Duration::from_secs(config.maintenance.prune_interval_seconds),
    );

    let app = build_router(state).await?;

    let addr = config.common.listen_addr();

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let grace = Duration::from_secs(config.common.shutdown_grace_seconds);

    let serve = service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    })
    .into_future();
    tokio::pin!(serve);

    // In-flight requests get `grace` to finish once the signal arrives.
    tokio::select! {
        result = &mut serve => result?,
        _ = async {
            let _ = stop_rx.wait_for(|stopping| *stopping).await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!(grace_seconds = grace.as_secs(), "Grace period elapsed, dropping open connections");
        }
    }

    pruner.abort();
    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
