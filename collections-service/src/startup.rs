//! Application startup and lifecycle management.

use crate::config::CollectionsConfig;
use crate::engine::{CollectionsEngine, EngineContext};
use crate::handlers::{self, contracts, jobs, mandates, webhooks};
use crate::services::{
    init_metrics, CollectionsStore, Database, HttpContractService, HttpGateway, HttpNotifier,
    RetryingGateway, RetryingNotifier,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CollectionsEngine>,
    pub store: Arc<dyn CollectionsStore>,
    pub webhook_secret: Secret<String>,
}

impl AppState {
    pub fn new(ctx: EngineContext, webhook_secret: Secret<String>) -> Self {
        Self {
            store: ctx.store.clone(),
            engine: Arc::new(CollectionsEngine::new(ctx)),
            webhook_secret,
        }
    }
}

/// All HTTP routes with the standard middleware stack.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        .route("/jobs/schedule", post(jobs::run_schedule))
        .route("/jobs/notify", post(jobs::run_notify))
        .route("/jobs/submit", post(jobs::run_submit))
        .route("/jobs/dunning", post(jobs::run_dunning))
        .route("/jobs/expire-mandates", post(jobs::run_expire_mandates))
        .route("/jobs/sync-contracts", post(jobs::run_sync_contracts))
        .route("/contracts/activations", post(contracts::activate_contract))
        .route("/contracts/:contract_id/ended", post(contracts::contract_ended))
        .route("/mandates/:mandate_id", get(mandates::get_mandate))
        .route("/mandates/:mandate_id/cancel", post(mandates::cancel_mandate))
        .route(
            "/mandates/:mandate_id/reactivate",
            post(mandates::reactivate_mandate),
        )
        .route(
            "/subscriptions/:subscription_id/pause",
            post(mandates::pause_subscription),
        )
        .route(
            "/subscriptions/:subscription_id/resume",
            post(mandates::resume_subscription),
        )
        .route(
            "/subscriptions/:subscription_id/payments",
            get(mandates::list_subscription_payments),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Bound listener plus the wired engine, ready to serve.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Connect to PostgreSQL, apply migrations, wire the HTTP collaborators
    /// behind their retry decorators and bind the listener.
    pub async fn build(config: CollectionsConfig) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;
        db.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let gateway = HttpGateway::new(&config.gateway)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("gateway client: {}", e)))?;
        let notifier = HttpNotifier::new(&config.notification)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("notification client: {}", e)))?;
        let contract_service = HttpContractService::new(&config.contracts)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("contract client: {}", e)))?;

        let ctx = EngineContext {
            store: Arc::new(db),
            gateway: Arc::new(RetryingGateway::new(gateway, config.retry.clone())),
            notifier: Arc::new(RetryingNotifier::new(notifier, config.retry.clone())),
            contracts: Arc::new(contract_service),
            policy: config.policy.clone(),
            retry: config.retry.clone(),
        };
        let state = AppState::new(ctx, config.gateway.webhook_secret.clone());

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port, "Collections service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = build_router(self.state);

        tracing::info!(
            service = "collections-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
