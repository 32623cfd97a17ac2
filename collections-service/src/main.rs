use collections_service::config::CollectionsConfig;
use collections_service::startup::Application;
use service_core::observability::init_tracing;
use tokio::signal;

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = CollectionsConfig::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    // Secrets stay out of the log.
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.common.bind_address(),
        otlp_endpoint = ?config.otlp_endpoint,
        db_max_connections = config.database.max_connections,
        gateway_url = %config.gateway.base_url,
        notification_url = %config.notification.base_url,
        contracts_url = %config.contracts.base_url,
        sepa_notice_days = config.policy.sepa_advance_notice_days,
        bacs_notice_days = config.policy.bacs_advance_notice_days,
        dunning_cool_down_days = config.policy.dunning_cool_down_days,
        "Starting collections-service"
    );

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to build application");
        std::io::Error::other(format!("Application build error: {}", e))
    })?;

    app.run_until(shutdown_signal()).await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}
