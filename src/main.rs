use std::sync::Arc;

use video_notifier::{
    ConnectionManager, DefaultComposer, DeliveryExecutor, DeliveryMetrics, HttpIdentityResolver,
    NotificationService, NotifierConfig, NotifierServer,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = NotifierConfig::from_env()?;
    config.logging.init()?;

    tracing::info!(
        relay = %config.smtp.address(),
        tls = ?config.smtp.tls.mode,
        max_attempts = config.smtp.retry.max_attempts,
        identity_service = %config.identity.base_url,
        "Starting video notifier"
    );

    let metrics = Arc::new(DeliveryMetrics::new());
    let smtp = Arc::new(config.smtp.clone());
    let connections = Arc::new(ConnectionManager::from_config(smtp.clone(), metrics.clone())?);
    let executor = DeliveryExecutor::from_config(&smtp, connections.clone(), metrics.clone())?;

    let service = NotificationService::new(
        Arc::new(HttpIdentityResolver::new(&config.identity)?),
        Arc::new(DefaultComposer),
        Arc::new(executor),
    );

    let server = NotifierServer::bind(&config.server, Arc::new(service)).await?;
    server.serve(shutdown_signal()).await?;

    if let Err(error) = connections.close().await {
        tracing::debug!(error = %error, "SMTP session did not close cleanly");
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sent = snapshot.emails_sent,
        failed = snapshot.emails_failed,
        retries = snapshot.retries,
        reconnects = snapshot.connection_attempts,
        "Video notifier stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "Cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
