//! Send a Notification Directly
//!
//! This example demonstrates how to:
//! - Load relay settings from the environment (or a `.env` file)
//! - Compose a job notification without the identity service
//! - Deliver it twice over the same reused SMTP session
//!
//! Usage: `cargo run --example send_notification -- someone@example.com [job-id]`

use std::sync::Arc;

use video_notifier::{
    ConnectionManager, DefaultComposer, DeliveryExecutor, DeliveryMetrics, Identity, JobStatus,
    MessageComposer, NotificationRequest, NotifierConfig, NotifierError,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let mut args = std::env::args().skip(1);
    let recipient = args.next().ok_or("usage: send_notification <recipient> [job-id]")?;
    let job_id = args.next().unwrap_or_else(|| "demo-1".to_string());

    let config = NotifierConfig::from_env()?;
    config.logging.init()?;

    let metrics = Arc::new(DeliveryMetrics::new());
    let smtp = Arc::new(config.smtp.clone());
    let connections = Arc::new(ConnectionManager::from_config(smtp.clone(), metrics.clone())?);
    let executor = DeliveryExecutor::from_config(&smtp, connections.clone(), metrics.clone())?;

    let identity = Identity {
        email: recipient,
        name: "cliente".to_string(),
    };

    println!("Relay: {}", smtp.address());
    for status in [JobStatus::Success, JobStatus::Error] {
        let request = NotificationRequest {
            job_id: job_id.clone(),
            status,
            user_id: 0,
            video_url: Some("https://example.com/videos/demo.mp4".to_string()),
            error_message: Some("codec não suportado".to_string()),
        };
        let message = DefaultComposer.compose(&request, &identity);

        println!("Sending {:?} notification to {}...", status, identity.email);
        match executor.send(&message).await {
            Ok(report) => {
                println!("Email sent successfully!");
                println!("  Message ID: {}", report.message_id);
                println!("  Attempts: {}", report.attempts);
                println!("  Session: #{}", report.session_id);
            }
            Err(NotifierError::Delivery { attempts, source, .. }) => {
                eprintln!("Delivery failed after {} attempt(s): {}", attempts, source);
            }
            Err(e) => return Err(e.into()),
        }
    }

    connections.close().await?;

    let snapshot = metrics.snapshot();
    println!(
        "Sessions opened: {}, retries: {}, bytes sent: {}",
        snapshot.connection_attempts - snapshot.connections_failed,
        snapshot.retries,
        snapshot.bytes_sent
    );
    Ok(())
}
