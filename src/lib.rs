//! # Video Notifier
//!
//! Email notifications for finished video-processing jobs:
//! - `POST /notify` endpoint that resolves the job owner and composes the email
//! - A single SMTP session reused across requests, probed with `NOOP` before
//!   each use and replaced when it has gone stale
//! - Delivery with bounded exponential backoff that retries transport
//!   failures and gives up immediately on permanent ones
//! - STARTTLS or implicit TLS, PLAIN/LOGIN/CRAM-MD5 authentication
//! - Multipart (text + HTML) MIME rendering
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use video_notifier::{
//!     ConnectionManager, DefaultComposer, DeliveryExecutor, DeliveryMetrics,
//!     HttpIdentityResolver, NotificationRequest, NotificationService, NotifierConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NotifierConfig::from_env()?;
//!     let metrics = Arc::new(DeliveryMetrics::new());
//!
//!     let smtp = Arc::new(config.smtp.clone());
//!     let connections = Arc::new(ConnectionManager::from_config(smtp.clone(), metrics.clone())?);
//!     let executor = DeliveryExecutor::from_config(&smtp, connections.clone(), metrics)?;
//!
//!     let service = NotificationService::new(
//!         Arc::new(HttpIdentityResolver::new(&config.identity)?),
//!         Arc::new(DefaultComposer),
//!         Arc::new(executor),
//!     );
//!
//!     let request: NotificationRequest = serde_json::from_str(
//!         r#"{"job_id":"42","status":"success","user_id":7,"video_url":"https://cdn/v.mp4"}"#,
//!     )?;
//!     service.execute(request).await?;
//!     connections.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod transport;

// Authentication
pub mod auth;

// MIME encoding
pub mod mime;

// Sessions and connection management
pub mod connection;
pub mod session;

// Delivery
pub mod delivery;
pub mod resilience;

// Notification use case
pub mod compose;
pub mod identity;
pub mod service;

// HTTP endpoint
pub mod server;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use compose::{DefaultComposer, MessageComposer};
pub use config::{
    ConfigError, IdentityConfig, NotifierConfig, RetryConfig, ServerConfig, SmtpConfig,
    SmtpConfigBuilder, TlsConfig, TlsMode,
};
pub use connection::{ConnectionManager, SessionConnector, SessionLease, TcpConnector};
pub use delivery::{DeliveryExecutor, MailSender};
pub use errors::{NotifierError, NotifierResult, SmtpError, SmtpErrorKind, SmtpResult};
pub use identity::{HttpIdentityResolver, IdentityError, IdentityResolver};
pub use self::mime::{MimeEncoder, RenderedMessage};
pub use observability::{DeliveryMetrics, LogFormat, LoggingConfig, MetricsSnapshot};
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use resilience::{RetryPolicy, Sleeper, TokioSleeper};
pub use server::{NotifierServer, ServerError};
pub use service::NotificationService;
pub use session::{MailSession, SmtpSession};
pub use transport::{SmtpTransport, TcpTransport, TlsContext};
pub use types::{
    Address, Envelope, Identity, JobStatus, NotificationRequest, NotifyAck, OutboundMessage,
    SendReport,
};
