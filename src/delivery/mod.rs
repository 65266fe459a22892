//! Delivery with retry.
//!
//! [`DeliveryExecutor`] renders a message once, then drives the
//! [`ConnectionManager`] through a bounded retry loop. Transient failures
//! invalidate the session and back off; anything else ends the loop at once.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

use crate::config::SmtpConfig;
use crate::connection::ConnectionManager;
use crate::errors::{NotifierError, NotifierResult, SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::{MimeEncoder, RenderedMessage};
use crate::observability::DeliveryMetrics;
use crate::resilience::{RetryPolicy, Sleeper, TokioSleeper};
use crate::types::{Address, OutboundMessage, SendReport};

/// Something that can deliver a composed message.
#[async_trait]
pub trait MailSender: Send + Sync + fmt::Debug {
    /// Delivers the message or returns the terminal failure.
    async fn send(&self, message: &OutboundMessage) -> NotifierResult<SendReport>;
}

/// Retrying delivery over the shared SMTP session.
#[derive(Debug)]
pub struct DeliveryExecutor {
    connections: Arc<ConnectionManager>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    encoder: MimeEncoder,
    sender: Address,
    max_message_size: Option<usize>,
    metrics: Arc<DeliveryMetrics>,
}

/// How one attempt ended when it did not end the loop.
enum AttemptOutcome {
    Delivered(SendReport),
    Transient(SmtpError),
}

impl DeliveryExecutor {
    /// Creates an executor that sleeps on the tokio timer.
    pub fn new(
        connections: Arc<ConnectionManager>,
        policy: RetryPolicy,
        sender: Address,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            connections,
            policy,
            sleeper: Arc::new(TokioSleeper),
            encoder: MimeEncoder::for_sender(&sender),
            sender,
            max_message_size: None,
            metrics,
        }
    }

    /// Creates an executor for the configured sender and retry settings.
    pub fn from_config(
        config: &SmtpConfig,
        connections: Arc<ConnectionManager>,
        metrics: Arc<DeliveryMetrics>,
    ) -> SmtpResult<Self> {
        let sender = config.sender_address()?;
        Ok(Self::new(
            connections,
            RetryPolicy::from(&config.retry),
            sender,
            metrics,
        )
        .with_max_message_size(config.max_message_size))
    }

    /// Refuses rendered messages larger than `limit` bytes without contacting
    /// the relay. Zero disables the check.
    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = Some(limit).filter(|l| *l > 0);
        self
    }

    /// Replaces the sleeper used between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The connection manager this executor drives.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Delivers one message.
    ///
    /// # Errors
    ///
    /// - [`NotifierError::Delivery`] when rendering fails (zero attempts), when
    ///   a send fails fatally, or when every attempt failed transiently. It
    ///   carries the last underlying error.
    /// - [`NotifierError::Connection`] when a session cannot be established for
    ///   a non-transient reason, such as rejected credentials.
    pub async fn send(&self, message: &OutboundMessage) -> NotifierResult<SendReport> {
        let rendered = match self.render(message) {
            Ok(rendered) => rendered,
            Err(source) => {
                self.metrics.record_send_failure();
                tracing::warn!(error = %source, "Message could not be rendered");
                return Err(NotifierError::Delivery {
                    recipient: message.recipient.clone(),
                    attempts: 0,
                    source,
                });
            }
        };

        let span = tracing::info_span!(
            "deliver",
            message_id = %rendered.message_id,
            recipient = %message.recipient,
        );
        self.deliver(&rendered, &message.recipient)
            .instrument(span)
            .await
    }

    fn render(&self, message: &OutboundMessage) -> SmtpResult<RenderedMessage> {
        let rendered = self.encoder.encode(&self.sender, message)?;
        match self.max_message_size {
            Some(limit) if rendered.data.len() > limit => Err(SmtpError::new(
                SmtpErrorKind::MessageTooLarge,
                format!("Message is {} bytes, limit is {}", rendered.data.len(), limit),
            )),
            _ => Ok(rendered),
        }
    }

    async fn deliver(&self, rendered: &RenderedMessage, recipient: &str) -> NotifierResult<SendReport> {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let last_error = match self.attempt(rendered, recipient, attempt).await? {
                AttemptOutcome::Delivered(report) => {
                    self.metrics.record_send_success();
                    tracing::info!(attempt, session_id = report.session_id, "Email delivered");
                    return Ok(report);
                }
                AttemptOutcome::Transient(error) => error,
            };

            if !self.policy.has_next(attempt) {
                self.metrics.record_send_failure();
                tracing::error!(attempts = attempt, error = %last_error, "Giving up on delivery");
                return Err(NotifierError::Delivery {
                    recipient: recipient.to_string(),
                    attempts: attempt,
                    source: last_error,
                });
            }

            let delay = self.policy.backoff_for(attempt);
            self.metrics.record_retry();
            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "Transient delivery failure, retrying"
            );
            self.sleeper.sleep(delay).await;
        }
    }

    /// One acquire-and-transmit. The lease is released before returning, so
    /// the backoff sleep never holds the session.
    async fn attempt(
        &self,
        rendered: &RenderedMessage,
        recipient: &str,
        attempt: u32,
    ) -> NotifierResult<AttemptOutcome> {
        let mut lease = match self.connections.acquire().await {
            Ok(lease) => lease,
            Err(error) if error.is_transient() => return Ok(AttemptOutcome::Transient(error)),
            Err(error) => {
                self.metrics.record_send_failure();
                tracing::error!(error = %error, "Cannot establish SMTP session");
                return Err(NotifierError::Connection(error));
            }
        };

        let session_id = lease.session_id();
        match lease.send_mail(rendered).await {
            Ok(reply) => Ok(AttemptOutcome::Delivered(SendReport {
                message_id: rendered.message_id.clone(),
                attempts: attempt,
                session_id,
                response: reply.full_message(),
            })),
            Err(error) if error.is_transient() => {
                lease.invalidate().await;
                Ok(AttemptOutcome::Transient(error))
            }
            Err(error) => {
                self.metrics.record_send_failure();
                tracing::error!(attempt, session_id, error = %error, "Delivery failed permanently");
                Err(NotifierError::Delivery {
                    recipient: recipient.to_string(),
                    attempts: attempt,
                    source: error,
                })
            }
        }
    }
}

#[async_trait]
impl MailSender for DeliveryExecutor {
    async fn send(&self, message: &OutboundMessage) -> NotifierResult<SendReport> {
        DeliveryExecutor::send(self, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{outbound_message, FakeRelay, RecordingSleeper};
    use rstest::rstest;
    use std::time::Duration;

    struct Harness {
        relay: FakeRelay,
        sleeper: Arc<RecordingSleeper>,
        metrics: Arc<DeliveryMetrics>,
        executor: DeliveryExecutor,
    }

    fn harness(max_attempts: u32) -> Harness {
        let relay = FakeRelay::new();
        let sleeper = Arc::new(RecordingSleeper::new());
        let metrics = Arc::new(DeliveryMetrics::new());
        let connections = Arc::new(ConnectionManager::new(Arc::new(relay.clone()), metrics.clone()));
        let executor = DeliveryExecutor::new(
            connections,
            RetryPolicy::new(max_attempts, Duration::from_secs(1), 8),
            Address::new("videos@example.com").unwrap(),
            metrics.clone(),
        )
        .with_sleeper(sleeper.clone());

        Harness {
            relay,
            sleeper,
            metrics,
            executor,
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let h = harness(3);

        let report = h.executor.send(&outbound_message()).await.unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.session_id, 1);
        assert!(report.response.contains("queued"));
        assert_eq!(h.relay.sends(), 1);
        assert!(h.sleeper.sleeps().is_empty());
        assert_eq!(h.executor.connections().current_session_id().await, Some(1));
        assert_eq!(h.metrics.snapshot().emails_sent, 1);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(5)]
    #[tokio::test]
    async fn test_all_transient_failures_exhaust_attempts(#[case] max_attempts: u32) {
        let h = harness(max_attempts);
        for _ in 0..max_attempts {
            h.relay.fail_send(SmtpError::disconnected("Connection unexpectedly closed"));
        }

        let err = h.executor.send(&outbound_message()).await.unwrap_err();

        match err {
            NotifierError::Delivery { attempts, source, .. } => {
                assert_eq!(attempts, max_attempts);
                assert_eq!(source.kind(), SmtpErrorKind::Disconnected);
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
        assert_eq!(h.relay.sends(), max_attempts as usize);

        let expected: Vec<Duration> = (1..max_attempts)
            .map(|k| Duration::from_secs(2u64.pow(k).min(8)))
            .collect();
        assert_eq!(h.sleeper.sleeps(), expected);

        let snapshot = h.metrics.snapshot();
        assert_eq!(snapshot.invalidations, u64::from(max_attempts));
        assert_eq!(snapshot.connection_attempts, u64::from(max_attempts));
        assert_eq!(snapshot.retries, u64::from(max_attempts - 1));
        assert_eq!(snapshot.emails_failed, 1);
        assert_eq!(h.executor.connections().current_session_id().await, None);
    }

    #[tokio::test]
    async fn test_fatal_failure_aborts_and_keeps_session() {
        let h = harness(3);
        h.relay.fail_send(SmtpError::new(SmtpErrorKind::SenderRejected, "Sender not allowed").with_smtp_code(550));

        let err = h.executor.send(&outbound_message()).await.unwrap_err();

        match err {
            NotifierError::Delivery { attempts, source, recipient } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.kind(), SmtpErrorKind::SenderRejected);
                assert_eq!(recipient, "ana@example.com");
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
        assert_eq!(h.relay.sends(), 1);
        assert!(h.sleeper.sleeps().is_empty());
        assert_eq!(h.executor.connections().current_session_id().await, Some(1));
        assert!(!h.relay.events().iter().any(|e| e.starts_with("close")));
    }

    #[tokio::test]
    async fn test_two_disconnects_then_success_uses_new_session() {
        let h = harness(3);
        h.relay
            .fail_send(SmtpError::disconnected("Connection unexpectedly closed"))
            .fail_send(SmtpError::disconnected("Connection unexpectedly closed"));

        let report = h.executor.send(&outbound_message()).await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.session_id, 3);
        assert_eq!(
            h.relay.events(),
            vec![
                "connect #1", "send #1", "close #1",
                "connect #2", "send #2", "close #2",
                "connect #3", "send #3",
            ]
        );
        assert_eq!(h.sleeper.sleeps(), vec![Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test]
    async fn test_transient_connect_failure_consumes_attempt() {
        let h = harness(3);
        h.relay.fail_connect(SmtpError::new(SmtpErrorKind::ConnectFailed, "Connection refused"));

        let report = h.executor.send(&outbound_message()).await.unwrap();

        assert_eq!(report.attempts, 2);
        assert_eq!(h.sleeper.sleeps(), vec![Duration::from_secs(2)]);
        assert_eq!(h.metrics.snapshot().connections_failed, 1);
    }

    #[tokio::test]
    async fn test_fatal_connect_failure_is_connection_error() {
        let h = harness(3);
        h.relay.fail_connect(SmtpError::authentication("Authentication credentials invalid").with_smtp_code(535));

        let err = h.executor.send(&outbound_message()).await.unwrap_err();

        assert!(matches!(err, NotifierError::Connection(ref e) if e.kind() == SmtpErrorKind::AuthenticationFailed));
        assert_eq!(h.relay.sends(), 0);
        assert!(h.sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_unrenderable_message_makes_no_attempt() {
        let h = harness(3);
        let mut message = outbound_message();
        message.recipient = "not an address".to_string();

        let err = h.executor.send(&message).await.unwrap_err();

        assert!(matches!(err, NotifierError::Delivery { attempts: 0, .. }));
        assert!(h.relay.events().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_makes_no_attempt() {
        let h = harness(3);
        let executor = h.executor.with_max_message_size(64);

        let err = executor.send(&outbound_message()).await.unwrap_err();

        match err {
            NotifierError::Delivery { attempts, source, .. } => {
                assert_eq!(attempts, 0);
                assert_eq!(source.kind(), SmtpErrorKind::MessageTooLarge);
            }
            other => panic!("expected delivery error, got {other:?}"),
        }
        assert!(h.relay.events().is_empty());
    }
}
