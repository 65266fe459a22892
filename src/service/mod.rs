//! Notification use case.
//!
//! Validates the request, resolves the job owner, composes the message and
//! hands it to the mail sender. Each step's failure is returned unchanged;
//! nothing here retries.

use std::sync::Arc;

use crate::compose::MessageComposer;
use crate::delivery::MailSender;
use crate::errors::{NotifierError, NotifierResult};
use crate::identity::IdentityResolver;
use crate::types::{NotificationRequest, NotifyAck};

/// Orchestrates one notification.
#[derive(Debug, Clone)]
pub struct NotificationService {
    identities: Arc<dyn IdentityResolver>,
    composer: Arc<dyn MessageComposer>,
    sender: Arc<dyn MailSender>,
}

impl NotificationService {
    /// Wires the service to its collaborators.
    pub fn new(
        identities: Arc<dyn IdentityResolver>,
        composer: Arc<dyn MessageComposer>,
        sender: Arc<dyn MailSender>,
    ) -> Self {
        Self {
            identities,
            composer,
            sender,
        }
    }

    /// Sends the notification for one finished job.
    pub async fn execute(&self, request: NotificationRequest) -> NotifierResult<NotifyAck> {
        request.validate().map_err(NotifierError::Validation)?;

        let identity = self.identities.resolve(request.user_id).await?;
        tracing::debug!(job_id = %request.job_id, user_id = request.user_id, "Identity resolved");

        let message = self.composer.compose(&request, &identity);
        let report = self.sender.send(&message).await?;

        tracing::info!(
            job_id = %request.job_id,
            status = ?request.status,
            message_id = %report.message_id,
            attempts = report.attempts,
            "Notification sent"
        );
        Ok(NotifyAck::ok())
    }
}
