//! Core types for the notifier.
//!
//! This module provides:
//! - Address types with validation
//! - The inbound notification request and its acknowledgement
//! - The resolved identity and the composed outbound message
//! - Delivery report types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        if name.chars().any(|c| c.is_control()) {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidAddress,
                "Display name cannot contain control characters",
            ));
        }
        Ok(Self {
            name: Some(name).filter(|n| !n.is_empty()),
            email,
        })
    }

    /// Parses an address from a string (e.g., "John Doe <john@example.com>").
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    /// Validates an email address according to RFC 5321 limits.
    fn validate_email(email: &str) -> SmtpResult<()> {
        let invalid = |reason: &str| Err(SmtpError::new(SmtpErrorKind::InvalidAddress, reason));

        if email.is_empty() {
            return invalid("Email address cannot be empty");
        }

        if email.len() > 254 {
            return invalid("Email address too long (max 254 characters)");
        }

        // Anything that could break out of the envelope command or header.
        if email
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || matches!(c, '<' | '>' | ','))
        {
            return invalid("Email address contains forbidden characters");
        }

        let Some((local, domain)) = email.split_once('@') else {
            return invalid("Email address must contain exactly one @");
        };
        if domain.contains('@') {
            return invalid("Email address must contain exactly one @");
        }

        if local.is_empty() || local.len() > 64 {
            return invalid("Local part must be 1-64 characters");
        }

        if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
            return invalid("Domain is malformed");
        }

        Ok(())
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => write!(f, "{}", self.email),
        }
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

/// Outcome of the video-processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// The video was processed.
    Success,
    /// Processing failed.
    Error,
}

/// Inbound notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Job identifier, shown in the subject.
    pub job_id: String,
    /// Job outcome.
    pub status: JobStatus,
    /// Owner of the job in the identity service.
    pub user_id: i64,
    /// Link to the processed video.
    #[serde(default)]
    pub video_url: Option<String>,
    /// Failure detail for the user.
    #[serde(default)]
    pub error_message: Option<String>,
}

impl NotificationRequest {
    /// Checks fields the JSON schema alone cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.job_id.trim().is_empty() {
            return Err("job_id must not be empty".to_string());
        }
        if self.job_id.chars().any(|c| c.is_control()) {
            return Err("job_id must not contain control characters".to_string());
        }
        Ok(())
    }
}

/// Acknowledgement returned for a delivered notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyAck {
    /// Always true on success.
    pub ok: bool,
}

impl NotifyAck {
    /// Successful acknowledgement.
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

/// User identity resolved from the identity service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Recipient address.
    pub email: String,
    /// Greeting name.
    pub name: String,
}

/// Fully composed message, consumed once by the delivery executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Recipient address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub text_body: String,
    /// HTML body.
    pub html_body: String,
}

/// SMTP envelope for one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Reverse path.
    pub from: Address,
    /// Forward path.
    pub to: Address,
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Message-ID header value that was sent.
    pub message_id: String,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Identifier of the session that carried the message.
    pub session_id: u64,
    /// Final reply text from the relay.
    pub response: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("test@example.com").unwrap();
        assert_eq!(addr.email, "test@example.com");
        assert!(addr.name.is_none());

        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.to_string(), "John Doe <john@example.com>");

        let addr = Address::parse("\"John, Doe\" <john@example.com>").unwrap();
        assert_eq!(addr.name, Some("John, Doe".to_string()));

        let addr = Address::parse("<bare@example.com>").unwrap();
        assert!(addr.name.is_none());
        assert_eq!(addr.to_smtp(), "<bare@example.com>");
    }

    #[test]
    fn test_address_validation() {
        assert!(Address::new("test@example.com").is_ok());
        assert!(Address::new("test.name+tag@sub.example.com").is_ok());

        assert!(Address::new("").is_err());
        assert!(Address::new("no-at-sign").is_err());
        assert!(Address::new("two@@signs.com").is_err());
        assert!(Address::new("@no-local.com").is_err());
        assert!(Address::new("no-domain@").is_err());
        assert!(Address::new("a@example.com\r\nRCPT TO:<x@y>").is_err());
        assert!(Address::new("a b@example.com").is_err());

        let err = Address::new("nope").unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidAddress);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_request_deserialize() {
        let json = r#"{"job_id":"42","status":"success","user_id":7,"video_url":"https://x/v.mp4"}"#;
        let req: NotificationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.job_id, "42");
        assert_eq!(req.status, JobStatus::Success);
        assert_eq!(req.user_id, 7);
        assert_eq!(req.video_url.as_deref(), Some("https://x/v.mp4"));
        assert!(req.error_message.is_none());
        assert!(req.validate().is_ok());

        let bad = r#"{"job_id":"42","status":"done","user_id":7}"#;
        assert!(serde_json::from_str::<NotificationRequest>(bad).is_err());
    }

    #[test]
    fn test_request_validate() {
        let req = NotificationRequest {
            job_id: "  ".to_string(),
            status: JobStatus::Error,
            user_id: 1,
            video_url: None,
            error_message: None,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_ack_serializes() {
        assert_eq!(serde_json::to_string(&NotifyAck::ok()).unwrap(), r#"{"ok":true}"#);
    }
}
