//! Error types for the notifier.
//!
//! Transport failures carry an explicit [`SmtpErrorKind`] tag. The delivery
//! executor decides between reconnect-and-retry and abort by matching on that
//! tag, never on the error's origin.

use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::IdentityError;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Result type for notifier operations.
pub type NotifierResult<T> = Result<T, NotifierError>;

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Transient: the session itself is suspect
    /// Peer closed the connection or the socket broke.
    Disconnected,
    /// TCP connect failed or the greeting was not a 220.
    ConnectFailed,
    /// EHLO and HELO were both refused.
    HandshakeFailed,
    /// DATA was refused or the message body was not accepted.
    DataRejected,
    /// Every envelope recipient was refused.
    RecipientsRejected,
    /// A socket operation exceeded its timeout.
    Timeout,

    // Fatal
    /// TLS could not be configured or negotiated.
    TlsFailed,
    /// STARTTLS is required but the server does not offer it.
    StarttlsNotSupported,
    /// Server rejected the credentials.
    AuthenticationFailed,
    /// No mutually supported authentication mechanism.
    AuthMethodNotSupported,
    /// MAIL FROM was refused.
    SenderRejected,
    /// Unparseable or unexpected server response.
    InvalidResponse,
    /// Malformed email address.
    InvalidAddress,
    /// Header value cannot be encoded safely.
    InvalidHeader,
    /// Message exceeds the server's size limit.
    MessageTooLarge,
    /// Configuration is invalid.
    ConfigurationInvalid,
    /// Unknown or internal error.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns true for connection-level faults that warrant reconnect-and-retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::Disconnected
                | SmtpErrorKind::ConnectFailed
                | SmtpErrorKind::HandshakeFailed
                | SmtpErrorKind::DataRejected
                | SmtpErrorKind::RecipientsRejected
                | SmtpErrorKind::Timeout
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::Disconnected => write!(f, "Server disconnected"),
            SmtpErrorKind::ConnectFailed => write!(f, "Connect failed"),
            SmtpErrorKind::HandshakeFailed => write!(f, "Handshake failed"),
            SmtpErrorKind::DataRejected => write!(f, "Message data rejected"),
            SmtpErrorKind::RecipientsRejected => write!(f, "All recipients rejected"),
            SmtpErrorKind::Timeout => write!(f, "Timed out"),
            SmtpErrorKind::TlsFailed => write!(f, "TLS failure"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::AuthenticationFailed => write!(f, "Authentication failed"),
            SmtpErrorKind::AuthMethodNotSupported => write!(f, "Auth method not supported"),
            SmtpErrorKind::SenderRejected => write!(f, "Sender rejected"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::InvalidAddress => write!(f, "Invalid address"),
            SmtpErrorKind::InvalidHeader => write!(f, "Invalid header"),
            SmtpErrorKind::MessageTooLarge => write!(f, "Message too large"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Enhanced SMTP status code (RFC 2034).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Parses an enhanced status code from a string (e.g., "5.1.1").
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let code = Self {
            class: parts.next()?.parse().ok()?,
            subject: parts.next()?.parse().ok()?,
            detail: parts.next()?.parse().ok()?,
        };
        if parts.next().is_some() || !(2..=5).contains(&code.class) {
            return None;
        }
        Some(code)
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if the delivery executor should reconnect and retry.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    // Convenience constructors

    /// Creates a disconnect error.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Disconnected, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Timeout, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::AuthenticationFailed, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates an error for a negative reply, tagged with the stage's kind.
    ///
    /// A 421 reply means the server is closing the channel, so it is always
    /// reported as [`SmtpErrorKind::Disconnected`] regardless of the stage.
    pub fn from_smtp_response(stage: SmtpErrorKind, code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::Disconnected,
            530 | 534 | 535 | 538 => SmtpErrorKind::AuthenticationFailed,
            552 if stage == SmtpErrorKind::SenderRejected => SmtpErrorKind::MessageTooLarge,
            _ => stage,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

impl std::error::Error for SmtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Top-level error surfaced by the notification service.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// The inbound request is malformed.
    #[error("invalid notification request: {0}")]
    Validation(String),

    /// The user's identity could not be resolved.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// The SMTP session could not be established.
    #[error("failed to establish SMTP session: {0}")]
    Connection(#[source] SmtpError),

    /// Delivery failed fatally or ran out of attempts.
    #[error("failed to send email to {recipient} after {attempts} attempt(s): {source}")]
    Delivery {
        /// Recipient address.
        recipient: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// Last underlying failure.
        #[source]
        source: SmtpError,
    },

    /// Settings are missing or invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NotifierError {
    /// Returns true if the caller supplied bad input rather than the system failing.
    pub fn is_client_error(&self) -> bool {
        match self {
            NotifierError::Validation(_) => true,
            NotifierError::Identity(e) => e.is_client_error(),
            _ => false,
        }
    }
}
