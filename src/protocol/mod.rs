//! SMTP command and reply model (RFC 5321).
//!
//! Only the subset the notifier drives is modelled: greeting, STARTTLS,
//! AUTH, a single-recipient mail transaction, NOOP probes and QUIT.

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpErrorKind, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// SASL mechanism name.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, already in `<addr>` form.
        address: String,
        /// SIZE parameter, sent only when the server advertises SIZE.
        size: Option<usize>,
    },
    /// RCPT TO command.
    RcptTo(String),
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// Liveness probe.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command for sending, without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom { address, size: Some(size) } => {
                format!("MAIL FROM:{} SIZE={}", address, size)
            }
            SmtpCommand::MailFrom { address, size: None } => format!("MAIL FROM:{}", address),
            SmtpCommand::RcptTo(address) => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns the verb for logging; never includes credentials.
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::Helo(_) => "HELO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth { .. } => "AUTH",
            SmtpCommand::MailFrom { .. } => "MAIL",
            SmtpCommand::RcptTo(_) => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Rset => "RSET",
            SmtpCommand::Noop => "NOOP",
            SmtpCommand::Quit => "QUIT",
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_smtp_string())
    }
}

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code (optional).
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply. A leading enhanced status code is split
    /// off the text, as [`SmtpResponse::parse`] does.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if let Some((esc, rest)) = Self::parse_enhanced_code(&message) {
            let rest = rest.trim().to_string();
            return Self {
                code,
                enhanced_code: Some(esc),
                message: vec![rest],
            };
        }
        Self {
            code,
            enhanced_code: None,
            message: vec![message],
        }
    }

    /// Parses a reply from raw lines (CRLF already stripped).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        let Some(first) = lines.first() else {
            return Err(SmtpError::protocol("Empty response"));
        };
        let code = Self::parse_code(first)?;

        let mut enhanced_code = None;
        let mut message = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            if Self::parse_code(line)? != code {
                return Err(SmtpError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = Self::parse_enhanced_code(text) {
                    enhanced_code = Some(esc);
                    message.push(rest.trim().to_string());
                    continue;
                }
            }
            message.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message,
        })
    }

    fn parse_code(line: &str) -> SmtpResult<u16> {
        line.get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|c| (200..600).contains(c))
            .ok_or_else(|| SmtpError::protocol(format!("Invalid status line: {:?}", line)))
    }

    fn parse_enhanced_code(text: &str) -> Option<(EnhancedStatusCode, &str)> {
        let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
        let code = EnhancedStatusCode::parse(head)?;
        Some((code, rest))
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts the reply into an error tagged with the failing stage.
    pub fn to_error(&self, stage: SmtpErrorKind) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(stage, self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }

    /// Returns `self` if the code matches, otherwise the stage-tagged error.
    pub fn expect_code(self, expected: u16, stage: SmtpErrorKind) -> SmtpResult<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(self.to_error(stage))
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// True when the server answered EHLO; false after a HELO fallback.
    pub esmtp: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the server's
    /// domain and is skipped.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self {
            esmtp: true,
            ..Self::default()
        };

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (capability, params) = line.split_once([' ', '=']).unwrap_or((line.as_str(), ""));

            match capability {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => caps.auth_mechanisms.extend(
                    params
                        .split_whitespace()
                        .filter_map(AuthMethod::from_capability),
                ),
                "STARTTLS" => caps.starttls = true,
                _ => {}
            }
        }

        caps
    }

    /// Capabilities of a server that only accepted HELO.
    pub fn helo_only() -> Self {
        Self::default()
    }

    /// Returns true if authentication is available.
    pub fn has_auth(&self) -> bool {
        !self.auth_mechanisms.is_empty()
    }
}

/// Reply codes the notifier checks.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Service closing.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Recipient not local, will forward.
    pub const USER_NOT_LOCAL_WILL_FORWARD: u16 = 251;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Service unavailable, closing channel.
    pub const SERVICE_UNAVAILABLE: u16 = 421;
}
