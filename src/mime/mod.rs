//! MIME rendering for outbound messages.
//!
//! Produces RFC 5322 messages with:
//! - RFC 2047 encoded-word headers for non-ASCII text
//! - A `multipart/alternative` body with quoted-printable text and HTML parts
//! - `Date`, `Message-ID` and `MIME-Version` headers
//!
//! [`MimeEncoder::prepare_data_content`] then applies the DATA-phase
//! transparency rules (dot-stuffing and the terminating `.` line).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::types::{Address, Envelope, OutboundMessage};

/// Longest unencoded chunk per encoded-word, keeping each word under 75 chars.
const ENCODED_WORD_CHUNK: usize = 45;

/// Soft limit for header line length before folding.
const HEADER_LINE_LIMIT: usize = 78;

/// A rendered message ready for the DATA phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    /// Message-ID without angle brackets.
    pub message_id: String,
    /// Envelope the message is addressed with.
    pub envelope: Envelope,
    /// RFC 5322 bytes, CRLF line endings, not yet dot-stuffed.
    pub data: Vec<u8>,
}

/// MIME encoder for outbound messages.
#[derive(Debug, Clone)]
pub struct MimeEncoder {
    /// Domain for message IDs.
    domain: String,
}

impl MimeEncoder {
    /// Creates a new encoder. `domain` is the right-hand side of Message-IDs.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// Creates an encoder whose Message-ID domain is the sender's domain.
    pub fn for_sender(sender: &Address) -> Self {
        let domain = sender
            .email
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        Self::new(domain)
    }

    /// Renders `message` from `sender`, dated now.
    pub fn encode(&self, sender: &Address, message: &OutboundMessage) -> SmtpResult<RenderedMessage> {
        self.encode_at(sender, message, Utc::now())
    }

    /// Renders `message` from `sender` with a fixed date.
    pub fn encode_at(
        &self,
        sender: &Address,
        message: &OutboundMessage,
        date: DateTime<Utc>,
    ) -> SmtpResult<RenderedMessage> {
        let recipient = Address::parse(&message.recipient)?;
        let message_id = self.generate_message_id(&date);
        let boundary = Self::generate_boundary();

        let mut output = Vec::with_capacity(
            message.text_body.len() + message.html_body.len() + 1024,
        );

        self.write_header(&mut output, "Date", &Self::format_date(&date))?;
        self.write_header(&mut output, "From", &Self::format_address(sender))?;
        self.write_header(&mut output, "To", &Self::format_address(&recipient))?;
        self.write_header(&mut output, "Subject", &Self::encode_header(&message.subject)?)?;
        self.write_header(&mut output, "Message-ID", &format!("<{}>", message_id))?;
        self.write_header(&mut output, "MIME-Version", "1.0")?;
        self.write_header(
            &mut output,
            "Content-Type",
            &format!("multipart/alternative; boundary=\"{}\"", boundary),
        )?;
        output.extend_from_slice(b"\r\n");

        self.write_part(&mut output, &boundary, &::mime::TEXT_PLAIN_UTF_8, &message.text_body)?;
        self.write_part(&mut output, &boundary, &::mime::TEXT_HTML_UTF_8, &message.html_body)?;
        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        Ok(RenderedMessage {
            message_id,
            envelope: Envelope {
                from: sender.clone(),
                to: recipient,
            },
            data: output,
        })
    }

    fn write_part(
        &self,
        output: &mut Vec<u8>,
        boundary: &str,
        content_type: &::mime::Mime,
        body: &str,
    ) -> SmtpResult<()> {
        output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        self.write_header(output, "Content-Type", content_type.as_ref())?;
        self.write_header(output, "Content-Transfer-Encoding", "quoted-printable")?;
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&Self::encode_quoted_printable(body));
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Writes a header line, folding long values at whitespace.
    fn write_header(&self, output: &mut Vec<u8>, name: &str, value: &str) -> SmtpResult<()> {
        if name.is_empty() || name.chars().any(|c| c.is_control() || c == ':' || c == ' ') {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidHeader,
                format!("Invalid header name: {:?}", name),
            ));
        }
        // Only pre-folded continuation lines may carry a line break.
        if value.replace("\r\n ", "").contains(['\r', '\n']) {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidHeader,
                format!("Header {} contains a line break", name),
            ));
        }

        let header = format!("{}: {}", name, value);
        output.extend_from_slice(Self::fold_header(&header).as_bytes());
        output.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Folds a header line at whitespace once it passes 78 characters.
    fn fold_header(header: &str) -> String {
        if header.len() <= HEADER_LINE_LIMIT || header.contains("\r\n") {
            return header.to_string();
        }

        let mut result = String::with_capacity(header.len() + 8);
        let mut current_line = String::new();

        for word in header.split(' ') {
            if current_line.is_empty() {
                current_line.push_str(word);
            } else if current_line.len() + 1 + word.len() <= HEADER_LINE_LIMIT - 2 {
                current_line.push(' ');
                current_line.push_str(word);
            } else {
                result.push_str(&current_line);
                result.push_str("\r\n ");
                current_line = word.to_string();
            }
        }

        result.push_str(&current_line);
        result
    }

    /// Encodes unstructured header text as RFC 2047 encoded-words when needed.
    ///
    /// Long values are split on character boundaries into several words joined
    /// by folding whitespace.
    pub fn encode_header(value: &str) -> SmtpResult<String> {
        if value.contains(['\r', '\n']) {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidHeader,
                "Header value contains a line break",
            ));
        }

        if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
            return Ok(value.to_string());
        }

        let mut words = Vec::new();
        let mut chunk = String::new();
        for c in value.chars() {
            if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
                words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
                chunk.clear();
            }
            chunk.push(c);
        }
        if !chunk.is_empty() {
            words.push(format!("=?UTF-8?B?{}?=", BASE64.encode(chunk.as_bytes())));
        }

        Ok(words.join("\r\n "))
    }

    fn format_address(address: &Address) -> String {
        match address.name() {
            Some(name) if name.is_ascii() => {
                if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') {
                    format!("\"{}\" <{}>", name.replace('"', "\\\""), address.email)
                } else {
                    format!("{} <{}>", name, address.email)
                }
            }
            Some(name) => {
                let encoded = Self::encode_header(name).unwrap_or_default();
                format!("{} <{}>", encoded, address.email)
            }
            None => address.email.clone(),
        }
    }

    /// Encodes a body as quoted-printable after normalizing line endings to CRLF.
    fn encode_quoted_printable(text: &str) -> Vec<u8> {
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n").replace('\n', "\r\n");
        quoted_printable::encode(normalized.as_bytes())
    }

    /// Generates a unique message ID.
    fn generate_message_id(&self, date: &DateTime<Utc>) -> String {
        format!("{}.{}@{}", Uuid::new_v4().simple(), date.timestamp(), self.domain)
    }

    /// Generates a unique boundary.
    fn generate_boundary() -> String {
        format!("----=_Part_{}", Uuid::new_v4().simple())
    }

    /// Formats the date for the Date header.
    fn format_date(date: &DateTime<Utc>) -> String {
        date.format("%a, %d %b %Y %H:%M:%S %z").to_string()
    }

    /// Prepares the DATA content with dot-stuffing and the final `.` line.
    pub fn prepare_data_content(encoded_email: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(encoded_email.len() + 100);
        let mut at_line_start = true;

        for &byte in encoded_email {
            if at_line_start && byte == b'.' {
                output.push(b'.');
            }

            output.push(byte);
            at_line_start = byte == b'\n';
        }

        if !output.ends_with(b"\r\n") {
            if output.ends_with(b"\n") {
                output.pop();
            }
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(b".\r\n");
        output
    }
}

impl Default for MimeEncoder {
    fn default() -> Self {
        Self::new("localhost")
    }
}
