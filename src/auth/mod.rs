//! SASL authentication for the relay session.
//!
//! Supports:
//! - PLAIN (RFC 4616)
//! - LOGIN (obsolete but widely used)
//! - CRAM-MD5 (RFC 2195)

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::Md5;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods supported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// CRAM-MD5 challenge-response.
    CramMd5,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::CramMd5 => "CRAM-MD5",
        }
    }

    /// Returns the priority for auto-selection (higher is better).
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::CramMd5 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses from an EHLO `AUTH` parameter.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "CRAM-MD5" => Some(AuthMethod::CramMd5),
            _ => None,
        }
    }

    /// Returns true if this method sends the password recoverably.
    pub fn exposes_password(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mechanism_name())
    }
}

/// Relay username and password.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Creates credentials from plain strings.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(username, SecretString::new(password.into()))
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the protected password.
    pub fn password(&self) -> &SecretString {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// SASL response builders.
pub struct Authenticator;

impl Authenticator {
    /// Generates the initial response for PLAIN authentication.
    pub fn plain_initial_response(credentials: &Credentials) -> String {
        // \0username\0password
        let response = format!(
            "\0{}\0{}",
            credentials.username,
            credentials.password.expose_secret()
        );
        BASE64.encode(response)
    }

    /// Generates LOGIN username response.
    pub fn login_username(credentials: &Credentials) -> String {
        BASE64.encode(&credentials.username)
    }

    /// Generates LOGIN password response.
    pub fn login_password(credentials: &Credentials) -> String {
        BASE64.encode(credentials.password.expose_secret())
    }

    /// Generates the CRAM-MD5 response to a base64 challenge.
    pub fn cram_md5_response(challenge: &str, credentials: &Credentials) -> SmtpResult<String> {
        let challenge_bytes = BASE64.decode(challenge.trim()).map_err(|e| {
            SmtpError::authentication(format!("Invalid CRAM-MD5 challenge: {}", e))
        })?;

        type HmacMd5 = Hmac<Md5>;
        let mut mac = HmacMd5::new_from_slice(credentials.password.expose_secret().as_bytes())
            .map_err(|e| SmtpError::authentication(format!("HMAC error: {}", e)))?;
        mac.update(&challenge_bytes);
        let digest = mac.finalize().into_bytes();

        let hex_digest: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Ok(BASE64.encode(format!("{} {}", credentials.username, hex_digest)))
    }

    /// Picks the strongest advertised mechanism.
    pub fn select_best_method(available: &HashSet<AuthMethod>) -> SmtpResult<AuthMethod> {
        available
            .iter()
            .max_by_key(|m| m.priority())
            .copied()
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_from_capability() {
        assert_eq!(AuthMethod::from_capability("PLAIN"), Some(AuthMethod::Plain));
        assert_eq!(AuthMethod::from_capability("login"), Some(AuthMethod::Login));
        assert_eq!(AuthMethod::from_capability("CRAM-MD5"), Some(AuthMethod::CramMd5));
        assert_eq!(AuthMethod::from_capability("XOAUTH2"), None);
    }

    #[test]
    fn test_plain_initial_response() {
        let creds = Credentials::plain("user", "password");
        let response = Authenticator::plain_initial_response(&creds);
        let decoded = BASE64.decode(&response).unwrap();
        assert_eq!(decoded, b"\0user\0password");
    }

    #[test]
    fn test_login_responses() {
        let creds = Credentials::plain("user@example.com", "hunter2");
        assert_eq!(Authenticator::login_username(&creds), "dXNlckBleGFtcGxlLmNvbQ==");
        assert_eq!(Authenticator::login_password(&creds), "aHVudGVyMg==");
    }

    #[test]
    fn test_cram_md5_rfc2195_vector() {
        let creds = Credentials::plain("tim", "tanstaaftanstaaf");
        let challenge = BASE64.encode("<1896.697170952@postoffice.reston.mci.net>");

        let response = Authenticator::cram_md5_response(&challenge, &creds).unwrap();
        let decoded = String::from_utf8(BASE64.decode(response).unwrap()).unwrap();
        assert_eq!(decoded, "tim b913a602c7eda7a495b4e6e7334d3890");
    }

    #[test]
    fn test_cram_md5_rejects_bad_challenge() {
        let creds = Credentials::plain("tim", "x");
        let err = Authenticator::cram_md5_response("!!not base64!!", &creds).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AuthenticationFailed);
    }

    #[test]
    fn test_select_best_method() {
        let all: HashSet<_> = [AuthMethod::Plain, AuthMethod::Login, AuthMethod::CramMd5]
            .into_iter()
            .collect();
        assert_eq!(Authenticator::select_best_method(&all).unwrap(), AuthMethod::CramMd5);

        let legacy: HashSet<_> = [AuthMethod::Login, AuthMethod::Plain].into_iter().collect();
        assert_eq!(Authenticator::select_best_method(&legacy).unwrap(), AuthMethod::Plain);

        let err = Authenticator::select_best_method(&HashSet::new()).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AuthMethodNotSupported);
    }

    #[test]
    fn test_credentials_debug() {
        let creds = Credentials::plain("user", "secret_password");
        let debug_str = format!("{:?}", creds);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("secret_password"));
    }
}
