//! Environment variable loading.
//!
//! | Variable | Default |
//! |---|---|
//! | `EMAIL_HOST` | `smtp.gmail.com` |
//! | `EMAIL_PORT` | `587` |
//! | `EMAIL_USER` / `EMAIL_PASS` | unset |
//! | `EMAIL_FROM` | `EMAIL_USER` |
//! | `EMAIL_USE_SSL` | `false` |
//! | `EMAIL_USE_STARTTLS` | `true` |
//! | `EMAIL_REQUIRE_STARTTLS` | `false` |
//! | `SMTP_CONNECT_TIMEOUT` | `7` |
//! | `SMTP_OP_TIMEOUT` | `10` |
//! | `SMTP_MAX_RETRIES` | `3` |
//! | `SMTP_CA_CERT` | unset |
//! | `SMTP_CLIENT_ID` | `localhost` |
//! | `AUTH_SERVICE_URL` | `http://clientservice-web:8000` |
//! | `AUTH_TIMEOUT` | `4` |
//! | `NOTIFIER_LISTEN_ADDR` | `0.0.0.0:8000` |
//! | `NOTIFIER_LOG_FORMAT` | `pretty` |
//! | `RUST_LOG` | `info` |
//!
//! Durations accept plain seconds (`7`, `2.5`) or humantime strings (`500ms`).

use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

use super::{
    ConfigError, IdentityConfig, NotifierConfig, RetryConfig, ServerConfig, SmtpConfig, TlsConfig,
    TlsMode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_HOST, DEFAULT_IDENTITY_TIMEOUT,
    DEFAULT_IDENTITY_URL, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_ATTEMPTS, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_PORT,
};
use crate::observability::{LogFormat, LoggingConfig};

/// Key lookup with blank values treated as unset.
pub struct Lookup<F> {
    inner: F,
}

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Wraps a lookup function.
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    /// Returns the trimmed value, or `None` when absent or blank.
    pub fn get(&self, key: &str) -> Option<String> {
        (self.inner)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, &raw, e)),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| invalid(key, &raw, "expected a boolean")),
            None => Ok(default),
        }
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_duration(&raw).map_err(|reason| invalid(key, &raw, reason)),
            None => Ok(default),
        }
    }
}

fn invalid(key: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parses common boolean spellings.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parses seconds as a float, or a humantime duration.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn tls_mode(lookup: &Lookup<impl Fn(&str) -> Option<String>>) -> Result<TlsMode, ConfigError> {
    if lookup.flag("EMAIL_USE_SSL", false)? {
        return Ok(TlsMode::Implicit);
    }
    if !lookup.flag("EMAIL_USE_STARTTLS", true)? {
        return Ok(TlsMode::None);
    }
    if lookup.flag("EMAIL_REQUIRE_STARTTLS", false)? {
        Ok(TlsMode::StartTlsRequired)
    } else {
        Ok(TlsMode::StartTls)
    }
}

/// Builds the full configuration from a lookup.
pub fn load<F>(lookup: &Lookup<F>) -> Result<NotifierConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let username = lookup.get("EMAIL_USER");
    let password = lookup.get("EMAIL_PASS").map(SecretString::new);
    let sender = lookup.get("EMAIL_FROM").or_else(|| username.clone());
    if sender.is_none() {
        return Err(ConfigError::Missing("EMAIL_FROM or EMAIL_USER".to_string()));
    }

    let max_attempts = lookup.parsed("SMTP_MAX_RETRIES", DEFAULT_MAX_ATTEMPTS)?;
    if max_attempts == 0 {
        return Err(invalid("SMTP_MAX_RETRIES", "0", "must be at least 1"));
    }

    let smtp = SmtpConfig {
        host: lookup.get("EMAIL_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: lookup.parsed("EMAIL_PORT", DEFAULT_PORT)?,
        tls: TlsConfig {
            mode: tls_mode(lookup)?,
            ca_cert_path: lookup.get("SMTP_CA_CERT").map(Into::into),
            sni_override: None,
        },
        // Credentials only count when both halves are present.
        username: username.clone().filter(|_| password.is_some()),
        password: password.filter(|_| username.is_some()),
        sender,
        connect_timeout: lookup.duration("SMTP_CONNECT_TIMEOUT", DEFAULT_CONNECT_TIMEOUT)?,
        operation_timeout: lookup.duration("SMTP_OP_TIMEOUT", DEFAULT_OPERATION_TIMEOUT)?,
        max_message_size: super::DEFAULT_MAX_MESSAGE_SIZE,
        retry: RetryConfig {
            max_attempts,
            ..RetryConfig::default()
        },
        client_id: lookup.get("SMTP_CLIENT_ID"),
    };
    smtp.validate()?;

    let identity = IdentityConfig {
        base_url: lookup
            .get("AUTH_SERVICE_URL")
            .unwrap_or_else(|| DEFAULT_IDENTITY_URL.to_string()),
        timeout: lookup.duration("AUTH_TIMEOUT", DEFAULT_IDENTITY_TIMEOUT)?,
    };

    let listen_raw = lookup
        .get("NOTIFIER_LISTEN_ADDR")
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
    let server = ServerConfig {
        listen_addr: listen_raw
            .parse()
            .map_err(|e| invalid("NOTIFIER_LISTEN_ADDR", &listen_raw, e))?,
    };

    let logging = LoggingConfig {
        filter: lookup.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        format: lookup.parsed::<LogFormat>("NOTIFIER_LOG_FORMAT", LogFormat::Pretty)?,
        ..LoggingConfig::default()
    };

    Ok(NotifierConfig {
        smtp,
        identity,
        server,
        logging,
    })
}
