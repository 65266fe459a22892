//! Configuration types for the notifier.
//!
//! Provides configuration with builder pattern for:
//! - Relay connection settings and TLS mode
//! - Authentication credentials and sender override
//! - Retry policy for the delivery executor
//! - Identity service and HTTP listener settings
//!
//! [`NotifierConfig::from_env`] reads the process environment; see [`env`] for
//! the variable names and parsing rules.

pub mod env;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::auth::Credentials;
use crate::errors::{SmtpError, SmtpResult};
use crate::observability::LoggingConfig;
use crate::types::Address;

/// Default relay host.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for opening the session.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// Default timeout for each command once the session is up.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of delivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default backoff time unit.
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Default backoff ceiling, in time units.
pub const DEFAULT_MAX_BACKOFF_UNITS: u64 = 8;

/// Default maximum message size (10 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default EHLO identity.
pub const DEFAULT_CLIENT_ID: &str = "localhost";

/// Default identity service base URL.
pub const DEFAULT_IDENTITY_URL: &str = "http://clientservice-web:8000";

/// Default identity request timeout.
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(4);

/// Default HTTP bind address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required setting is absent.
    #[error("missing required setting {0}")]
    Missing(String),

    /// A setting could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },

    /// The relay settings are inconsistent.
    #[error(transparent)]
    Smtp(#[from] SmtpError),
}

/// TLS mode for the relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS.
    None,
    /// Opportunistic STARTTLS; upgrade failures fall back to plaintext (default).
    #[default]
    StartTls,
    /// Required STARTTLS (fail if not offered or not negotiated).
    StartTlsRequired,
    /// Implicit TLS (port 465).
    Implicit,
}

impl TlsMode {
    /// Returns true if the session should attempt STARTTLS.
    pub fn wants_starttls(&self) -> bool {
        matches!(self, TlsMode::StartTls | TlsMode::StartTlsRequired)
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Extra PEM trust roots added to the bundled web PKI roots.
    pub ca_cert_path: Option<PathBuf>,
    /// Server Name Indication override.
    pub sni_override: Option<String>,
}

impl TlsConfig {
    /// Creates a new TLS config builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Sets the TLS mode.
    pub fn mode(mut self, mode: TlsMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the CA certificate path.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ca_cert_path = Some(path.into());
        self
    }

    /// Sets the SNI override.
    pub fn sni_override(mut self, sni: impl Into<String>) -> Self {
        self.config.sni_override = Some(sni.into());
        self
    }

    /// Builds the TLS configuration.
    pub fn build(self) -> TlsConfig {
        self.config
    }
}

/// Retry configuration for the delivery executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total delivery attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Length of one backoff time unit.
    #[serde(default = "default_backoff_unit", with = "humantime_serde")]
    pub backoff_unit: Duration,
    /// Backoff ceiling, in time units.
    #[serde(default = "default_max_backoff_units")]
    pub max_backoff_units: u64,
}

fn default_max_attempts() -> u32 { DEFAULT_MAX_ATTEMPTS }
fn default_backoff_unit() -> Duration { DEFAULT_BACKOFF_UNIT }
fn default_max_backoff_units() -> u64 { DEFAULT_MAX_BACKOFF_UNITS }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_unit: default_backoff_unit(),
            max_backoff_units: default_max_backoff_units(),
        }
    }
}

/// Relay session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication username.
    pub username: Option<String>,
    /// Authentication password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Sender override; falls back to `username`.
    pub sender: Option<String>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Per-command timeout once the session is established.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,
    /// Maximum message size.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_operation_timeout() -> Duration { DEFAULT_OPERATION_TIMEOUT }
fn default_max_message_size() -> usize { DEFAULT_MAX_MESSAGE_SIZE }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if self.retry.max_attempts == 0 {
            return Err(SmtpError::configuration("max_attempts must be at least 1"));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(SmtpError::configuration(
                "Username and password must be set together",
            ));
        }

        self.sender_address()?;
        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the relay credentials, if configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }

    /// Returns the envelope sender: the override, else the username.
    pub fn sender_address(&self) -> SmtpResult<Address> {
        let raw = self
            .sender
            .as_deref()
            .or(self.username.as_deref())
            .ok_or_else(|| {
                SmtpError::configuration("A sender is required (set a sender or a username)")
            })?;
        Address::parse(raw)
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(DEFAULT_CLIENT_ID)
    }

    /// Returns the name to verify the relay certificate against.
    pub fn tls_server_name(&self) -> &str {
        self.tls.sni_override.as_deref().unwrap_or(&self.host)
    }
}

/// Builder for relay configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    sender: Option<String>,
    connect_timeout: Duration,
    operation_timeout: Duration,
    max_message_size: usize,
    retry: RetryConfig,
    client_id: Option<String>,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    /// Sets the sender override.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Disables TLS.
    pub fn no_tls(mut self) -> Self {
        self.tls.mode = TlsMode::None;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-command timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Sets maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Sets the number of delivery attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host.ok_or_else(|| SmtpError::configuration("Host is required"))?,
            port: if self.port == 0 { DEFAULT_PORT } else { self.port },
            tls: self.tls,
            username: self.username,
            password: self.password,
            sender: self.sender,
            connect_timeout: if self.connect_timeout == Duration::ZERO {
                DEFAULT_CONNECT_TIMEOUT
            } else {
                self.connect_timeout
            },
            operation_timeout: if self.operation_timeout == Duration::ZERO {
                DEFAULT_OPERATION_TIMEOUT
            } else {
                self.operation_timeout
            },
            max_message_size: if self.max_message_size == 0 {
                DEFAULT_MAX_MESSAGE_SIZE
            } else {
                self.max_message_size
            },
            retry: self.retry,
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Identity service client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base URL; `/api/client/{id}` is appended.
    #[serde(default = "default_identity_url")]
    pub base_url: String,
    /// Request timeout.
    #[serde(default = "default_identity_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_identity_url() -> String { DEFAULT_IDENTITY_URL.to_string() }
fn default_identity_timeout() -> Duration { DEFAULT_IDENTITY_TIMEOUT }

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            timeout: default_identity_timeout(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

/// Complete service configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Relay settings.
    pub smtp: SmtpConfig,
    /// Identity service settings.
    pub identity: IdentityConfig,
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl NotifierConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        env::load(&env::Lookup::new(lookup))
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SmtpErrorKind;

    #[test]
    fn test_config_builder() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .port(2525)
            .credentials("user@example.com", "pass")
            .build()
            .unwrap();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 2525);
        assert_eq!(config.address(), "smtp.example.com:2525");
        assert!(config.has_auth());
        assert_eq!(config.credentials().unwrap().username(), "user@example.com");
    }

    #[test]
    fn test_config_defaults() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .sender("noreply@example.com")
            .build()
            .unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(config.tls.mode, TlsMode::StartTls);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.client_id(), "localhost");
        assert!(!config.has_auth());
    }

    #[test]
    fn test_sender_falls_back_to_username() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .credentials("robot@example.com", "pass")
            .build()
            .unwrap();
        assert_eq!(config.sender_address().unwrap().email, "robot@example.com");

        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .credentials("robot@example.com", "pass")
            .sender("Videos <videos@example.com>")
            .build()
            .unwrap();
        let sender = config.sender_address().unwrap();
        assert_eq!(sender.email, "videos@example.com");
        assert_eq!(sender.name.as_deref(), Some("Videos"));
    }

    #[test]
    fn test_config_validation() {
        let result = SmtpConfig::builder().sender("a@example.com").build();
        assert!(result.is_err());

        let err = SmtpConfig::builder().host("smtp.example.com").build().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConfigurationInvalid);

        let err = SmtpConfig::builder()
            .host("smtp.example.com")
            .sender("a@example.com")
            .max_attempts(0)
            .build()
            .unwrap_err();
        assert!(err.message().contains("max_attempts"));

        let err = SmtpConfig::builder()
            .host("smtp.example.com")
            .username("a@example.com")
            .build()
            .unwrap_err();
        assert!(err.message().contains("together"));
    }

    #[test]
    fn test_tls_config() {
        let tls = TlsConfig::builder()
            .mode(TlsMode::StartTlsRequired)
            .sni_override("relay.internal")
            .build();

        assert_eq!(tls.mode, TlsMode::StartTlsRequired);
        assert!(tls.mode.wants_starttls());
        assert!(!TlsMode::Implicit.wants_starttls());
        assert!(!TlsMode::None.wants_starttls());
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let json = r#"{
            "host": "smtp.example.com",
            "username": "bot@example.com",
            "operation_timeout": "15s",
            "retry": { "max_attempts": 5, "backoff_unit": "250ms" }
        }"#;

        let config: SmtpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.operation_timeout, Duration::from_secs(15));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_unit, Duration::from_millis(250));
        assert_eq!(config.retry.max_backoff_units, DEFAULT_MAX_BACKOFF_UNITS);
        assert!(config.password.is_none());
    }
}
