//! Identity resolution.
//!
//! Maps a job owner's `user_id` to the address and greeting name used in the
//! notification, by asking the client service over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

use crate::config::IdentityConfig;
use crate::types::Identity;

/// Greeting used when the identity service has no name on record.
pub const FALLBACK_NAME: &str = "cliente";

/// Identity lookup failures. None of these are retried.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The service has no such user.
    #[error("user {user_id} not found")]
    NotFound {
        /// Requested user.
        user_id: i64,
    },

    /// The user exists but has no usable email address.
    #[error("identity service returned no email for user {user_id}")]
    MissingEmail {
        /// Requested user.
        user_id: i64,
    },

    /// The service answered with an unexpected status.
    #[error("identity service responded with HTTP {status}")]
    Upstream {
        /// HTTP status code.
        status: u16,
    },

    /// The request could not be made or timed out.
    #[error("identity service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body was not the expected JSON.
    #[error("identity service returned an unreadable body: {0}")]
    Decode(String),
}

impl IdentityError {
    /// True when the lookup failed because of the requested user, not the service.
    pub fn is_client_error(&self) -> bool {
        matches!(self, IdentityError::NotFound { .. } | IdentityError::MissingEmail { .. })
    }
}

/// Resolves a user id to an [`Identity`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync + fmt::Debug {
    /// Looks up `user_id`.
    async fn resolve(&self, user_id: i64) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct ClientRecord {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Resolver backed by `GET {base_url}/api/client/{user_id}`.
#[derive(Debug, Clone)]
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityResolver {
    /// Creates a resolver with its own HTTP client.
    pub fn new(config: &IdentityConfig) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, user_id: i64) -> String {
        format!("{}/api/client/{}", self.base_url, user_id)
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve(&self, user_id: i64) -> Result<Identity, IdentityError> {
        let url = self.url_for(user_id);
        tracing::debug!(user_id, url = %url, "Resolving identity");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(IdentityError::NotFound { user_id });
        }
        if !status.is_success() {
            tracing::warn!(user_id, status = status.as_u16(), "Identity service error");
            return Err(IdentityError::Upstream {
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let record: Option<ClientRecord> =
            serde_json::from_slice(&body).map_err(|e| IdentityError::Decode(e.to_string()))?;

        let (email, name) = match record {
            Some(record) => (record.email, record.name),
            None => (None, None),
        };

        let email = email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or(IdentityError::MissingEmail { user_id })?;
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        Ok(Identity { email, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver(server: &MockServer) -> HttpIdentityResolver {
        HttpIdentityResolver::new(&IdentityConfig {
            base_url: format!("{}/", server.uri()),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolves_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/7"))
            .and(header("accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"email": "u@example.com", "name": "Mateus", "cpf": "123"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let identity = resolver(&server).resolve(7).await.unwrap();

        assert_eq!(identity.email, "u@example.com");
        assert_eq!(identity.name, "Mateus");
    }

    #[tokio::test]
    async fn test_missing_name_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"email": "x@example.com", "name": null})))
            .mount(&server)
            .await;

        let identity = resolver(&server).resolve(8).await.unwrap();
        assert_eq!(identity.name, FALLBACK_NAME);
    }

    #[tokio::test]
    async fn test_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve(9).await.unwrap_err();
        assert!(matches!(err, IdentityError::NotFound { user_id: 9 }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_missing_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ana", "email": ""})))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve(10).await.unwrap_err();
        assert!(matches!(err, IdentityError::MissingEmail { user_id: 10 }));
    }

    #[tokio::test]
    async fn test_null_body_is_missing_email() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/11"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve(11).await.unwrap_err();
        assert!(matches!(err, IdentityError::MissingEmail { user_id: 11 }));
    }

    #[tokio::test]
    async fn test_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/12"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve(12).await.unwrap_err();
        assert!(matches!(err, IdentityError::Upstream { status: 503 }));
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_garbage_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/client/13"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = resolver(&server).resolve(13).await.unwrap_err();
        assert!(matches!(err, IdentityError::Decode(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let resolver = HttpIdentityResolver::new(&IdentityConfig {
            base_url: server.uri(),
            timeout: Duration::from_millis(50),
        })
        .unwrap();

        let err = resolver.resolve(14).await.unwrap_err();
        assert!(matches!(err, IdentityError::Transport(_)));
    }
}
