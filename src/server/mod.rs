//! HTTP endpoint.
//!
//! `POST /notify` accepts a [`NotificationRequest`] and answers `{"ok": true}`
//! once the email has been accepted by the relay. Failures are reported as
//! `{"detail": "..."}` with a status chosen by [`status_for`].

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::errors::NotifierError;
use crate::service::NotificationService;
use crate::types::NotificationRequest;

/// HTTP server failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Requested address.
        address: SocketAddr,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The server stopped with an error.
    #[error("HTTP server error: {0}")]
    Serve(#[source] io::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

fn error_response(status: StatusCode, detail: String) -> Response {
    (status, Json(ErrorBody { detail })).into_response()
}

/// HTTP status for a failed notification.
pub fn status_for(error: &NotifierError) -> StatusCode {
    match error {
        NotifierError::Validation(_) => StatusCode::BAD_REQUEST,
        NotifierError::Identity(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
        NotifierError::Identity(_) | NotifierError::Connection(_) | NotifierError::Delivery { .. } => {
            StatusCode::BAD_GATEWAY
        }
        NotifierError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Builds the application router.
pub fn router(service: Arc<NotificationService>) -> Router {
    Router::new()
        .route("/notify", post(notify_handler))
        .with_state(service)
}

async fn notify_handler(
    State(service): State<Arc<NotificationService>>,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "Rejected notification payload");
            return error_response(rejection.status(), rejection.body_text());
        }
    };

    let job_id = request.job_id.clone();
    match service.execute(request).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(error) => {
            let status = status_for(&error);
            if status.is_server_error() {
                tracing::error!(job_id = %job_id, error = %error, "Notification failed");
            } else {
                tracing::warn!(job_id = %job_id, error = %error, "Notification rejected");
            }
            error_response(status, error.to_string())
        }
    }
}

/// Notification HTTP server.
pub struct NotifierServer {
    listener: TcpListener,
    router: Router,
}

impl NotifierServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the configured address fails.
    pub async fn bind(config: &ServerConfig, service: Arc<NotificationService>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: config.listen_addr,
                source,
            })?;

        tracing::info!(address = %config.listen_addr, "Notification server bound");

        Ok(Self {
            listener,
            router: router(service),
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a runtime error.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Notification server starting");

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerError::Serve)?;

        tracing::info!("Notification server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::DefaultComposer;
    use crate::errors::SmtpError;
    use crate::identity::IdentityError;
    use crate::mocks::{RecordingSender, StaticIdentityResolver};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(sender: Arc<RecordingSender>) -> Router {
        let identities = StaticIdentityResolver::new().with(7, "u@example.com", "Mateus");
        let service = NotificationService::new(Arc::new(identities), Arc::new(DefaultComposer), sender);
        router(Arc::new(service))
    }

    async fn post_json(app: Router, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/notify")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_notify_ok() {
        let sender = Arc::new(RecordingSender::new());
        let body = json!({"job_id": "42", "status": "success", "user_id": 7, "video_url": "http://cdn/v.mp4"});

        let (status, json) = post_json(app(sender.clone()), &body.to_string()).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, json!({"ok": true}));
        assert_eq!(sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let (status, json) = post_json(app(Arc::new(RecordingSender::new())), "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_status_is_unprocessable() {
        let body = json!({"job_id": "42", "status": "done", "user_id": 7});
        let (status, json) = post_json(app(Arc::new(RecordingSender::new())), &body.to_string()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["detail"].is_string());
    }

    #[tokio::test]
    async fn test_empty_job_id() {
        let body = json!({"job_id": "", "status": "error", "user_id": 7});
        let (status, json) = post_json(app(Arc::new(RecordingSender::new())), &body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["detail"].as_str().unwrap().contains("job_id"));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let sender = Arc::new(RecordingSender::new());
        let body = json!({"job_id": "42", "status": "error", "user_id": 99});

        let (status, json) = post_json(app(sender.clone()), &body.to_string()).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "user 99 not found");
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_bad_gateway() {
        let sender = Arc::new(RecordingSender::new());
        sender.fail_next(NotifierError::Delivery {
            recipient: "u@example.com".to_string(),
            attempts: 3,
            source: SmtpError::disconnected("Connection unexpectedly closed"),
        });
        let body = json!({"job_id": "42", "status": "success", "user_id": 7});

        let (status, json) = post_json(app(sender), &body.to_string()).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["detail"].as_str().unwrap().contains("after 3 attempt(s)"));
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/notify")
            .body(Body::empty())
            .unwrap();
        let response = app(Arc::new(RecordingSender::new())).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&NotifierError::Identity(IdentityError::MissingEmail { user_id: 1 })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&NotifierError::Identity(IdentityError::Upstream { status: 500 })),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&NotifierError::Connection(SmtpError::authentication("denied"))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&NotifierError::Validation("bad".to_string())),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_bind_and_serve_shutdown() {
        let service = NotificationService::new(
            Arc::new(StaticIdentityResolver::new()),
            Arc::new(DefaultComposer),
            Arc::new(RecordingSender::new()),
        );
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        };

        let server = NotifierServer::bind(&config, Arc::new(service)).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        server.serve(async {}).await.unwrap();
    }
}
