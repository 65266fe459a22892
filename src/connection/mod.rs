//! Connection management.
//!
//! The [`ConnectionManager`] owns at most one live mail session. Callers get
//! exclusive use of it through a [`SessionLease`], which holds the slot's
//! async mutex from probe-or-connect until the lease is dropped. A cached
//! session is probed with `NOOP` before reuse and replaced when the probe
//! fails.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{SmtpError, SmtpResult};
use crate::mime::RenderedMessage;
use crate::observability::DeliveryMetrics;
use crate::protocol::SmtpResponse;
use crate::session::{establish, MailSession};
use crate::transport::{TcpTransport, TlsContext};

/// Opens new mail sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync + fmt::Debug {
    /// Opens, greets, secures and authenticates a new session.
    async fn connect(&self) -> SmtpResult<Box<dyn MailSession>>;
}

/// Connector for a real relay over TCP.
#[derive(Debug)]
pub struct TcpConnector {
    config: Arc<SmtpConfig>,
    tls: Option<TlsContext>,
    metrics: Arc<DeliveryMetrics>,
}

impl TcpConnector {
    /// Creates a connector. The TLS context is built here, once, so a bad CA
    /// file fails at startup rather than on the first delivery.
    pub fn new(config: Arc<SmtpConfig>, metrics: Arc<DeliveryMetrics>) -> SmtpResult<Self> {
        let tls = match config.tls.mode {
            TlsMode::None => None,
            _ => Some(TlsContext::from_config(&config)?),
        };

        Ok(Self {
            config,
            tls,
            metrics,
        })
    }
}

#[async_trait]
impl SessionConnector for TcpConnector {
    async fn connect(&self) -> SmtpResult<Box<dyn MailSession>> {
        let transport = TcpTransport::connect(&self.config, self.tls.clone()).await?;
        let session = establish(transport, &self.config, self.metrics.clone()).await?;
        Ok(Box::new(session))
    }
}

struct LiveSession {
    id: u64,
    session: Box<dyn MailSession>,
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("id", &self.id)
            .field("encrypted", &self.session.is_encrypted())
            .finish()
    }
}

/// Closes a session that is being discarded. Errors are logged and dropped.
async fn close_quietly(mut live: LiveSession) {
    if let Err(error) = live.session.close().await {
        tracing::debug!(session_id = live.id, error = %error, "Ignoring error while closing session");
    }
}

/// Owner of the shared mail session.
pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    slot: Arc<Mutex<Option<LiveSession>>>,
    next_id: AtomicU64,
    metrics: Arc<DeliveryMetrics>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connector", &self.connector)
            .field("sessions_opened", &self.next_id.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager. Nothing is connected until the first acquire.
    pub fn new(connector: Arc<dyn SessionConnector>, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            connector,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
            metrics,
        }
    }

    /// Creates a manager that connects to the configured relay over TCP.
    pub fn from_config(config: Arc<SmtpConfig>, metrics: Arc<DeliveryMetrics>) -> SmtpResult<Self> {
        let connector = TcpConnector::new(config, metrics.clone())?;
        Ok(Self::new(Arc::new(connector), metrics))
    }

    /// Returns a verified-live session, connecting or reconnecting as needed.
    ///
    /// Establishment failures are returned as-is and never retried here.
    pub async fn acquire(&self) -> SmtpResult<SessionLease> {
        let mut slot = self.slot.clone().lock_owned().await;

        let probe = match slot.as_mut() {
            Some(live) => Some((live.id, live.session.probe().await)),
            None => None,
        };

        match probe {
            Some((id, Ok(()))) => {
                tracing::debug!(session_id = id, "Reusing cached session");
                return Ok(SessionLease::new(slot, id, self.metrics.clone()));
            }
            Some((id, Err(error))) => {
                self.metrics.record_probe_failure();
                tracing::warn!(session_id = id, error = %error, "Cached session failed liveness probe, reconnecting");
                if let Some(stale) = slot.take() {
                    close_quietly(stale).await;
                }
            }
            None => {}
        }

        let live = self.connect().await?;
        let id = live.id;
        *slot = Some(live);
        Ok(SessionLease::new(slot, id, self.metrics.clone()))
    }

    async fn connect(&self) -> SmtpResult<LiveSession> {
        match self.connector.connect().await {
            Ok(session) => {
                self.metrics.record_connect(true);
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(session_id = id, encrypted = session.is_encrypted(), "SMTP session established");
                Ok(LiveSession { id, session })
            }
            Err(error) => {
                self.metrics.record_connect(false);
                tracing::warn!(error = %error, transient = error.is_transient(), "SMTP connect failed");
                Err(error)
            }
        }
    }

    /// Discards the cached session so the next acquire reconnects.
    pub async fn invalidate(&self) {
        let stale = self.slot.lock().await.take();
        if let Some(live) = stale {
            self.metrics.record_invalidation();
            tracing::debug!(session_id = live.id, "Invalidating session");
            close_quietly(live).await;
        }
    }

    /// Sends `QUIT` on the cached session, if any, and leaves the manager
    /// empty. The manager stays usable; a later acquire reconnects.
    pub async fn close(&self) -> SmtpResult<()> {
        let current = self.slot.lock().await.take();
        match current {
            Some(mut live) => {
                tracing::info!(session_id = live.id, "Closing SMTP session");
                live.session.close().await
            }
            None => Ok(()),
        }
    }

    /// Identifier of the cached session, if one is cached.
    pub async fn current_session_id(&self) -> Option<u64> {
        self.slot.lock().await.as_ref().map(|live| live.id)
    }
}

/// Exclusive use of the live session until dropped.
pub struct SessionLease {
    guard: OwnedMutexGuard<Option<LiveSession>>,
    session_id: u64,
    metrics: Arc<DeliveryMetrics>,
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl SessionLease {
    fn new(guard: OwnedMutexGuard<Option<LiveSession>>, session_id: u64, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            guard,
            session_id,
            metrics,
        }
    }

    /// Identifier of the leased session. Distinct for every connection the
    /// manager opens.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Runs one mail transaction on the leased session.
    pub async fn send_mail(&mut self, message: &RenderedMessage) -> SmtpResult<SmtpResponse> {
        match self.guard.as_mut() {
            Some(live) => live.session.send_mail(message).await,
            None => Err(SmtpError::disconnected("Session was invalidated")),
        }
    }

    /// Discards the leased session and releases the slot.
    pub async fn invalidate(mut self) {
        if let Some(live) = self.guard.take() {
            self.metrics.record_invalidation();
            tracing::debug!(session_id = live.id, "Invalidating session");
            close_quietly(live).await;
        }
    }
}
