//! Authenticated relay session.
//!
//! [`establish`] runs the connect protocol over any [`SmtpTransport`]:
//! greeting, EHLO (with HELO fallback), optional STARTTLS, re-EHLO, AUTH and
//! finally the switch to the per-operation timeout. The resulting
//! [`SmtpSession`] implements [`MailSession`], the seam the connection manager
//! owns and leases out.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{SmtpConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::{MimeEncoder, RenderedMessage};
use crate::observability::DeliveryMetrics;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};
use crate::transport::SmtpTransport;

/// A live, authenticated mail session.
#[async_trait]
pub trait MailSession: Send + fmt::Debug {
    /// Liveness probe (`NOOP`).
    async fn probe(&mut self) -> SmtpResult<()>;

    /// Runs one mail transaction for an already rendered message and returns
    /// the relay's final reply.
    async fn send_mail(&mut self, message: &RenderedMessage) -> SmtpResult<SmtpResponse>;

    /// Sends `QUIT` and closes the socket.
    async fn close(&mut self) -> SmtpResult<()>;

    /// Returns true if the session runs over TLS.
    fn is_encrypted(&self) -> bool;
}

/// Session over a concrete transport.
pub struct SmtpSession<T> {
    transport: T,
    capabilities: EsmtpCapabilities,
    metrics: Arc<DeliveryMetrics>,
}

impl<T: SmtpTransport> fmt::Debug for SmtpSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpSession")
            .field("transport", &self.transport)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Runs the connect protocol on a freshly opened transport.
pub async fn establish<T: SmtpTransport>(
    mut transport: T,
    config: &SmtpConfig,
    metrics: Arc<DeliveryMetrics>,
) -> SmtpResult<SmtpSession<T>> {
    let greeting = transport.read_response().await?;
    if greeting.code != codes::SERVICE_READY {
        return Err(greeting.to_error(SmtpErrorKind::ConnectFailed));
    }

    let mut capabilities = greet(&mut transport, config.client_id()).await?;

    if config.tls.mode.wants_starttls()
        && !transport.is_tls()
        && start_tls(&mut transport, &capabilities, config.tls.mode).await?
    {
        metrics.record_tls_upgrade();
        capabilities = greet(&mut transport, config.client_id()).await?;
    }

    if let Some(credentials) = config.credentials() {
        let result = authenticate(&mut transport, &capabilities, &credentials).await;
        metrics.record_auth_attempt(result.is_ok());
        result?;
    }

    transport.set_timeout(config.operation_timeout);

    Ok(SmtpSession {
        transport,
        capabilities,
        metrics,
    })
}

/// EHLO, falling back to HELO for servers without ESMTP.
async fn greet<T: SmtpTransport>(transport: &mut T, client_id: &str) -> SmtpResult<EsmtpCapabilities> {
    let response = transport
        .send_command(&SmtpCommand::Ehlo(client_id.to_string()))
        .await?;
    if response.is_success() {
        return Ok(EsmtpCapabilities::from_ehlo_response(&response));
    }
    if response.code == codes::SERVICE_UNAVAILABLE {
        return Err(response.to_error(SmtpErrorKind::HandshakeFailed));
    }

    tracing::debug!(code = response.code, "EHLO refused, falling back to HELO");
    let response = transport
        .send_command(&SmtpCommand::Helo(client_id.to_string()))
        .await?;
    if response.is_success() {
        Ok(EsmtpCapabilities::helo_only())
    } else {
        Err(response.to_error(SmtpErrorKind::HandshakeFailed))
    }
}

/// Attempts the STARTTLS upgrade. Returns true when the stream is now
/// encrypted. Refusals are tolerated unless the mode requires TLS.
async fn start_tls<T: SmtpTransport>(
    transport: &mut T,
    capabilities: &EsmtpCapabilities,
    mode: TlsMode,
) -> SmtpResult<bool> {
    let required = mode == TlsMode::StartTlsRequired;

    if !capabilities.starttls {
        if required {
            return Err(SmtpError::new(
                SmtpErrorKind::StarttlsNotSupported,
                "Server does not support STARTTLS",
            ));
        }
        tracing::warn!("Server does not advertise STARTTLS, continuing without encryption");
        return Ok(false);
    }

    let response = transport.send_command(&SmtpCommand::StartTls).await?;
    if response.code != codes::SERVICE_READY {
        if required || response.code == codes::SERVICE_UNAVAILABLE {
            return Err(response.to_error(SmtpErrorKind::TlsFailed));
        }
        tracing::warn!(
            code = response.code,
            reply = %response.first_message(),
            "STARTTLS refused, continuing without encryption"
        );
        return Ok(false);
    }

    // After a 220 the plaintext stream is consumed by the handshake, so a
    // handshake failure cannot fall back. Outside the required mode the
    // broken channel is reported as a handshake failure and reconnected.
    match transport.upgrade_tls().await {
        Ok(()) => Ok(true),
        Err(err) if !required && err.kind() == SmtpErrorKind::TlsFailed => {
            tracing::warn!(error = %err, "STARTTLS handshake failed, dropping the connection");
            Err(SmtpError::new(
                SmtpErrorKind::HandshakeFailed,
                format!("STARTTLS handshake failed: {}", err.message()),
            )
            .with_cause(err))
        }
        Err(err) => Err(err),
    }
}

async fn authenticate<T: SmtpTransport>(
    transport: &mut T,
    capabilities: &EsmtpCapabilities,
    credentials: &Credentials,
) -> SmtpResult<()> {
    if !capabilities.has_auth() {
        return Err(SmtpError::new(
            SmtpErrorKind::AuthMethodNotSupported,
            "Server does not advertise AUTH",
        ));
    }

    let method = Authenticator::select_best_method(&capabilities.auth_mechanisms)?;
    if method.exposes_password() && !transport.is_tls() {
        tracing::warn!(
            mechanism = %method,
            "Authenticating over an unencrypted connection"
        );
    }

    match method {
        AuthMethod::Plain => auth_plain(transport, credentials).await,
        AuthMethod::Login => auth_login(transport, credentials).await,
        AuthMethod::CramMd5 => auth_cram_md5(transport, credentials).await,
    }?;

    tracing::debug!(mechanism = %method, user = credentials.username(), "Authenticated");
    Ok(())
}

fn expect_auth(response: SmtpResponse, expected: u16) -> SmtpResult<SmtpResponse> {
    response.expect_code(expected, SmtpErrorKind::AuthenticationFailed)
}

async fn auth_plain<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Plain.mechanism_name().to_string(),
        initial_response: Some(Authenticator::plain_initial_response(credentials)),
    };
    expect_auth(transport.send_command(&command).await?, codes::AUTH_SUCCESS)?;
    Ok(())
}

async fn auth_login<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::Login.mechanism_name().to_string(),
        initial_response: None,
    };
    expect_auth(transport.send_command(&command).await?, codes::AUTH_CONTINUE)?;

    let username = Authenticator::login_username(credentials);
    transport.send_data(format!("{}\r\n", username).as_bytes()).await?;
    expect_auth(transport.read_response().await?, codes::AUTH_CONTINUE)?;

    let password = Authenticator::login_password(credentials);
    transport.send_data(format!("{}\r\n", password).as_bytes()).await?;
    expect_auth(transport.read_response().await?, codes::AUTH_SUCCESS)?;
    Ok(())
}

async fn auth_cram_md5<T: SmtpTransport>(transport: &mut T, credentials: &Credentials) -> SmtpResult<()> {
    let command = SmtpCommand::Auth {
        mechanism: AuthMethod::CramMd5.mechanism_name().to_string(),
        initial_response: None,
    };
    let challenge = expect_auth(transport.send_command(&command).await?, codes::AUTH_CONTINUE)?;

    let answer = Authenticator::cram_md5_response(challenge.first_message(), credentials)?;
    transport.send_data(format!("{}\r\n", answer).as_bytes()).await?;
    expect_auth(transport.read_response().await?, codes::AUTH_SUCCESS)?;
    Ok(())
}

impl<T: SmtpTransport> SmtpSession<T> {
    /// Returns the capabilities from the last EHLO.
    pub fn capabilities(&self) -> &EsmtpCapabilities {
        &self.capabilities
    }

    /// Aborts the open transaction after a refusal. A broken connection is
    /// left alone; the caller discards it anyway.
    async fn abort_transaction(&mut self, cause: &SmtpError) {
        if cause.kind() == SmtpErrorKind::Disconnected {
            return;
        }
        if let Err(e) = self.transport.send_command(&SmtpCommand::Rset).await {
            tracing::debug!(error = %e, "RSET after refused transaction failed");
        }
    }

    /// Runs MAIL, RCPT and DATA for one message.
    async fn transact(&mut self, message: &RenderedMessage) -> SmtpResult<SmtpResponse> {
        if let Some(limit) = self.capabilities.size {
            if message.data.len() > limit {
                return Err(SmtpError::new(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message is {} bytes, server accepts {}", message.data.len(), limit),
                ));
            }
        }

        let mail_from = SmtpCommand::MailFrom {
            address: message.envelope.from.to_smtp(),
            size: self.capabilities.size.map(|_| message.data.len()),
        };
        let response = self.transport.send_command(&mail_from).await?;
        if response.code != codes::OK {
            let err = response.to_error(SmtpErrorKind::SenderRejected);
            self.abort_transaction(&err).await;
            return Err(err);
        }

        let rcpt_to = SmtpCommand::RcptTo(message.envelope.to.to_smtp());
        let response = self.transport.send_command(&rcpt_to).await?;
        if !matches!(response.code, codes::OK | codes::USER_NOT_LOCAL_WILL_FORWARD) {
            let err = SmtpError::from_smtp_response(
                SmtpErrorKind::RecipientsRejected,
                response.code,
                format!("All recipients were rejected: {}", response.full_message()),
            );
            self.abort_transaction(&err).await;
            return Err(err);
        }

        let response = self.transport.send_command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            let err = response.to_error(SmtpErrorKind::DataRejected);
            self.abort_transaction(&err).await;
            return Err(err);
        }

        let payload = MimeEncoder::prepare_data_content(&message.data);
        self.transport.send_data(&payload).await?;

        let response = self.transport.read_response().await?;
        if response.code != codes::OK {
            return Err(response.to_error(SmtpErrorKind::DataRejected));
        }

        self.metrics.record_bytes_sent(payload.len() as u64);
        Ok(response)
    }
}

#[async_trait]
impl<T: SmtpTransport> MailSession for SmtpSession<T> {
    async fn probe(&mut self) -> SmtpResult<()> {
        self.transport
            .send_command(&SmtpCommand::Noop)
            .await?
            .expect_code(codes::OK, SmtpErrorKind::Disconnected)?;
        Ok(())
    }

    async fn send_mail(&mut self, message: &RenderedMessage) -> SmtpResult<SmtpResponse> {
        // A reply that cannot be parsed leaves the stream out of step with
        // the transaction, so the session is reported as lost.
        self.transact(message).await.map_err(|err| {
            if err.kind() == SmtpErrorKind::InvalidResponse {
                SmtpError::new(
                    SmtpErrorKind::Disconnected,
                    format!("Lost protocol sync: {}", err.message()),
                )
                .with_cause(err)
            } else {
                err
            }
        })
    }

    async fn close(&mut self) -> SmtpResult<()> {
        let result = self.transport.send_command(&SmtpCommand::Quit).await;
        self.transport.shutdown().await;
        result.map(|_| ())
    }

    fn is_encrypted(&self) -> bool {
        self.transport.is_tls()
    }
}
