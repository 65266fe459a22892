//! Transport layer for the relay session.
//!
//! [`SmtpTransport`] is the wire-level seam: send a command line, read a
//! (possibly multi-line) reply, stream DATA bytes, and upgrade to TLS.
//! [`TcpTransport`] implements it over TCP with rustls.
//!
//! Socket failures map onto the transient error kinds: I/O errors and EOF
//! become [`SmtpErrorKind::Disconnected`], expired deadlines become
//! [`SmtpErrorKind::Timeout`].

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader as StdBufReader};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::protocol::{SmtpCommand, SmtpResponse};

/// Longest reply line accepted before the server is considered broken.
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Wire-level SMTP transport.
#[async_trait]
pub trait SmtpTransport: Send + fmt::Debug {
    /// Sends a command and receives the reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Sends raw data (the DATA payload).
    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()>;

    /// Reads one reply from the server.
    async fn read_response(&mut self) -> SmtpResult<SmtpResponse>;

    /// Upgrades the connection to TLS after a successful `STARTTLS`.
    async fn upgrade_tls(&mut self) -> SmtpResult<()>;

    /// Returns true if the stream is encrypted.
    fn is_tls(&self) -> bool;

    /// Sets the deadline applied to each subsequent read and write.
    fn set_timeout(&mut self, timeout: Duration);

    /// Closes the socket without any SMTP exchange.
    async fn shutdown(&mut self);
}

/// TLS client parameters, built once per connector.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Builds the client config from the bundled web PKI roots plus the
    /// optional extra CA file.
    pub fn from_config(config: &SmtpConfig) -> SmtpResult<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &config.tls.ca_cert_path {
            let file = File::open(path).map_err(|e| {
                SmtpError::tls(format!("Cannot open CA file {}", path.display())).with_cause(e)
            })?;
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut StdBufReader::new(file)) {
                let cert = cert.map_err(|e| {
                    SmtpError::tls(format!("Invalid PEM in {}", path.display())).with_cause(e)
                })?;
                roots.add(cert).map_err(|e| {
                    SmtpError::tls(format!("Rejected CA certificate in {}", path.display()))
                        .with_cause(e)
                })?;
                added += 1;
            }
            if added == 0 {
                return Err(SmtpError::tls(format!(
                    "No certificates found in {}",
                    path.display()
                )));
            }
            tracing::debug!(path = %path.display(), certificates = added, "Loaded extra CA roots");
        }

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let host = config.tls_server_name().to_string();
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", host)))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }
}

trait SessionStream: AsyncBufRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> SessionStream for T {}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    Closed,
}

/// TCP connection with optional TLS.
pub struct TcpTransport {
    stream: TransportStream,
    timeout: Duration,
    tls: Option<TlsContext>,
    peer: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("tls", &self.is_tls())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TcpTransport {
    /// Opens a TCP connection within `config.connect_timeout`. With implicit
    /// TLS the handshake happens here, before any greeting is read.
    ///
    /// The connect timeout stays in force for every later read and write until
    /// [`SmtpTransport::set_timeout`] replaces it.
    pub async fn connect(config: &SmtpConfig, tls: Option<TlsContext>) -> SmtpResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| SmtpError::timeout(format!("Connect to {} timed out", address)))?
            .map_err(|e| {
                SmtpError::new(
                    SmtpErrorKind::ConnectFailed,
                    format!("Cannot connect to {}", address),
                )
                .with_cause(e)
            })?;

        stream.set_nodelay(true).ok();

        let mut transport = Self {
            stream: TransportStream::Plain(BufReader::new(stream)),
            timeout: config.connect_timeout,
            tls,
            peer: address,
        };

        if config.tls.mode == crate::config::TlsMode::Implicit {
            transport.upgrade_tls().await?;
        }

        Ok(transport)
    }

    fn stream_mut(&mut self) -> SmtpResult<&mut dyn SessionStream> {
        match &mut self.stream {
            TransportStream::Plain(stream) => Ok(stream),
            TransportStream::Tls(stream) => Ok(stream.as_mut()),
            TransportStream::Closed => Err(SmtpError::disconnected("Connection already closed")),
        }
    }

    fn map_io_error(error: io::Error, action: &str) -> SmtpError {
        SmtpError::disconnected(format!("{} failed: {}", action, error)).with_cause(error)
    }

    /// Reads lines until a reply is complete (no `-` after the code).
    async fn read_response_inner(
        reader: &mut dyn SessionStream,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::timeout("Read timed out"))?
                .map_err(|e| Self::map_io_error(e, "Read"))?;

            if read == 0 {
                return Err(SmtpError::disconnected("Connection unexpectedly closed"));
            }
            if line.len() > MAX_LINE_LENGTH {
                return Err(SmtpError::protocol("Reply line too long"));
            }

            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_all(
        writer: &mut dyn SessionStream,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::timeout("Write timed out"))?
            .map_err(|e| Self::map_io_error(e, "Write"))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::timeout("Flush timed out"))?
            .map_err(|e| Self::map_io_error(e, "Flush"))?;

        Ok(())
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        tracing::trace!(peer = %self.peer, command = command.verb(), "Sending SMTP command");

        let line = format!("{}\r\n", command.to_smtp_string());
        let timeout = self.timeout;
        Self::write_all(self.stream_mut()?, line.as_bytes(), timeout).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout = self.timeout;
        Self::write_all(self.stream_mut()?, data, timeout).await
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let timeout = self.timeout;
        let response = Self::read_response_inner(self.stream_mut()?, timeout).await?;

        tracing::trace!(
            peer = %self.peer,
            code = response.code,
            message = %response.first_message(),
            "Received SMTP response"
        );

        Ok(response)
    }

    async fn upgrade_tls(&mut self) -> SmtpResult<()> {
        let Some(tls) = self.tls.clone() else {
            return Err(SmtpError::tls("TLS is not configured for this connection"));
        };

        let tcp_stream = match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(SmtpError::tls("Connection is not in plaintext mode"));
            }
        };

        let tls_stream = timeout(self.timeout, tls.connector.connect(tls.server_name, tcp_stream))
            .await
            .map_err(|_| SmtpError::timeout("TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        self.stream = TransportStream::Tls(Box::new(BufReader::new(tls_stream)));
        tracing::debug!(peer = %self.peer, "TLS established");
        Ok(())
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.stream, TransportStream::Closed) {
            TransportStream::Plain(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            TransportStream::Tls(mut stream) => {
                let _ = stream.get_mut().shutdown().await;
            }
            TransportStream::Closed => {}
        }
    }
}
