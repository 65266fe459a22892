//! Shared fixtures for integration tests: a minimal SMTP relay on localhost.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use video_notifier::{RetryConfig, SmtpConfig, TlsMode};

/// How the relay misbehaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayBehavior {
    /// Hang up right after accepting each message.
    pub close_after_message: bool,
    /// On the first connection only, hang up when DATA is issued.
    pub drop_first_data: bool,
    /// Advertise STARTTLS. The first connection accepts it and then sends
    /// plaintext instead of a handshake; later ones refuse it with 454.
    pub broken_first_starttls: bool,
    /// On the first connection only, answer MAIL with a line that is not an
    /// SMTP reply.
    pub garble_first_mail: bool,
}

/// Plaintext SMTP relay that stores every accepted message.
#[derive(Debug, Clone)]
pub struct FakeSmtpServer {
    addr: SocketAddr,
    messages: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeSmtpServer {
    pub async fn start(behavior: RelayBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self {
            addr: listener.local_addr().unwrap(),
            messages: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let state = server.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = state.handle(stream, n, behavior).await;
                });
            }
        });

        server
    }

    /// Relay settings pointing at this server, with a short backoff unit.
    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig::builder()
            .host(self.addr.ip().to_string())
            .port(self.addr.port())
            .sender("Videos <videos@example.com>")
            .tls_mode(TlsMode::None)
            .connect_timeout(Duration::from_secs(2))
            .operation_timeout(Duration::from_secs(2))
            .retry(RetryConfig {
                max_attempts: 3,
                backoff_unit: Duration::from_millis(5),
                max_backoff_units: 8,
            })
            .build()
            .unwrap()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn handle(&self, stream: TcpStream, connection: usize, behavior: RelayBehavior) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"220 fake.test ESMTP ready\r\n").await?;

        while let Some(line) = lines.next_line().await? {
            let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
            match verb.as_str() {
                "EHLO" => {
                    if behavior.broken_first_starttls {
                        writer.write_all(b"250-fake.test greets you\r\n250-STARTTLS\r\n").await?;
                    } else {
                        writer.write_all(b"250-fake.test greets you\r\n").await?;
                    }
                    writer.write_all(b"250-8BITMIME\r\n250 SIZE 1000000\r\n").await?
                }
                "STARTTLS" => {
                    if connection == 1 {
                        writer.write_all(b"220 2.0.0 Ready to start TLS\r\n").await?;
                        writer.write_all(b"this is not a TLS record\r\n").await?;
                        return Ok(());
                    }
                    writer.write_all(b"454 4.7.0 TLS not available\r\n").await?
                }
                "HELO" | "NOOP" | "RSET" => writer.write_all(b"250 OK\r\n").await?,
                "MAIL" if behavior.garble_first_mail && connection == 1 => {
                    writer.write_all(b"garbled\r\n").await?
                }
                "MAIL" => writer.write_all(b"250 2.1.0 Sender OK\r\n").await?,
                "RCPT" => writer.write_all(b"250 2.1.5 Recipient OK\r\n").await?,
                "DATA" => {
                    if behavior.drop_first_data && connection == 1 {
                        return Ok(());
                    }
                    writer.write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n").await?;

                    let mut body = Vec::new();
                    while let Some(data_line) = lines.next_line().await? {
                        if data_line == "." {
                            break;
                        }
                        body.push(data_line);
                    }
                    let id = {
                        let mut messages = self.messages.lock().unwrap();
                        messages.push(body.join("\n"));
                        messages.len()
                    };
                    writer
                        .write_all(format!("250 2.0.0 Ok: queued as MSG{id}\r\n").as_bytes())
                        .await?;

                    if behavior.close_after_message {
                        return Ok(());
                    }
                }
                "QUIT" => {
                    writer.write_all(b"221 2.0.0 Bye\r\n").await?;
                    return Ok(());
                }
                _ => writer.write_all(b"502 5.5.2 Command not recognized\r\n").await?,
            }
        }

        Ok(())
    }
}
