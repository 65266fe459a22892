//! Mock implementations for testing.
//!
//! Scripted doubles for every seam of the notifier: the wire transport, the
//! session connector, the sleeper, the mail sender and the identity resolver.
//! Each double records what it was asked to do so tests can assert on the
//! exact sequence of calls.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::SessionConnector;
use crate::delivery::MailSender;
use crate::errors::{NotifierError, NotifierResult, SmtpError, SmtpResult};
use crate::identity::{IdentityError, IdentityResolver};
use crate::mime::{MimeEncoder, RenderedMessage};
use crate::protocol::{codes, SmtpCommand, SmtpResponse};
use crate::resilience::Sleeper;
use crate::session::MailSession;
use crate::transport::SmtpTransport;
use crate::types::{Address, Identity, OutboundMessage, SendReport};

/// Transport that plays back a fixed list of replies and logs every call.
///
/// Clones share the reply queue and the log, so a test can keep a clone to
/// inspect after handing the original to the code under test. Once the
/// script runs out every call fails with a disconnect.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<SmtpResult<SmtpResponse>>>>,
    log: Arc<Mutex<Vec<String>>>,
    tls_failure: Arc<Mutex<Option<SmtpError>>>,
    tls: bool,
}

impl ScriptedTransport {
    /// Creates an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reply.
    pub fn push(self, response: SmtpResponse) -> Self {
        self.replies.lock().unwrap().push_back(Ok(response));
        self
    }

    /// Appends a read failure, such as an unparseable reply.
    pub fn fail(self, error: SmtpError) -> Self {
        self.replies.lock().unwrap().push_back(Err(error));
        self
    }

    /// Makes the TLS upgrade fail with `error`.
    pub fn fail_tls(self, error: SmtpError) -> Self {
        *self.tls_failure.lock().unwrap() = Some(error);
        self
    }

    /// Appends a single-line reply.
    pub fn reply(self, code: u16, text: &str) -> Self {
        self.push(SmtpResponse::new(code, text))
    }

    /// Everything the client did, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn next_reply(&self) -> SmtpResult<SmtpResponse> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SmtpError::disconnected("Connection unexpectedly closed")))
    }
}

#[async_trait]
impl SmtpTransport for ScriptedTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        self.record(command.to_smtp_string());
        self.next_reply()
    }

    async fn send_data(&mut self, data: &[u8]) -> SmtpResult<()> {
        self.record(format!("<data {} bytes>", data.len()));
        Ok(())
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        self.next_reply()
    }

    async fn upgrade_tls(&mut self) -> SmtpResult<()> {
        self.record("<tls handshake>".to_string());
        if let Some(error) = self.tls_failure.lock().unwrap().take() {
            return Err(error);
        }
        self.tls = true;
        Ok(())
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.record(format!("<timeout {:?}>", timeout));
    }

    async fn shutdown(&mut self) {
        self.record("<shutdown>".to_string());
    }
}

/// Creates a greeting response.
pub fn greeting() -> SmtpResponse {
    SmtpResponse::new(codes::SERVICE_READY, "mx.example.com ESMTP ready")
}

/// Creates an EHLO response advertising `capabilities`.
pub fn ehlo_reply(capabilities: &[&str]) -> SmtpResponse {
    let mut lines = vec!["mx.example.com greets localhost".to_string()];
    lines.extend(capabilities.iter().map(|c| c.to_string()));
    SmtpResponse {
        code: codes::OK,
        enhanced_code: None,
        message: lines,
    }
}

/// A composed message for `ana@example.com`.
pub fn outbound_message() -> OutboundMessage {
    OutboundMessage {
        recipient: "ana@example.com".to_string(),
        subject: "Seu vídeo foi processado (#42)".to_string(),
        text_body: "Olá, Ana!".to_string(),
        html_body: "<p>Olá, Ana!</p>".to_string(),
    }
}

/// [`outbound_message`] rendered from `videos@example.com`.
pub fn rendered_message() -> RenderedMessage {
    let sender = Address {
        name: None,
        email: "videos@example.com".to_string(),
    };
    MimeEncoder::for_sender(&sender)
        .encode(&sender, &outbound_message())
        .expect("fixture message renders")
}

#[derive(Debug, Default)]
struct RelayState {
    connect_failures: VecDeque<SmtpError>,
    probe_failures: VecDeque<SmtpError>,
    send_failures: VecDeque<SmtpError>,
    close_failures: VecDeque<SmtpError>,
    events: Vec<String>,
    sessions: u64,
    sends: usize,
}

/// Session connector for a simulated relay.
///
/// Every operation succeeds unless a failure was queued for it; queued
/// failures are consumed one per call. Events are logged as `connect #N`,
/// `probe #N`, `send #N` and `close #N`, where `N` numbers the sessions in
/// the order they were opened.
#[derive(Debug, Clone, Default)]
pub struct FakeRelay {
    state: Arc<Mutex<RelayState>>,
}

impl FakeRelay {
    /// Creates a relay where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next connect.
    pub fn fail_connect(&self, error: SmtpError) -> &Self {
        self.state.lock().unwrap().connect_failures.push_back(error);
        self
    }

    /// Fails the next liveness probe.
    pub fn fail_probe(&self, error: SmtpError) -> &Self {
        self.state.lock().unwrap().probe_failures.push_back(error);
        self
    }

    /// Fails the next transaction.
    pub fn fail_send(&self, error: SmtpError) -> &Self {
        self.state.lock().unwrap().send_failures.push_back(error);
        self
    }

    /// Fails the next close.
    pub fn fail_close(&self, error: SmtpError) -> &Self {
        self.state.lock().unwrap().close_failures.push_back(error);
        self
    }

    /// Logged events, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    /// Number of transactions attempted.
    pub fn sends(&self) -> usize {
        self.state.lock().unwrap().sends
    }
}

#[async_trait]
impl SessionConnector for FakeRelay {
    async fn connect(&self) -> SmtpResult<Box<dyn MailSession>> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.connect_failures.pop_front() {
            state.events.push("connect failed".to_string());
            return Err(error);
        }
        state.sessions += 1;
        let id = state.sessions;
        state.events.push(format!("connect #{id}"));
        Ok(Box::new(FakeSession {
            id,
            relay: self.clone(),
        }))
    }
}

/// Session handed out by [`FakeRelay`].
#[derive(Debug)]
pub struct FakeSession {
    id: u64,
    relay: FakeRelay,
}

impl FakeSession {
    fn step(&self, verb: &str, pick: impl FnOnce(&mut RelayState) -> Option<SmtpError>) -> SmtpResult<()> {
        let mut state = self.relay.state.lock().unwrap();
        state.events.push(format!("{verb} #{}", self.id));
        match pick(&mut state) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MailSession for FakeSession {
    async fn probe(&mut self) -> SmtpResult<()> {
        self.step("probe", |s| s.probe_failures.pop_front())
    }

    async fn send_mail(&mut self, _message: &RenderedMessage) -> SmtpResult<SmtpResponse> {
        self.step("send", |s| {
            s.sends += 1;
            s.send_failures.pop_front()
        })?;
        Ok(SmtpResponse::new(codes::OK, "2.0.0 Ok: queued as FAKE"))
    }

    async fn close(&mut self) -> SmtpResult<()> {
        self.step("close", |s| s.close_failures.pop_front())
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Sleeper that returns at once and remembers what it was asked for.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Creates a sleeper with an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested durations, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Mail sender that records messages instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    failure: Mutex<Option<NotifierError>>,
}

impl RecordingSender {
    /// Creates a sender that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next send fail with `error`.
    pub fn fail_next(&self, error: NotifierError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Messages handed to the sender, including failed ones.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> NotifierResult<SendReport> {
        self.sent.lock().unwrap().push(message.clone());
        if let Some(error) = self.failure.lock().unwrap().take() {
            return Err(error);
        }
        Ok(SendReport {
            message_id: "recorded@example.com".to_string(),
            attempts: 1,
            session_id: 1,
            response: "2.0.0 Ok".to_string(),
        })
    }
}

/// Identity resolver over a fixed table. Unknown users are not found.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    identities: HashMap<i64, Identity>,
}

impl StaticIdentityResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user.
    pub fn with(mut self, user_id: i64, email: &str, name: &str) -> Self {
        self.identities.insert(
            user_id,
            Identity {
                email: email.to_string(),
                name: name.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, user_id: i64) -> Result<Identity, IdentityError> {
        self.identities
            .get(&user_id)
            .cloned()
            .ok_or(IdentityError::NotFound { user_id })
    }
}
