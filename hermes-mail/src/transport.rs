//! Delivery of composed messages

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use hermes_common::{ConfigError, outgoing, tracing};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    ComposedMail, TransportError,
    client::{ClientError, Response, SmtpClient},
};

/// Hands composed messages to a relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver `mail` to every envelope recipient.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the relay could not be reached or
    /// refused the message.
    async fn send(&self, mail: &ComposedMail) -> Result<(), TransportError>;
}

/// How the connection to the relay is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    /// TLS from the first byte (SMTPS)
    #[default]
    Implicit,
    /// Plain connection upgraded with `STARTTLS`
    StartTls,
    /// No encryption at all
    None,
}

/// Per-command timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// Connection and TLS handshake
    #[serde(default = "defaults::connect")]
    pub connect_secs: u64,

    /// Every command other than `DATA`
    #[serde(default = "defaults::command")]
    pub command_secs: u64,

    /// `DATA` and the message content
    #[serde(default = "defaults::data")]
    pub data_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect(),
            command_secs: defaults::command(),
            data_secs: defaults::data(),
        }
    }
}

/// Relay configuration
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay host, may be left empty here and provided by the environment
    #[serde(default)]
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub tls: TlsMode,

    /// Name announced in `EHLO`
    #[serde(default = "defaults::helo")]
    pub helo: String,

    /// Accept self-signed or otherwise invalid relay certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("tls", &self.tls)
            .field("helo", &self.helo)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl SmtpConfig {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: defaults::port(),
            username: None,
            password: None,
            tls: TlsMode::default(),
            helo: defaults::helo(),
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the host is empty, the port is zero, only
    /// one of username and password is set or a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Missing("smtp.host"));
        }

        if self.port == 0 {
            return Err(ConfigError::invalid("smtp.port", "must not be 0"));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::invalid(
                "smtp.username",
                "username and password must be set together",
            ));
        }

        if self.helo.trim().is_empty() || self.helo.contains(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "smtp.helo",
                format!("'{}' is not a valid EHLO name", self.helo),
            ));
        }

        let timeouts = &self.timeouts;
        if timeouts.connect_secs == 0 || timeouts.command_secs == 0 || timeouts.data_secs == 0 {
            return Err(ConfigError::invalid(
                "smtp.timeouts",
                "timeouts must be greater than 0",
            ));
        }

        Ok(())
    }
}

mod defaults {
    pub const fn port() -> u16 {
        465
    }

    pub fn helo() -> String {
        "localhost".to_string()
    }

    pub const fn connect() -> u64 {
        30
    }

    pub const fn command() -> u64 {
        30
    }

    pub const fn data() -> u64 {
        120
    }
}

async fn timed<T, F>(
    command: &'static str,
    timeout: Duration,
    future: F,
) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, ClientError>> + Send,
{
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| TransportError::Timeout { command, timeout })?
        .map_err(TransportError::from)
}

fn expect(
    response: Response,
    command: impl Into<String>,
    accept: fn(&Response) -> bool,
) -> Result<Response, TransportError> {
    if accept(&response) {
        Ok(response)
    } else {
        let command = command.into();
        outgoing!(
            level = DEBUG,
            code = response.code,
            permanent = response.is_permanent_error(),
            "Relay refused {command}"
        );
        Err(TransportError::Rejected {
            command,
            code: response.code,
            message: response.message(),
        })
    }
}

/// Delivers through an SMTP relay, one connection per message.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: Arc<SmtpConfig>,
}

impl SmtpTransport {
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid.
    pub fn new(config: SmtpConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        if config.accept_invalid_certs {
            tracing::warn!(
                host = %config.host,
                "TLS certificate validation is disabled for the SMTP relay"
            );
        }

        Ok(Self {
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    async fn connect(&self) -> Result<SmtpClient, TransportError> {
        let config = &self.config;
        let server = config.address();
        let timeout = Duration::from_secs(config.timeouts.connect_secs);

        let connecting = async {
            if config.tls == TlsMode::Implicit {
                SmtpClient::connect_tls(&server, config.host.clone(), config.accept_invalid_certs)
                    .await
            } else {
                SmtpClient::connect(&server, config.host.clone())
                    .await
                    .map(|client| client.accept_invalid_certs(config.accept_invalid_certs))
            }
        };

        let connected = tokio::time::timeout(timeout, connecting).await;

        connected
            .map_err(|_| TransportError::Timeout {
                command: "connect",
                timeout,
            })?
            .map_err(|source| TransportError::Connect { server, source })
    }

    #[tracing::instrument(
        name = "smtp",
        skip_all,
        fields(server = %self.config.address(), message_id = %mail.message_id)
    )]
    async fn deliver(&self, mail: &ComposedMail) -> Result<(), TransportError> {
        let config = &self.config;
        let command = Duration::from_secs(config.timeouts.command_secs);
        let data = Duration::from_secs(config.timeouts.data_secs);

        let mut client = self.connect().await?;

        let greeting = timed("greeting", command, client.read_greeting()).await?;
        expect(greeting, "connection", Response::is_success)?;

        let mut ehlo = expect(
            timed("EHLO", command, client.ehlo(&config.helo)).await?,
            "EHLO",
            Response::is_success,
        )?;

        if config.tls == TlsMode::StartTls {
            expect(
                timed("STARTTLS", command, client.starttls()).await?,
                "STARTTLS",
                Response::is_success,
            )?;

            ehlo = expect(
                timed("EHLO", command, client.ehlo(&config.helo)).await?,
                "EHLO",
                Response::is_success,
            )?;

            outgoing!(level = DEBUG, "TLS negotiated via STARTTLS");
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            if !client.is_tls() {
                tracing::warn!("Sending SMTP credentials over an unencrypted connection");
            }

            let response = timed("AUTH", command, client.auth_plain(username, password)).await?;
            if !response.is_success() {
                return Err(TransportError::Auth(format!(
                    "{} {}",
                    response.code,
                    response.message()
                )));
            }
        }

        let mut parameters = Vec::new();
        if ehlo.advertises("SIZE") {
            parameters.push(format!("SIZE={}", mail.size()));
        }
        if mail.requires_8bit() {
            if !ehlo.advertises("8BITMIME") {
                return Err(TransportError::Unsupported("8BITMIME"));
            }
            parameters.push("BODY=8BITMIME".to_string());
        }

        expect(
            timed("MAIL FROM", command, client.mail_from(&mail.sender, &parameters)).await?,
            "MAIL FROM",
            Response::is_success,
        )?;

        for recipient in &mail.recipients {
            expect(
                timed("RCPT TO", command, client.rcpt_to(recipient)).await?,
                format!("RCPT TO <{recipient}>"),
                Response::is_success,
            )?;
        }

        expect(
            timed("DATA", data, client.data()).await?,
            "DATA",
            Response::is_intermediate,
        )?;
        expect(
            timed("message content", data, client.send_data(&mail.data)).await?,
            "message content",
            Response::is_success,
        )?;

        // The relay has accepted the message at this point
        if let Err(e) = timed("QUIT", command, client.quit()).await {
            tracing::warn!(error = %e, "QUIT failed after successful delivery");
        }

        outgoing!(
            level = INFO,
            recipients = mail.recipients.len(),
            size = mail.size(),
            "Message accepted by relay"
        );

        Ok(())
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, mail: &ComposedMail) -> Result<(), TransportError> {
        self.deliver(mail).await
    }
}

/// Keeps sent messages in memory.
///
/// Used by tests and dry runs. Clones share the same outbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    sent: Arc<Mutex<Vec<ComposedMail>>>,
    failures: Arc<AtomicUsize>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<ComposedMail> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn send(&self, mail: &ComposedMail) -> Result<(), TransportError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if injected {
            return Err(TransportError::Unavailable(
                "injected transport failure".to_string(),
            ));
        }

        self.sent.lock().push(mail.clone());
        Ok(())
    }
}
