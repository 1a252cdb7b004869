//! Audit events for the record lifecycle
//!
//! Every record handed to the redriver ends in exactly one of these terminal
//! events, which makes the audit trail the place to reconcile a batch:
//!
//! - `RecordDelivered`: the handler succeeded (possibly after retries)
//! - `RecordRetrying`: an attempt failed and another one will follow
//! - `RecordQuarantined`: the retry budget ran out and the record was redriven
//! - `MailSent`: the mail sender handed a composed message to the transport
//!
//! Recipient addresses can be redacted through [`AuditConfig`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Emit audit events at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Replace the local part of recipient addresses with `[REDACTED]`
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Handle used to emit audit events.
///
/// Cheap to clone; components that emit audit events hold their own copy
/// instead of reading process-wide state.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    config: Arc<AuditConfig>,
}

/// Redact email address if redaction is enabled
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if redact {
        if let Some((_, domain)) = email.rsplit_once('@') {
            format!("[REDACTED]@{domain}")
        } else {
            "[REDACTED]".to_string()
        }
    } else {
        email.to_string()
    }
}

/// Redact multiple email addresses
#[must_use]
pub fn redact_emails(emails: &[String], redact: bool) -> Vec<String> {
    emails.iter().map(|e| redact_email(e, redact)).collect()
}

impl AuditLog {
    #[must_use]
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Logged when a record's handler succeeds.
    pub fn record_delivered(&self, record_id: &str, attempts: u32, duration_ms: u128) {
        if !self.config.enabled {
            return;
        }

        tracing::event!(
            tracing::Level::INFO,
            event = "RecordDelivered",
            record_id = %record_id,
            attempts = attempts,
            duration_ms = duration_ms,
            "Audit: Record delivered"
        );
    }

    /// Logged for every failed attempt that still has budget left.
    pub fn record_retrying(&self, record_id: &str, attempt: u32, remaining: u32, error: &str) {
        if !self.config.enabled {
            return;
        }

        tracing::event!(
            tracing::Level::WARN,
            event = "RecordRetrying",
            record_id = %record_id,
            attempt = attempt,
            remaining = remaining,
            error = %error,
            "Audit: Attempt failed, retrying"
        );
    }

    /// Logged once a record has exhausted its budget and was redriven.
    ///
    /// `quarantine_error` is set when the quarantine write itself failed.
    pub fn record_quarantined(
        &self,
        record_id: &str,
        target: &str,
        attempts: u32,
        error: &str,
        quarantine_error: Option<&str>,
    ) {
        if !self.config.enabled {
            return;
        }

        tracing::event!(
            tracing::Level::ERROR,
            event = "RecordQuarantined",
            record_id = %record_id,
            target = %target,
            attempts = attempts,
            error = %error,
            quarantine_error = quarantine_error,
            "Audit: Record quarantined after exhausting retries"
        );
    }

    /// Logged when a composed mail was accepted by the outbound transport.
    pub fn mail_sent(&self, template: &str, recipients: &[String], attachments: usize, size: usize) {
        if !self.config.enabled {
            return;
        }

        let recipients = redact_emails(recipients, self.config.redact_recipients);

        tracing::event!(
            tracing::Level::INFO,
            event = "MailSent",
            template = %template,
            recipients = ?recipients,
            recipient_count = recipients.len(),
            attachments = attachments,
            size = size,
            "Audit: Mail handed to transport"
        );
    }
}
