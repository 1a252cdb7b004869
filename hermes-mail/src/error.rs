use std::{io, time::Duration};

use thiserror::Error;

use crate::client::ClientError;

/// Errors raised by an [`ObjectStore`](crate::ObjectStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object {key} not found in {location}")]
    NotFound { location: String, key: String },

    /// Empty, absolute or escaping keys are rejected before touching storage.
    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("I/O error reading {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("Reading {key} timed out after {timeout:?}")]
    Timeout { key: String, timeout: Duration },
}

/// Errors raised while handing a message to the relay.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: ClientError,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },

    #[error("Server rejected {command}: {code} {message}")]
    Rejected {
        command: String,
        code: u16,
        message: String,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Relay does not support {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Whether the relay answered with a 5xx reply.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 500)
    }
}

/// Why one attempt at sending a mail failed.
///
/// Every variant is retried by the redriver; none of them is retried here.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Invalid mail request: {0}")]
    Parse(String),

    #[error("Unable to fetch template {key}: {source}")]
    TemplateFetch {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Unable to fetch attachment {key}: {source}")]
    AttachmentFetch {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Unable to render template: {0}")]
    Render(String),

    #[error("Unable to compose message: {0}")]
    Compose(String),

    #[error("Unable to send mail: {0}")]
    Delivery(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::NotFound {
            location: "attachments".to_string(),
            key: "missing.pdf".to_string(),
        };
        assert_eq!(err.to_string(), "Object missing.pdf not found in attachments");

        let err = StoreError::Timeout {
            key: "a".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "Reading a timed out after 2s");
    }

    #[test]
    fn test_mail_error_display() {
        let err = MailError::AttachmentFetch {
            key: "missing.pdf".to_string(),
            source: StoreError::NotFound {
                location: "attachments".to_string(),
                key: "missing.pdf".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "Unable to fetch attachment missing.pdf: Object missing.pdf not found in attachments"
        );

        let err = MailError::from(TransportError::Rejected {
            command: "RCPT TO".to_string(),
            code: 550,
            message: "No such user".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Unable to send mail: Server rejected RCPT TO: 550 No such user"
        );
    }

    #[test]
    fn test_permanent_rejection() {
        let rejected = |code| TransportError::Rejected {
            command: "MAIL FROM".to_string(),
            code,
            message: String::new(),
        };
        assert!(rejected(550).is_permanent());
        assert!(!rejected(451).is_permanent());
        assert!(!TransportError::Auth("bad".to_string()).is_permanent());
    }
}
