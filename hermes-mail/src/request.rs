//! Mail request payloads
//!
//! A record body is a JSON object describing one mail:
//!
//! ```json
//! {
//!   "from": "Billing <billing@example.com>",
//!   "to": ["alice@example.com"],
//!   "subject": "Invoice {{ number }}",
//!   "template": "invoices/monthly.html",
//!   "attachments": ["invoices/2024-01.pdf", { "key": "terms.txt", "filename": "Terms.txt" }],
//!   "variables": { "number": 42, "name": "Alice" }
//! }
//! ```

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Deserializer, Serialize};

use crate::MailError;

/// A template variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variable {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Number(number) => write!(f, "{number}"),
            Self::Flag(flag) => write!(f, "{flag}"),
        }
    }
}

impl From<&str> for Variable {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// An attachment to fetch from the attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AttachmentSpec")]
pub struct AttachmentRef {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl AttachmentRef {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            filename: None,
            content_type: None,
        }
    }

    /// The file name shown to the recipient: the explicit one, or the last
    /// segment of the key.
    #[must_use]
    pub fn filename(&self) -> &str {
        self.filename
            .as_deref()
            .unwrap_or_else(|| self.key.rsplit('/').next().unwrap_or(&self.key))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AttachmentSpec {
    Key(String),
    Detailed {
        key: String,
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        content_type: Option<String>,
    },
}

impl From<AttachmentSpec> for AttachmentRef {
    fn from(spec: AttachmentSpec) -> Self {
        match spec {
            AttachmentSpec::Key(key) => Self::new(key),
            AttachmentSpec::Detailed {
                key,
                filename,
                content_type,
            } => Self {
                key,
                filename,
                content_type,
            },
        }
    }
}

/// One mail to send, as carried by a record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub bcc: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    pub template: String,

    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,

    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(address) => vec![address],
        OneOrMany::Many(addresses) => addresses,
    })
}

impl MailRequest {
    /// Parse and validate a record body.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Parse`] if the body is not a valid request.
    pub fn parse(payload: &str) -> Result<Self, MailError> {
        let request: Self =
            serde_json::from_str(payload).map_err(|e| MailError::Parse(e.to_string()))?;
        request.validate()?;
        Ok(request)
    }

    /// # Errors
    ///
    /// Returns [`MailError::Parse`] if there is no recipient, the template
    /// key is empty or any address cannot be parsed.
    pub fn validate(&self) -> Result<(), MailError> {
        if self.template.trim().is_empty() {
            return Err(MailError::Parse("template key is empty".to_string()));
        }

        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(MailError::Parse(
                "at least one recipient is required".to_string(),
            ));
        }

        let addresses = self
            .from
            .iter()
            .chain(&self.to)
            .chain(&self.cc)
            .chain(&self.bcc)
            .chain(&self.reply_to);

        for address in addresses {
            if envelope_address(address).is_none() {
                return Err(MailError::Parse(format!("invalid address '{address}'")));
            }
        }

        if let Some(attachment) = self.attachments.iter().find(|a| a.key.trim().is_empty()) {
            return Err(MailError::Parse(format!(
                "attachment key is empty (filename: {})",
                attachment.filename()
            )));
        }

        Ok(())
    }

    /// Every address the mail is delivered to, Bcc included.
    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to.iter().chain(&self.cc).chain(&self.bcc)
    }
}

/// Extract the bare `local@domain` part of a header-style address such as
/// `Alice <alice@example.com>`.
///
/// Returns `None` unless `value` is exactly one mailbox.
#[must_use]
pub fn envelope_address(value: &str) -> Option<String> {
    let info = mailparse::addrparse(value).ok()?.extract_single_info()?;

    let (local, domain) = info.addr.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }

    Some(info.addr)
}
