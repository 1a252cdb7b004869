//! Mail templates
//!
//! A template is UTF-8 text. It may start with a header block of `Subject:`
//! and `Content-Type:` lines, terminated by a blank line:
//!
//! ```text
//! Subject: Welcome, {{ name }}
//! Content-Type: text/html
//!
//! <p>Hello {{ name }}</p>
//! ```
//!
//! `{{ name }}` placeholders are replaced with the request's variables. HTML
//! bodies get their substituted values escaped.

use std::collections::BTreeMap;

use crate::{MailError, Variable};

const SUBJECT: &str = "subject";
const CONTENT_TYPE: &str = "content-type";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    subject: Option<String>,
    content_type: String,
    body: String,
}

impl Template {
    /// Parse the template stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Render`] if the template is not UTF-8 or its
    /// header block holds an unknown header.
    pub fn parse(key: &str, data: &[u8]) -> Result<Self, MailError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| MailError::Render(format!("template {key} is not valid UTF-8: {e}")))?;

        let mut subject = None;
        let mut content_type = None;
        let mut body = text;

        if header(first_line(text)).is_some() {
            let mut rest = text;

            loop {
                let (line, remainder) = split_line(rest);
                rest = remainder;

                if line.is_empty() {
                    break;
                }

                match header(line) {
                    Some((SUBJECT, value)) => subject = Some(value.to_string()),
                    Some((_, value)) => {
                        let mime = value.split(';').next().unwrap_or(value);
                        content_type = Some(mime.trim().to_ascii_lowercase());
                    }
                    None => {
                        return Err(MailError::Render(format!(
                            "template {key} has an unsupported header line '{line}'"
                        )));
                    }
                }

                if rest.is_empty() {
                    break;
                }
            }

            body = rest;
        }

        Ok(Self {
            subject,
            content_type: content_type.unwrap_or_else(|| content_type_for(key).to_string()),
            body: body.to_string(),
        })
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// The body's MIME type, without parameters.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    #[must_use]
    pub fn is_html(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("text/html")
    }

    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Render the body with `variables`.
    ///
    /// # Errors
    ///
    /// Returns [`MailError::Render`] if a placeholder is malformed or names an
    /// unknown variable.
    pub fn render_body(&self, variables: &BTreeMap<String, Variable>) -> Result<String, MailError> {
        render_with(&self.body, variables, self.is_html())
    }
}

/// Render `text`, replacing each `{{ name }}` with its variable.
///
/// # Errors
///
/// Returns [`MailError::Render`] if a placeholder is malformed or names an
/// unknown variable.
pub fn render(text: &str, variables: &BTreeMap<String, Variable>) -> Result<String, MailError> {
    render_with(text, variables, false)
}

fn render_with(
    text: &str,
    variables: &BTreeMap<String, Variable>,
    escape: bool,
) -> Result<String, MailError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| MailError::Render("unterminated placeholder".to_string()))?;

        let name = after[..end].trim();
        if name.is_empty() {
            return Err(MailError::Render("empty placeholder".to_string()));
        }

        let value = variables
            .get(name)
            .ok_or_else(|| MailError::Render(format!("unknown variable '{name}'")))?
            .to_string();

        if escape {
            escape_html(&value, &mut out);
        } else {
            out.push_str(&value);
        }

        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn escape_html(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
}

/// Guess a body type from the template key.
#[must_use]
pub fn content_type_for(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "html" || ext == "htm" => "text/html",
        _ => "text/plain",
    }
}

fn first_line(text: &str) -> &str {
    split_line(text).0
}

/// Split off the first line, accepting both LF and CRLF.
fn split_line(text: &str) -> (&str, &str) {
    let (line, rest) = text.split_once('\n').unwrap_or((text, ""));
    (line.strip_suffix('\r').unwrap_or(line), rest)
}

fn header(line: &str) -> Option<(&'static str, &str)> {
    let (name, value) = line.split_once(':')?;

    let name = match name.trim() {
        name if name.eq_ignore_ascii_case(SUBJECT) => SUBJECT,
        name if name.eq_ignore_ascii_case(CONTENT_TYPE) => CONTENT_TYPE,
        _ => return None,
    };

    Some((name, value.trim()))
}
