//! MIME message composition

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::{MailError, request::envelope_address};

/// Encoded line length for base64 bodies.
const BASE64_LINE: usize = 76;

/// Longest line allowed by RFC 5322, CRLF excluded.
const MAX_LINE: usize = 998;

/// Encoded line length for quoted-printable bodies, soft break included.
const QP_LINE: usize = 76;

/// UTF-8 bytes per RFC 2047 encoded-word, keeping each word within 75
/// characters.
const ENCODED_WORD_BYTES: usize = 45;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message ready for the transport: envelope plus RFC 5322 content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMail {
    /// Value of the `Message-ID` header, angle brackets included
    pub message_id: String,
    /// Envelope sender (`MAIL FROM`)
    pub sender: String,
    /// Envelope recipients (`RCPT TO`), Bcc included
    pub recipients: Vec<String>,
    /// Headers and body, CRLF line endings
    pub data: String,
}

impl ComposedMail {
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Whether the content holds octets outside 7-bit ASCII, which a relay
    /// only takes with `BODY=8BITMIME`.
    #[must_use]
    pub fn requires_8bit(&self) -> bool {
        !self.data.is_ascii()
    }
}

/// Builds a MIME message from its parts.
///
/// Without attachments the message is a single `text/*` part, otherwise a
/// `multipart/mixed` with base64 encoded attachments. Bcc recipients only
/// make it into the envelope.
///
/// The output is always 7-bit clean: non-ASCII header text becomes RFC 2047
/// encoded-words, and a body that is not plain ASCII with short lines is
/// sent quoted-printable.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    reply_to: Option<String>,
    subject: Option<String>,
    content_type: Option<String>,
    body: Option<String>,
    attachments: Vec<Attachment>,
    date: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    #[must_use]
    pub fn to_multiple(mut self, addresses: &[impl AsRef<str>]) -> Self {
        self.to
            .extend(addresses.iter().map(|a| a.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn cc_multiple(mut self, addresses: &[impl AsRef<str>]) -> Self {
        self.cc
            .extend(addresses.iter().map(|a| a.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn bcc_multiple(mut self, addresses: &[impl AsRef<str>]) -> Self {
        self.bcc
            .extend(addresses.iter().map(|a| a.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// MIME type of the body, `text/plain` when unset.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(content.into());
        self
    }

    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Use a fixed `Date` header instead of the current time.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// # Errors
    ///
    /// Returns [`MailError::Compose`] if the sender or every recipient is
    /// missing, an address is invalid or a header value spans lines.
    pub fn build(self) -> Result<ComposedMail, MailError> {
        let from = self
            .from
            .as_deref()
            .ok_or_else(|| MailError::Compose("no sender address".to_string()))?;
        let sender = address(from)?;

        let recipients = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|recipient| address(recipient))
            .collect::<Result<Vec<_>, _>>()?;

        if recipients.is_empty() {
            return Err(MailError::Compose("no recipients".to_string()));
        }

        let domain = sender.rsplit_once('@').map_or("localhost", |(_, d)| d);
        let message_id = format!("<{}@{domain}>", Ulid::new());

        let mut data = String::with_capacity(
            1024 + self.attachments.iter().map(|a| a.data.len() * 4 / 3).sum::<usize>(),
        );

        push_address_header(&mut data, "From", &[from])?;
        if !self.to.is_empty() {
            push_address_header(&mut data, "To", &self.to)?;
        }
        if !self.cc.is_empty() {
            push_address_header(&mut data, "Cc", &self.cc)?;
        }
        if let Some(reply_to) = &self.reply_to {
            address(reply_to)?;
            push_address_header(&mut data, "Reply-To", &[reply_to])?;
        }
        if let Some(subject) = &self.subject {
            check_header("Subject", subject)?;
            push_raw_header(&mut data, "Subject", &encode_header_value(subject));
        }
        push_header(
            &mut data,
            "Date",
            &self.date.unwrap_or_else(Utc::now).to_rfc2822(),
        )?;
        push_header(&mut data, "Message-ID", &message_id)?;
        push_header(&mut data, "MIME-Version", "1.0")?;

        let content_type = self.content_type.as_deref().unwrap_or("text/plain");
        let body = normalize_line_endings(self.body.as_deref().unwrap_or_default());
        let encoding = BodyEncoding::for_body(&body);
        let body = encoding.encode(&body);

        if self.attachments.is_empty() {
            push_body_headers(&mut data, content_type, encoding);
            data.push_str("\r\n");
            data.push_str(&body);
        } else {
            let boundary = format!("=_hermes_{}", Ulid::new());

            data.push_str(&format!(
                "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
            ));

            data.push_str(&format!("--{boundary}\r\n"));
            push_body_headers(&mut data, content_type, encoding);
            data.push_str("\r\n");
            data.push_str(&body);
            if !body.ends_with("\r\n") {
                data.push_str("\r\n");
            }

            for attachment in &self.attachments {
                data.push_str(&format!("--{boundary}\r\n"));
                push_header(&mut data, "Content-Type", &attachment.content_type)?;
                data.push_str("Content-Transfer-Encoding: base64\r\n");
                data.push_str(&format!(
                    "Content-Disposition: attachment; {}\r\n\r\n",
                    filename_parameter(&attachment.filename)
                ));
                data.push_str(&base64_wrapped(&attachment.data));
            }

            data.push_str(&format!("--{boundary}--\r\n"));
        }

        Ok(ComposedMail {
            message_id,
            sender,
            recipients,
            data,
        })
    }
}

fn address(value: &str) -> Result<String, MailError> {
    envelope_address(value).ok_or_else(|| MailError::Compose(format!("invalid address '{value}'")))
}

/// Header values are checked before encoding, so injected line breaks are
/// caught even in text that would end up as an encoded-word.
fn check_header(name: &str, value: &str) -> Result<(), MailError> {
    if name.contains(['\r', '\n', ':']) || value.contains(['\r', '\n']) {
        return Err(MailError::Compose(format!(
            "header {name} must fit on a single line"
        )));
    }
    Ok(())
}

fn push_raw_header(data: &mut String, name: &str, value: &str) {
    data.push_str(name);
    data.push_str(": ");
    data.push_str(value);
    data.push_str("\r\n");
}

fn push_header(data: &mut String, name: &str, value: &str) -> Result<(), MailError> {
    check_header(name, value)?;
    push_raw_header(data, name, value);
    Ok(())
}

fn push_address_header(
    data: &mut String,
    name: &str,
    addresses: &[impl AsRef<str>],
) -> Result<(), MailError> {
    let encoded = addresses
        .iter()
        .map(|mailbox| {
            check_header(name, mailbox.as_ref())?;
            encode_mailbox(mailbox.as_ref())
        })
        .collect::<Result<Vec<_>, _>>()?;

    push_raw_header(data, name, &encoded.join(", "));
    Ok(())
}

/// Encode the display name of a mailbox, the address itself stays ASCII.
fn encode_mailbox(mailbox: &str) -> Result<String, MailError> {
    if mailbox.is_ascii() {
        return Ok(mailbox.to_string());
    }

    let info = mailparse::addrparse(mailbox)
        .ok()
        .and_then(|list| list.extract_single_info())
        .filter(|info| info.addr.is_ascii())
        .ok_or_else(|| MailError::Compose(format!("invalid address '{mailbox}'")))?;

    Ok(match info.display_name {
        Some(name) if !name.is_empty() => {
            format!("{} <{}>", encode_header_value(&name), info.addr)
        }
        _ => info.addr,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyEncoding {
    SevenBit,
    QuotedPrintable,
}

impl BodyEncoding {
    /// `body` must already use CRLF line endings.
    fn for_body(body: &str) -> Self {
        let plain = body.is_ascii()
            && !body.contains('\0')
            && body.split("\r\n").all(|line| line.len() <= MAX_LINE);

        if plain {
            Self::SevenBit
        } else {
            Self::QuotedPrintable
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::SevenBit => "7bit",
            Self::QuotedPrintable => "quoted-printable",
        }
    }

    fn encode(self, body: &str) -> String {
        match self {
            Self::SevenBit => body.to_string(),
            Self::QuotedPrintable => quoted_printable(body),
        }
    }
}

fn push_body_headers(data: &mut String, content_type: &str, encoding: BodyEncoding) {
    data.push_str(&format!("Content-Type: {content_type}; charset=utf-8\r\n"));
    data.push_str(&format!("Content-Transfer-Encoding: {}\r\n", encoding.name()));
}

/// RFC 2045 quoted-printable of CRLF separated text.
fn quoted_printable(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 2);
    let mut lines = text.split("\r\n").peekable();

    while let Some(line) = lines.next() {
        let bytes = line.as_bytes();
        let mut width = 0;

        for (i, &byte) in bytes.iter().enumerate() {
            let last = i + 1 == bytes.len();
            // Trailing whitespace would be stripped in transit
            let literal = matches!(byte, b'!'..=b'<' | b'>'..=b'~')
                || (matches!(byte, b' ' | b'\t') && !last);
            let len = if literal { 1 } else { 3 };

            // Room for the soft break unless nothing follows on this line
            let limit = if last { QP_LINE } else { QP_LINE - 1 };
            if width + len > limit {
                out.push_str("=\r\n");
                width = 0;
            }

            if literal {
                out.push(char::from(byte));
            } else {
                out.push_str(&format!("={byte:02X}"));
            }
            width += len;
        }

        if lines.peek().is_some() {
            out.push_str("\r\n");
        }
    }

    out
}

/// RFC 2047 encoded-words for non-ASCII header values, folded so no word
/// runs past 75 characters.
fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    for (index, ch) in value.char_indices() {
        if index + ch.len_utf8() - start > ENCODED_WORD_BYTES {
            words.push(&value[start..index]);
            start = index;
        }
    }
    words.push(&value[start..]);

    words
        .iter()
        .map(|word| format!("=?UTF-8?B?{}?=", STANDARD.encode(word)))
        .collect::<Vec<_>>()
        .join("\r\n ")
}

/// `filename` parameter of `Content-Disposition`, RFC 2231 encoded when the
/// name is not ASCII.
fn filename_parameter(filename: &str) -> String {
    let cleaned: String = filename.chars().filter(|c| !c.is_control()).collect();

    if cleaned.is_ascii() {
        let quoted: String = cleaned
            .chars()
            .map(|c| if c == '"' || c == '\\' { '_' } else { c })
            .collect();
        return format!("filename=\"{quoted}\"");
    }

    let mut encoded = String::from("filename*=UTF-8''");
    for byte in cleaned.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

/// Base64 with CRLF every 76 characters, ending in CRLF.
fn base64_wrapped(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2 + 2);

    for (i, ch) in encoded.chars().enumerate() {
        if i > 0 && i % BASE64_LINE == 0 {
            out.push_str("\r\n");
        }
        out.push(ch);
    }

    if !out.is_empty() {
        out.push_str("\r\n");
    }
    out
}

/// Guess an attachment's MIME type from its file name.
#[must_use]
pub fn guess_content_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "txt" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "ics" => "text/calendar",
        "pdf" => "application/pdf",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "zip" => "application/zip",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}
