//! The mail sending pipeline
//!
//! For one record body: parse the request, fetch its template, fetch every
//! attachment, render, compose and hand the result to the transport. Any
//! failure aborts the whole mail; retrying is the redriver's job.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use hermes_common::{audit::AuditLog, internal, outgoing};
use hermes_redrive::{MessageRecord, RecordHandler};

use crate::{
    Attachment, ComposedMail, MailError, MailRequest, MailTransport, MessageBuilder, ObjectStore,
    Template,
    message::guess_content_type,
    request::AttachmentRef,
    template::render,
};

pub struct MailSender {
    templates: Arc<dyn ObjectStore>,
    attachments: Arc<dyn ObjectStore>,
    transport: Arc<dyn MailTransport>,
    default_from: Option<String>,
    audit: AuditLog,
}

impl std::fmt::Debug for MailSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSender")
            .field("templates", &self.templates.location())
            .field("attachments", &self.attachments.location())
            .field("default_from", &self.default_from)
            .finish_non_exhaustive()
    }
}

impl MailSender {
    /// `default_from` is used for requests that carry no sender.
    #[must_use]
    pub fn new(
        templates: Arc<dyn ObjectStore>,
        attachments: Arc<dyn ObjectStore>,
        transport: Arc<dyn MailTransport>,
        default_from: Option<String>,
    ) -> Self {
        Self {
            templates,
            attachments,
            transport,
            default_from,
            audit: AuditLog::default(),
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Send the mail described by `payload`.
    ///
    /// # Errors
    ///
    /// Returns the [`MailError`] of the first step that failed. Nothing is
    /// sent unless every step before delivery succeeded.
    pub async fn send(&self, payload: &str) -> Result<(), MailError> {
        let request = MailRequest::parse(payload)?;
        let mail = self.compose(&request).await?;

        if let Err(e) = self.transport.send(&mail).await {
            outgoing!(
                level = WARN,
                message_id = %mail.message_id,
                permanent = e.is_permanent(),
                error = %e,
                "Delivery failed"
            );
            return Err(e.into());
        }

        self.audit.mail_sent(
            &request.template,
            &mail.recipients,
            request.attachments.len(),
            mail.size(),
        );

        Ok(())
    }

    /// Run every step up to delivery and return the message that would be
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns the [`MailError`] of the first step that failed.
    pub async fn compose(&self, request: &MailRequest) -> Result<ComposedMail, MailError> {
        internal!(
            level = DEBUG,
            template = %request.template,
            attachments = request.attachments.len(),
            "Composing mail"
        );

        let template = self
            .templates
            .get(&request.template)
            .await
            .map_err(|source| MailError::TemplateFetch {
                key: request.template.clone(),
                source,
            })?;

        let attachments =
            try_join_all(request.attachments.iter().map(|a| self.fetch_attachment(a))).await?;

        let template = Template::parse(&request.template, &template)?;
        let body = template.render_body(&request.variables)?;

        let subject = request
            .subject
            .as_deref()
            .or_else(|| template.subject())
            .map(|subject| render(subject, &request.variables))
            .transpose()?;

        let from = request
            .from
            .as_ref()
            .or(self.default_from.as_ref())
            .ok_or_else(|| MailError::Compose("no sender address and no default".to_string()))?;

        let mut builder = MessageBuilder::new()
            .from(from)
            .to_multiple(&request.to)
            .cc_multiple(&request.cc)
            .bcc_multiple(&request.bcc)
            .content_type(template.content_type())
            .body(body);

        if let Some(subject) = subject {
            builder = builder.subject(subject);
        }
        if let Some(reply_to) = &request.reply_to {
            builder = builder.reply_to(reply_to);
        }

        attachments
            .into_iter()
            .fold(builder, MessageBuilder::attach)
            .build()
    }

    async fn fetch_attachment(&self, attachment: &AttachmentRef) -> Result<Attachment, MailError> {
        let data = self
            .attachments
            .get(&attachment.key)
            .await
            .map_err(|source| MailError::AttachmentFetch {
                key: attachment.key.clone(),
                source,
            })?;

        let filename = attachment.filename().to_string();
        let content_type = attachment
            .content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(&filename).to_string());

        Ok(Attachment {
            filename,
            content_type,
            data,
        })
    }
}

#[async_trait]
impl RecordHandler for MailSender {
    type Error = MailError;

    async fn handle(&self, record: &MessageRecord) -> Result<(), MailError> {
        self.send(record.body()).await
    }
}
