use std::{
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use hermes_common::{Signal, audit::AuditLog, internal};
use hermes_mail::{MailSender, MailTransport, MemoryTransport, SmtpTransport};
use hermes_redrive::{
    BatchReport, DirectoryQuarantine, MemoryQuarantine, MessageRecord, QuarantineSink, Redriver,
};
use tokio::{io::AsyncReadExt, sync::broadcast};

use crate::config::Config;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, finishing in-flight records");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, finishing in-flight records");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

/// Parse a batch: a JSON array of records.
///
/// # Errors
///
/// Returns an error if `content` is not a list of records.
pub fn parse_batch(content: &str) -> anyhow::Result<Vec<MessageRecord>> {
    serde_json::from_str(content).context("Batch is not a JSON array of records")
}

/// Read a batch from `source`, or from stdin when it is `None` or `-`.
///
/// # Errors
///
/// Returns an error if the batch cannot be read or parsed.
pub async fn read_batch(source: Option<&Path>) -> anyhow::Result<Vec<MessageRecord>> {
    let content = match source {
        Some(path) if path != Path::new("-") => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read batch from {}", path.display()))?,
        _ => {
            let mut content = String::new();
            tokio::io::stdin()
                .read_to_string(&mut content)
                .await
                .context("Failed to read batch from stdin")?;
            content
        }
    };

    parse_batch(&content)
}

/// Everything needed to run batches, built once from the configuration.
pub struct Hermes {
    sender: MailSender,
    redriver: Redriver,
    /// Captures composed mails when running dry
    dry_run: Option<MemoryTransport>,
}

impl Hermes {
    /// Validate `config` and build the stores, transport, quarantine and
    /// redriver it describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the quarantine
    /// directory cannot be created.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let templates = config.template_store.build("template_store")?;
        let attachments = config.attachment_store.build("attachment_store")?;

        let (transport, dry_run): (Arc<dyn MailTransport>, _) = if config.dry_run {
            internal!(level = WARN, "Dry run, no mail will leave this process");
            let transport = MemoryTransport::new();
            (Arc::new(transport.clone()), Some(transport))
        } else {
            (Arc::new(SmtpTransport::new(config.smtp.clone())?), None)
        };

        let quarantine: Arc<dyn QuarantineSink> = match &config.queue.quarantine {
            Some(path) => Arc::new(
                DirectoryQuarantine::open(path)
                    .await
                    .with_context(|| format!("Unable to open quarantine {}", path.display()))?,
            ),
            // Only reachable in a dry run, validation requires a directory otherwise
            None => {
                internal!(
                    level = WARN,
                    "Dry run without quarantine directory, exhausted records are only reported"
                );
                Arc::new(MemoryQuarantine::new())
            }
        };

        let audit = AuditLog::new(config.audit.clone());

        let sender = MailSender::new(templates, attachments, transport, config.default_from.clone())
            .with_audit(audit.clone());

        let span = tracing::info_span!(
            "batch",
            queue = config.queue.identifier.as_deref().unwrap_or("unknown"),
            region = config.region.as_deref().unwrap_or("unknown"),
        );

        let redriver = Redriver::new(config.retry.clone(), quarantine)?
            .with_concurrency(config.concurrency)?
            .with_span(span)
            .with_audit(audit);

        Ok(Self {
            sender,
            redriver,
            dry_run,
        })
    }

    /// Run one batch, stopping early once `shutdown` carries a signal.
    pub async fn process(
        &self,
        records: Vec<MessageRecord>,
        shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> BatchReport {
        let report = self
            .redriver
            .process_with_report(records, &self.sender, shutdown)
            .await;

        if let Some(transport) = &self.dry_run {
            for mail in transport.sent() {
                internal!(
                    level = INFO,
                    message_id = %mail.message_id,
                    sender = %mail.sender,
                    recipients = ?mail.recipients,
                    size = mail.size(),
                    "Dry run composed mail"
                );
            }
        }

        report
    }

    /// Mails composed so far when running dry.
    pub fn dry_run_transport(&self) -> Option<&MemoryTransport> {
        self.dry_run.as_ref()
    }

    /// Run one batch with SIGINT/SIGTERM wired to a graceful stop.
    ///
    /// # Errors
    ///
    /// Returns the aggregated batch error if any record failed or was not
    /// processed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self, records: Vec<MessageRecord>) -> anyhow::Result<()> {
        let mut receiver = SHUTDOWN_BROADCAST.subscribe();
        let signals = tokio::spawn(shutdown());

        internal!(
            level = INFO,
            records = records.len(),
            quarantine = %self.redriver.quarantine_target(),
            "Processing batch"
        );

        let report = self.process(records, Some(&mut receiver)).await;
        signals.abort();

        internal!(
            level = INFO,
            delivered = report.delivered(),
            quarantined = report.quarantined(),
            unprocessed = report.unprocessed.len(),
            "Batch finished"
        );

        report.into_result()?;
        Ok(())
    }
}
