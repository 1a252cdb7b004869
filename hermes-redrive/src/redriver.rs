//! Batch orchestration
//!
//! The [`Redriver`] takes an ordered batch of records and a [`RecordHandler`],
//! and guarantees that every record ends up either handled or quarantined
//! with its failure recorded. Records are isolated from each other: a record
//! exhausting its budget only affects the aggregated result.

use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use futures_util::{StreamExt, stream::FuturesUnordered};
use hermes_common::{ConfigError, Signal, audit::AuditLog, internal, tracing};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{Instrument, Span};

use crate::{
    AttemptError, BatchError, MessageRecord, QuarantineSink, QuarantinedRecord, RecordFailure,
    RecordHandler, RecordId, RetryPolicy,
};

/// Terminal state of one record within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler succeeded on attempt number `attempts`
    Succeeded { attempts: u32 },
    /// Every attempt failed and the record was handed to quarantine
    FailedExhausted { attempts: u32 },
}

impl DispatchOutcome {
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts } | Self::FailedExhausted { attempts } => *attempts,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub id: RecordId,
    pub outcome: DispatchOutcome,
}

/// Everything that happened to one batch.
///
/// Outcomes are listed in completion order, which equals input order when
/// records are processed one at a time.
#[derive(Debug)]
pub struct BatchReport {
    pub total: usize,
    pub outcomes: Vec<RecordOutcome>,
    pub failures: Vec<RecordFailure>,
    pub unprocessed: Vec<RecordId>,
}

impl BatchReport {
    const fn new(total: usize) -> Self {
        Self {
            total,
            outcomes: Vec::new(),
            failures: Vec::new(),
            unprocessed: Vec::new(),
        }
    }

    #[must_use]
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.outcome.is_success())
            .count()
    }

    #[must_use]
    pub fn quarantined(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<DispatchOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.id.as_str() == id)
            .map(|outcome| outcome.outcome)
    }

    /// Whether every record was handled successfully.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.unprocessed.is_empty()
    }

    /// Collapse the report into the batch result.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] if any record failed or was not processed.
    pub fn into_result(self) -> Result<(), BatchError> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(BatchError {
                total: self.total,
                failures: self.failures,
                unprocessed: self.unprocessed,
            })
        }
    }

    fn push(&mut self, result: RecordResult) {
        self.outcomes.push(RecordOutcome {
            id: result.id,
            outcome: result.outcome,
        });

        if let Some(failure) = result.failure {
            self.failures.push(failure);
        }
    }
}

struct RecordResult {
    id: RecordId,
    outcome: DispatchOutcome,
    failure: Option<RecordFailure>,
}

/// Sticky view over an optional shutdown channel.
struct ShutdownWatch<'a> {
    receiver: Option<&'a mut broadcast::Receiver<Signal>>,
    triggered: bool,
}

impl<'a> ShutdownWatch<'a> {
    const fn new(receiver: Option<&'a mut broadcast::Receiver<Signal>>) -> Self {
        Self {
            receiver,
            triggered: false,
        }
    }

    fn triggered(&mut self) -> bool {
        if self.triggered {
            return true;
        }

        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };

        self.triggered = match receiver.try_recv() {
            Ok(Signal::Shutdown | Signal::Finalised) | Err(TryRecvError::Lagged(_)) => true,
            Err(TryRecvError::Empty | TryRecvError::Closed) => false,
        };

        self.triggered
    }
}

/// Runs a handler over a batch of records with a bounded retry budget.
pub struct Redriver {
    policy: RetryPolicy,
    quarantine: Arc<dyn QuarantineSink>,
    concurrency: NonZeroUsize,
    span: Span,
    audit: AuditLog,
}

impl std::fmt::Debug for Redriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redriver")
            .field("policy", &self.policy)
            .field("quarantine", &self.quarantine.target())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Redriver {
    /// Create a redriver with the given budget and quarantine target.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the policy is invalid, most notably when
    /// `max_attempts` is zero.
    pub fn new(
        policy: RetryPolicy,
        quarantine: Arc<dyn QuarantineSink>,
    ) -> Result<Self, ConfigError> {
        policy.validate()?;

        let span = tracing::info_span!("redrive", target = %quarantine.target());

        Ok(Self {
            policy,
            quarantine,
            concurrency: NonZeroUsize::MIN,
            span,
            audit: AuditLog::default(),
        })
    }

    /// Handle up to `concurrency` records at the same time.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `concurrency` is zero.
    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self, ConfigError> {
        self.concurrency = NonZeroUsize::new(concurrency)
            .ok_or_else(|| ConfigError::invalid("concurrency", "must be at least 1"))?;
        Ok(self)
    }

    /// Emit every event of this redriver inside `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[must_use]
    pub fn quarantine_target(&self) -> &str {
        self.quarantine.target()
    }

    /// Process a batch and report only whether it fully succeeded.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchError`] naming every record that exhausted its budget
    /// or was left unprocessed because of `shutdown`.
    pub async fn process<H>(
        &self,
        records: Vec<MessageRecord>,
        handler: &H,
        shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> Result<(), BatchError>
    where
        H: RecordHandler + ?Sized,
    {
        self.process_with_report(records, handler, shutdown)
            .await
            .into_result()
    }

    /// Process a batch and report the outcome of every record.
    ///
    /// `shutdown` is polled before each record is started; once a signal is
    /// seen, in-flight records finish and the rest are reported unprocessed.
    pub async fn process_with_report<H>(
        &self,
        records: Vec<MessageRecord>,
        handler: &H,
        shutdown: Option<&mut broadcast::Receiver<Signal>>,
    ) -> BatchReport
    where
        H: RecordHandler + ?Sized,
    {
        self.run_batch(records, handler, ShutdownWatch::new(shutdown))
            .instrument(self.span.clone())
            .await
    }

    async fn run_batch<H>(
        &self,
        records: Vec<MessageRecord>,
        handler: &H,
        mut shutdown: ShutdownWatch<'_>,
    ) -> BatchReport
    where
        H: RecordHandler + ?Sized,
    {
        let total = records.len();
        let mut report = BatchReport::new(total);

        if total == 0 {
            internal!("Empty batch, nothing to redrive");
            return report;
        }

        internal!(
            level = DEBUG,
            total,
            concurrency = self.concurrency.get(),
            "Processing batch"
        );

        let mut pending = records.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.concurrency.get() && !shutdown.triggered() {
                let Some(record) = pending.next() else {
                    break;
                };
                in_flight.push(self.redrive_record(record, handler));
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            report.push(result);
        }

        report
            .unprocessed
            .extend(pending.map(|record| record.id().clone()));

        if !report.unprocessed.is_empty() {
            tracing::warn!(
                unprocessed = report.unprocessed.len(),
                "Shutdown requested, leaving remaining records for redelivery"
            );
        }

        internal!(
            level = INFO,
            total,
            delivered = report.delivered(),
            quarantined = report.quarantined(),
            unprocessed = report.unprocessed.len(),
            "Batch processed"
        );

        report
    }

    /// Attempt one record until it succeeds or the budget runs out.
    async fn redrive_record<H>(&self, record: MessageRecord, handler: &H) -> RecordResult
    where
        H: RecordHandler + ?Sized,
    {
        let started = Instant::now();
        let mut attempts = 0;

        let error = loop {
            if attempts > 0 && self.policy.is_final_attempt(attempts) {
                internal!(
                    level = DEBUG,
                    record_id = %record.id(),
                    attempts,
                    "Final attempt"
                );
            }
            attempts += 1;

            match self.attempt(&record, handler).await {
                Ok(()) => {
                    self.audit.record_delivered(
                        record.id().as_str(),
                        attempts,
                        started.elapsed().as_millis(),
                    );

                    return RecordResult {
                        id: record.id().clone(),
                        outcome: DispatchOutcome::Succeeded { attempts },
                        failure: None,
                    };
                }
                Err(error) if self.policy.should_retry(attempts) => {
                    self.audit.record_retrying(
                        record.id().as_str(),
                        attempts,
                        self.policy.remaining_attempts(attempts),
                        &error.to_string(),
                    );

                    let delay = self.policy.delay_for(attempts);
                    if !delay.is_zero() {
                        internal!(
                            level = DEBUG,
                            record_id = %record.id(),
                            "Waiting {delay:?} before next attempt"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(error) => break error,
            }
        };

        let quarantine_error = self
            .quarantine
            .quarantine(&QuarantinedRecord::new(
                record.clone(),
                error.to_string(),
                attempts,
            ))
            .await
            .err();

        if let Some(e) = &quarantine_error {
            tracing::error!(
                record_id = %record.id(),
                target = self.quarantine.target(),
                error = %e,
                "Failed to quarantine record"
            );
        }

        self.audit.record_quarantined(
            record.id().as_str(),
            self.quarantine.target(),
            attempts,
            &error.to_string(),
            quarantine_error.as_ref().map(ToString::to_string).as_deref(),
        );

        RecordResult {
            id: record.id().clone(),
            outcome: DispatchOutcome::FailedExhausted { attempts },
            failure: Some(RecordFailure {
                id: record.id().clone(),
                attempts,
                error,
                quarantine_error,
            }),
        }
    }

    async fn attempt<H>(&self, record: &MessageRecord, handler: &H) -> Result<(), AttemptError>
    where
        H: RecordHandler + ?Sized,
    {
        let attempt = handler.handle(record);

        let result = match self.policy.attempt_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| AttemptError::TimedOut(timeout))?,
            None => attempt.await,
        };

        result.map_err(|e| AttemptError::Handler(Box::new(e)))
    }
}
