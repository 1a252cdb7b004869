//! Error types for the redrive engine.
//!
//! Failures are layered the way they are observed:
//! - [`AttemptError`]: why a single attempt failed
//! - [`RecordFailure`]: a record that exhausted its budget, with its last error
//!   and whether quarantining it succeeded
//! - [`BatchError`]: everything that went wrong in one batch

use std::{fmt, io, time::Duration};

use thiserror::Error;

use crate::RecordId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while re-depositing a record into a quarantine target.
#[derive(Debug, Error)]
pub enum QuarantineError {
    /// Writing to the quarantine target failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The record could not be encoded for the target.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The target refuses to hold more records.
    #[error("Quarantine capacity exceeded: {len}/{capacity} records")]
    CapacityExceeded { len: usize, capacity: usize },

    /// The target rejected the record for another reason.
    #[error("Quarantine target rejected record: {0}")]
    Rejected(String),
}

/// Why one attempt at handling a record failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// The handler returned an error.
    #[error(transparent)]
    Handler(BoxError),

    /// The handler did not finish within the attempt timeout.
    #[error("Attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl AttemptError {
    /// Downcast the handler's error to its concrete type.
    #[must_use]
    pub fn handler_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Handler(error) => error.downcast_ref::<E>(),
            Self::TimedOut(_) => None,
        }
    }
}

/// A record whose retry budget ran out.
#[derive(Debug)]
pub struct RecordFailure {
    pub id: RecordId,
    pub attempts: u32,
    /// The error observed on the last attempt
    pub error: AttemptError,
    /// Set when the record could not be quarantined either
    pub quarantine_error: Option<QuarantineError>,
}

impl fmt::Display for RecordFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (after {} attempts)",
            self.id, self.error, self.attempts
        )?;

        if let Some(quarantine_error) = &self.quarantine_error {
            write!(f, ", quarantine failed: {quarantine_error}")?;
        }

        Ok(())
    }
}

/// Aggregated outcome of a batch that did not fully succeed.
///
/// `failures` holds every record that exhausted its budget; `unprocessed`
/// holds records that were never attempted because shutdown was requested.
/// The caller decides how to acknowledge the batch from this.
#[derive(Debug)]
pub struct BatchError {
    pub total: usize,
    pub failures: Vec<RecordFailure>,
    pub unprocessed: Vec<RecordId>,
}

impl BatchError {
    /// Ids of every record that exhausted its budget.
    pub fn failed_ids(&self) -> impl Iterator<Item = &RecordId> {
        self.failures.iter().map(|failure| &failure.id)
    }

    /// Whether some records of the batch did make it.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failures.len() + self.unprocessed.len() < self.total
    }

    /// Whether any failed record is missing from the quarantine target.
    #[must_use]
    pub fn has_unquarantined(&self) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.quarantine_error.is_some())
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} records failed", self.failures.len(), self.total)?;

        if !self.unprocessed.is_empty() {
            write!(f, ", {} not processed", self.unprocessed.len())?;
        }

        for (i, failure) in self.failures.iter().enumerate() {
            f.write_str(if i == 0 { ": " } else { "; " })?;
            write!(f, "{failure}")?;
        }

        if !self.unprocessed.is_empty() {
            let ids = self
                .unprocessed
                .iter()
                .map(RecordId::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, " [not processed: {ids}]")?;
        }

        Ok(())
    }
}

impl std::error::Error for BatchError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(id: &str, message: &str) -> RecordFailure {
        RecordFailure {
            id: RecordId::from(id),
            attempts: 3,
            error: AttemptError::Handler(message.into()),
            quarantine_error: None,
        }
    }

    #[test]
    fn test_record_failure_display() {
        let mut failure = failure("C", "connection refused");
        assert_eq!(
            failure.to_string(),
            "C: connection refused (after 3 attempts)"
        );

        failure.quarantine_error = Some(QuarantineError::CapacityExceeded {
            len: 1,
            capacity: 1,
        });
        assert_eq!(
            failure.to_string(),
            "C: connection refused (after 3 attempts), quarantine failed: \
             Quarantine capacity exceeded: 1/1 records"
        );
    }

    #[test]
    fn test_batch_error_display() {
        let error = BatchError {
            total: 4,
            failures: vec![failure("C", "boom"), failure("D", "bang")],
            unprocessed: vec![],
        };

        assert_eq!(
            error.to_string(),
            "2 of 4 records failed: C: boom (after 3 attempts); D: bang (after 3 attempts)"
        );
        assert!(error.is_partial());
        assert!(!error.has_unquarantined());
        assert_eq!(
            error.failed_ids().map(RecordId::as_str).collect::<Vec<_>>(),
            vec!["C", "D"]
        );
    }

    #[test]
    fn test_batch_error_lists_unprocessed() {
        let error = BatchError {
            total: 3,
            failures: vec![],
            unprocessed: vec![RecordId::from("B"), RecordId::from("C")],
        };

        assert_eq!(
            error.to_string(),
            "0 of 3 records failed, 2 not processed [not processed: B, C]"
        );
    }

    #[test]
    fn test_attempt_error_downcast() {
        let error = AttemptError::Handler(Box::new(io::Error::other("disk on fire")));
        assert!(error.handler_error::<io::Error>().is_some());
        assert!(error.handler_error::<fmt::Error>().is_none());

        let error = AttemptError::TimedOut(Duration::from_secs(5));
        assert_eq!(error.to_string(), "Attempt timed out after 5s");
        assert!(error.handler_error::<io::Error>().is_none());
    }
}
