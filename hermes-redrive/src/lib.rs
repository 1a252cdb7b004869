//! Redrive engine for queue batches
//!
//! This crate provides:
//! - [`Redriver`]: runs a [`RecordHandler`] over every record of a batch with
//!   a bounded number of attempts per record
//! - [`RetryPolicy`]: the per-record attempt budget and backoff between attempts
//! - [`QuarantineSink`]: where records go once their budget is exhausted
//! - [`BatchError`]: a single error summarizing every record that did not make it
//!
//! A failing record never stops its siblings from being attempted.

mod error;
mod handler;
mod policy;
pub mod quarantine;
mod record;
mod redriver;

pub use error::{AttemptError, BatchError, BoxError, QuarantineError, RecordFailure};
pub use handler::{HandlerFn, RecordHandler, handler_fn};
pub use policy::RetryPolicy;
pub use quarantine::{DirectoryQuarantine, MemoryQuarantine, QuarantineSink, QuarantinedRecord};
pub use record::{MessageRecord, RecordId};
pub use redriver::{BatchReport, DispatchOutcome, RecordOutcome, Redriver};
