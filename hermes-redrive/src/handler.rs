use std::{error::Error, future::Future};

use async_trait::async_trait;

use crate::MessageRecord;

/// The unit of work the redriver runs for each record.
///
/// Implementations must not retry internally: every failure is reported to
/// the redriver, which owns the retry budget.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    type Error: Error + Send + Sync + 'static;

    async fn handle(&self, record: &MessageRecord) -> Result<(), Self::Error>;
}

/// A [`RecordHandler`] backed by a closure. See [`handler_fn`].
#[derive(Debug, Clone)]
pub struct HandlerFn<F>(F);

/// Wrap a closure taking an owned record as a [`RecordHandler`].
///
/// ```ignore
/// let handler = handler_fn(|record: MessageRecord| async move {
///     println!("{}", record.body());
///     Ok::<_, std::io::Error>(())
/// });
/// ```
pub const fn handler_fn<F>(f: F) -> HandlerFn<F> {
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut, E> RecordHandler for HandlerFn<F>
where
    F: Fn(MessageRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Error + Send + Sync + 'static,
{
    type Error = E;

    async fn handle(&self, record: &MessageRecord) -> Result<(), E> {
        (self.0)(record.clone()).await
    }
}
