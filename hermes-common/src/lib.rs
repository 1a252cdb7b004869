pub mod audit;
pub mod error;
pub mod logging;

pub use error::ConfigError;
pub use tracing;

/// Process-level lifecycle signals broadcast to long-running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
