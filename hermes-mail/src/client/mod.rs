//! Minimal SMTP submission client
//!
//! Speaks just enough SMTP to hand one composed message to a relay: greeting,
//! EHLO, STARTTLS, `AUTH PLAIN`, the envelope and the content.

#[allow(clippy::module_inception)]
mod client;
mod error;
mod response;

pub use client::SmtpClient;
pub use error::ClientError;
pub use response::Response;
