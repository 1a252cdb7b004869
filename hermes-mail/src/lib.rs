//! Template driven mail sending
//!
//! [`MailSender`] turns a JSON mail request into a MIME message built from a
//! stored template and stored attachments, and delivers it through a
//! [`MailTransport`]. It implements [`hermes_redrive::RecordHandler`] so a
//! batch of queued requests can be run through a redriver.

pub mod client;
mod error;
pub mod message;
pub mod request;
mod sender;
pub mod store;
pub mod template;
pub mod transport;

pub use error::{MailError, StoreError, TransportError};
pub use message::{Attachment, ComposedMail, MessageBuilder};
pub use request::{AttachmentRef, MailRequest, Variable};
pub use sender::MailSender;
pub use store::{DirectoryStore, MemoryStore, ObjectStore};
pub use template::Template;
pub use transport::{MailTransport, MemoryTransport, SmtpConfig, SmtpTimeouts, SmtpTransport, TlsMode};
