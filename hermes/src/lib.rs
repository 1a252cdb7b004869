//! Queue-driven templated mail sender
//!
//! Wires the configuration to the mail pipeline from `hermes-mail` and the
//! redrive engine from `hermes-redrive`.

pub mod config;
pub mod controller;

pub use config::Config;
pub use controller::Hermes;
