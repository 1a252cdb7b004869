#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use hermes::{Config, Hermes, controller::read_batch};
use hermes_common::logging;

/// Send templated mails for a batch of queue records
#[derive(Parser, Debug)]
#[command(name = "hermes")]
#[command(version)]
struct Cli {
    /// Configuration file, overrides `HERMES_CONFIG`
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Compose every mail without contacting the relay
    #[arg(long)]
    dry_run: bool,

    /// JSON array of records; read from stdin when omitted or `-`
    batch: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();

    let mut config = Config::discover(cli.config.as_deref())?;
    config.dry_run |= cli.dry_run;

    let hermes = Hermes::new(config).await?;
    let records = read_batch(cli.batch.as_deref()).await?;

    hermes.run(records).await
}
