//! ZTP CLI
//!
//! Provisions edge clusters and their components from a site description.

use std::fs::File;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ztp_cli::{Cli, Console};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let console = Arc::new(Console::stdio(cli.color));

    // Initialize tracing
    let (writer, ansi) = match &cli.log_file {
        Some(path) => match File::create(path) {
            Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), false),
            Err(e) => {
                console.error(format_args!(
                    "Failed to open log file '{}': {}",
                    path.display(),
                    e
                ));
                return ExitCode::FAILURE;
            }
        },
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(ansi)
                .with_writer(writer),
        )
        .init();

    match cli.run(console.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            console.error(&e);
            ExitCode::FAILURE
        }
    }
}
