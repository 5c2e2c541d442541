//! ZTP CLI library

pub mod commands;
pub mod console;
pub mod error;

pub use console::{ColorChoice, Console};
pub use error::{Error, Result};

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use commands::{cluster, dev, lso, metallb, ui, Context};

/// ZTP - provision edge clusters from a site description
#[derive(Parser, Debug)]
#[command(name = "ztp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level used when RUST_LOG isn't set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Write the log to this file instead of standard error
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Colour the console prefixes
    #[arg(long, global = true, value_enum, default_value_t = ColorChoice::Auto)]
    pub color: ColorChoice,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create clusters or cluster components
    #[command(subcommand)]
    Create(CreateCommand),
    /// Delete clusters or cluster components
    #[command(subcommand)]
    Delete(DeleteCommand),
    /// Developer tools
    #[command(subcommand)]
    Dev(DevCommand),
}

#[derive(Subcommand, Debug)]
pub enum CreateCommand {
    /// Create clusters on the hub
    #[command(alias = "clusters")]
    Cluster(cluster::CreateArgs),
    /// Create metal load balancers
    #[command(alias = "metallbs")]
    Metallb(metallb::CreateArgs),
    /// Create the local storage operator
    Lso(lso::CreateArgs),
    /// Create the setup UI
    Ui(ui::UiArgs),
}

#[derive(Subcommand, Debug)]
pub enum DeleteCommand {
    /// Delete clusters from the hub
    #[command(alias = "clusters")]
    Cluster(cluster::DeleteArgs),
    /// Delete metal load balancers
    #[command(alias = "metallbs")]
    Metallb(metallb::DeleteArgs),
    /// Delete the setup UI
    Ui(ui::UiArgs),
}

#[derive(Subcommand, Debug)]
pub enum DevCommand {
    /// Render a template directory and create the objects
    Apply(dev::DevArgs),
    /// Render a template directory and delete the objects
    Delete(dev::DevArgs),
}

impl Cli {
    /// Run the CLI command, aborting promptly on Ctrl-C
    pub async fn run(self, console: Arc<Console>) -> Result<()> {
        let cancel = CancellationToken::new();
        let interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling");
                    cancel.cancel();
                }
            }
        });

        let ctx = Context::new(console, cancel);
        let result = match self.command {
            Commands::Create(command) => match command {
                CreateCommand::Cluster(args) => cluster::create(&ctx, args).await,
                CreateCommand::Metallb(args) => metallb::create(&ctx, args).await,
                CreateCommand::Lso(args) => lso::create(&ctx, args).await,
                CreateCommand::Ui(args) => ui::create(&ctx, args).await,
            },
            Commands::Delete(command) => match command {
                DeleteCommand::Cluster(args) => cluster::delete(&ctx, args).await,
                DeleteCommand::Metallb(args) => metallb::delete(&ctx, args).await,
                DeleteCommand::Ui(args) => ui::delete(&ctx, args).await,
            },
            Commands::Dev(command) => match command {
                DevCommand::Apply(args) => dev::apply(&ctx, args).await,
                DevCommand::Delete(args) => dev::delete(&ctx, args).await,
            },
        };
        interrupt.abort();
        result
    }
}
