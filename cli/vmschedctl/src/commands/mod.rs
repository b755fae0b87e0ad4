//! CLI commands.

mod deploy;
mod info;
mod remove;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::output::OutputFormat;

/// vmschedctl - place and remove VMs on a vmsched host.
#[derive(Debug, Parser)]
#[command(name = "vmschedctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Scheduler command API URL.
    #[arg(long, global = true, env = "VMSCHED_URL", default_value = "http://127.0.0.1:8099")]
    url: String,

    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deploy a domain.
    Deploy(deploy::DeployCommand),

    /// Remove a domain by name or uuid.
    Remove(remove::RemoveCommand),

    /// Show subsets and placed domains.
    Info(info::InfoCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            url: self.url,
            format: OutputFormat::parse(&self.format),
        };

        match self.command {
            Commands::Deploy(cmd) => cmd.run(ctx).await,
            Commands::Remove(cmd) => cmd.run(ctx).await,
            Commands::Info(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("vmschedctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub url: String,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.url)
    }
}
