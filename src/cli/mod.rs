pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.clone()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow definition
    Run {
        /// Path to the workflow YAML file
        #[arg(required = true)]
        workflow: PathBuf,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,

        /// Override the workflow's start URL
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Validate a workflow definition without running it
    Validate {
        /// Path to the workflow YAML file
        #[arg(required = true)]
        workflow: PathBuf,
    },

    /// List the active error recovery rules
    Rules {
        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Summarize a previous run's extracted items file
    Inspect {
        /// Path to the JSON items file written by `run`
        #[arg(required = true)]
        output: PathBuf,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { workflow, profile, url } => {
            info!("Running workflow {}", workflow.display());
            commands::run(workflow, profile, url).await
        }
        Commands::Validate { workflow } => commands::validate(workflow).await,
        Commands::Rules { profile } => commands::rules(profile).await,
        Commands::Inspect { output } => commands::inspect(output).await,
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
