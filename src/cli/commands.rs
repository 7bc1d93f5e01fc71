//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Provisio - declarative infrastructure provisioning.
#[derive(Parser, Debug)]
#[command(name = "provisio")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the manifest file.
    #[arg(short, long, global = true, env = "PROVISIO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the manifest and its resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show resources in dependency order.
    Graph,

    /// Compute and display the execution plan.
    Plan {
        /// Plan the deletion of every managed resource.
        #[arg(long)]
        destroy: bool,

        /// Save the plan to a file for a later `apply`.
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,

        /// Show attribute-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply a saved plan, or plan and apply the manifest.
    Apply {
        /// Plan file written by `plan --out`.
        plan_file: Option<PathBuf>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum concurrent provider operations.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Destroy all managed resources.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Update state from the providers' view of each resource.
    Refresh,

    /// Report drift between state and the providers without changing state.
    Drift,

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// List recorded resources.
    List,

    /// Show one recorded resource.
    Show {
        /// Resource address.
        address: String,
    },

    /// Forget a resource without deleting it.
    Rm {
        /// Resource address.
        address: String,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from(["provisio", "apply", "plan.json", "--yes", "--parallelism", "4"]).unwrap();
        let Commands::Apply {
            plan_file,
            yes,
            parallelism,
        } = cli.command
        else {
            panic!("expected apply");
        };
        assert_eq!(plan_file, Some(PathBuf::from("plan.json")));
        assert!(yes);
        assert_eq!(parallelism, Some(4));
    }

    #[test]
    fn test_parse_state_show() {
        let cli = Cli::try_parse_from(["provisio", "--output", "json", "state", "show", "null_resource.a"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Show { .. }
            }
        ));
    }
}
