use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// mlnode - resumable single-node ML platform provisioning
#[derive(Parser, Debug)]
#[command(name = "mlnode")]
#[command(about = "Provision MicroK8s, Juju and Kubeflow on a single node, resuming where the last run stopped")]
#[command(version)]
pub struct Cli {
    /// JSON configuration file (missing fields keep their defaults)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Progress file to use instead of ~/.mlnode_setup_progress
    #[arg(long, global = true)]
    pub state_file: Option<PathBuf>,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Commands that change the host (snap install, microk8s enable, juju
    /// deploy, mkfs, ...) are skipped and logged. Read-only queries still
    /// run so the preview is realistic. Progress is never written.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the remaining provisioning steps (default)
    Run,
    /// Show the progress marker and the steps still to run
    Status,
    /// List every step in execution order
    Steps,
    /// Delete the progress file so the next run starts from the first step
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
    /// Write the default configuration to a file for editing
    Config {
        /// Destination file
        #[arg(short, long)]
        output: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }

    /// Subcommand to execute; no subcommand means `run`.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_no_args_runs() {
        let cli = Cli::try_parse_from(["mlnode"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.command(), Commands::Run);
        assert!(!cli.dry_run);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mlnode",
            "status",
            "--state-file",
            "/tmp/progress",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.command(), Commands::Status);
        assert_eq!(cli.state_file, Some(PathBuf::from("/tmp/progress")));
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_config_output() {
        let cli = Cli::try_parse_from(["mlnode", "config", "--output", "mlnode.json"]).unwrap();
        match cli.command() {
            Commands::Config { output } => assert_eq!(output, PathBuf::from("mlnode.json")),
            other => panic!("Expected Config command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_reset_defaults_to_unconfirmed() {
        let cli = Cli::try_parse_from(["mlnode", "reset"]).unwrap();
        assert_eq!(cli.command(), Commands::Reset { yes: false });
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["mlnode", "deploy"]).is_err());
    }
}
