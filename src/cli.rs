use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::HAWSER_VERSION;

#[derive(Parser, Debug)]
#[clap(version = HAWSER_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run as a daemon against the deployment server
    Daemon,

    /// Install an artifact from a local file or URL, without a server
    Install {
        /// Path or URL of the artifact
        #[clap(index = 1)]
        artifact: String,
    },

    /// Commit a standalone update that is awaiting confirmation
    Commit,

    /// Roll a standalone update back to the previous software
    Rollback,

    /// Ask the server once whether a deployment is pending
    #[clap(name = "check-update")]
    CheckUpdate,

    /// Push the inventory attributes to the server once
    #[clap(name = "send-inventory")]
    SendInventory,

    /// Print the name of the currently installed artifact
    #[clap(name = "show-artifact")]
    ShowArtifact,

    /// Print everything the current software provides
    #[clap(name = "show-provides")]
    ShowProvides,
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Daemon => "daemon",
            Commands::Install { .. } => "install",
            Commands::Commit => "commit",
            Commands::Rollback => "rollback",
            Commands::CheckUpdate => "check-update",
            Commands::SendInventory => "send-inventory",
            Commands::ShowArtifact => "show-artifact",
            Commands::ShowProvides => "show-provides",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_daemon() {
        let cli = Cli::try_parse_from(["hawser", "daemon"]).unwrap();
        assert!(matches!(cli.command, Commands::Daemon));
        assert_eq!(cli.verbosity, LevelFilter::Info);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_parses_install_with_globals() {
        let cli = Cli::try_parse_from([
            "hawser",
            "install",
            "/tmp/release.hawser",
            "-v",
            "debug",
            "--config",
            "/etc/hawser/other.conf",
        ])
        .unwrap();
        match cli.command {
            Commands::Install { artifact } => assert_eq!(artifact, "/tmp/release.hawser"),
            other => panic!("unexpected command {other}"),
        }
        assert_eq!(cli.verbosity, LevelFilter::Debug);
        assert_eq!(cli.config.unwrap(), PathBuf::from("/etc/hawser/other.conf"));
    }

    #[test]
    fn test_rejects_unknown_command() {
        Cli::try_parse_from(["hawser", "frobnicate"]).unwrap_err();
    }
}
