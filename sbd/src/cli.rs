//! CLI argument parsing for sbd

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sbd")]
#[command(author, version, about = "Suit builder coordinator", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the coordinator until interrupted
    Serve {
        /// Listen address, overriding the config
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Parse a definition file and report what would be built
    Check {
        /// Definition file
        #[arg(required = true)]
        file: PathBuf,

        /// Print every parsed item
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show recently finished builds
    History {
        /// Number of entries
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// Show the active or crashed build snapshot
    State,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check_with_global_flags() {
        let cli = Cli::parse_from(["sbd", "check", "suit.alb", "--log-level", "debug", "-v"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Check { file, verbose } => {
                assert_eq!(file, PathBuf::from("suit.alb"));
                assert!(verbose);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_history_default_count() {
        let cli = Cli::parse_from(["sbd", "history"]);
        assert!(matches!(cli.command, Command::History { count: 10 }));
    }
}
