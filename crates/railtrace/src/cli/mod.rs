//! Command-line interface for railtrace.
//!
//! This module provides the CLI structure for the `railtrace` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::Verbosity;

pub use commands::{ConfigCommand, FeedSource, PruneCommand, RunCommand, StatusCommand};

/// railtrace - Record vehicle positions offline, sync when you can
///
/// Samples positions on a fixed interval, keeps every sample in a local
/// store, and delivers them to an HTTP endpoint in batches.
#[derive(Debug, Parser)]
#[command(name = "railtrace")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the recorder until interrupted
    Run(RunCommand),

    /// Stop the recording session (a running recorder stops sampling)
    Stop,

    /// Show session and store status
    Status(StatusCommand),

    /// Attempt one sync of undelivered records
    Sync,

    /// Bound the store and drop old delivered records
    Prune(PruneCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_name() {
        let cli = Cli::command();
        assert_eq!(cli.get_name(), "railtrace");
    }

    #[test]
    fn test_cli_verify() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_verbosity_flags() {
        assert_eq!(parse(&["railtrace", "-q", "status"]).verbosity(), Verbosity::Quiet);
        assert_eq!(parse(&["railtrace", "status"]).verbosity(), Verbosity::Normal);
        assert_eq!(parse(&["railtrace", "-v", "status"]).verbosity(), Verbosity::Verbose);
        assert_eq!(parse(&["railtrace", "-vv", "status"]).verbosity(), Verbosity::Trace);
    }

    #[test]
    fn test_parse_run_defaults() {
        let cli = parse(&["railtrace", "run"]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert!(!run.start);
        assert!(!run.synthetic);
        assert_eq!(run.interval_ms, None);
        assert_eq!(run.feed, FeedSource::Stdin);
    }

    #[test]
    fn test_parse_run_with_options() {
        let cli = parse(&[
            "railtrace",
            "run",
            "--start",
            "--interval-ms",
            "2500",
            "--synthetic",
            "--feed",
            "none",
        ]);
        let Command::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert!(run.start);
        assert!(run.synthetic);
        assert_eq!(run.interval_ms, Some(2500));
        assert_eq!(run.feed, FeedSource::Disabled);
    }

    #[test]
    fn test_parse_simple_commands() {
        assert!(matches!(parse(&["railtrace", "stop"]).command, Command::Stop));
        assert!(matches!(parse(&["railtrace", "sync"]).command, Command::Sync));
        assert!(matches!(
            parse(&["railtrace", "status", "--json"]).command,
            Command::Status(StatusCommand { json: true })
        ));
    }

    #[test]
    fn test_parse_prune() {
        let cli = parse(&["railtrace", "prune", "--keep", "50"]);
        assert!(matches!(
            cli.command,
            Command::Prune(PruneCommand { keep: Some(50) })
        ));
    }

    #[test]
    fn test_parse_config_validate() {
        let cli = parse(&["railtrace", "config", "validate", "--file", "/tmp/rt.toml"]);
        let Command::Config(ConfigCommand::Validate { file }) = cli.command else {
            panic!("expected config validate");
        };
        assert_eq!(file, Some(PathBuf::from("/tmp/rt.toml")));
    }

    #[test]
    fn test_parse_with_config() {
        let cli = parse(&["railtrace", "-c", "/custom/config.toml", "status"]);
        assert_eq!(cli.config, Some(PathBuf::from("/custom/config.toml")));
    }

    #[test]
    fn test_rejects_unknown_feed() {
        assert!(Cli::try_parse_from(["railtrace", "run", "--feed", "serial"]).is_err());
    }
}
