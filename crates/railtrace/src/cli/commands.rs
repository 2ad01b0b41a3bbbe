//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Start a new recording session immediately
    #[arg(short, long)]
    pub start: bool,

    /// Sampling interval in milliseconds (overrides configuration)
    #[arg(short, long, value_name = "MS")]
    pub interval_ms: Option<u64>,

    /// Generate a synthetic position when no fix is available
    #[arg(long)]
    pub synthetic: bool,

    /// Where position fixes come from
    #[arg(short, long, value_enum, default_value = "stdin")]
    pub feed: FeedSource,
}

/// Source of position fixes for `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FeedSource {
    /// JSON lines on standard input
    #[default]
    Stdin,
    /// No feed; only synthetic samples are produced
    #[value(name = "none")]
    Disabled,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Prune command arguments.
#[derive(Debug, Args)]
pub struct PruneCommand {
    /// Keep at most this many records (defaults to `storage.max_records`)
    #[arg(short, long, value_name = "N")]
    pub keep: Option<usize>,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_source_default() {
        assert_eq!(FeedSource::default(), FeedSource::Stdin);
    }

    #[test]
    fn test_feed_source_value_names() {
        assert_eq!(
            FeedSource::from_str("none", false).unwrap(),
            FeedSource::Disabled
        );
        assert_eq!(
            FeedSource::from_str("stdin", false).unwrap(),
            FeedSource::Stdin
        );
        assert!(FeedSource::from_str("serial", false).is_err());
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }
}
