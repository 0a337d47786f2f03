//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the torrent downloader
#[derive(Debug, Parser)]
#[command(name = "torrent-fetch")]
#[command(about = "Download a torrent's content from tracker-announced peers", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Output file (defaults to the torrent's name in the current directory)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Port reported to the tracker
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections
    #[arg(short, long)]
    pub max_connections: Option<usize>,

    /// Print the torrent summary and exit
    #[arg(long)]
    pub info_only: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
