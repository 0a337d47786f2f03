//! CLI module
//!
//! Command-line arguments, configuration and console output for the
//! downloader binary.

pub mod args;
pub mod config;
pub mod summary;

pub use args::CliArgs;
pub use config::Config;
