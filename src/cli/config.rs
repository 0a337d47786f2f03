//! Configuration module
//!
//! Tunables for the transfer engine. Loaded from an optional JSON file and
//! overridden by command-line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cli::args::CliArgs;
use crate::error::TorrentError;

/// Configuration for the torrent downloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port reported to the tracker
    pub listen_port: u16,
    /// Maximum number of simultaneous peer connections
    pub max_connections: usize,
    /// Outstanding requests per peer
    pub pipeline_depth: usize,
    /// Time a single block request may stay unanswered
    pub request_timeout_ms: u64,
    /// Request timeouts in a row before a peer is dropped
    pub max_consecutive_timeouts: u32,
    /// Silence tolerated while requests are outstanding
    pub io_timeout_ms: u64,
    /// Silence tolerated from a peer we are not waiting on
    pub idle_timeout_ms: u64,
    /// Quiet period after which a keep-alive is sent
    pub keepalive_interval_ms: u64,
    /// TCP connect limit
    pub connect_timeout_ms: u64,
    /// Corrupt pieces a peer may contribute to before it is banned
    pub max_hash_failures_per_peer: u32,
    /// Tracker announces attempted while the transfer is incomplete
    pub announce_rounds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections: 30,
            pipeline_depth: 5,
            request_timeout_ms: 10_000,
            max_consecutive_timeouts: 3,
            io_timeout_ms: 30_000,
            idle_timeout_ms: 180_000,
            keepalive_interval_ms: 60_000,
            connect_timeout_ms: 10_000,
            max_hash_failures_per_peer: 3,
            announce_rounds: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::storage_error_full("Failed to read config file", path.display().to_string(), e.to_string())
        })?;
        Ok(Self::from_json(&text)?)
    }

    /// Parse and validate a JSON document; missing keys take their defaults
    pub fn from_json(text: &str) -> Result<Self, TorrentError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    /// Apply command-line overrides
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.listen_port = port;
        }
        if let Some(max_connections) = args.max_connections {
            self.max_connections = max_connections;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), TorrentError> {
        let checks: [(&str, bool); 10] = [
            ("listen_port", self.listen_port == 0),
            ("max_connections", self.max_connections == 0),
            ("pipeline_depth", self.pipeline_depth == 0),
            ("request_timeout_ms", self.request_timeout_ms == 0),
            ("max_consecutive_timeouts", self.max_consecutive_timeouts == 0),
            ("io_timeout_ms", self.io_timeout_ms == 0),
            ("idle_timeout_ms", self.idle_timeout_ms == 0),
            ("keepalive_interval_ms", self.keepalive_interval_ms == 0),
            ("connect_timeout_ms", self.connect_timeout_ms == 0),
            ("max_hash_failures_per_peer", self.max_hash_failures_per_peer == 0),
        ];

        match checks.iter().find(|(_, invalid)| *invalid) {
            Some((field, _)) => Err(TorrentError::config_error_with_field(
                format!("{} must be greater than zero", field),
                *field,
            )),
            None => Ok(()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline_depth, 5);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.io_timeout(), Duration::from_secs(30));
        assert_eq!(config.keepalive_interval(), Duration::from_secs(60));
        assert!(config.idle_timeout() > config.keepalive_interval());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"pipeline_depth": 8, "request_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.pipeline_depth, 8);
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_connections, 30);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = Config::from_json(r#"{"pipeline_depth": 0}"#).unwrap_err();
        match err {
            TorrentError::ConfigError { field, .. } => assert_eq!(field.as_deref(), Some("pipeline_depth")),
            other => panic!("unexpected error: {:?}", other),
        }

        let err = Config::from_json(r#"{"keepalive_interval_ms": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            TorrentError::ConfigError { field: Some(ref f), .. } if f == "keepalive_interval_ms"
        ));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = Config::from_json("{not json").unwrap_err();
        assert!(matches!(err, TorrentError::ConfigError { .. }));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs {
            torrent_file: PathBuf::from("test.torrent"),
            output: None,
            config: None,
            port: Some(7000),
            max_connections: None,
            info_only: false,
            verbose: false,
            quiet: false,
        };

        let mut config = Config::default();
        config.apply_args(&args);
        assert_eq!(config.listen_port, 7000);
        assert_eq!(config.max_connections, 30);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/torrent-fetch.json")).unwrap_err();
        assert!(err.downcast_ref::<TorrentError>().is_some());
    }
}
