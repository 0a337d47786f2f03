//! torrent-fetch - Main entry point
//!
//! Loads a .torrent, announces to its trackers and downloads the payload
//! into a single output file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use torrent_fetch::cli::summary::{report_summary, torrent_summary};
use torrent_fetch::{CliArgs, Config, DownloadCoordinator, FileSink, HttpTracker, TorrentError, TorrentParser};

/// Upper bound on the pause between announce rounds
const MAX_ROUND_DELAY: Duration = Duration::from_secs(30);

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = load_config(&args)?;
    let metadata = Arc::new(
        TorrentParser::parse_file(&args.torrent_file).context("Failed to load torrent file")?,
    );

    if !args.quiet {
        print!("{}", torrent_summary(&metadata, &config));
    }
    if args.info_only {
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(&metadata.name));
    if metadata.is_multi_file() {
        warn!(
            "Multi-file torrent: writing all {} files concatenated into {}",
            metadata.files().len(),
            output.display()
        );
    }

    let tracker = HttpTracker::new(&metadata)?;
    let mut coordinator = DownloadCoordinator::new(metadata.clone(), config.clone(), &mut rand::thread_rng());
    let mut sink = FileSink::create(&output, metadata.total_length(), metadata.piece_length).await?;
    info!("Local peer id: {}", String::from_utf8_lossy(&coordinator.peer_id()));

    let started = Instant::now();
    let rounds = config.announce_rounds.max(1);
    let mut last_error = None;

    for round in 1..=rounds {
        let left = coordinator.bytes_left().await;
        info!("Announce round {}/{} ({} bytes left)", round, rounds, left);

        let delay = match tracker
            .announce(&metadata.content_id, &coordinator.peer_id(), config.listen_port, left)
            .await
        {
            Ok(response) => match coordinator.run(&response.peers, &mut sink).await {
                Ok(report) => {
                    if !args.quiet {
                        print!("{}", report_summary(&report, metadata.total_length(), started.elapsed()));
                    }
                    info!("Saved to {}", output.display());
                    return Ok(());
                }
                Err(e) if matches!(e.downcast_ref::<TorrentError>(), Some(TorrentError::StorageError { .. })) => {
                    error!("Cannot write output: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Round {} ended without completing: {}", round, e);
                    last_error = Some(e);
                    response.interval().min(MAX_ROUND_DELAY)
                }
            },
            Err(e) => {
                warn!("Announce failed: {}", e);
                last_error = Some(e.into());
                MAX_ROUND_DELAY
            }
        };

        if round < rounds {
            debug!("Waiting {:?} before the next announce", delay);
            tokio::time::sleep(delay).await;
        }
    }

    let err = last_error.unwrap_or_else(|| anyhow::anyhow!("Transfer did not run"));
    error!("Download failed: {}", err);
    Err(err)
}

fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };
    config.apply_args(args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized");
}
