//! Console summaries
//!
//! Human-readable output for the torrent overview and the final transfer
//! report. Everything else goes through `tracing`.

use std::fmt::Write;
use std::time::Duration;

use crate::cli::Config;
use crate::download::DownloadReport;
use crate::torrent::{FileLayout, TorrentMetadata};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:01}s", seconds, duration.subsec_millis() / 100)
    }
}

/// Overview printed before the transfer starts
pub fn torrent_summary(metadata: &TorrentMetadata, config: &Config) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Torrent Information:");
    let _ = writeln!(out, "  Name: {}", metadata.name);
    let _ = writeln!(
        out,
        "  Size: {} ({})",
        metadata.total_length(),
        format_bytes(metadata.total_length())
    );
    let _ = writeln!(out, "  Pieces: {}", metadata.piece_count());
    let _ = writeln!(out, "  Piece length: {}", format_bytes(metadata.piece_length as u64));
    let _ = writeln!(out, "  Content id: {}", metadata.content_id_hex());
    let _ = writeln!(out, "  Tracker: {}", metadata.announce);
    for tracker in &metadata.announce_list {
        let _ = writeln!(out, "  Backup tracker: {}", tracker);
    }
    if let FileLayout::MultiFile { files } = &metadata.layout {
        let _ = writeln!(out, "  Files:");
        for file in files {
            let _ = writeln!(out, "    {} ({})", file.path.join("/"), format_bytes(file.length));
        }
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Configuration:");
    let _ = writeln!(out, "  Listen port: {}", config.listen_port);
    let _ = writeln!(out, "  Max connections: {}", config.max_connections);
    let _ = writeln!(out, "  Pipeline depth: {}", config.pipeline_depth);
    out
}

/// Closing report of a finished transfer
pub fn report_summary(report: &DownloadReport, total_length: u64, elapsed: Duration) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Download complete!");
    let _ = writeln!(out, "  Downloaded: {}", format_bytes(total_length));
    let _ = writeln!(out, "  Pieces: {}/{}", report.pieces_verified, report.total_pieces);
    let _ = writeln!(out, "  Time: {}", format_duration(elapsed));
    let _ = writeln!(out, "  Reassigned blocks: {}", report.released);
    let _ = writeln!(out, "  Hash failures: {}", report.hash_failures);
    if report.banned > 0 {
        let _ = writeln!(out, "  Banned peers: {}", report.banned);
    }
    out
}
