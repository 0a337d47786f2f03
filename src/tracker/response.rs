//! Tracker announce request and response
//!
//! Builds the HTTP announce URL and decodes the bencoded reply. Peers may
//! come as a list of `{ip, port}` dictionaries or as one compact byte string
//! of 6-byte entries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tracing::{debug, trace, warn};
use url::Url;

use crate::bencode::{decode, BencodeValue};
use crate::error::TorrentError;

/// Decoded tracker reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    /// Seconds the tracker asks us to wait before the next announce
    pub interval: u32,
    pub peers: Vec<SocketAddr>,
    pub warning: Option<String>,
}

impl TrackerResponse {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval as u64)
    }

    /// Decode a bencoded tracker reply
    pub fn parse(body: &[u8]) -> Result<Self, TorrentError> {
        let (root, trailing) = decode(body).map_err(|e| e.with_context("tracker response"))?;
        if trailing > 0 {
            trace!("Ignoring {} trailing bytes after tracker response", trailing);
        }
        if !root.is_dict() {
            return Err(TorrentError::tracker_error(format!(
                "Response is a {}, expected a dictionary",
                root.type_name()
            )));
        }

        if let Some(reason) = root.get(b"failure reason") {
            let reason = String::from_utf8_lossy(reason.as_bytes().unwrap_or_default()).into_owned();
            return Err(TorrentError::tracker_error_with_source("Tracker refused announce", reason));
        }

        let interval = root
            .get(b"interval")
            .and_then(BencodeValue::as_integer)
            .ok_or_else(|| TorrentError::tracker_error("Missing interval"))?;
        let interval = u32::try_from(interval)
            .map_err(|_| TorrentError::tracker_error(format!("Invalid interval {}", interval)))?;

        let peers = match root.get(b"peers") {
            Some(peers) => parse_peers(peers)?,
            None => {
                warn!("Tracker response has no peers");
                Vec::new()
            }
        };

        let warning = root
            .get(b"warning message")
            .and_then(BencodeValue::as_str)
            .map(String::from);
        if let Some(message) = &warning {
            warn!("Tracker warning: {}", message);
        }

        debug!("Tracker returned {} peers, interval {}s", peers.len(), interval);
        Ok(Self { interval, peers, warning })
    }
}

fn parse_peers(peers: &BencodeValue) -> Result<Vec<SocketAddr>, TorrentError> {
    if let Some(compact) = peers.as_bytes() {
        return parse_compact_peers(compact);
    }
    let list = peers
        .as_list()
        .ok_or_else(|| TorrentError::tracker_error(format!("peers is a {}", peers.type_name())))?;

    let mut addrs = Vec::with_capacity(list.len());
    for entry in list {
        let ip = entry.get(b"ip").and_then(BencodeValue::as_str);
        let port = entry.get(b"port").and_then(BencodeValue::as_integer);
        let (Some(ip), Some(port)) = (ip, port) else {
            return Err(TorrentError::tracker_error("Peer entry needs ip and port"));
        };
        let Ok(port) = u16::try_from(port) else {
            return Err(TorrentError::tracker_error(format!("Invalid peer port {}", port)));
        };
        match ip.parse::<IpAddr>() {
            Ok(ip) => addrs.push(SocketAddr::new(ip, port)),
            // hostnames are not resolved
            Err(_) => debug!("Skipping peer with non-literal address '{}'", ip),
        }
    }
    Ok(addrs)
}

/// Split a compact peer string into IPv4 addresses
pub fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if bytes.len() % 6 != 0 {
        return Err(TorrentError::tracker_error(format!(
            "Compact peer list of {} bytes is not a multiple of 6",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([c[4], c[5]]))
        })
        .collect())
}

/// Announce URL for `announce`, preserving any query it already carries
pub fn announce_url(
    announce: &str,
    content_id: &[u8; 20],
    peer_id: &[u8; 20],
    port: u16,
    left: u64,
) -> Result<String, TorrentError> {
    let parsed = Url::parse(announce)
        .map_err(|e| TorrentError::tracker_error_with_source(format!("Invalid announce URL '{}'", announce), e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TorrentError::tracker_error(format!(
            "Unsupported tracker scheme '{}'",
            parsed.scheme()
        )));
    }

    let separator = if parsed.query().is_some() { '&' } else { '?' };
    Ok(format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        announce,
        separator,
        urlencoding::encode_binary(content_id),
        urlencoding::encode_binary(peer_id),
        port,
        left
    ))
}
