//! HTTP tracker client

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::torrent::TorrentMetadata;
use crate::tracker::response::{announce_url, TrackerResponse};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Announces to the trackers of one torrent
pub struct HttpTracker {
    client: Client,
    urls: Vec<String>,
}

impl HttpTracker {
    /// Trackers are tried in order: `announce` first, then `announce-list`
    pub fn new(metadata: &TorrentMetadata) -> Result<Self, TorrentError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| TorrentError::tracker_error_with_source("Failed to build HTTP client", e.to_string()))?;

        let urls = std::iter::once(metadata.announce.clone())
            .chain(metadata.announce_list.iter().cloned())
            .collect();
        Ok(Self { client, urls })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Announce to the first tracker that answers
    pub async fn announce(
        &self,
        content_id: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        left: u64,
    ) -> Result<TrackerResponse, TorrentError> {
        let mut last_error = TorrentError::tracker_error("No tracker URLs");
        for url in &self.urls {
            match self.announce_to(url, content_id, peer_id, port, left).await {
                Ok(response) => {
                    info!("Tracker {} returned {} peers", url, response.peers.len());
                    return Ok(response);
                }
                Err(e) => {
                    warn!("Announce to {} failed: {}", url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn announce_to(
        &self,
        announce: &str,
        content_id: &[u8; 20],
        peer_id: &[u8; 20],
        port: u16,
        left: u64,
    ) -> Result<TrackerResponse, TorrentError> {
        let url = announce_url(announce, content_id, peer_id, port, left)?;
        debug!("Announcing: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TorrentError::tracker_error_with_source(format!("Request to {} failed", announce), e.to_string()))?;
        if !response.status().is_success() {
            return Err(TorrentError::tracker_error(format!(
                "{} answered HTTP {}",
                announce,
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TorrentError::tracker_error_with_source("Failed to read tracker response", e.to_string()))?;
        TrackerResponse::parse(&body)
    }
}
