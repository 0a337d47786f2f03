//! Tracker module
//!
//! Peer discovery over HTTP announce.

#[cfg(feature = "download")]
pub mod http;
pub mod response;

#[cfg(feature = "download")]
pub use http::HttpTracker;
pub use response::{announce_url, parse_compact_peers, TrackerResponse};
