//! Error types for the torrent client core
//!
//! This module defines the error taxonomy shared by the codec, the
//! metadata loader, the peer wire protocol and the download coordinator.

use std::fmt;

/// Category of a bencode format error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BencodeErrorKind {
    /// A byte that cannot start or continue a value at this position
    MalformedInput,
    /// The buffer ended inside a value, or a declared length runs past the end
    TruncatedInput,
    /// A list or dictionary has no terminating `e` before the buffer ends
    UnterminatedContainer,
}

impl fmt::Display for BencodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BencodeErrorKind::MalformedInput => write!(f, "malformed input"),
            BencodeErrorKind::TruncatedInput => write!(f, "truncated input"),
            BencodeErrorKind::UnterminatedContainer => write!(f, "unterminated container"),
        }
    }
}

/// Comprehensive error type for torrent operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode format errors
    BencodeError {
        kind: BencodeErrorKind,
        offset: usize,
        message: String,
    },

    /// The `pieces` byte string is not a whole number of 20-byte digests
    InvalidPieceList {
        length: usize,
    },

    /// Torrent metadata violates a structural invariant
    CorruptMetadata {
        message: String,
        field: Option<String>,
    },

    /// The remote handshake does not match this transfer
    HandshakeRejected {
        message: String,
        peer: Option<String>,
    },

    /// BitTorrent protocol violations
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors (I/O, timeouts)
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Tracker errors
    TrackerError {
        message: String,
        source: Option<String>,
    },

    /// Piece persistence errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// No connection remains and the transfer is incomplete
    TransferFailed {
        verified: usize,
        total: usize,
    },
}

impl TorrentError {
    /// Create a new bencode error
    pub fn bencode_error(kind: BencodeErrorKind, offset: usize, message: impl Into<String>) -> Self {
        TorrentError::BencodeError {
            kind,
            offset,
            message: message.into(),
        }
    }

    /// Create a new CorruptMetadata error
    pub fn corrupt_metadata(message: impl Into<String>) -> Self {
        TorrentError::CorruptMetadata {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new CorruptMetadata error naming the offending field
    pub fn corrupt_metadata_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::CorruptMetadata {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new HandshakeRejected error
    pub fn handshake_rejected(message: impl Into<String>) -> Self {
        TorrentError::HandshakeRejected {
            message: message.into(),
            peer: None,
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError
    pub fn peer_error(message: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: None,
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new TrackerError with source
    pub fn tracker_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Bencode error category, if this is a format error from the codec
    pub fn bencode_kind(&self) -> Option<BencodeErrorKind> {
        match self {
            TorrentError::BencodeError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Attach the remote address to a peer-scoped error
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        match &mut self {
            TorrentError::HandshakeRejected { peer, .. } | TorrentError::PeerError { peer, .. } => {
                if peer.is_none() {
                    *peer = Some(addr.into());
                }
            }
            _ => {}
        }
        self
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            TorrentError::ProtocolError { source, .. }
            | TorrentError::PeerError { source, .. }
            | TorrentError::NetworkError { source, .. }
            | TorrentError::TrackerError { source, .. }
            | TorrentError::StorageError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            TorrentError::BencodeError { message, .. } | TorrentError::CorruptMetadata { message, .. } => {
                *message = format!("{} ({})", message, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::BencodeError { kind, offset, message } => {
                write!(f, "Bencode error: {} at offset {}: {}", kind, offset, message)
            }
            TorrentError::InvalidPieceList { length } => {
                write!(f, "Invalid piece list: {} bytes is not a multiple of 20", length)
            }
            TorrentError::CorruptMetadata { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Corrupt metadata: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Corrupt metadata: {}", message)
                }
            }
            TorrentError::HandshakeRejected { message, peer } => {
                if let Some(p) = peer {
                    write!(f, "Handshake rejected: {} (peer: {})", message, p)
                } else {
                    write!(f, "Handshake rejected: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::TrackerError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Tracker error: {} (source: {})", message, src)
                } else {
                    write!(f, "Tracker error: {}", message)
                }
            }
            TorrentError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            TorrentError::TransferFailed { verified, total } => {
                write!(f, "Transfer failed: no peers left with {}/{} pieces verified", verified, total)
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::PeerError {
            message: err.to_string(),
            peer: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::ConfigError {
            message: format!("Failed to parse JSON config: {}", err),
            field: None,
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::peer_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bencode_error_display() {
        let err = TorrentError::bencode_error(BencodeErrorKind::TruncatedInput, 7, "string runs past end");
        let text = err.to_string();
        assert!(text.contains("truncated input"));
        assert!(text.contains("offset 7"));
        assert_eq!(err.bencode_kind(), Some(BencodeErrorKind::TruncatedInput));
    }

    #[test]
    fn test_bencode_kind_absent_for_other_errors() {
        assert_eq!(TorrentError::corrupt_metadata("bad").bencode_kind(), None);
    }

    #[test]
    fn test_invalid_piece_list_display() {
        let err = TorrentError::InvalidPieceList { length: 21 };
        assert!(err.to_string().contains("21 bytes"));
    }

    #[test]
    fn test_with_peer_fills_missing_address() {
        let err = TorrentError::handshake_rejected("content id mismatch").with_peer("127.0.0.1:6881");
        assert!(err.to_string().contains("127.0.0.1:6881"));
    }

    #[test]
    fn test_with_peer_keeps_existing_address() {
        let err = TorrentError::peer_error_full("reset", "10.0.0.1:1", "io")
            .with_peer("10.0.0.2:2");
        assert!(err.to_string().contains("10.0.0.1:1"));
        assert!(!err.to_string().contains("10.0.0.2:2"));
    }

    #[test]
    fn test_with_context() {
        let err = TorrentError::protocol_error("Invalid frame").with_context("while reading piece");
        assert!(err.to_string().contains("while reading piece"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::PeerError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = TorrentError::config_error_with_field("must be positive", "pipeline_depth");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("pipeline_depth"));
    }

    #[test]
    fn test_transfer_failed_display() {
        let err = TorrentError::TransferFailed { verified: 1, total: 2 };
        assert!(err.to_string().contains("1/2"));
    }
}
