//! torrent-fetch
//!
//! BitTorrent download core: a span-preserving bencode codec, torrent
//! metadata loading, the peer wire protocol and a coordinator that assembles
//! verified pieces from many peers at once.

pub mod bencode;
pub mod cli;
pub mod download;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::{BencodeErrorKind, TorrentError};

pub use bencode::{BencodeKind, BencodeValue};
pub use cli::{CliArgs, Config};
pub use download::{DownloadCoordinator, DownloadReport};
pub use peer::{Bitfield, ConnectionState, PeerConnection, PeerEvent, PeerSession};
pub use protocol::{generate_peer_id, Handshake, Message, MessageId, PeerWire};
pub use storage::{BlockState, FileSink, MemorySink, PieceManager, PieceSink, PieceStatus, BLOCK_SIZE};
pub use torrent::{FileLayout, TorrentFile, TorrentMetadata, TorrentParser};
#[cfg(feature = "download")]
pub use tracker::HttpTracker;
pub use tracker::TrackerResponse;
