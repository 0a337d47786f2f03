//! Torrent file handling module
//!
//! Turns a raw .torrent descriptor into immutable [`TorrentMetadata`].

pub mod info;
pub mod parser;

#[cfg(test)]
pub(crate) mod test_data;

pub use info::{FileLayout, TorrentFile, TorrentMetadata};
pub use parser::TorrentParser;
