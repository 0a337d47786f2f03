//! Torrent metadata structures
//!
//! Typed view of a torrent descriptor, built once by the parser and
//! immutable afterwards.

use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// Length of a SHA-1 digest
pub const HASH_LEN: usize = 20;

/// Represents a file in a multi-file torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// File path components (e.g., ["folder", "subfolder", "file.txt"])
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// How the torrent payload maps onto files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLayout {
    SingleFile { name: String, length: u64 },
    MultiFile { files: Vec<TorrentFile> },
}

/// Torrent metadata derived from a parsed descriptor
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Primary tracker announce URL
    pub announce: String,
    /// Additional tracker URLs, tiers flattened in order
    pub announce_list: Vec<String>,
    /// Suggested name (file name, or directory name for multi-file torrents)
    pub name: String,
    /// Size of each piece in bytes; the last piece may be shorter
    pub piece_length: u32,
    /// Expected SHA-1 digest of every piece, in order
    pub piece_hashes: Vec<[u8; HASH_LEN]>,
    /// File layout
    pub layout: FileLayout,
    /// SHA-1 of the raw `info` dictionary bytes
    pub content_id: [u8; HASH_LEN],
}

impl TorrentMetadata {
    /// Total payload size in bytes
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            FileLayout::SingleFile { length, .. } => *length,
            FileLayout::MultiFile { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of a piece, or `None` when out of range
    pub fn piece_len(&self, index: usize) -> Option<u32> {
        piece_size(self.total_length(), self.piece_length, self.piece_count(), index)
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; HASH_LEN]> {
        self.piece_hashes.get(index).copied()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        matches!(self.layout, FileLayout::MultiFile { .. })
    }

    /// All files in the torrent; a single-file torrent yields one entry
    pub fn files(&self) -> Vec<TorrentFile> {
        match &self.layout {
            FileLayout::SingleFile { name, length } => vec![TorrentFile {
                path: vec![name.clone()],
                length: *length,
            }],
            FileLayout::MultiFile { files } => files.clone(),
        }
    }

    /// Get content identifier as a hex string
    pub fn content_id_hex(&self) -> String {
        hex::encode(self.content_id)
    }

    /// Generate the content identifier from raw info dictionary bytes
    pub fn generate_content_id(info_dict_bytes: &[u8]) -> [u8; HASH_LEN] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` string into digests
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; HASH_LEN]>, TorrentError> {
        if pieces_bytes.len() % HASH_LEN != 0 {
            return Err(TorrentError::InvalidPieceList {
                length: pieces_bytes.len(),
            });
        }

        Ok(pieces_bytes
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

/// Length of piece `index` for a payload of `total_length` bytes.
pub fn piece_size(total_length: u64, piece_length: u32, piece_count: usize, index: usize) -> Option<u32> {
    if index >= piece_count {
        return None;
    }
    let start = index as u64 * piece_length as u64;
    let remaining = total_length.checked_sub(start)?;
    Some(remaining.min(piece_length as u64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(length: u64, piece_length: u32, pieces: usize) -> TorrentMetadata {
        TorrentMetadata {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: vec![],
            name: "test".to_string(),
            piece_length,
            piece_hashes: vec![[2u8; 20]; pieces],
            layout: FileLayout::SingleFile {
                name: "test".to_string(),
                length,
            },
            content_id: [1u8; 20],
        }
    }

    #[test]
    fn test_single_file_geometry() {
        let info = sample(1500, 1024, 2);

        assert_eq!(info.total_length(), 1500);
        assert_eq!(info.piece_count(), 2);
        assert_eq!(info.piece_len(0), Some(1024));
        assert_eq!(info.piece_len(1), Some(476));
        assert_eq!(info.piece_len(2), None);
        assert!(!info.is_multi_file());
        assert_eq!(info.content_id_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_multi_file_total_and_files() {
        let mut info = sample(0, 1024, 1);
        info.layout = FileLayout::MultiFile {
            files: vec![
                TorrentFile { path: vec!["a".to_string()], length: 500 },
                TorrentFile { path: vec!["dir".to_string(), "b".to_string()], length: 524 },
            ],
        };

        assert_eq!(info.total_length(), 1024);
        assert!(info.is_multi_file());
        assert_eq!(info.files().len(), 2);
        assert_eq!(info.piece_len(0), Some(1024));
    }

    #[test]
    fn test_files_single_file() {
        let info = sample(2048, 1024, 2);
        let files = info.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, vec!["test"]);
        assert_eq!(files[0].length, 2048);
    }

    #[test]
    fn test_generate_content_id() {
        let hash = TorrentMetadata::generate_content_id(b"abc");
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_parse_piece_hashes_valid() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentMetadata::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0][19], 19);
        assert_eq!(result[1][0], 20);
    }

    #[test]
    fn test_parse_piece_hashes_invalid() {
        let err = TorrentMetadata::parse_piece_hashes(&[1u8; 21]).unwrap_err();
        assert!(matches!(err, TorrentError::InvalidPieceList { length: 21 }));
    }

    #[test]
    fn test_piece_size_exact_multiple() {
        assert_eq!(piece_size(32768, 16384, 2, 1), Some(16384));
        assert_eq!(piece_size(32768, 16384, 2, 2), None);
    }
}
