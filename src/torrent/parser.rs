//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, BencodeValue};
use crate::error::TorrentError;
use crate::torrent::info::{FileLayout, TorrentFile, TorrentMetadata};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let (root, trailing) = bencode::decode(data)?;
        if trailing > 0 {
            debug!("Ignoring {} trailing bytes after torrent dictionary", trailing);
        }

        Ok(Self::convert_to_metadata(&root, data)?)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentMetadata> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert_to_metadata(root: &BencodeValue, source: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        if !root.is_dict() {
            return Err(TorrentError::corrupt_metadata(format!(
                "Root must be a dictionary, found {}",
                root.type_name()
            )));
        }

        let announce = required_str(root, "announce")?.to_string();
        let announce_list = Self::announce_list(root, &announce);

        let info_value = root
            .get(b"info")
            .ok_or_else(|| TorrentError::corrupt_metadata_field("Missing info dictionary", "info"))?;
        if !info_value.is_dict() {
            return Err(TorrentError::corrupt_metadata_field("info must be a dictionary", "info"));
        }

        // The digest covers the bytes exactly as the encoder wrote them.
        let info_bytes = info_value
            .raw(source)
            .ok_or_else(|| TorrentError::corrupt_metadata_field("info span outside source buffer", "info"))?;
        let content_id = TorrentMetadata::generate_content_id(info_bytes);
        debug!("Content id: {}", hex::encode(content_id));

        let name = required_str(info_value, "name")?.to_string();

        let raw_piece_length = required_int(info_value, "piece length")?;
        let piece_length = u32::try_from(raw_piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                TorrentError::corrupt_metadata_field(
                    format!("Invalid piece length {}", raw_piece_length),
                    "piece length",
                )
            })?;

        let pieces_bytes = info_value
            .get(b"pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TorrentError::corrupt_metadata_field("Missing pieces field", "pieces"))?;
        let piece_hashes = TorrentMetadata::parse_piece_hashes(pieces_bytes)?;

        let layout = match (info_value.get(b"length"), info_value.get(b"files")) {
            (Some(_), None) => {
                let length = non_negative(required_int(info_value, "length")?, "length")?;
                FileLayout::SingleFile { name: name.clone(), length }
            }
            (None, Some(files)) => FileLayout::MultiFile {
                files: Self::parse_files(files)?,
            },
            (Some(_), Some(_)) => {
                return Err(TorrentError::corrupt_metadata("Both length and files present in info dict"));
            }
            (None, None) => {
                return Err(TorrentError::corrupt_metadata("Neither length nor files found in info dict"));
            }
        };

        let metadata = TorrentMetadata {
            announce,
            announce_list,
            name,
            piece_length,
            piece_hashes,
            layout,
            content_id,
        };
        Self::validate_geometry(&metadata)?;

        info!(
            "Parsed torrent '{}': {} bytes in {} pieces of {} bytes",
            metadata.name,
            metadata.total_length(),
            metadata.piece_count(),
            metadata.piece_length
        );
        Ok(metadata)
    }

    /// Flatten announce-list tiers in order, skipping duplicates of anything seen so far
    fn announce_list(root: &BencodeValue, announce: &str) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let tiers = match root.get(b"announce-list").and_then(|v| v.as_list()) {
            Some(tiers) => tiers,
            None => return urls,
        };

        for url in tiers
            .iter()
            .filter_map(|tier| tier.as_list())
            .flatten()
            .filter_map(|url| url.as_str())
        {
            if url != announce && !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        urls
    }

    fn parse_files(files: &BencodeValue) -> Result<Vec<TorrentFile>, TorrentError> {
        let entries = files
            .as_list()
            .ok_or_else(|| TorrentError::corrupt_metadata_field("files must be a list", "files"))?;
        if entries.is_empty() {
            return Err(TorrentError::corrupt_metadata_field("files list is empty", "files"));
        }

        let mut parsed = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.is_dict() {
                return Err(TorrentError::corrupt_metadata_field("file entry must be a dictionary", "files"));
            }
            let length = non_negative(required_int(entry, "length")?, "length")?;

            let components = entry
                .get(b"path")
                .and_then(|v| v.as_list())
                .filter(|list| !list.is_empty())
                .ok_or_else(|| TorrentError::corrupt_metadata_field("Missing file path", "path"))?;

            let mut path = Vec::with_capacity(components.len());
            for component in components {
                let part = component
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| TorrentError::corrupt_metadata_field("Invalid path component", "path"))?;
                if part == ".." || part.contains('/') || part.contains('\\') {
                    return Err(TorrentError::corrupt_metadata_field(
                        format!("Unsafe path component '{}'", part),
                        "path",
                    ));
                }
                path.push(part.to_string());
            }

            parsed.push(TorrentFile { path, length });
        }
        Ok(parsed)
    }

    /// The hash list must cover the payload exactly: `ceil(total / piece_length)` entries.
    fn validate_geometry(metadata: &TorrentMetadata) -> Result<(), TorrentError> {
        let total = metadata.total_length();
        let expected = total.div_ceil(metadata.piece_length as u64);
        let actual = metadata.piece_count() as u64;

        if actual != expected {
            return Err(TorrentError::corrupt_metadata_field(
                format!(
                    "{} piece hashes for {} bytes at piece length {} (expected {})",
                    actual, total, metadata.piece_length, expected
                ),
                "pieces",
            ));
        }
        Ok(())
    }
}

fn required_str<'a>(dict: &'a BencodeValue, key: &str) -> Result<&'a str, TorrentError> {
    dict.get(key.as_bytes())
        .and_then(|v| v.as_str())
        .ok_or_else(|| TorrentError::corrupt_metadata_field(format!("Missing or invalid {} field", key), key))
}

fn required_int(dict: &BencodeValue, key: &str) -> Result<i64, TorrentError> {
    dict.get(key.as_bytes())
        .and_then(|v| v.as_integer())
        .ok_or_else(|| TorrentError::corrupt_metadata_field(format!("Missing or invalid {} field", key), key))
}

fn non_negative(value: i64, field: &str) -> Result<u64, TorrentError> {
    u64::try_from(value)
        .map_err(|_| TorrentError::corrupt_metadata_field(format!("Negative {}: {}", field, value), field))
}
