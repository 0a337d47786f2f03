//! Destinations for verified pieces
//!
//! The coordinator hands every verified piece to a [`PieceSink`] exactly once,
//! in verification order.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::error::TorrentError;

/// Receiver of verified piece data
#[async_trait]
pub trait PieceSink: Send {
    /// Persist one verified piece
    async fn write_piece(&mut self, index: u32, data: Bytes) -> Result<()>;

    /// Flush everything; called once the transfer is complete
    async fn finish(&mut self) -> Result<()>;
}

/// Keeps verified pieces in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pieces: BTreeMap<u32, Bytes>,
    finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn piece(&self, index: u32) -> Option<&Bytes> {
        self.pieces.get(&index)
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Concatenate stored pieces in index order
    pub fn assemble(&self) -> Vec<u8> {
        self.pieces.values().flat_map(|piece| piece.iter().copied()).collect()
    }
}

#[async_trait]
impl PieceSink for MemorySink {
    async fn write_piece(&mut self, index: u32, data: Bytes) -> Result<()> {
        if self.pieces.insert(index, data).is_some() {
            return Err(TorrentError::storage_error_full(
                "Piece written twice",
                "memory",
                format!("piece {}", index),
            )
            .into());
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Writes the whole payload into one file, piece `i` at `i * piece_length`
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    piece_length: u64,
    file: fs::File,
}

impl FileSink {
    /// Create (or truncate) `path` and size it to `total_length`
    pub async fn create(path: &Path, total_length: u64, piece_length: u32) -> Result<Self> {
        info!("Writing payload to {} ({} bytes)", path.display(), total_length);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;
        file.set_len(total_length).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            piece_length: piece_length as u64,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn write_piece(&mut self, index: u32, data: Bytes) -> Result<()> {
        let offset = index as u64 * self.piece_length;
        debug!("Writing piece {} at offset {}", index, offset);

        let io = async {
            self.file.seek(SeekFrom::Start(offset)).await?;
            self.file.write_all(&data).await
        };
        io.await.map_err(|e| {
            error!("Failed to write piece {} to '{}': {}", index, self.path.display(), e);
            TorrentError::storage_error_full("Failed to write piece", self.path.display().to_string(), e.to_string())
        })?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.file.flush().await.map_err(|e| {
            TorrentError::storage_error_full("Failed to flush file", self.path.display().to_string(), e.to_string())
        })?;
        self.file.sync_all().await.map_err(|e| {
            TorrentError::storage_error_full("Failed to sync file", self.path.display().to_string(), e.to_string())
        })?;
        info!("Finished writing {}", self.path.display());
        Ok(())
    }
}
