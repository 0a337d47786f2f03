//! Storage module
//!
//! Piece/block bookkeeping for a transfer and the sinks verified pieces are
//! handed to.

pub mod piece;
pub mod sink;

use std::sync::Arc;

use tokio::sync::Mutex;

// Re-export piece types
pub use piece::{BlockOutcome, BlockRequest, BlockState, PieceManager, PieceStats, PieceStatus, BLOCK_SIZE};

// Re-export sink types
pub use sink::{FileSink, MemorySink, PieceSink};

/// Piece manager shared by every peer task of one transfer
pub type SharedPieces = Arc<Mutex<PieceManager>>;
