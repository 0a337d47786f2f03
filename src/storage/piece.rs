//! Piece manager
//!
//! Owns every piece and block state of a transfer. Callers share one
//! instance behind a mutex; no method here blocks or performs I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::Bitfield;
use crate::torrent::info::{piece_size, TorrentMetadata};

/// Standard request size
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Status of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceStatus {
    /// No block received yet, or rolled back after a hash mismatch
    #[default]
    Missing,
    /// At least one block requested or received
    InProgress,
    /// Every block received, hash not yet checked
    Downloaded,
    /// Hash matched; terminal
    Verified,
}

/// State of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Unassigned,
    Requested { peer: SocketAddr, requested_at: Instant },
    Received,
}

/// A block handed out by [`PieceManager::select_assignment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Result of [`PieceManager::complete_block`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Block stored, piece still incomplete
    Stored,
    /// Last block arrived and the piece hash matched
    PieceVerified { index: u32 },
    /// Last block arrived and the hash did not match; the piece was reset
    PieceCorrupt { index: u32, contributors: Vec<SocketAddr> },
    /// Block already received or piece already verified
    Ignored,
}

/// Transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceStats {
    pub verified: usize,
    pub released: u64,
    pub hash_failures: u64,
}

#[derive(Debug)]
struct Block {
    offset: u32,
    length: u32,
    state: BlockState,
}

#[derive(Debug)]
struct Piece {
    length: u32,
    hash: [u8; 20],
    status: PieceStatus,
    blocks: Vec<Block>,
    buffer: Vec<u8>,
    contributors: HashSet<SocketAddr>,
}

impl Piece {
    fn new(length: u32, hash: [u8; 20]) -> Self {
        let blocks = (0..length.div_ceil(BLOCK_SIZE))
            .map(|i| {
                let offset = i * BLOCK_SIZE;
                Block {
                    offset,
                    length: (length - offset).min(BLOCK_SIZE),
                    state: BlockState::Unassigned,
                }
            })
            .collect();

        Self {
            length,
            hash,
            status: PieceStatus::Missing,
            blocks,
            buffer: Vec::new(),
            contributors: HashSet::new(),
        }
    }

    fn first_unassigned(&self) -> Option<usize> {
        self.blocks.iter().position(|b| b.state == BlockState::Unassigned)
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Unassigned;
        }
        self.buffer = Vec::new();
        self.status = PieceStatus::Missing;
    }
}

/// Manages piece/block download state for a torrent
#[derive(Debug)]
pub struct PieceManager {
    pieces: Vec<Piece>,
    availability: Vec<u32>,
    peers: HashMap<SocketAddr, Bitfield>,
    banned: HashSet<SocketAddr>,
    verified: VecDeque<(u32, Bytes)>,
    stats: PieceStats,
}

impl PieceManager {
    pub fn new(metadata: &TorrentMetadata) -> Self {
        Self::from_parts(&metadata.piece_hashes, metadata.piece_length, metadata.total_length())
    }

    /// Build from raw geometry; the last piece takes whatever remains of `total_length`
    pub fn from_parts(piece_hashes: &[[u8; 20]], piece_length: u32, total_length: u64) -> Self {
        let count = piece_hashes.len();
        let pieces = piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let length = piece_size(total_length, piece_length, count, index).unwrap_or(0);
                Piece::new(length, *hash)
            })
            .collect();

        debug!("Piece manager tracking {} pieces", count);
        Self {
            pieces,
            availability: vec![0; count],
            peers: HashMap::new(),
            banned: HashSet::new(),
            verified: VecDeque::new(),
            stats: PieceStats::default(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn status(&self, index: usize) -> Option<PieceStatus> {
        self.pieces.get(index).map(|p| p.status)
    }

    pub fn block_state(&self, index: usize, offset: u32) -> Option<BlockState> {
        self.pieces
            .get(index)?
            .blocks
            .iter()
            .find(|b| b.offset == offset)
            .map(|b| b.state)
    }

    /// Number of peers known to have `index`
    pub fn availability(&self, index: usize) -> u32 {
        self.availability.get(index).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> PieceStats {
        self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.status == PieceStatus::Verified)
    }

    /// Payload bytes not yet verified
    pub fn bytes_left(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|p| p.status != PieceStatus::Verified)
            .map(|p| p.length as u64)
            .sum()
    }

    /// Record a peer's full bitmap, replacing anything registered before
    pub fn register_bitfield(&mut self, peer: SocketAddr, bitfield: &Bitfield) {
        if self.banned.contains(&peer) {
            return;
        }
        self.forget_availability(&peer);
        let len = self.availability.len();
        for index in bitfield.iter_set().filter(|&i| i < len) {
            self.availability[index] += 1;
        }
        self.peers.insert(peer, bitfield.clone());
        trace!("Registered bitfield from {} ({} pieces)", peer, bitfield.count());
    }

    /// Record a single `have`
    pub fn register_have(&mut self, peer: SocketAddr, index: usize) -> Result<(), TorrentError> {
        if index >= self.pieces.len() {
            return Err(TorrentError::protocol_error(format!(
                "Have for piece {} out of range ({} pieces)",
                index,
                self.pieces.len()
            )));
        }

        if self.banned.contains(&peer) {
            return Ok(());
        }

        let count = self.pieces.len();
        let bitfield = self.peers.entry(peer).or_insert_with(|| Bitfield::new(count));
        if !bitfield.has(index) {
            bitfield.set(index);
            self.availability[index] += 1;
        }
        Ok(())
    }

    /// Whether `bitfield` holds any piece still needed
    pub fn has_assignable(&self, bitfield: &Bitfield) -> bool {
        self.pieces
            .iter()
            .enumerate()
            .any(|(i, p)| p.status != PieceStatus::Verified && bitfield.has(i))
    }

    /// Pick the next block to request from `peer`.
    ///
    /// Rarest piece first among those the peer has and that still have an
    /// unassigned block; ties go to the lowest index. The chosen block is
    /// marked requested by `peer`.
    pub fn select_assignment(&mut self, peer: SocketAddr, bitfield: &Bitfield) -> Option<BlockRequest> {
        if self.banned.contains(&peer) {
            return None;
        }
        let (index, block_index) = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(i, p)| p.status != PieceStatus::Verified && bitfield.has(*i))
            .filter_map(|(i, p)| p.first_unassigned().map(|b| (i, b)))
            .min_by_key(|(i, _)| (self.availability[*i], *i))?;

        let piece = &mut self.pieces[index];
        let block = &mut piece.blocks[block_index];
        block.state = BlockState::Requested {
            peer,
            requested_at: Instant::now(),
        };
        if piece.status == PieceStatus::Missing {
            piece.status = PieceStatus::InProgress;
        }

        let request = BlockRequest {
            piece: index as u32,
            offset: block.offset,
            length: block.length,
        };
        trace!("Assigned {:?} to {}", request, peer);
        Some(request)
    }

    /// Return a requested block to the unassigned pool. Piece status is left alone.
    pub fn release_assignment(&mut self, index: u32, offset: u32) -> bool {
        let block = match self
            .pieces
            .get_mut(index as usize)
            .and_then(|p| p.blocks.iter_mut().find(|b| b.offset == offset))
        {
            Some(block) => block,
            None => return false,
        };

        if matches!(block.state, BlockState::Requested { .. }) {
            block.state = BlockState::Unassigned;
            self.stats.released += 1;
            true
        } else {
            false
        }
    }

    /// Release every block currently requested by `peer`, returning how many
    pub fn release_peer(&mut self, peer: SocketAddr) -> usize {
        let mut released = 0;
        for block in self.pieces.iter_mut().flat_map(|p| p.blocks.iter_mut()) {
            if matches!(block.state, BlockState::Requested { peer: owner, .. } if owner == peer) {
                block.state = BlockState::Unassigned;
                released += 1;
            }
        }
        self.stats.released += released as u64;
        released
    }

    /// Drop a closing peer: its requested blocks and its availability go together
    pub fn remove_peer(&mut self, peer: SocketAddr) -> usize {
        let released = self.release_peer(peer);
        self.forget_availability(&peer);
        if released > 0 {
            debug!("Released {} blocks held by {}", released, peer);
        }
        released
    }

    /// Stop handing work to `peer` and release everything it holds
    pub fn ban_peer(&mut self, peer: SocketAddr) -> usize {
        self.banned.insert(peer);
        self.remove_peer(peer)
    }

    pub fn is_banned(&self, peer: &SocketAddr) -> bool {
        self.banned.contains(peer)
    }

    /// Store a received block and verify its piece once the last block is in
    pub fn complete_block(
        &mut self,
        peer: SocketAddr,
        index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockOutcome, TorrentError> {
        let piece = self.pieces.get_mut(index as usize).ok_or_else(|| {
            TorrentError::protocol_error(format!("Block for unknown piece {}", index))
        })?;
        if piece.status == PieceStatus::Verified || self.banned.contains(&peer) {
            return Ok(BlockOutcome::Ignored);
        }

        let piece_length = piece.length;
        let block = piece
            .blocks
            .iter_mut()
            .find(|b| b.offset == offset)
            .ok_or_else(|| TorrentError::protocol_error(format!("No block at piece {} offset {}", index, offset)))?;
        if block.length as usize != data.len() {
            return Err(TorrentError::protocol_error_with_source(
                format!("Block {}:{} has wrong length", index, offset),
                format!("expected {}, got {}", block.length, data.len()),
            ));
        }
        if block.state == BlockState::Received {
            return Ok(BlockOutcome::Ignored);
        }
        block.state = BlockState::Received;

        if piece.buffer.is_empty() {
            piece.buffer = vec![0u8; piece_length as usize];
        }
        let start = offset as usize;
        piece.buffer[start..start + data.len()].copy_from_slice(data);
        piece.contributors.insert(peer);
        piece.status = PieceStatus::InProgress;

        if piece.blocks.iter().any(|b| b.state != BlockState::Received) {
            return Ok(BlockOutcome::Stored);
        }

        piece.status = PieceStatus::Downloaded;
        let digest: [u8; 20] = Sha1::digest(&piece.buffer).into();
        let contributors: Vec<SocketAddr> = piece.contributors.drain().collect();

        if digest == piece.hash {
            piece.status = PieceStatus::Verified;
            let data = std::mem::take(&mut piece.buffer);
            self.verified.push_back((index, Bytes::from(data)));
            self.stats.verified += 1;
            info!(
                "Piece {} verified ({}/{})",
                index,
                self.stats.verified,
                self.pieces.len()
            );
            Ok(BlockOutcome::PieceVerified { index })
        } else {
            piece.reset();
            self.stats.hash_failures += 1;
            warn!(
                "Piece {} failed hash check (expected {}, got {}), re-fetching",
                index,
                hex::encode(piece.hash),
                hex::encode(digest)
            );
            Ok(BlockOutcome::PieceCorrupt { index, contributors })
        }
    }

    /// Drain verified piece data in verification order
    pub fn take_verified(&mut self) -> Vec<(u32, Bytes)> {
        self.verified.drain(..).collect()
    }

    /// Oldest verified piece not yet handed out
    pub fn next_verified(&mut self) -> Option<(u32, Bytes)> {
        self.verified.pop_front()
    }

    /// Put back a piece the caller failed to persist; it is handed out next
    pub fn requeue_verified(&mut self, index: u32, data: Bytes) {
        self.verified.push_front((index, data));
    }

    fn forget_availability(&mut self, peer: &SocketAddr) {
        if let Some(previous) = self.peers.remove(peer) {
            let len = self.availability.len();
            for index in previous.iter_set().filter(|&i| i < len) {
                self.availability[index] = self.availability[index].saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::test_data::sample_content;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn hashes(content: &[u8], piece_length: usize) -> Vec<[u8; 20]> {
        content
            .chunks(piece_length)
            .map(|c| Sha1::digest(c).into())
            .collect()
    }

    fn manager(content: &[u8], piece_length: u32) -> PieceManager {
        PieceManager::from_parts(&hashes(content, piece_length as usize), piece_length, content.len() as u64)
    }

    fn block_of(content: &[u8], piece_length: u32, request: BlockRequest) -> &[u8] {
        let start = request.piece as usize * piece_length as usize + request.offset as usize;
        &content[start..start + request.length as usize]
    }

    #[test]
    fn test_block_geometry() {
        let content = sample_content(40000);
        let mut pm = manager(&content, 32768);
        let all = Bitfield::full(2);

        let mut requests = Vec::new();
        while let Some(request) = pm.select_assignment(addr(1), &all) {
            requests.push(request);
        }

        assert_eq!(
            requests,
            vec![
                BlockRequest { piece: 0, offset: 0, length: 16384 },
                BlockRequest { piece: 0, offset: 16384, length: 16384 },
                BlockRequest { piece: 1, offset: 0, length: 40000 - 32768 },
            ]
        );
    }

    #[test]
    fn test_select_respects_bitfield() {
        let content = sample_content(3 * 16384);
        let mut pm = manager(&content, 16384);
        let mut only_two = Bitfield::new(3);
        only_two.set(2);

        let request = pm.select_assignment(addr(1), &only_two).unwrap();
        assert_eq!(request.piece, 2);
        assert!(pm.select_assignment(addr(1), &only_two).is_none());
        assert!(pm.select_assignment(addr(1), &Bitfield::new(3)).is_none());
    }

    #[test]
    fn test_select_never_returns_requested_or_received() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(2);

        let first = pm.select_assignment(addr(1), &all).unwrap();
        let second = pm.select_assignment(addr(2), &all).unwrap();
        assert_ne!(first, second);
        assert!(pm.select_assignment(addr(3), &all).is_none());

        pm.complete_block(addr(1), first.piece, first.offset, block_of(&content, 16384, first))
            .unwrap();
        assert!(pm.select_assignment(addr(3), &all).is_none());
        assert_eq!(pm.block_state(first.piece as usize, first.offset), Some(BlockState::Received));
    }

    #[test]
    fn test_rarest_first_with_lowest_index_tiebreak() {
        let content = sample_content(3 * 16384);
        let mut pm = manager(&content, 16384);

        pm.register_bitfield(addr(1), &Bitfield::full(3));
        let mut has_0_and_2 = Bitfield::new(3);
        has_0_and_2.set(0);
        has_0_and_2.set(2);
        pm.register_bitfield(addr(2), &has_0_and_2);

        // piece 1 is held by one peer, pieces 0 and 2 by two
        assert_eq!(pm.select_assignment(addr(1), &Bitfield::full(3)).unwrap().piece, 1);
        assert_eq!(pm.select_assignment(addr(1), &Bitfield::full(3)).unwrap().piece, 0);
        assert_eq!(pm.select_assignment(addr(1), &Bitfield::full(3)).unwrap().piece, 2);
    }

    #[test]
    fn test_have_updates_availability() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);

        pm.register_have(addr(1), 1).unwrap();
        pm.register_have(addr(1), 1).unwrap();
        assert_eq!(pm.availability(1), 1);
        assert!(pm.register_have(addr(1), 2).is_err());

        pm.remove_peer(addr(1));
        assert_eq!(pm.availability(1), 0);
    }

    #[test]
    fn test_verification_and_take_verified() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(2);

        let request = pm.select_assignment(addr(1), &all).unwrap();
        let outcome = pm
            .complete_block(addr(1), request.piece, request.offset, block_of(&content, 16384, request))
            .unwrap();
        assert_eq!(outcome, BlockOutcome::PieceVerified { index: 0 });
        assert_eq!(pm.status(0), Some(PieceStatus::Verified));
        assert!(!pm.is_complete());
        assert_eq!(pm.bytes_left(), 16384);

        let verified = pm.take_verified();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].1, &content[..16384]);
        assert!(pm.take_verified().is_empty());

        // a late duplicate for a verified piece changes nothing
        let again = pm.complete_block(addr(2), 0, 0, &content[..16384]).unwrap();
        assert_eq!(again, BlockOutcome::Ignored);
    }

    #[test]
    fn test_requeued_piece_is_handed_out_first() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(2);

        for _ in 0..2 {
            let request = pm.select_assignment(addr(1), &all).unwrap();
            pm.complete_block(addr(1), request.piece, request.offset, block_of(&content, 16384, request))
                .unwrap();
        }

        let (first, data) = pm.next_verified().unwrap();
        pm.requeue_verified(first, data.clone());
        assert_eq!(pm.next_verified(), Some((first, data)));
        assert!(pm.next_verified().is_some());
        assert!(pm.next_verified().is_none());
    }

    #[test]
    fn test_hash_mismatch_resets_whole_piece_then_refetch_verifies() {
        let content = sample_content(32768);
        let mut pm = manager(&content, 32768);
        let all = Bitfield::full(1);

        let a = pm.select_assignment(addr(1), &all).unwrap();
        let b = pm.select_assignment(addr(2), &all).unwrap();
        assert_eq!(
            pm.complete_block(addr(1), a.piece, a.offset, block_of(&content, 32768, a)).unwrap(),
            BlockOutcome::Stored
        );

        let corrupt = vec![0u8; b.length as usize];
        match pm.complete_block(addr(2), b.piece, b.offset, &corrupt).unwrap() {
            BlockOutcome::PieceCorrupt { index, mut contributors } => {
                contributors.sort();
                assert_eq!(index, 0);
                assert_eq!(contributors, vec![addr(1), addr(2)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(pm.status(0), Some(PieceStatus::Missing));
        assert_eq!(pm.block_state(0, 0), Some(BlockState::Unassigned));
        assert_eq!(pm.block_state(0, 16384), Some(BlockState::Unassigned));
        assert_eq!(pm.stats().hash_failures, 1);

        let mut outcome = BlockOutcome::Stored;
        while let Some(request) = pm.select_assignment(addr(3), &all) {
            outcome = pm
                .complete_block(addr(3), request.piece, request.offset, block_of(&content, 32768, request))
                .unwrap();
        }
        assert_eq!(outcome, BlockOutcome::PieceVerified { index: 0 });
        assert!(pm.is_complete());
    }

    #[test]
    fn test_release_assignment() {
        let content = sample_content(16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(1);

        let request = pm.select_assignment(addr(1), &all).unwrap();
        assert_eq!(pm.status(0), Some(PieceStatus::InProgress));
        assert!(pm.release_assignment(request.piece, request.offset));
        assert_eq!(pm.block_state(0, 0), Some(BlockState::Unassigned));
        assert_eq!(pm.status(0), Some(PieceStatus::InProgress));
        assert!(!pm.release_assignment(request.piece, request.offset));
        assert_eq!(pm.stats().released, 1);

        // released block can be handed to another peer
        assert_eq!(pm.select_assignment(addr(2), &all), Some(request));
    }

    #[test]
    fn test_remove_peer_releases_only_its_blocks() {
        let content = sample_content(3 * 16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(3);

        pm.select_assignment(addr(1), &all).unwrap();
        pm.select_assignment(addr(1), &all).unwrap();
        let kept = pm.select_assignment(addr(2), &all).unwrap();

        assert_eq!(pm.remove_peer(addr(1)), 2);
        assert!(matches!(
            pm.block_state(kept.piece as usize, kept.offset),
            Some(BlockState::Requested { peer, .. }) if peer == addr(2)
        ));
        assert_eq!(pm.stats().released, 2);
    }

    #[test]
    fn test_banned_peer_gets_no_work() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);
        let all = Bitfield::full(2);

        pm.register_bitfield(addr(1), &all);
        let held = pm.select_assignment(addr(1), &all).unwrap();
        assert_eq!(pm.ban_peer(addr(1)), 1);

        assert!(pm.is_banned(&addr(1)));
        assert_eq!(pm.availability(0), 0);
        assert!(pm.select_assignment(addr(1), &all).is_none());
        let late = pm
            .complete_block(addr(1), held.piece, held.offset, block_of(&content, 16384, held))
            .unwrap();
        assert_eq!(late, BlockOutcome::Ignored);
        assert_eq!(pm.select_assignment(addr(2), &all), Some(held));
    }

    #[test]
    fn test_complete_block_rejects_bad_geometry() {
        let content = sample_content(16384);
        let mut pm = manager(&content, 16384);

        assert!(pm.complete_block(addr(1), 5, 0, &content).is_err());
        assert!(pm.complete_block(addr(1), 0, 100, &content[..100]).is_err());
        assert!(pm.complete_block(addr(1), 0, 0, &content[..100]).is_err());
    }

    #[test]
    fn test_has_assignable() {
        let content = sample_content(2 * 16384);
        let mut pm = manager(&content, 16384);
        let mut only_zero = Bitfield::new(2);
        only_zero.set(0);

        assert!(pm.has_assignable(&only_zero));
        pm.complete_block(addr(1), 0, 0, &content[..16384]).unwrap();
        assert!(!pm.has_assignable(&only_zero));
        assert!(pm.has_assignable(&Bitfield::full(2)));
    }
}
