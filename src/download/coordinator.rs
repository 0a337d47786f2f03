//! Download coordinator
//!
//! Owns the metadata and the shared [`PieceManager`], dials candidate peers
//! with bounded concurrency and streams verified pieces to a [`PieceSink`].
//! Every peer runs in its own task; the coordinator only reacts to piece
//! events and to connections closing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cli::Config;
use crate::error::TorrentError;
use crate::peer::{ConnectionReport, PeerConnection, PeerEvent, PeerSettings, TransferContext};
use crate::protocol::generate_peer_id;
use crate::storage::{PieceManager, PieceSink, SharedPieces};
use crate::torrent::TorrentMetadata;

/// Outcome of a successful transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub pieces_verified: usize,
    pub total_pieces: usize,
    /// Blocks returned to the pool by choke, timeout or failure
    pub released: u64,
    pub hash_failures: u64,
    /// Peers that completed the handshake during this run
    pub peers_connected: usize,
    pub peers_failed: usize,
    pub banned: usize,
}

/// Drives one transfer across any number of peer connections
pub struct DownloadCoordinator {
    metadata: Arc<TorrentMetadata>,
    config: Config,
    peer_id: [u8; 20],
    pieces: SharedPieces,
    strikes: HashMap<SocketAddr, u32>,
    banned: HashSet<SocketAddr>,
}

/// Per-run bookkeeping of spawned peer tasks
struct ActivePeers {
    tasks: JoinSet<ConnectionReport>,
    handles: HashMap<SocketAddr, AbortHandle>,
    addrs: HashMap<Id, SocketAddr>,
}

impl ActivePeers {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            handles: HashMap::new(),
            addrs: HashMap::new(),
        }
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    fn spawn(&mut self, addr: SocketAddr, ctx: TransferContext) {
        self.spawn_task(addr, PeerConnection::connect_and_run(addr, ctx));
    }

    fn spawn_task<F>(&mut self, addr: SocketAddr, task: F)
    where
        F: Future<Output = ConnectionReport> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.addrs.insert(handle.id(), addr);
        self.handles.insert(addr, handle);
    }

    /// Address of the peer a finished task was serving
    fn addr_of(&self, id: Id) -> Option<SocketAddr> {
        self.addrs.get(&id).copied()
    }

    fn forget(&mut self, addr: &SocketAddr) -> Option<AbortHandle> {
        let handle = self.handles.remove(addr)?;
        self.addrs.remove(&handle.id());
        Some(handle)
    }

    fn abort(&mut self, addr: &SocketAddr) -> bool {
        match self.forget(addr) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl DownloadCoordinator {
    /// Create a coordinator with a peer id drawn from `rng`
    pub fn new<R: Rng + ?Sized>(metadata: Arc<TorrentMetadata>, config: Config, rng: &mut R) -> Self {
        let peer_id = generate_peer_id(rng);
        Self::with_peer_id(metadata, config, peer_id)
    }

    /// Create a coordinator with a fixed peer id
    pub fn with_peer_id(metadata: Arc<TorrentMetadata>, config: Config, peer_id: [u8; 20]) -> Self {
        let pieces = Arc::new(Mutex::new(PieceManager::new(&metadata)));
        Self {
            metadata,
            config,
            peer_id,
            pieces,
            strikes: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn metadata(&self) -> &TorrentMetadata {
        &self.metadata
    }

    pub fn pieces(&self) -> SharedPieces {
        self.pieces.clone()
    }

    /// Peers dropped for contributing to corrupt pieces
    pub fn banned(&self) -> &HashSet<SocketAddr> {
        &self.banned
    }

    pub async fn is_complete(&self) -> bool {
        self.pieces.lock().await.is_complete()
    }

    /// Bytes still to fetch, as reported to the tracker
    pub async fn bytes_left(&self) -> u64 {
        self.pieces.lock().await.bytes_left()
    }

    /// Download from `candidates` until complete or until no connection is left.
    ///
    /// State survives between calls, so a caller may re-announce and run again
    /// with a fresh candidate list. Banned peers are never dialed again.
    pub async fn run<S>(&mut self, candidates: &[SocketAddr], sink: &mut S) -> Result<DownloadReport>
    where
        S: PieceSink + ?Sized,
    {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let ctx = TransferContext::new(
            self.metadata.content_id,
            self.peer_id,
            self.metadata.piece_count(),
            self.pieces.clone(),
            events_tx,
            PeerSettings::from(&self.config),
        );

        let mut seen = HashSet::new();
        let mut queue: VecDeque<SocketAddr> = candidates
            .iter()
            .copied()
            .filter(|addr| !self.banned.contains(addr) && seen.insert(*addr))
            .collect();
        info!(
            "Starting transfer of '{}' with {} candidate peers",
            self.metadata.name,
            queue.len()
        );

        let mut active = ActivePeers::new();
        let mut report = DownloadReport::default();
        let mut outcome = Ok(());

        loop {
            if self.pieces.lock().await.is_complete() {
                break;
            }

            while active.len() < self.config.max_connections {
                let Some(addr) = queue.pop_front() else { break };
                debug!("Dialing {} ({} queued)", addr, queue.len());
                active.spawn(addr, ctx.clone());
            }
            if active.tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(event) = events.recv() => {
                    if let Err(e) = self.handle_event(event, &ctx, &mut active, &mut queue, sink).await {
                        outcome = Err(e);
                        break;
                    }
                }
                Some(joined) = active.tasks.join_next() => {
                    self.handle_join(joined, &ctx, &mut active, &mut report).await;
                }
            }
        }

        // Drain events that raced with the last completion
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::PieceCorrupt { index, contributors } = event {
                self.add_strikes(index, &contributors, &ctx, &mut active, &mut queue).await;
            }
        }
        if outcome.is_ok() {
            outcome = self.flush_verified(sink).await;
        }

        // Aborted tasks never reach their own cleanup
        active.tasks.shutdown().await;
        let unreported: Vec<SocketAddr> = active.handles.keys().copied().collect();
        if !unreported.is_empty() {
            let mut pieces = self.pieces.lock().await;
            for addr in unreported {
                pieces.remove_peer(addr);
            }
        }
        outcome?;

        let stats = self.pieces.lock().await.stats();
        let total = self.metadata.piece_count();
        let complete = self.pieces.lock().await.is_complete();

        if !complete {
            warn!("No peers left with {}/{} pieces verified", stats.verified, total);
            return Err(TorrentError::TransferFailed {
                verified: stats.verified,
                total,
            }
            .into());
        }

        sink.finish()
            .await
            .map_err(|e| storage_failure("Failed to finish output", e))?;
        report.pieces_verified = stats.verified;
        report.total_pieces = total;
        report.released = stats.released;
        report.hash_failures = stats.hash_failures;
        report.banned = self.banned.len();
        info!(
            "Transfer complete: {} pieces, {} blocks reassigned, {} hash failures",
            total, report.released, report.hash_failures
        );
        Ok(report)
    }

    /// Account for a peer task that ended
    async fn handle_join(
        &mut self,
        joined: std::result::Result<ConnectionReport, JoinError>,
        ctx: &TransferContext,
        active: &mut ActivePeers,
        report: &mut DownloadReport,
    ) {
        match joined {
            Ok(closed) => {
                active.forget(&closed.addr);
                record_connection(&closed, report);
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                report.peers_failed += 1;
                let Some(addr) = active.addr_of(e.id()) else {
                    error!("Peer task panicked: {}", e);
                    return;
                };
                error!("Peer task for {} panicked: {}", addr, e);
                active.forget(&addr);
                let released = self.pieces.lock().await.remove_peer(addr);
                if released > 0 {
                    ctx.signal_work();
                }
            }
        }
    }

    async fn handle_event<S>(
        &mut self,
        event: PeerEvent,
        ctx: &TransferContext,
        active: &mut ActivePeers,
        queue: &mut VecDeque<SocketAddr>,
        sink: &mut S,
    ) -> Result<()>
    where
        S: PieceSink + ?Sized,
    {
        match event {
            PeerEvent::PieceVerified { index } => {
                debug!("Piece {} verified", index);
                self.flush_verified(sink).await?;
            }
            PeerEvent::PieceCorrupt { index, contributors } => {
                self.add_strikes(index, &contributors, ctx, active, queue).await;
            }
        }
        Ok(())
    }

    /// Charge every contributor of a corrupt piece; ban at the configured limit
    async fn add_strikes(
        &mut self,
        index: u32,
        contributors: &[SocketAddr],
        ctx: &TransferContext,
        active: &mut ActivePeers,
        queue: &mut VecDeque<SocketAddr>,
    ) {
        for peer in contributors {
            if self.banned.contains(peer) {
                continue;
            }
            let strikes = self.strikes.entry(*peer).or_insert(0);
            *strikes += 1;
            warn!("Peer {} contributed to corrupt piece {} ({} strikes)", peer, index, strikes);

            if *strikes >= self.config.max_hash_failures_per_peer {
                let released = self.pieces.lock().await.ban_peer(*peer);
                let aborted = active.abort(peer);
                queue.retain(|addr| addr != peer);
                self.banned.insert(*peer);
                warn!(
                    "Banned {} (released {} blocks, connection aborted: {})",
                    peer, released, aborted
                );
                ctx.signal_work();
            }
        }
    }

    /// Hand verified pieces to the sink one at a time, lock released first.
    ///
    /// A piece leaves the manager's queue only once the sink accepted it.
    async fn flush_verified<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: PieceSink + ?Sized,
    {
        loop {
            let next = self.pieces.lock().await.next_verified();
            let Some((index, data)) = next else {
                return Ok(());
            };
            if let Err(e) = sink.write_piece(index, data.clone()).await {
                self.pieces.lock().await.requeue_verified(index, data);
                error!("Failed to persist piece {}: {}", index, e);
                return Err(storage_failure(format!("Failed to persist piece {}", index), e).into());
            }
        }
    }
}

fn storage_failure(message: impl Into<String>, cause: anyhow::Error) -> TorrentError {
    match cause.downcast::<TorrentError>() {
        Ok(e @ TorrentError::StorageError { .. }) => e,
        Ok(other) => TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: Some(other.to_string()),
        },
        Err(cause) => TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: Some(cause.to_string()),
        },
    }
}

fn record_connection(closed: &ConnectionReport, report: &mut DownloadReport) {
    if closed.peer_id.is_some() {
        report.peers_connected += 1;
    }
    if closed.is_failed() {
        report.peers_failed += 1;
        debug!(
            "Connection to {} closed after {} blocks: {}",
            closed.addr,
            closed.blocks_received,
            closed
                .error
                .as_ref()
                .map_or_else(|| "no error".to_string(), |e| e.to_string())
        );
    }
}
