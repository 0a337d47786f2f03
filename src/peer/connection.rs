//! Peer connection module
//!
//! Drives one remote peer: handshake, message loop, request pipelining and
//! per-request timeouts. Block bookkeeping lives in the shared
//! [`PieceManager`](crate::storage::PieceManager); the lock is only taken for
//! short, I/O-free sections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::cli::Config;
use crate::error::TorrentError;
use crate::peer::state::{ConnectionState, PeerSession, SessionAction, SessionEvent};
use crate::protocol::{max_frame_len, Handshake, Message, PeerWire};
use crate::storage::{BlockOutcome, BlockRequest, SharedPieces};

/// Per-connection limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    pub pipeline_depth: usize,
    pub request_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    /// Silence allowed while requests are outstanding
    pub io_timeout: Duration,
    /// Silence allowed otherwise
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl From<&Config> for PeerSettings {
    fn from(config: &Config) -> Self {
        Self {
            pipeline_depth: config.pipeline_depth,
            request_timeout: config.request_timeout(),
            max_consecutive_timeouts: config.max_consecutive_timeouts,
            io_timeout: config.io_timeout(),
            idle_timeout: config.idle_timeout(),
            keepalive_interval: config.keepalive_interval(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Piece-level events reported to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    PieceVerified { index: u32 },
    PieceCorrupt { index: u32, contributors: Vec<SocketAddr> },
}

/// How a connection ended
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub addr: SocketAddr,
    pub peer_id: Option<[u8; 20]>,
    pub final_state: ConnectionState,
    pub blocks_received: u64,
    pub timeouts: u64,
    /// Requests this peer still held when it closed
    pub released: usize,
    pub error: Option<TorrentError>,
}

impl ConnectionReport {
    pub fn is_failed(&self) -> bool {
        self.final_state == ConnectionState::Failed
    }
}

/// Everything a connection needs from the transfer it belongs to
#[derive(Clone)]
pub struct TransferContext {
    pub content_id: [u8; 20],
    pub local_peer_id: [u8; 20],
    pub piece_count: usize,
    pub pieces: SharedPieces,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub settings: PeerSettings,
    /// Bumped whenever blocks return to the pool or a piece verifies
    pub work: Arc<watch::Sender<u64>>,
}

impl TransferContext {
    pub fn new(
        content_id: [u8; 20],
        local_peer_id: [u8; 20],
        piece_count: usize,
        pieces: SharedPieces,
        events: mpsc::UnboundedSender<PeerEvent>,
        settings: PeerSettings,
    ) -> Self {
        let (work, _) = watch::channel(0);
        Self {
            content_id,
            local_peer_id,
            piece_count,
            pieces,
            events,
            settings,
            work: Arc::new(work),
        }
    }

    /// Wake idle connections so they re-check the piece manager
    pub fn signal_work(&self) {
        self.work.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    request: BlockRequest,
    deadline: Instant,
}

/// Represents a connected peer
pub struct PeerConnection<S> {
    addr: SocketAddr,
    wire: PeerWire<S>,
    session: PeerSession,
    ctx: TransferContext,
    work: watch::Receiver<u64>,
    in_flight: Vec<InFlight>,
    last_received: Instant,
    last_sent: Instant,
    /// When the request window last went from empty to busy
    waiting_since: Instant,
    consecutive_timeouts: u32,
    blocks_received: u64,
    timeouts: u64,
}

impl PeerConnection<TcpStream> {
    /// Dial `addr` and run the connection to completion
    pub async fn connect_and_run(addr: SocketAddr, ctx: TransferContext) -> ConnectionReport {
        debug!("Connecting to peer: {}", addr);
        let socket = match timeout(ctx.settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                debug!("Failed to connect to {}: {}", addr, e);
                return Self::dial_failure(addr, TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string()));
            }
            Err(e) => {
                debug!("Connection timeout to {}", addr);
                return Self::dial_failure(addr, TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string()));
            }
        };

        if let Err(e) = socket.set_nodelay(true) {
            trace!("set_nodelay failed for {}: {}", addr, e);
        }
        PeerConnection::new(addr, socket, ctx).run().await
    }

    fn dial_failure(addr: SocketAddr, error: TorrentError) -> ConnectionReport {
        ConnectionReport {
            addr,
            peer_id: None,
            final_state: ConnectionState::Failed,
            blocks_received: 0,
            timeouts: 0,
            released: 0,
            error: Some(error),
        }
    }
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream
    pub fn new(addr: SocketAddr, stream: S, ctx: TransferContext) -> Self {
        Self {
            addr,
            wire: PeerWire::new(stream, max_frame_len(ctx.piece_count)),
            session: PeerSession::new(ctx.piece_count),
            work: ctx.work.subscribe(),
            ctx,
            in_flight: Vec::new(),
            last_received: Instant::now(),
            last_sent: Instant::now(),
            waiting_since: Instant::now(),
            consecutive_timeouts: 0,
            blocks_received: 0,
            timeouts: 0,
        }
    }

    /// Run until the transfer completes or the connection fails.
    ///
    /// Whatever the outcome, every block still requested by this peer and its
    /// availability are returned to the piece manager before this returns.
    pub async fn run(mut self) -> ConnectionReport {
        let result = self.drive().await;

        let released = self.ctx.pieces.lock().await.remove_peer(self.addr);
        self.in_flight.clear();
        if released > 0 {
            self.ctx.signal_work();
        }

        let error = match result {
            Ok(()) => {
                debug!("Connection to {} finished, transfer complete", self.addr);
                None
            }
            Err(e) => {
                self.session.fail();
                let e = e.with_peer(self.addr.to_string());
                warn!("Peer {} failed: {}", self.addr, e);
                Some(e)
            }
        };

        ConnectionReport {
            addr: self.addr,
            peer_id: self.session.peer_id,
            final_state: self.session.state(),
            blocks_received: self.blocks_received,
            timeouts: self.timeouts,
            released,
            error,
        }
    }

    async fn drive(&mut self) -> Result<(), TorrentError> {
        self.handshake().await?;

        loop {
            if self.ctx.pieces.lock().await.is_complete() {
                return Ok(());
            }
            self.work.borrow_and_update();
            self.fill_pipeline().await?;

            let deadline = self.next_deadline();
            tokio::select! {
                read = timeout_at(deadline, self.wire.read_message()) => match read {
                    Ok(message) => {
                        let message = message?;
                        self.last_received = Instant::now();
                        self.handle_message(message).await?;
                    }
                    Err(_) => self.handle_deadline().await?,
                },
                // The read above is cancel safe, so waking here loses nothing
                _ = self.work.changed() => {
                    trace!("Work signal for {}", self.addr);
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), TorrentError> {
        let ours = Handshake::new(self.ctx.content_id, self.ctx.local_peer_id);
        timeout(self.ctx.settings.io_timeout, self.wire.write_handshake(&ours)).await??;
        self.last_sent = Instant::now();
        self.session.transition(SessionEvent::HandshakeSent)?;

        let theirs = timeout(self.ctx.settings.io_timeout, self.wire.read_handshake()).await??;
        theirs.validate(&self.ctx.content_id)?;
        self.session
            .transition(SessionEvent::HandshakeAccepted { peer_id: theirs.peer_id })?;
        self.last_received = Instant::now();

        info!(
            "Handshake completed with {} (peer id {})",
            self.addr,
            String::from_utf8_lossy(&theirs.peer_id)
        );
        Ok(())
    }

    /// Declare interest and top the request window up to `pipeline_depth`
    async fn fill_pipeline(&mut self) -> Result<(), TorrentError> {
        let mut requests = Vec::new();
        let declare_interest;
        {
            let mut pieces = self.ctx.pieces.lock().await;
            declare_interest = !self.session.am_interested && pieces.has_assignable(&self.session.bitfield);

            if !self.session.peer_choking && (self.session.am_interested || declare_interest) {
                while self.in_flight.len() + requests.len() < self.ctx.settings.pipeline_depth {
                    match pieces.select_assignment(self.addr, &self.session.bitfield) {
                        Some(request) => requests.push(request),
                        None => break,
                    }
                }
            }
        }

        if declare_interest {
            self.session.am_interested = true;
            self.send(Message::Interested).await?;
        }

        if self.in_flight.is_empty() && !requests.is_empty() {
            self.waiting_since = Instant::now();
        }
        for request in requests {
            self.in_flight.push(InFlight {
                request,
                deadline: Instant::now() + self.ctx.settings.request_timeout,
            });
            trace!("Requesting {}:{} ({} bytes) from {}", request.piece, request.offset, request.length, self.addr);
            self.send(Message::Request {
                index: request.piece,
                begin: request.offset,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), TorrentError> {
        match self.session.apply(message)? {
            SessionAction::None => {}
            SessionAction::ReleaseRequests => {
                let released = self.ctx.pieces.lock().await.release_peer(self.addr);
                self.in_flight.clear();
                debug!("Choked by {}, released {} requests", self.addr, released);
                if released > 0 {
                    self.ctx.signal_work();
                }
            }
            SessionAction::RegisterBitfield => {
                self.ctx
                    .pieces
                    .lock()
                    .await
                    .register_bitfield(self.addr, &self.session.bitfield);
            }
            SessionAction::RegisterHave(index) => {
                self.ctx.pieces.lock().await.register_have(self.addr, index)?;
            }
            SessionAction::Block { index, begin, data } => self.handle_block(index, begin, data).await?,
        }
        Ok(())
    }

    async fn handle_block(&mut self, index: u32, begin: u32, data: Vec<u8>) -> Result<(), TorrentError> {
        let position = self
            .in_flight
            .iter()
            .position(|f| f.request.piece == index && f.request.offset == begin);
        let Some(position) = position else {
            trace!("Ignoring unrequested block {}:{} from {}", index, begin, self.addr);
            return Ok(());
        };

        self.in_flight.swap_remove(position);
        self.consecutive_timeouts = 0;
        self.blocks_received += 1;

        let outcome = self
            .ctx
            .pieces
            .lock()
            .await
            .complete_block(self.addr, index, begin, &data)?;

        let event = match outcome {
            BlockOutcome::PieceVerified { index } => PeerEvent::PieceVerified { index },
            BlockOutcome::PieceCorrupt { index, contributors } => PeerEvent::PieceCorrupt { index, contributors },
            BlockOutcome::Stored | BlockOutcome::Ignored => return Ok(()),
        };
        self.ctx.signal_work();
        if self.ctx.events.send(event).is_err() {
            trace!("Coordinator gone, dropping piece event");
        }
        Ok(())
    }

    /// A request deadline, the idle limit or the keep-alive interval passed
    async fn handle_deadline(&mut self) -> Result<(), TorrentError> {
        let now = Instant::now();
        let (expired, pending): (Vec<InFlight>, Vec<InFlight>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|f| f.deadline <= now);
        self.in_flight = pending;

        if expired.is_empty() {
            if now >= self.idle_deadline() {
                return Err(TorrentError::peer_error(format!(
                    "No message for {:?}",
                    now.duration_since(self.last_received)
                )));
            }
            if now >= self.last_sent + self.ctx.settings.keepalive_interval {
                trace!("Sending keep-alive to {}", self.addr);
                self.send(Message::KeepAlive).await?;
            }
            return Ok(());
        }

        {
            let mut pieces = self.ctx.pieces.lock().await;
            for flight in &expired {
                pieces.release_assignment(flight.request.piece, flight.request.offset);
            }
        }
        self.ctx.signal_work();

        for flight in expired {
            self.timeouts += 1;
            self.consecutive_timeouts += 1;
            debug!(
                "Request {}:{} to {} timed out ({} in a row)",
                flight.request.piece, flight.request.offset, self.addr, self.consecutive_timeouts
            );
            if self.consecutive_timeouts >= self.ctx.settings.max_consecutive_timeouts {
                return Err(TorrentError::peer_error(format!(
                    "{} consecutive request timeouts",
                    self.consecutive_timeouts
                )));
            }
            self.send(Message::Cancel {
                index: flight.request.piece,
                begin: flight.request.offset,
                length: flight.request.length,
            })
            .await?;
        }
        Ok(())
    }

    /// Silence limit: short while we wait on blocks, long for an idle peer
    fn idle_deadline(&self) -> Instant {
        if self.in_flight.is_empty() {
            self.last_received + self.ctx.settings.idle_timeout
        } else {
            self.last_received.max(self.waiting_since) + self.ctx.settings.io_timeout
        }
    }

    fn next_deadline(&self) -> Instant {
        let idle = self.idle_deadline();
        let keepalive = self.last_sent + self.ctx.settings.keepalive_interval;
        self.in_flight
            .iter()
            .map(|f| f.deadline)
            .chain([idle, keepalive])
            .min()
            .unwrap_or(idle)
    }

    async fn send(&mut self, message: Message) -> Result<(), TorrentError> {
        timeout(self.ctx.settings.io_timeout, self.wire.send(&message)).await??;
        self.last_sent = Instant::now();
        Ok(())
    }
}
