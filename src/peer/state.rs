//! Peer state module
//!
//! Connection state machine and the per-peer protocol flags. Every inbound
//! message goes through [`PeerSession::apply`], which rejects events that are
//! invalid for the current state and tells the connection what to do with
//! the shared piece state.

use std::fmt;

use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::peer::Bitfield;
use crate::protocol::Message;

/// Represents the state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Dialing or dialed, nothing sent yet
    #[default]
    Connecting,
    /// Our handshake is on the wire
    HandshakeSent,
    /// Handshakes exchanged and validated
    Established,
    /// Terminal
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::HandshakeSent => "handshake-sent",
            ConnectionState::Established => "established",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle events that move the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    HandshakeSent,
    HandshakeAccepted { peer_id: [u8; 20] },
    Failed,
}

/// What the connection must do after a message was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    None,
    /// Peer choked us; every in-flight request goes back to the pool
    ReleaseRequests,
    /// Peer announced its full bitmap
    RegisterBitfield,
    /// Peer announced one more piece
    RegisterHave(usize),
    /// Block payload for (piece, offset)
    Block { index: u32, begin: u32, data: Vec<u8> },
}

/// Protocol state of one remote peer
#[derive(Debug, Clone)]
pub struct PeerSession {
    state: ConnectionState,
    /// Peer id taken from the remote handshake
    pub peer_id: Option<[u8; 20]>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Pieces the peer claims to have
    pub bitfield: Bitfield,
    messages_seen: u64,
}

impl PeerSession {
    pub fn new(piece_count: usize) -> Self {
        Self {
            state: ConnectionState::Connecting,
            peer_id: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(piece_count),
            messages_seen: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        self.state == ConnectionState::Established && !self.peer_choking && self.am_interested
    }

    /// Advance the lifecycle; out-of-order events are protocol errors
    pub fn transition(&mut self, event: SessionEvent) -> Result<(), TorrentError> {
        let next = match (self.state, event) {
            (ConnectionState::Failed, _) => {
                return Err(TorrentError::protocol_error("Connection already failed"));
            }
            (_, SessionEvent::Failed) => ConnectionState::Failed,
            (ConnectionState::Connecting, SessionEvent::HandshakeSent) => ConnectionState::HandshakeSent,
            (ConnectionState::HandshakeSent, SessionEvent::HandshakeAccepted { peer_id }) => {
                self.peer_id = Some(peer_id);
                ConnectionState::Established
            }
            (state, event) => {
                return Err(TorrentError::protocol_error(format!(
                    "Event {:?} invalid in state {}",
                    event, state
                )));
            }
        };

        trace!("Connection state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark the session failed; idempotent
    pub fn fail(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// Apply one inbound message
    pub fn apply(&mut self, message: Message) -> Result<SessionAction, TorrentError> {
        if self.state != ConnectionState::Established {
            return Err(TorrentError::protocol_error(format!(
                "Received {:?} in state {}",
                message.message_id(),
                self.state
            )));
        }

        if message == Message::KeepAlive {
            return Ok(SessionAction::None);
        }
        let first = self.messages_seen == 0;
        self.messages_seen += 1;

        let action = match message {
            Message::KeepAlive => SessionAction::None,
            Message::Choke => {
                self.peer_choking = true;
                SessionAction::ReleaseRequests
            }
            Message::Unchoke => {
                self.peer_choking = false;
                SessionAction::None
            }
            Message::Interested => {
                self.peer_interested = true;
                SessionAction::None
            }
            Message::NotInterested => {
                self.peer_interested = false;
                SessionAction::None
            }
            Message::Have { piece_index } => {
                let index = piece_index as usize;
                if index >= self.bitfield.len() {
                    return Err(TorrentError::protocol_error(format!(
                        "Have for piece {} out of range",
                        piece_index
                    )));
                }
                self.bitfield.set(index);
                SessionAction::RegisterHave(index)
            }
            Message::Bitfield { bitfield } => {
                if !first {
                    return Err(TorrentError::protocol_error("Bitfield must be the first message"));
                }
                self.bitfield = Bitfield::from_bytes(&bitfield, self.bitfield.len())?;
                debug!("Peer has {}/{} pieces", self.bitfield.count(), self.bitfield.len());
                SessionAction::RegisterBitfield
            }
            Message::Piece { index, begin, block } => SessionAction::Block {
                index,
                begin,
                data: block,
            },
            Message::Request { index, begin, .. } => {
                trace!("Ignoring upload request for {}:{}", index, begin);
                SessionAction::None
            }
            Message::Cancel { .. } => SessionAction::None,
            Message::Unknown { id, payload } => {
                debug!("Ignoring unknown message id {} ({} bytes)", id, payload.len());
                SessionAction::None
            }
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established(piece_count: usize) -> PeerSession {
        let mut session = PeerSession::new(piece_count);
        session.transition(SessionEvent::HandshakeSent).unwrap();
        session
            .transition(SessionEvent::HandshakeAccepted { peer_id: [9u8; 20] })
            .unwrap();
        session
    }

    #[test]
    fn test_initial_flags() {
        let session = PeerSession::new(4);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(session.am_choking);
        assert!(session.peer_choking);
        assert!(!session.am_interested);
        assert!(!session.peer_interested);
        assert!(!session.can_request());
    }

    #[test]
    fn test_lifecycle() {
        let session = established(4);
        assert_eq!(session.state(), ConnectionState::Established);
        assert_eq!(session.peer_id, Some([9u8; 20]));
    }

    #[test]
    fn test_out_of_order_lifecycle_rejected() {
        let mut session = PeerSession::new(4);
        assert!(session
            .transition(SessionEvent::HandshakeAccepted { peer_id: [0u8; 20] })
            .is_err());

        session.transition(SessionEvent::Failed).unwrap();
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(session.transition(SessionEvent::HandshakeSent).is_err());
    }

    #[test]
    fn test_piece_before_handshake_rejected() {
        let mut session = PeerSession::new(4);
        session.transition(SessionEvent::HandshakeSent).unwrap();
        let err = session
            .apply(Message::Piece { index: 0, begin: 0, block: vec![1] })
            .unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolError { .. }));
    }

    #[test]
    fn test_choke_sets_flag_and_releases() {
        let mut session = established(4);
        assert_eq!(session.apply(Message::Unchoke).unwrap(), SessionAction::None);
        assert!(!session.peer_choking);

        assert_eq!(session.apply(Message::Choke).unwrap(), SessionAction::ReleaseRequests);
        assert!(session.peer_choking);
    }

    #[test]
    fn test_bitfield_only_first() {
        let mut session = established(4);
        assert_eq!(
            session.apply(Message::Bitfield { bitfield: vec![0xa0] }).unwrap(),
            SessionAction::RegisterBitfield
        );
        assert!(session.bitfield.has(0));
        assert!(session.bitfield.has(2));

        assert!(session.apply(Message::Bitfield { bitfield: vec![0xf0] }).is_err());
    }

    #[test]
    fn test_bitfield_after_keepalive_still_first() {
        let mut session = established(4);
        session.apply(Message::KeepAlive).unwrap();
        assert!(session.apply(Message::Bitfield { bitfield: vec![0xf0] }).is_ok());
    }

    #[test]
    fn test_bitfield_late_rejected() {
        let mut session = established(4);
        session.apply(Message::Unchoke).unwrap();
        assert!(session.apply(Message::Bitfield { bitfield: vec![0xf0] }).is_err());
    }

    #[test]
    fn test_have_range_checked() {
        let mut session = established(4);
        assert_eq!(
            session.apply(Message::Have { piece_index: 3 }).unwrap(),
            SessionAction::RegisterHave(3)
        );
        assert!(session.bitfield.has(3));
        assert!(session.apply(Message::Have { piece_index: 4 }).is_err());
    }

    #[test]
    fn test_unknown_and_upload_requests_ignored() {
        let mut session = established(4);
        assert_eq!(
            session.apply(Message::Unknown { id: 20, payload: vec![1, 2] }).unwrap(),
            SessionAction::None
        );
        assert_eq!(
            session
                .apply(Message::Request { index: 0, begin: 0, length: 16384 })
                .unwrap(),
            SessionAction::None
        );
    }
}
