//! Peer management module
//!
//! Handles peer connections and state management.

pub mod bitfield;
pub mod connection;
pub mod state;

// Re-export main types
pub use bitfield::Bitfield;
pub use connection::{ConnectionReport, PeerConnection, PeerEvent, PeerSettings, TransferContext};
pub use state::{ConnectionState, PeerSession, SessionAction, SessionEvent};
