//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer-to-peer protocol.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{generate_peer_id, Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{max_frame_len, PeerWire};
