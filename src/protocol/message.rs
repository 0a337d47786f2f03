//! BitTorrent protocol messages
//!
//! Defines all message types used in the BitTorrent protocol.

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl MessageId {
    /// Map a wire id to a known message; `None` for ids this client does not speak
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageId::Choke),
            1 => Some(MessageId::Unchoke),
            2 => Some(MessageId::Interested),
            3 => Some(MessageId::NotInterested),
            4 => Some(MessageId::Have),
            5 => Some(MessageId::Bitfield),
            6 => Some(MessageId::Request),
            7 => Some(MessageId::Piece),
            8 => Some(MessageId::Cancel),
            _ => None,
        }
    }
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// A well-framed message with an id outside 0-8 (extensions, DHT port, ...)
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Get the message ID (returns None for KeepAlive and unknown ids)
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
            Message::KeepAlive | Message::Unknown { .. } => None,
        }
    }

    /// Get the message length (excluding the length prefix)
    pub fn length(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bitfield } => 1 + bitfield.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len() as u32,
            Message::Unknown { payload, .. } => 1 + payload.len() as u32,
        }
    }

    /// Serialize the message to bytes (including length prefix)
    pub fn serialize(&self) -> Vec<u8> {
        trace!("Serializing message: {:?}", self.message_id());
        let mut buf = BytesMut::with_capacity(4 + self.length() as usize);
        buf.put_u32(self.length());

        match self {
            Message::KeepAlive => {}
            Message::Choke => buf.put_u8(MessageId::Choke as u8),
            Message::Unchoke => buf.put_u8(MessageId::Unchoke as u8),
            Message::Interested => buf.put_u8(MessageId::Interested as u8),
            Message::NotInterested => buf.put_u8(MessageId::NotInterested as u8),
            Message::Have { piece_index } => {
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece_index);
            }
            Message::Bitfield { bitfield } => {
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield);
            }
            Message::Request { index, begin, length } => {
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel { index, begin, length } => {
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Unknown { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.to_vec()
    }

    /// Decode one frame body (everything after the 4-byte length prefix).
    ///
    /// An empty body is a keep-alive. Fixed-size messages must carry exactly
    /// their payload size.
    pub fn deserialize(frame: &[u8]) -> Result<Self, TorrentError> {
        let mut buf = frame;
        if buf.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = buf.get_u8();
        let message_id = match MessageId::from_u8(id) {
            Some(message_id) => message_id,
            None => {
                return Ok(Message::Unknown {
                    id,
                    payload: buf.to_vec(),
                })
            }
        };

        let expected = match message_id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => Some(0),
            MessageId::Have => Some(4),
            MessageId::Request | MessageId::Cancel => Some(12),
            MessageId::Bitfield | MessageId::Piece => None,
        };
        if let Some(expected) = expected {
            if buf.remaining() != expected {
                return Err(TorrentError::protocol_error_with_source(
                    format!("Bad {:?} payload length", message_id),
                    format!("expected {} bytes, got {}", expected, buf.remaining()),
                ));
            }
        }

        let message = match message_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have {
                piece_index: buf.get_u32(),
            },
            MessageId::Bitfield => Message::Bitfield { bitfield: buf.to_vec() },
            MessageId::Request => Message::Request {
                index: buf.get_u32(),
                begin: buf.get_u32(),
                length: buf.get_u32(),
            },
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_error_with_source(
                        "Piece message too short",
                        format!("expected at least 8 bytes, got {}", buf.remaining()),
                    ));
                }
                Message::Piece {
                    index: buf.get_u32(),
                    begin: buf.get_u32(),
                    block: buf.to_vec(),
                }
            }
            MessageId::Cancel => Message::Cancel {
                index: buf.get_u32(),
                begin: buf.get_u32(),
                length: buf.get_u32(),
            },
        };

        trace!("Decoded message: {:?}", message.message_id());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_is_bare_length() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_request_wire_layout() {
        let bytes = Message::Request { index: 1, begin: 16384, length: 16384 }.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]);

        let decoded = Message::deserialize(&bytes[4..]).unwrap();
        assert_eq!(decoded, Message::Request { index: 1, begin: 16384, length: 16384 });
    }

    #[test]
    fn test_piece_carries_block() {
        let message = Message::Piece { index: 10, begin: 0, block: vec![1, 2, 3, 4, 5] };
        let bytes = message.serialize();
        assert_eq!(message.length(), 14);
        assert_eq!(Message::deserialize(&bytes[4..]).unwrap(), message);
    }

    #[test]
    fn test_fixed_size_payload_must_match_exactly() {
        // choke with a trailing byte
        assert!(Message::deserialize(&[0, 0]).is_err());
        // have with 3 bytes
        assert!(Message::deserialize(&[4, 0, 0, 1]).is_err());
        // have with 5 bytes
        assert!(Message::deserialize(&[4, 0, 0, 0, 1, 9]).is_err());
        // request short by one
        assert!(Message::deserialize(&[6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // piece without its header
        assert!(Message::deserialize(&[7, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn test_unknown_id_surfaces_as_unknown() {
        let decoded = Message::deserialize(&[9, 0x1a, 0xe1]).unwrap();
        assert_eq!(decoded, Message::Unknown { id: 9, payload: vec![0x1a, 0xe1] });
        assert_eq!(decoded.message_id(), None);
    }

    #[test]
    fn test_empty_bitfield_allowed_by_framing() {
        assert_eq!(
            Message::deserialize(&[5]).unwrap(),
            Message::Bitfield { bitfield: vec![] }
        );
    }

    #[test]
    fn test_message_length() {
        assert_eq!(Message::Choke.length(), 1);
        assert_eq!(Message::Have { piece_index: 0 }.length(), 5);
        assert_eq!(Message::Cancel { index: 0, begin: 0, length: 0 }.length(), 13);
        assert_eq!(Message::Bitfield { bitfield: vec![0xff; 3] }.length(), 4);
    }
}
