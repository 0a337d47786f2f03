//! BitTorrent handshake protocol
//!
//! Handles the initial handshake between peers.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of a serialized handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix of locally generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RF0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Extension bits; always sent as zero, kept verbatim on receipt
    pub reserved: [u8; 8],
    /// Content identifier of the transfer
    pub content_id: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Create a new handshake with content_id and peer_id
    pub fn new(content_id: [u8; 20], peer_id: [u8; 20]) -> Self {
        debug!("Creating new handshake for content id: {}", hex::encode(content_id));
        Self {
            reserved: [0u8; 8],
            content_id,
            peer_id,
        }
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        trace!("Serializing handshake");
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&self.content_id);
        buf.put_slice(&self.peer_id);

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Deserialize a handshake, checking the length byte and protocol string
    pub fn deserialize(data: &[u8; HANDSHAKE_LEN]) -> Result<Self, TorrentError> {
        let protocol_length = data[0];
        if protocol_length != PROTOCOL_LENGTH {
            warn!("Invalid protocol length: expected {}, got {}", PROTOCOL_LENGTH, protocol_length);
            return Err(TorrentError::handshake_rejected(format!(
                "Invalid protocol length: expected {}, got {}",
                PROTOCOL_LENGTH, protocol_length
            )));
        }

        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            warn!("Invalid protocol string");
            return Err(TorrentError::handshake_rejected("Invalid protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        if reserved != [0u8; 8] {
            trace!("Peer advertises extension bits {}", hex::encode(reserved));
        }

        let mut content_id = [0u8; 20];
        content_id.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        debug!("Handshake peer_id: {}", hex::encode(peer_id));

        Ok(Self {
            reserved,
            content_id,
            peer_id,
        })
    }

    /// Check the handshake belongs to the transfer identified by `expected`
    pub fn validate(&self, expected: &[u8; 20]) -> Result<(), TorrentError> {
        if self.content_id != *expected {
            warn!(
                "Handshake content id mismatch: expected {}, got {}",
                hex::encode(expected),
                hex::encode(self.content_id)
            );
            return Err(TorrentError::handshake_rejected("Content id mismatch"));
        }
        Ok(())
    }
}

/// Generate a peer ID: client prefix followed by 12 random alphanumerics
pub fn generate_peer_id<R: Rng + ?Sized>(rng: &mut R) -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    for byte in peer_id[8..].iter_mut() {
        *byte = rng.sample(rand::distributions::Alphanumeric);
    }
    debug!("Generated new peer ID: {}", String::from_utf8_lossy(&peer_id));
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();

        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_reserved_bits_tolerated_on_receipt() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[25] = 0x10;
        bytes[27] = 0x05;

        let parsed = Handshake::deserialize(&bytes).unwrap();
        assert_eq!(parsed.reserved[5], 0x10);
        assert!(parsed.validate(&[1u8; 20]).is_ok());
        // Our own serialization still zeroes them
        assert_eq!(&parsed.serialize()[20..28], &[0u8; 8]);
    }

    #[test]
    fn test_bad_length_byte_rejected() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[0] = 18;
        let err = Handshake::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::HandshakeRejected { .. }));
    }

    #[test]
    fn test_bad_protocol_string_rejected() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[1] = b'b';
        let err = Handshake::deserialize(&bytes).unwrap_err();
        assert!(matches!(err, TorrentError::HandshakeRejected { .. }));
    }

    #[test]
    fn test_content_id_mismatch_rejected() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let err = handshake.validate(&[3u8; 20]).unwrap_err();
        assert!(matches!(err, TorrentError::HandshakeRejected { .. }));
    }

    #[test]
    fn test_generate_peer_id() {
        let mut rng = StdRng::seed_from_u64(7);
        let peer_id = generate_peer_id(&mut rng);
        assert_eq!(&peer_id[..8], b"-RF0001-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_alphanumeric()));

        let mut same_seed = StdRng::seed_from_u64(7);
        assert_eq!(generate_peer_id(&mut same_seed), peer_id);
    }
}
