//! Wire protocol framing
//!
//! [`PeerWire`] owns a peer stream plus a receive buffer. Bytes are pulled
//! with `read_buf` and complete frames are split off the front of the buffer,
//! so dropping a pending read (for example when a request timer fires) never
//! loses a partially received frame.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::TorrentError;
use crate::storage::BLOCK_SIZE;

/// Largest frame a peer may send for a torrent with `piece_count` pieces:
/// a full block or the bitfield, whichever is bigger.
pub fn max_frame_len(piece_count: usize) -> usize {
    let piece_frame = 9 + BLOCK_SIZE as usize;
    let bitfield_frame = 1 + piece_count.div_ceil(8);
    piece_frame.max(bitfield_frame)
}

/// Framed BitTorrent stream
pub struct PeerWire<S> {
    stream: S,
    buffer: BytesMut,
    max_frame: usize,
}

impl<S> PeerWire<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame: usize) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_frame,
        }
    }

    /// Write a handshake to the stream
    pub async fn write_handshake(&mut self, handshake: &Handshake) -> Result<(), TorrentError> {
        self.stream.write_all(&handshake.serialize()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the peer's 68-byte handshake. Cancel safe.
    pub async fn read_handshake(&mut self) -> Result<Handshake, TorrentError> {
        while self.buffer.len() < HANDSHAKE_LEN {
            self.fill().await?;
        }

        let mut raw = [0u8; HANDSHAKE_LEN];
        self.buffer.copy_to_slice(&mut raw);
        Handshake::deserialize(&raw)
    }

    /// Write a message to the stream
    pub async fn send(&mut self, message: &Message) -> Result<(), TorrentError> {
        trace!("Sending {:?}", message.message_id());
        self.stream.write_all(&message.serialize()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next complete message. Cancel safe.
    pub async fn read_message(&mut self) -> Result<Message, TorrentError> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Message::deserialize(&frame);
            }
            self.fill().await?;
        }
    }

    /// Number of buffered, not yet consumed bytes
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    async fn fill(&mut self) -> Result<(), TorrentError> {
        let read = self.stream.read_buf(&mut self.buffer).await?;
        if read == 0 {
            return Err(TorrentError::peer_error("Connection closed by peer"));
        }
        Ok(())
    }

    fn split_frame(&mut self) -> Result<Option<BytesMut>, TorrentError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]]) as usize;
        if length > self.max_frame {
            return Err(TorrentError::protocol_error_with_source(
                "Frame exceeds maximum length",
                format!("{} > {}", length, self.max_frame),
            ));
        }

        if self.buffer.len() < 4 + length {
            self.buffer.reserve(4 + length - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(4);
        Ok(Some(self.buffer.split_to(length)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_messages_across_duplex() {
        let (a, b) = duplex(64 * 1024);
        let mut left = PeerWire::new(a, max_frame_len(8));
        let mut right = PeerWire::new(b, max_frame_len(8));

        left.send(&Message::Interested).await.unwrap();
        left.send(&Message::KeepAlive).await.unwrap();
        left.send(&Message::Have { piece_index: 3 }).await.unwrap();

        assert_eq!(right.read_message().await.unwrap(), Message::Interested);
        assert_eq!(right.read_message().await.unwrap(), Message::KeepAlive);
        assert_eq!(right.read_message().await.unwrap(), Message::Have { piece_index: 3 });
    }

    #[tokio::test]
    async fn test_handshake_exchange() {
        let (a, b) = duplex(1024);
        let mut left = PeerWire::new(a, 1024);
        let mut right = PeerWire::new(b, 1024);

        left.write_handshake(&Handshake::new([4u8; 20], [5u8; 20])).await.unwrap();
        left.send(&Message::Unchoke).await.unwrap();

        let handshake = right.read_handshake().await.unwrap();
        assert_eq!(handshake.content_id, [4u8; 20]);
        assert_eq!(handshake.peer_id, [5u8; 20]);
        // Bytes following the handshake stay buffered for framing
        assert_eq!(right.read_message().await.unwrap(), Message::Unchoke);
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_frame() {
        let (mut raw, b) = duplex(1024);
        let mut wire = PeerWire::new(b, 1024);

        let frame = Message::Request { index: 1, begin: 2, length: 3 }.serialize();
        raw.write_all(&frame[..7]).await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(50), wire.read_message()).await;
        assert!(pending.is_err());
        assert_eq!(wire.buffered(), 7);

        raw.write_all(&frame[7..]).await.unwrap();
        assert_eq!(
            wire.read_message().await.unwrap(),
            Message::Request { index: 1, begin: 2, length: 3 }
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_payload() {
        let (mut raw, b) = duplex(1024);
        let mut wire = PeerWire::new(b, 100);

        raw.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        let err = wire.read_message().await.unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolError { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_peer_error() {
        let (raw, b) = duplex(1024);
        let mut wire = PeerWire::new(b, 100);
        drop(raw);

        let err = wire.read_message().await.unwrap_err();
        assert!(matches!(err, TorrentError::PeerError { .. }));
    }

    #[test]
    fn test_max_frame_len() {
        assert_eq!(max_frame_len(10), 9 + 16384);
        assert_eq!(max_frame_len(1_000_000), 1 + 125_000);
    }
}
