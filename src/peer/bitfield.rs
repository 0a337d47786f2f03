//! Piece availability bitmap

use crate::error::TorrentError;

/// One bit per piece, most significant bit of byte 0 is piece 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitmap for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Bitmap with every piece set
    pub fn full(len: usize) -> Self {
        let mut bitfield = Self::new(len);
        for index in 0..len {
            bitfield.set(index);
        }
        bitfield
    }

    /// Validate a received `bitfield` payload for a torrent of `len` pieces.
    ///
    /// The payload must be exactly `ceil(len / 8)` bytes and the spare bits
    /// of the final byte must be clear.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, TorrentError> {
        let expected = len.div_ceil(8);
        if bytes.len() != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Bitfield has wrong length",
                format!("expected {} bytes, got {}", expected, bytes.len()),
            ));
        }

        let spare = expected * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(TorrentError::protocol_error("Bitfield has spare bits set"));
            }
        }

        Ok(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Set a piece; out-of-range indices are ignored
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    /// Number of pieces the bitmap describes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of set pieces in ascending order
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bitfield = Bitfield::new(10);
        bitfield.set(0);
        bitfield.set(9);
        bitfield.set(10);

        assert!(bitfield.has(0));
        assert!(bitfield.has(9));
        assert!(!bitfield.has(1));
        assert!(!bitfield.has(10));
        assert_eq!(bitfield.count(), 2);
        assert_eq!(bitfield.as_bytes(), &[0x80, 0x40]);
        assert_eq!(bitfield.iter_set().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_full() {
        let bitfield = Bitfield::full(10);
        assert_eq!(bitfield.count(), 10);
        assert_eq!(bitfield.as_bytes(), &[0xff, 0xc0]);
    }

    #[test]
    fn test_from_bytes_checks_length() {
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0, 0x00], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 10).is_ok());
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        let err = Bitfield::from_bytes(&[0xff, 0xe0], 10).unwrap_err();
        assert!(matches!(err, TorrentError::ProtocolError { .. }));

        // exact multiple of 8 has no spare bits
        assert!(Bitfield::from_bytes(&[0xff], 8).is_ok());
    }
}
