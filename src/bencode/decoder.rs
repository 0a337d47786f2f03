//! Bencode decoder
//!
//! Recursive-descent parser over an untrusted byte buffer. Every declared
//! length is checked against the bytes that remain before anything is
//! copied, and nesting depth is bounded.

use tracing::trace;

use crate::bencode::value::{BencodeKind, BencodeValue};
use crate::error::{BencodeErrorKind, TorrentError};

/// Maximum container nesting accepted by the decoder
pub const MAX_DEPTH: usize = 64;

type DecodeResult<T> = std::result::Result<T, TorrentError>;

/// Parse one value starting at `start_offset`.
///
/// Returns the value and the offset just past its last byte.
pub fn parse(buffer: &[u8], start_offset: usize) -> DecodeResult<(BencodeValue, usize)> {
    let mut decoder = Decoder {
        data: buffer,
        pos: start_offset,
    };
    let value = decoder.value(0)?;
    trace!("Parsed bencode {} spanning {:?}", value.type_name(), value.span());
    Ok((value, decoder.pos))
}

/// Parse one value from the start of `buffer`.
///
/// Returns the value and the number of unconsumed trailing bytes.
pub fn decode(buffer: &[u8]) -> DecodeResult<(BencodeValue, usize)> {
    let (value, end) = parse(buffer, 0)?;
    Ok((value, buffer.len() - end))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn error(&self, kind: BencodeErrorKind, message: impl Into<String>) -> TorrentError {
        TorrentError::bencode_error(kind, self.pos, message)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn value(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(self.error(BencodeErrorKind::MalformedInput, "nesting too deep"));
        }

        match self.peek() {
            None => Err(self.error(BencodeErrorKind::TruncatedInput, "unexpected end of input")),
            Some(b'i') => self.integer(),
            Some(b'l') => self.list(depth),
            Some(b'd') => self.dictionary(depth),
            Some(b'0'..=b'9') => self.byte_string(),
            Some(other) => Err(self.error(
                BencodeErrorKind::MalformedInput,
                format!("unexpected byte 0x{:02x}", other),
            )),
        }
    }

    fn integer(&mut self) -> DecodeResult<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let digits_start = self.pos;

        while let Some(b'0'..=b'9' | b'-') = self.peek() {
            self.pos += 1;
        }

        match self.peek() {
            None => return Err(self.error(BencodeErrorKind::TruncatedInput, "unterminated integer")),
            Some(b'e') => {}
            Some(other) => {
                return Err(self.error(
                    BencodeErrorKind::MalformedInput,
                    format!("unexpected byte 0x{:02x} in integer", other),
                ))
            }
        }

        let digits = &self.data[digits_start..self.pos];
        let value = parse_integer(digits).ok_or_else(|| {
            TorrentError::bencode_error(
                BencodeErrorKind::MalformedInput,
                digits_start,
                format!("invalid integer {:?}", String::from_utf8_lossy(digits)),
            )
        })?;

        self.pos += 1;
        Ok(BencodeValue::new(BencodeKind::Integer(value), start..self.pos))
    }

    fn byte_string(&mut self) -> DecodeResult<BencodeValue> {
        let start = self.pos;
        let bytes = self.string_bytes()?;
        Ok(BencodeValue::new(BencodeKind::ByteString(bytes), start..self.pos))
    }

    fn string_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let start = self.pos;
        let mut length: usize = 0;

        loop {
            match self.peek() {
                None => return Err(self.error(BencodeErrorKind::TruncatedInput, "unterminated string length")),
                Some(b':') => break,
                Some(digit @ b'0'..=b'9') => {
                    length = length
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((digit - b'0') as usize))
                        .ok_or_else(|| self.error(BencodeErrorKind::MalformedInput, "string length overflows"))?;
                    self.pos += 1;
                }
                Some(other) => {
                    return Err(self.error(
                        BencodeErrorKind::MalformedInput,
                        format!("unexpected byte 0x{:02x} in string length", other),
                    ))
                }
            }
        }

        if self.pos - start > 1 && self.data[start] == b'0' {
            return Err(TorrentError::bencode_error(
                BencodeErrorKind::MalformedInput,
                start,
                "string length has leading zero",
            ));
        }

        self.pos += 1;
        let remaining = self.data.len() - self.pos;
        if length > remaining {
            return Err(self.error(
                BencodeErrorKind::TruncatedInput,
                format!("declared length {} exceeds remaining {} bytes", length, remaining),
            ));
        }

        let bytes = self.data[self.pos..self.pos + length].to_vec();
        self.pos += length;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let mut items = Vec::new();

        loop {
            match self.peek() {
                None => return Err(self.error(BencodeErrorKind::UnterminatedContainer, "list has no terminator")),
                Some(b'e') => break,
                Some(_) => items.push(self.value(depth + 1)?),
            }
        }

        self.pos += 1;
        Ok(BencodeValue::new(BencodeKind::List(items), start..self.pos))
    }

    fn dictionary(&mut self, depth: usize) -> DecodeResult<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let mut entries = Vec::new();

        loop {
            match self.peek() {
                None => {
                    return Err(self.error(
                        BencodeErrorKind::UnterminatedContainer,
                        "dictionary has no terminator",
                    ))
                }
                Some(b'e') => break,
                Some(b'0'..=b'9') => {
                    let key = self.string_bytes()?;
                    if self.peek().is_none() {
                        return Err(self.error(
                            BencodeErrorKind::UnterminatedContainer,
                            "dictionary key has no value",
                        ));
                    }
                    let value = self.value(depth + 1)?;
                    entries.push((key, value));
                }
                Some(other) => {
                    return Err(self.error(
                        BencodeErrorKind::MalformedInput,
                        format!("dictionary key must be a byte string, found 0x{:02x}", other),
                    ))
                }
            }
        }

        self.pos += 1;
        Ok(BencodeValue::new(BencodeKind::Dictionary(entries), start..self.pos))
    }
}

/// Base-10 integer with optional sign, no superfluous leading zeros, no `-0`.
fn parse_integer(digits: &[u8]) -> Option<i64> {
    let body = digits.strip_prefix(b"-").unwrap_or(digits);
    if body.is_empty() || !body.iter().all(u8::is_ascii_digit) {
        return None;
    }
    if body[0] == b'0' && (body.len() > 1 || body.len() < digits.len()) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
