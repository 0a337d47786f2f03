//! Bencode value tree
//!
//! Every parsed value keeps the `[start, end)` range it was read from so
//! that digests over a sub-structure never depend on re-encoding.

use std::ops::Range;

/// Payload of a bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeKind {
    ByteString(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    /// Key/value pairs in source order. Duplicate keys are kept as-is.
    Dictionary(Vec<(Vec<u8>, BencodeValue)>),
}

/// A parsed bencode value together with its source span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BencodeValue {
    kind: BencodeKind,
    span: Range<usize>,
}

impl BencodeValue {
    pub(crate) fn new(kind: BencodeKind, span: Range<usize>) -> Self {
        Self { kind, span }
    }

    /// The value payload
    pub fn kind(&self) -> &BencodeKind {
        &self.kind
    }

    /// Byte range this value occupied in the buffer it was parsed from
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    /// The exact source bytes of this value.
    ///
    /// `source` must be the buffer the value was parsed from; returns `None`
    /// if the span does not fit it.
    pub fn raw<'a>(&self, source: &'a [u8]) -> Option<&'a [u8]> {
        source.get(self.span.clone())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            BencodeKind::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Byte string interpreted as UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            BencodeKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match &self.kind {
            BencodeKind::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match &self.kind {
            BencodeKind::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn is_dict(&self) -> bool {
        matches!(self.kind, BencodeKind::Dictionary(_))
    }

    /// Dictionary lookup by raw key bytes.
    ///
    /// Linear scan; with duplicate keys the first match wins. Returns `None`
    /// for non-dictionaries.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict()?
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v)
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            BencodeKind::ByteString(_) => "byte string",
            BencodeKind::Integer(_) => "integer",
            BencodeKind::List(_) => "list",
            BencodeKind::Dictionary(_) => "dictionary",
        }
    }
}
