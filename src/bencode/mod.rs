//! Bencode codec
//!
//! Parses the bencode binary format into a tree of values that remember
//! the exact byte range they occupied in the source buffer.

pub mod decoder;
pub mod value;

pub use decoder::{decode, parse, MAX_DEPTH};
pub use value::{BencodeKind, BencodeValue};
