//! Builders for synthetic torrent descriptors used across the test suites

use sha1::{Digest, Sha1};

/// Append a bencoded byte string
pub(crate) fn bstr(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Deterministic, non-repeating-looking payload
pub(crate) fn sample_content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 251) as u8).collect()
}

/// Concatenated SHA-1 digests of every `piece_length` chunk of `content`
pub(crate) fn piece_hashes(content: &[u8], piece_length: usize) -> Vec<u8> {
    content
        .chunks(piece_length)
        .flat_map(|chunk| {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            digest
        })
        .collect()
}

/// Canonical single-file info dictionary for `content`
pub(crate) fn single_file_info(name: &str, piece_length: usize, content: &[u8]) -> Vec<u8> {
    let mut info = b"d".to_vec();
    info.extend_from_slice(format!("6:lengthi{}e", content.len()).as_bytes());
    bstr(&mut info, b"name");
    bstr(&mut info, name.as_bytes());
    info.extend_from_slice(format!("12:piece lengthi{}e", piece_length).as_bytes());
    bstr(&mut info, b"pieces");
    bstr(&mut info, &piece_hashes(content, piece_length));
    info.push(b'e');
    info
}

/// Top-level descriptor `{announce, info}` around raw info bytes
pub(crate) fn wrap_info(announce: &str, info: &[u8]) -> Vec<u8> {
    let mut data = b"d".to_vec();
    bstr(&mut data, b"announce");
    bstr(&mut data, announce.as_bytes());
    bstr(&mut data, b"info");
    data.extend_from_slice(info);
    data.push(b'e');
    data
}

pub(crate) fn single_file_torrent(announce: &str, name: &str, piece_length: usize, content: &[u8]) -> Vec<u8> {
    wrap_info(announce, &single_file_info(name, piece_length, content))
}
