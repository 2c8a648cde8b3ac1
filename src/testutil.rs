use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::torrent::TorrentMetadata;

pub(crate) const INFO_HASH: [u8; 20] = [0xAB; 20];

/// Deterministic, non-repeating-ish content.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Single-file metadata whose piece hashes match `data`.
pub(crate) fn metadata(piece_length: u64, data: &[u8]) -> Arc<TorrentMetadata> {
    let hashes: Vec<[u8; 20]> = data
        .chunks(piece_length as usize)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect();
    let meta = TorrentMetadata::single_file(
        "http://tracker.test/announce",
        INFO_HASH,
        "payload.bin",
        piece_length,
        data.len() as u64,
        hashes,
    )
    .unwrap();
    Arc::new(meta)
}
