//! Digest helpers

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b with a 256-bit output, the digest behind [`crate::PeerId`].
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BLAKE2b-256 over several segments without intermediate allocation.
pub fn blake2b_256_all(segments: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for segment in segments {
        hasher.update(segment);
    }
    hasher.finalize().into()
}
