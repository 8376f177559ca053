//! Channel id hashing.
//!
//! The registry trees are keyed by a 32-bit hash of the channel id
//! (spec.md §3); collisions are resolved by comparing the id bytes
//! themselves. `rustc-hash`'s `FxHasher` gives a fast, stable-within-process
//! hash without pulling in a dedicated hashing crate.

use std::hash::Hasher;

use rustc_hash::FxHasher;

pub fn hash_channel_id(id: &[u8]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write(id);
    let full = hasher.finish();
    (full ^ (full >> 32)) as u32
}
