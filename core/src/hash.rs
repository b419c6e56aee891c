//! The 32-bit key hash consumed throughout the rest of the crate.
//!
//! This crate only needs *some* deterministic 32-bit hash so the startup
//! index rebuild reproduces the same hashes the index log was built with.
//! FNV-1a is the standard dependency-free choice; embedders with their own
//! key-hash convention can override it via `Table::open_with_hasher`.
pub fn fnv1a_32(bytes: &[u8]) -> i32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i32
}
