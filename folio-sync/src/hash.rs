//! FNV-1a hashing shared by composition tracking, advisory locks and
//! upload-queue record checksums.
//!
//! Not a cryptographic hash. Collisions are possible and tolerated by every
//! caller.

/// FNV offset basis (32-bit).
pub const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
/// FNV prime (32-bit).
pub const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the UTF-16 code units of `value`.
pub fn fnv1a_32(value: &str) -> u32 {
    value.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    })
}

/// 32-bit FNV-1a over raw bytes, folded into an existing hash state.
pub fn fnv1a_32_bytes(seed: u32, bytes: &[u8]) -> u32 {
    bytes.iter().fold(seed, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
