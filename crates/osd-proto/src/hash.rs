/// FNV-1a hash functions.
///
/// Used to spread file directories over a fixed fan-out tree. The hash must
/// be stable across restarts and across nodes, so it never depends on the
/// process or platform.

/// FNV-1a 64-bit initial basis.
const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;
/// FNV-1a 64-bit prime.
const FNV_64_PRIME: u64 = 0x0100_0000_01b3;

/// Compute FNV-1a hash over a byte buffer.
#[inline]
pub fn fnv_64a_buf(buf: &[u8], mut hval: u64) -> u64 {
    for &byte in buf {
        hval ^= byte as u64;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Compute FNV-1a hash over a single u64 value.
#[inline]
pub fn fnv_64a_64(val: u64, mut hval: u64) -> u64 {
    for i in 0..8 {
        hval ^= (val >> (i * 8)) & 0xff;
        hval = hval.wrapping_mul(FNV_64_PRIME);
    }
    hval
}

/// Hash a file ID (double-hash for better distribution of short IDs).
#[inline]
pub fn file_id_hash(file_id: &str) -> u64 {
    let hval = fnv_64a_buf(file_id.as_bytes(), FNV1A_64_INIT);
    fnv_64a_64(hval, hval)
}

/// Number of hex digits needed to name `subdirs` directories.
pub fn hex_prefix_len(subdirs: u32) -> usize {
    let max = subdirs.saturating_sub(1).max(1);
    let bits = 32 - max.leading_zeros() as usize;
    bits.div_ceil(4)
}

/// Directory components for `file_id` in a tree with `subdirs` entries per
/// level and `depth` levels.
///
/// Components are successive hex chunks of [`file_id_hash`]. The tree never
/// goes deeper than the 16 hex digits of the hash allow.
pub fn hash_dir_components(file_id: &str, subdirs: u32, depth: u32) -> Vec<String> {
    let hex = format!("{:016x}", file_id_hash(file_id));
    let prefix = hex_prefix_len(subdirs);
    let levels = (depth as usize).min(hex.len() / prefix);
    (0..levels)
        .map(|i| hex[i * prefix..(i + 1) * prefix].to_string())
        .collect()
}
