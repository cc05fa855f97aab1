//! Key-based routing to determine shard assignment.
//!
//! Routing uses the top bits of 32-bit FNV-1, so the shard count is always a
//! power of two and doubling it splits every shard in two. The hash a shard
//! uses for its own table is a separate function (see [`HashFn`]).

/// A 32-bit hash over a raw key.
pub type HashFn = fn(&[u8]) -> u32;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

const DJB_START: u32 = 5381;

/// Exponent value meaning "one shard, nothing to route".
pub const SINGLE_SHARD_EXP: u32 = 32;

/// FNV-1 (multiply, then xor), 32 bits. The routing hash of every format version.
pub fn fnv1_32(key: &[u8]) -> u32 {
  let mut hash = FNV_OFFSET_BASIS;
  for &byte in key {
    hash = hash.wrapping_mul(FNV_PRIME);
    hash ^= u32::from(byte);
  }
  hash
}

/// The classic cdb table hash: `h = ((h << 5) + h) ^ c`, starting at 5381.
pub fn djb(key: &[u8]) -> u32 {
  let mut hash = DJB_START;
  for &byte in key {
    hash = (hash << 5).wrapping_add(hash) ^ u32::from(byte);
  }
  hash
}

/// Returns the shard a key must reside in.
///
/// `exp_c` is the number of low hash bits discarded; the remaining high bits
/// are the shard index. `exp_c == 32` is the single-shard case and skips hashing.
#[inline]
pub fn bucket(hash: HashFn, key: &[u8], exp_c: u32) -> usize {
  if exp_c >= SINGLE_SHARD_EXP {
    return 0;
  }
  (hash(key) >> exp_c) as usize
}

/// The exponent matching a power-of-two shard count.
///
/// # Panics
///
/// Panics if `shard_count` is not a power of two or exceeds 2^32.
pub fn exp_for_shard_count(shard_count: u64) -> u32 {
  assert!(
    shard_count.is_power_of_two() && shard_count <= 1 << 32,
    "shard_count must be a power of two not above 2^32, got {}",
    shard_count
  );
  SINGLE_SHARD_EXP - shard_count.trailing_zeros()
}

/// Routes keys to shard indices for one fixed shard count.
#[derive(Debug, Clone, Copy)]
pub struct Router {
  exp_c: u32,
  hash: HashFn,
}

impl Router {
  /// Creates a router over `shard_count` shards using the FNV-1 routing hash.
  ///
  /// # Panics
  ///
  /// Panics if `shard_count` is not a power of two or exceeds 2^32.
  pub fn new(shard_count: u64) -> Self {
    Self::with_hash(shard_count, fnv1_32)
  }

  /// Creates a router with a custom routing hash.
  pub fn with_hash(shard_count: u64, hash: HashFn) -> Self {
    Self {
      exp_c: exp_for_shard_count(shard_count),
      hash,
    }
  }

  /// Routes a key to its shard index, in `0..shard_count`.
  #[inline]
  pub fn route(&self, key: &[u8]) -> usize {
    bucket(self.hash, key, self.exp_c)
  }

  pub fn exp_c(&self) -> u32 {
    self.exp_c
  }

  pub fn shard_count(&self) -> u64 {
    1u64 << (SINGLE_SHARD_EXP - self.exp_c)
  }
}
