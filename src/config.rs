use std::path::PathBuf;

use crate::hash::{HashFn, fnv1_32};
use crate::naming::FormatVersion;

/// Defines the strategy used for reading shard files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadStrategy {
  /// Memory-maps every shard file.
  /// Fastest for point lookups; lookups never take a lock.
  /// WARNING: Carries SIGBUS risks if a shard is truncated underneath the map.
  #[default]
  Mmap,

  /// Uses `File::seek` and `File::read` behind a per-shard lock.
  /// Keeps resident memory flat for very large shard sets.
  StandardIo,
}

/// Text interchange formats accepted by `load` and produced by `dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
  /// The cdbmake format: `+klen,vlen:key->value\n`.
  /// Length-prefixed, so keys and values may contain any byte.
  #[default]
  Cdbmake,

  /// `key<TAB>value\n`, split on the first tab or space when loading.
  /// Meant for hand-edited input; not byte-exact for keys containing
  /// whitespace or newlines.
  Simple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DumpOptions {
  pub format: DumpFormat,
  /// Write (or expect) keys only, no values.
  pub keys_only: bool,
}

impl DumpOptions {
  pub fn new(format: DumpFormat) -> Self {
    Self {
      format,
      keys_only: false,
    }
  }

  pub fn keys_only(mut self) -> Self {
    self.keys_only = true;
    self
  }
}

#[derive(Debug, Clone)]
pub struct WriterOptions {
  /// Directory holding the shard files. Created if missing.
  pub root_path: PathBuf,

  /// Requested number of shards.
  /// Positive: fixed, rounded up to the next power of two.
  /// Zero or negative: auto-growing, starting from `|n|` (2 when zero).
  /// Default: 0.
  pub shard_count: i64,

  /// Naming scheme and internal hash of the created files.
  /// Default: `FormatVersion::V1`.
  pub version: FormatVersion,

  /// Hash used to pick the owning shard of a key.
  /// Readers always route with FNV-1; changing this is only useful for
  /// producing directories that need `ReaderOptions::try_all`.
  /// Default: `fnv1_32`.
  pub routing_hash: HashFn,

  /// Hard limit for a single shard file in bytes, header and hash tables included.
  /// Cannot exceed the 32-bit offsets of the cdb format.
  /// Default: u32::MAX (4 GiB).
  pub max_shard_size: u64,

  /// How many times a single `put` may double the shard count before giving up.
  /// Default: 8.
  pub max_growth_steps: u32,

  /// Size of the in-memory write buffer per shard.
  /// Default: 64 KB.
  pub write_buffer_size: usize,

  /// After `close`, make shard files 0440 and the directory 0550 (unix only).
  /// Default: false.
  pub harden_permissions: bool,
}

impl Default for WriterOptions {
  fn default() -> Self {
    Self {
      root_path: PathBuf::from("./cdb_data"),
      shard_count: 0,
      version: FormatVersion::V1,
      routing_hash: fnv1_32,
      max_shard_size: u32::MAX as u64,
      max_growth_steps: 8,
      write_buffer_size: 64 * 1024, // 64 KB
      harden_permissions: false,
    }
  }
}

impl WriterOptions {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      root_path: path.into(),
      ..Default::default()
    }
  }

  /// Whether a `CapacityExceeded` from a shard triggers growth.
  pub fn can_grow(&self) -> bool {
    self.shard_count <= 0
  }

  /// The shard count the writer actually starts with: a power of two.
  pub fn initial_shard_count(&self) -> u64 {
    let requested = match self.shard_count {
      0 => 2,
      n => n.unsigned_abs(),
    };
    requested.next_power_of_two()
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
  /// On a miss in the owning shard, probe every other shard in index order.
  /// Recovery aid for directories built with a different routing scheme;
  /// turns every true miss into a scan of all shards.
  /// Default: false.
  pub try_all: bool,

  pub read_strategy: ReadStrategy,
}
