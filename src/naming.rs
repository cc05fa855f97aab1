//! Shard file names and shard-set layout validation.
//!
//! Current (v1) files are named `mcdb-v1-<total>,<index>.cdb`, legacy (v0)
//! files `mcdb-<total>,<index>.cdb`. The total is decimal, the index is binary
//! zero-padded to `log2(total) + 1` digits:
//!
//! ```text
//! mcdb-v1-4,000.cdb  mcdb-v1-4,001.cdb  mcdb-v1-4,010.cdb  mcdb-v1-4,011.cdb
//! ```
//!
//! Validation of a directory listing is a pure function over names so it can
//! be exercised without touching the filesystem.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::hash::{self, HashFn};

pub const FILE_PREFIX: &str = "mcdb-";
pub const FILE_SUFFIX: &str = ".cdb";

/// On-disk naming scheme and the table hash that comes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatVersion {
  /// No version field in the name; shards hash their tables with FNV-1,
  /// the same function used for routing.
  V0,
  /// Versioned names; shards use the standard cdb (DJB) table hash.
  #[default]
  V1,
}

impl FormatVersion {
  pub fn number(self) -> u8 {
    match self {
      FormatVersion::V0 => 0,
      FormatVersion::V1 => 1,
    }
  }

  pub fn from_number(n: u64) -> Option<Self> {
    match n {
      0 => Some(FormatVersion::V0),
      1 => Some(FormatVersion::V1),
      _ => None,
    }
  }

  /// The hash a shard of this version uses for its own table.
  pub fn internal_hash(self) -> HashFn {
    match self {
      FormatVersion::V0 => hash::fnv1_32,
      FormatVersion::V1 => hash::djb,
    }
  }
}

impl fmt::Display for FormatVersion {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "v{}", self.number())
  }
}

/// Identity of one shard file within a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardIdentity {
  pub version: FormatVersion,
  pub total_shards: u64,
  pub index: u64,
}

impl ShardIdentity {
  pub fn new(version: FormatVersion, total_shards: u64, index: u64) -> Self {
    Self {
      version,
      total_shards,
      index,
    }
  }

  /// Generates the file name for this shard.
  pub fn file_name(&self) -> String {
    let width = index_width(self.total_shards);
    match self.version {
      FormatVersion::V0 => format!(
        "{}{},{:0width$b}{}",
        FILE_PREFIX, self.total_shards, self.index, FILE_SUFFIX
      ),
      FormatVersion::V1 => format!(
        "{}v{}-{},{:0width$b}{}",
        FILE_PREFIX,
        self.version.number(),
        self.total_shards,
        self.index,
        FILE_SUFFIX
      ),
    }
  }

  /// Parses a shard identity from a file name.
  ///
  /// Returns `Ok(None)` for names that are not shard files at all (wrong
  /// prefix or suffix), and an error for names that look like shard files but
  /// do not scan.
  pub fn parse(name: &str) -> Result<Option<Self>> {
    let Some(body) = name
      .strip_prefix(FILE_PREFIX)
      .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
    else {
      return Ok(None);
    };

    let invalid = |reason: String| Error::InvalidFilename {
      name: name.to_string(),
      reason,
    };

    let (version, counts) = match body.strip_prefix('v') {
      Some(versioned) => {
        let (number, counts) = versioned
          .split_once('-')
          .ok_or_else(|| invalid("missing '-' after version".into()))?;
        let number = parse_decimal(number).ok_or_else(|| invalid(format!("bad version {:?}", number)))?;
        let version = FormatVersion::from_number(number).ok_or_else(|| invalid(format!("unknown version {}", number)))?;
        (version, counts)
      }
      None => (FormatVersion::V0, body),
    };

    let (total, index) = counts
      .split_once(',')
      .ok_or_else(|| invalid("missing ',' between shard count and index".into()))?;
    let total_shards = parse_decimal(total).ok_or_else(|| invalid(format!("bad shard count {:?}", total)))?;
    let index = parse_binary(index).ok_or_else(|| invalid(format!("bad binary shard index {:?}", index)))?;

    if !total_shards.is_power_of_two() || total_shards > 1 << 32 {
      return Err(invalid(format!(
        "shard count {} is not a power of two up to 2^32",
        total_shards
      )));
    }

    Ok(Some(Self {
      version,
      total_shards,
      index,
    }))
  }
}

/// Number of binary digits used for shard indices of a set.
fn index_width(total_shards: u64) -> usize {
  total_shards.max(1).trailing_zeros() as usize + 1
}

fn parse_decimal(s: &str) -> Option<u64> {
  if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  s.parse().ok()
}

fn parse_binary(s: &str) -> Option<u64> {
  if s.is_empty() || !s.bytes().all(|b| b == b'0' || b == b'1') {
    return None;
  }
  u64::from_str_radix(s, 2).ok()
}

/// A validated, complete set of shard files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
  pub version: FormatVersion,
  /// File names indexed by shard index.
  pub files: Vec<String>,
}

impl ShardLayout {
  /// Validates a directory listing.
  ///
  /// Non-shard names are ignored. The first shard file fixes the shard count
  /// and version; every other file must agree, indices must be in range and
  /// unique, and every index in `0..total` must be present.
  pub fn from_names<I, S>(names: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut first: Option<ShardIdentity> = None;
    let mut found: BTreeMap<u64, String> = BTreeMap::new();

    for name in names {
      let name = name.as_ref();
      let Some(id) = ShardIdentity::parse(name)? else {
        continue;
      };

      let expected = *first.get_or_insert(id);
      if id.version != expected.version {
        return Err(Error::Structural(format!(
          "version mismatch: was {}, now {} ({:?})",
          expected.version, id.version, name
        )));
      }
      if id.total_shards != expected.total_shards {
        return Err(Error::Structural(format!(
          "{:?}: shard count {} differs from {} of the other files",
          name, id.total_shards, expected.total_shards
        )));
      }
      if id.index >= id.total_shards {
        return Err(Error::Structural(format!(
          "{:?}: shard index {} out of range for {} shards",
          name, id.index, id.total_shards
        )));
      }
      if let Some(previous) = found.insert(id.index, name.to_string()) {
        return Err(Error::Structural(format!(
          "shard index {} claimed by both {:?} and {:?}",
          id.index, previous, name
        )));
      }
    }

    let Some(first) = first else {
      return Err(Error::Structural(format!(
        "no {}*{} files found",
        FILE_PREFIX, FILE_SUFFIX
      )));
    };

    if found.len() as u64 != first.total_shards {
      let missing = found
        .keys()
        .zip(0u64..)
        .find(|(index, expected)| **index != *expected)
        .map(|(_, expected)| expected)
        .unwrap_or(found.len() as u64);
      return Err(Error::Structural(format!(
        "incomplete shard set: shard {} of {} ({}) not found",
        missing,
        first.total_shards,
        ShardIdentity::new(first.version, first.total_shards, missing).file_name()
      )));
    }

    Ok(Self {
      version: first.version,
      files: found.into_values().collect(),
    })
  }

  pub fn shard_count(&self) -> u64 {
    self.files.len() as u64
  }

  pub fn exp_c(&self) -> u32 {
    hash::exp_for_shard_count(self.shard_count())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn names(version: FormatVersion, total: u64, indices: &[u64]) -> Vec<String> {
    indices
      .iter()
      .map(|&i| ShardIdentity::new(version, total, i).file_name())
      .collect()
  }

  #[test]
  fn test_filenames() {
    let v1 = |t, i| ShardIdentity::new(FormatVersion::V1, t, i).file_name();
    assert_eq!(v1(1, 0), "mcdb-v1-1,0.cdb");
    assert_eq!(v1(2, 1), "mcdb-v1-2,01.cdb");
    assert_eq!(v1(4, 0), "mcdb-v1-4,000.cdb");
    assert_eq!(v1(4, 3), "mcdb-v1-4,011.cdb");
    assert_eq!(v1(16, 5), "mcdb-v1-16,00101.cdb");

    let v0 = ShardIdentity::new(FormatVersion::V0, 8, 6).file_name();
    assert_eq!(v0, "mcdb-8,0110.cdb");
  }

  #[test]
  fn test_parse() {
    let id = ShardIdentity::parse("mcdb-v1-4,011.cdb").unwrap().unwrap();
    assert_eq!(id, ShardIdentity::new(FormatVersion::V1, 4, 3));

    let id = ShardIdentity::parse("mcdb-8,0110.cdb").unwrap().unwrap();
    assert_eq!(id, ShardIdentity::new(FormatVersion::V0, 8, 6));

    // Versioned name carrying version 0 is still legacy.
    let id = ShardIdentity::parse("mcdb-v0-2,1.cdb").unwrap().unwrap();
    assert_eq!(id.version, FormatVersion::V0);

    // Padding is not significant when parsing.
    let id = ShardIdentity::parse("mcdb-v1-4,11.cdb").unwrap().unwrap();
    assert_eq!(id.index, 3);
  }

  #[test]
  fn test_parse_ignores_foreign_files() {
    assert!(ShardIdentity::parse("notes.txt").unwrap().is_none());
    assert!(ShardIdentity::parse("mcdb-v1-4,000.cdb.tmp").unwrap().is_none());
    assert!(ShardIdentity::parse("data.cdb").unwrap().is_none());
  }

  #[test]
  fn test_parse_rejects_malformed() {
    for bad in [
      "mcdb-v1-4,012.cdb",
      "mcdb-v1-x,01.cdb",
      "mcdb-v1-4.cdb",
      "mcdb-vx-4,01.cdb",
      "mcdb-v7-4,01.cdb",
      "mcdb-v1-3,01.cdb",
      "mcdb-v1-0,0.cdb",
      "mcdb-backup.cdb",
      "mcdb-v1-4,+1.cdb",
    ] {
      let err = ShardIdentity::parse(bad).unwrap_err();
      match err {
        Error::InvalidFilename { name, .. } => assert_eq!(name, bad),
        other => panic!("{}: unexpected error {:?}", bad, other),
      }
    }
  }

  #[test]
  fn test_layout_complete() {
    let mut listing = names(FormatVersion::V1, 4, &[2, 0, 3, 1]);
    listing.push("README".into());
    let layout = ShardLayout::from_names(&listing).unwrap();

    assert_eq!(layout.version, FormatVersion::V1);
    assert_eq!(layout.shard_count(), 4);
    assert_eq!(layout.exp_c(), 30);
    assert_eq!(layout.files[0], "mcdb-v1-4,000.cdb");
    assert_eq!(layout.files[3], "mcdb-v1-4,011.cdb");
  }

  #[test]
  fn test_layout_empty() {
    let err = ShardLayout::from_names(["a.txt", "b.bin"]).unwrap_err();
    assert!(matches!(err, Error::Structural(_)));
  }

  #[test]
  fn test_layout_names_the_gap() {
    let listing = names(FormatVersion::V1, 4, &[0, 2, 3]);
    let err = ShardLayout::from_names(&listing).unwrap_err();
    let msg = err.to_string();
    assert!(matches!(err, Error::Structural(_)));
    assert!(msg.contains("shard 1 of 4"), "{}", msg);
    assert!(msg.contains("mcdb-v1-4,001.cdb"), "{}", msg);

    // Gap at the end.
    let listing = names(FormatVersion::V1, 4, &[0, 1, 2]);
    let msg = ShardLayout::from_names(&listing).unwrap_err().to_string();
    assert!(msg.contains("shard 3 of 4"), "{}", msg);
  }

  #[test]
  fn test_layout_rejects_mixed_counts() {
    let mut listing = names(FormatVersion::V1, 2, &[0, 1]);
    listing.extend(names(FormatVersion::V1, 4, &[0, 1, 2, 3]));
    let err = ShardLayout::from_names(&listing).unwrap_err();
    assert!(matches!(err, Error::Structural(_)));
  }

  #[test]
  fn test_layout_rejects_mixed_versions() {
    let mut listing = names(FormatVersion::V1, 2, &[0]);
    listing.extend(names(FormatVersion::V0, 2, &[1]));
    let msg = ShardLayout::from_names(&listing).unwrap_err().to_string();
    assert!(msg.contains("version mismatch"), "{}", msg);
  }

  #[test]
  fn test_layout_rejects_out_of_range_and_duplicates() {
    let listing = ["mcdb-v1-2,00.cdb", "mcdb-v1-2,10.cdb"];
    assert!(matches!(
      ShardLayout::from_names(listing),
      Err(Error::Structural(_))
    ));

    let listing = ["mcdb-v1-2,00.cdb", "mcdb-v1-2,0.cdb", "mcdb-v1-2,01.cdb"];
    let msg = ShardLayout::from_names(listing).unwrap_err().to_string();
    assert!(msg.contains("claimed by both"), "{}", msg);
  }

  #[test]
  fn test_legacy_layout_uses_fnv_tables() {
    let layout = ShardLayout::from_names(names(FormatVersion::V0, 2, &[0, 1])).unwrap();
    assert_eq!(layout.version, FormatVersion::V0);
    assert_eq!(layout.version.internal_hash()(b"foobar"), hash::fnv1_32(b"foobar"));
  }
}
