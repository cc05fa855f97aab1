use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("I/O Error on {}: {source}", path.display())]
  IoPath {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("Invalid shard set: {0}")]
  Structural(String),

  #[error("Invalid shard filename {name:?}: {reason}")]
  InvalidFilename { name: String, reason: String },

  #[error("Shard capacity exceeded in {}: need {needed} bytes, limit is {limit}", path.display())]
  CapacityExceeded { path: PathBuf, needed: u64, limit: u64 },

  #[error("Record too large for any shard: need {needed} bytes, limit is {limit}")]
  RecordTooLarge { needed: u64, limit: u64 },

  #[error("Growth limit reached after {attempts} doublings ({shards} shards)")]
  GrowthLimit { attempts: u32, shards: u64 },

  #[error("Record Format Error: {0}")]
  Format(String),

  #[error("Data Corruption: {0}")]
  Corruption(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  #[error("Operation cancelled")]
  Cancelled,

  #[error("Shard set already closed")]
  Closed,
}

impl Error {
  /// Attaches the offending path to an I/O failure.
  pub(crate) fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
    Error::IoPath {
      path: path.as_ref().to_path_buf(),
      source,
    }
  }

  /// True for the per-shard overflow signal that drives growth.
  pub fn is_capacity_exceeded(&self) -> bool {
    matches!(self, Error::CapacityExceeded { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_io_error_names_path() {
    let err = Error::io("/tmp/mcdb-v1-2,00.cdb", io::Error::new(io::ErrorKind::NotFound, "gone"));
    let msg = err.to_string();
    assert!(msg.contains("mcdb-v1-2,00.cdb"), "{}", msg);
    assert!(msg.contains("gone"), "{}", msg);
  }

  #[test]
  fn test_capacity_predicate() {
    let err = Error::CapacityExceeded {
      path: PathBuf::from("x.cdb"),
      needed: 10,
      limit: 5,
    };
    assert!(err.is_capacity_exceeded());
    assert!(!Error::Cancelled.is_capacity_exceeded());
    assert!(!Error::RecordTooLarge { needed: 10, limit: 5 }.is_capacity_exceeded());
  }
}
