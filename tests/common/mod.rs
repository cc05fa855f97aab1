#![allow(dead_code)]

use ironcdb::{ShardedReader, ShardedWriter, WriterOptions};
use tempfile::TempDir;

pub struct TestEnv {
  // The TempDir guard must be kept alive to prevent premature deletion of the directory.
  pub _dir: TempDir,
  pub root: std::path::PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("set");
    Self { _dir: dir, root }
  }

  pub fn options(&self) -> WriterOptions {
    WriterOptions::new(&self.root)
  }

  pub fn writer(&self, shard_count: i64) -> ShardedWriter {
    ShardedWriter::create(&self.root, shard_count).unwrap()
  }

  pub fn reader(&self) -> ShardedReader {
    ShardedReader::open(&self.root).unwrap()
  }

  /// Sorted file names in the shard directory.
  pub fn files(&self) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(&self.root)
      .unwrap()
      .map(|e| e.unwrap().file_name().into_string().unwrap())
      .collect();
    names.sort();
    names
  }
}

pub fn key(i: usize) -> Vec<u8> {
  format!("key_{}", i).into_bytes()
}

pub fn value(i: usize, len: usize) -> Vec<u8> {
  (0..len).map(|j| (i + j) as u8).collect()
}
