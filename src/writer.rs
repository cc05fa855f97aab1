//! ShardedWriter implementation - build side of a shard set.

use std::fs;
use std::io::{BufReader, Read};
use std::mem;
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::codec::RecordCodec;
use crate::config::{DumpOptions, ReaderOptions, WriterOptions};
use crate::error::{Error, Result};
use crate::hash::Router;
use crate::naming::{FILE_PREFIX, FILE_SUFFIX, FormatVersion, ShardIdentity};
use crate::reader::ShardedReader;
use crate::shard::ShardBuilder;
use crate::table::{HEADER_SIZE, TABLE_BYTES_PER_ENTRY};

/// Read buffer used when loading a text dump.
const LOAD_BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// Largest shard count the 32-bit routing hash can address.
const MAX_SHARDS: u64 = 1 << 32;

/// Builds a shard set: a directory of cdb files, one per hash range.
///
/// Records are routed to shards by key hash and appended. The files become
/// valid cdb files once `close` has written their hash tables. A writer is
/// single-threaded; share it behind a `Mutex` if several threads feed it.
///
/// An auto-growing writer (`shard_count <= 0`) doubles its shard count when a
/// shard would overflow `max_shard_size`: the current set is finished,
/// reread into a set twice as large, and the old files are deleted.
///
/// # Example
///
/// ```no_run
/// use ironcdb::ShardedWriter;
///
/// # fn main() -> ironcdb::Result<()> {
/// // 0 = start with 2 shards and grow as needed
/// let mut writer = ShardedWriter::create("./cdb_data", 0)?;
/// writer.put(b"user_123", b"profile_data")?;
/// writer.close()?;
/// # Ok(())
/// # }
/// ```
pub struct ShardedWriter {
  options: WriterOptions,
  router: Router,
  /// Open builders, indexed by shard.
  builders: Vec<ShardBuilder>,
  can_grow: bool,
  closed: bool,
}

impl ShardedWriter {
  /// Creates a writer in `path` with default options.
  ///
  /// `shard_count > 0` fixes the count (rounded up to a power of two);
  /// `shard_count <= 0` starts from `|shard_count|` shards (2 for zero) and
  /// grows on demand.
  pub fn create(path: impl Into<PathBuf>, shard_count: i64) -> Result<Self> {
    Self::with_options(WriterOptions {
      shard_count,
      ..WriterOptions::new(path)
    })
  }

  /// Creates a writer from explicit options.
  ///
  /// # Errors
  ///
  /// Returns `Config` for a shard count above 2^32 or a `max_shard_size`
  /// too small for even one record, and `IoPath` if the directory or a
  /// shard file cannot be created. Files created before a failure are
  /// removed again.
  pub fn with_options(options: WriterOptions) -> Result<Self> {
    if options.shard_count.unsigned_abs() > MAX_SHARDS {
      return Err(Error::Config(format!(
        "shard_count {} exceeds the maximum of {}",
        options.shard_count, MAX_SHARDS
      )));
    }
    let minimum = HEADER_SIZE as u64 + TABLE_BYTES_PER_ENTRY;
    if options.max_shard_size < minimum {
      return Err(Error::Config(format!(
        "max_shard_size {} is below the minimum of {} bytes",
        options.max_shard_size, minimum
      )));
    }

    let shard_count = options.initial_shard_count();
    let can_grow = options.can_grow();
    let writer = Self::create_set(options, shard_count, can_grow)?;

    tracing::info!(
      target: "ironcdb",
      path = %writer.path().display(),
      shards = shard_count,
      version = %writer.version(),
      growable = can_grow,
      "created shard set"
    );
    Ok(writer)
  }

  /// Creates `shard_count` empty shard files.
  fn create_set(options: WriterOptions, shard_count: u64, can_grow: bool) -> Result<Self> {
    let root = &options.root_path;
    fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;

    let router = Router::with_hash(shard_count, options.routing_hash);
    let internal_hash = options.version.internal_hash();

    let mut builders = Vec::new();
    for index in 0..shard_count {
      let name = ShardIdentity::new(options.version, shard_count, index).file_name();
      match ShardBuilder::create(root.join(name), internal_hash, &options) {
        Ok(builder) => builders.push(builder),
        Err(e) => {
          discard(builders);
          return Err(e);
        }
      }
    }

    Ok(Self {
      options,
      router,
      builders,
      can_grow,
      closed: false,
    })
  }

  /// Adds a record. Duplicate keys are stored as separate records.
  ///
  /// # Errors
  ///
  /// - `CapacityExceeded` if the owning shard is full and the writer cannot
  ///   grow.
  /// - `RecordTooLarge` if a growing writer is handed a record that would not
  ///   fit even an empty shard. Nothing is written and the writer stays usable.
  /// - `GrowthLimit` if `max_growth_steps` doublings did not make room.
  pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
    self.put_with(&CancelToken::never(), key, value)
  }

  /// Like [`put`](Self::put), polling `cancel` before the write and once
  /// per record copied if the put triggers growth.
  ///
  /// If growth fails or is cancelled, the writer is left closed with the
  /// pre-growth shard set finished and valid on disk.
  pub fn put_with(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<()> {
    cancel.check()?;
    self.ensure_open()?;

    let index = self.router.route(key);
    let builder = &mut self.builders[index];
    match builder.put(key, value) {
      Err(e) if e.is_capacity_exceeded() && self.can_grow => {
        // No shard count can hold a record that overflows an empty shard.
        let needed = ShardBuilder::size_when_empty(key, value);
        let limit = builder.max_size();
        if needed > limit {
          return Err(Error::RecordTooLarge { needed, limit });
        }
        self.grow(cancel, key, value)
      }
      other => other,
    }
  }

  /// Doubles the shard count until the pending record and every stored
  /// record fit, then swaps the new set in.
  fn grow(&mut self, cancel: &CancelToken, key: &[u8], value: &[u8]) -> Result<()> {
    let old_count = self.shard_count();

    // 1. Finish the current set so it can be read back.
    let old_files: Vec<PathBuf> = self.builders.iter().map(|b| b.path().to_path_buf()).collect();
    self.closed = true;
    finish_all(mem::take(&mut self.builders))?;

    let reader = ShardedReader::open_with(&self.options.root_path, ReaderOptions::default())?;

    // 2. Rebuild into larger sets until everything fits.
    let mut shard_count = old_count;
    for attempt in 1..=self.options.max_growth_steps {
      shard_count *= 2;
      if shard_count > MAX_SHARDS {
        break;
      }

      tracing::info!(
        target: "ironcdb",
        from = old_count,
        to = shard_count,
        attempt,
        "shard full, growing shard set"
      );

      let mut next = Self::create_set(self.options.clone(), shard_count, false)?;
      match next.copy_from(cancel, &reader, key, value) {
        Ok(()) => {
          // 3. Release the old set and replace it.
          drop(reader);
          next.can_grow = true;
          let removed = remove_files(&old_files);
          *self = next;
          return removed;
        }
        Err(e) => {
          next.abandon();
          if !e.is_capacity_exceeded() {
            return Err(e);
          }
          tracing::debug!(target: "ironcdb", shards = shard_count, "still overflowing, doubling again");
        }
      }
    }

    Err(Error::GrowthLimit {
      attempts: self.options.max_growth_steps,
      shards: shard_count.min(MAX_SHARDS),
    })
  }

  /// Writes the pending record first, then every record of `reader`.
  fn copy_from(&mut self, cancel: &CancelToken, reader: &ShardedReader, key: &[u8], value: &[u8]) -> Result<()> {
    self.put_with(cancel, key, value)?;
    for record in reader.iter() {
      let (key, value) = record?;
      self.put_with(cancel, &key, &value)?;
    }
    Ok(())
  }

  /// Drops an unfinished set and deletes its files.
  fn abandon(&mut self) {
    self.closed = true;
    discard(mem::take(&mut self.builders));
  }

  /// Reads records from a text dump and adds each one.
  ///
  /// Returns the number of records loaded.
  pub fn load<R: Read>(&mut self, reader: R, options: DumpOptions) -> Result<u64> {
    self.load_with(&CancelToken::never(), reader, options)
  }

  /// Like [`load`](Self::load), polling `cancel` once per record.
  ///
  /// On a format error the records before it stay written.
  pub fn load_with<R: Read>(&mut self, cancel: &CancelToken, reader: R, options: DumpOptions) -> Result<u64> {
    self.ensure_open()?;

    let input = BufReader::with_capacity(LOAD_BUFFER_SIZE, reader);
    let mut count = 0u64;
    for record in RecordCodec::from(options).decoder(input) {
      let (key, value) = record?;
      self.put_with(cancel, &key, &value)?;
      count += 1;
    }

    tracing::debug!(target: "ironcdb", path = %self.path().display(), records = count, "loaded records");
    Ok(count)
  }

  /// Finishes every shard file. Idempotent.
  ///
  /// Keeps going past a failing shard and returns the first error. With
  /// `harden_permissions` the files and directory are made read-only
  /// afterwards.
  pub fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;

    let records: usize = self.builders.iter().map(ShardBuilder::len).sum();
    let result = finish_all(mem::take(&mut self.builders));
    if self.options.harden_permissions {
      harden(&self.options.root_path);
    }

    tracing::info!(
      target: "ironcdb",
      path = %self.path().display(),
      shards = self.shard_count(),
      records,
      ok = result.is_ok(),
      "closed shard set"
    );
    result
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed {
      return Err(Error::Closed);
    }
    Ok(())
  }

  /// Current number of shards.
  pub fn shard_count(&self) -> u64 {
    self.router.shard_count()
  }

  pub fn path(&self) -> &Path {
    &self.options.root_path
  }

  pub fn version(&self) -> FormatVersion {
    self.options.version
  }

  /// Whether a full shard triggers growth rather than an error.
  pub fn growth_enabled(&self) -> bool {
    self.can_grow
  }

  pub fn is_closed(&self) -> bool {
    self.closed
  }
}

impl Drop for ShardedWriter {
  fn drop(&mut self) {
    if self.closed {
      return;
    }
    tracing::warn!(target: "ironcdb", path = %self.path().display(), "writer dropped without close, closing now");
    if let Err(e) = self.close() {
      tracing::error!(target: "ironcdb", "failed to close shard set on drop: {}", e);
    }
  }
}

/// Finishes every builder, returning the first error.
fn finish_all(builders: Vec<ShardBuilder>) -> Result<()> {
  let mut first_error = None;
  for builder in builders {
    let path = builder.path().to_path_buf();
    if let Err(e) = builder.finish() {
      tracing::error!(target: "ironcdb", path = %path.display(), "failed to finish shard: {}", e);
      first_error = first_error.or(Some(e));
    }
  }
  first_error.map_or(Ok(()), Err)
}

/// Drops unfinished builders and deletes their files, best effort.
fn discard(builders: Vec<ShardBuilder>) {
  for builder in builders {
    let path = builder.path().to_path_buf();
    drop(builder);
    if let Err(e) = fs::remove_file(&path) {
      tracing::warn!(target: "ironcdb", path = %path.display(), "failed to remove abandoned shard: {}", e);
    }
  }
}

/// Deletes every file, returning the first error.
fn remove_files(paths: &[PathBuf]) -> Result<()> {
  let mut first_error = None;
  for path in paths {
    if let Err(e) = fs::remove_file(path) {
      first_error = first_error.or(Some(Error::io(path, e)));
    }
  }
  first_error.map_or(Ok(()), Err)
}

/// Makes shard files 0440 and the directory 0550. Failures are logged only.
#[cfg(unix)]
fn harden(root: &Path) {
  use std::os::unix::fs::PermissionsExt;

  let set = |path: &Path, mode: u32| {
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
      tracing::warn!(target: "ironcdb", path = %path.display(), "failed to harden permissions: {}", e);
    }
  };

  match fs::read_dir(root) {
    Ok(entries) => {
      for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX) {
          set(&entry.path(), 0o440);
        }
      }
    }
    Err(e) => tracing::warn!(target: "ironcdb", path = %root.display(), "failed to list shard set: {}", e),
  }
  set(root, 0o550);
}

#[cfg(not(unix))]
fn harden(root: &Path) {
  let Ok(entries) = fs::read_dir(root) else {
    return;
  };
  for entry in entries.flatten() {
    let name = entry.file_name();
    let name = name.to_string_lossy();
    if !(name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX)) {
      continue;
    }
    if let Ok(metadata) = entry.metadata() {
      let mut permissions = metadata.permissions();
      permissions.set_readonly(true);
      if let Err(e) = fs::set_permissions(entry.path(), permissions) {
        tracing::warn!(target: "ironcdb", "failed to harden permissions: {}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::DumpFormat;
  use tempfile::TempDir;

  fn shard_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
      .unwrap()
      .map(|e| e.unwrap().file_name().into_string().unwrap())
      .collect();
    names.sort();
    names
  }

  #[test]
  fn test_creates_power_of_two_shards() {
    let dir = TempDir::new().unwrap();
    let mut writer = ShardedWriter::create(dir.path(), 3).unwrap();
    assert_eq!(writer.shard_count(), 4);
    assert!(!writer.growth_enabled());
    writer.close().unwrap();

    assert_eq!(
      shard_files(dir.path()),
      vec![
        "mcdb-v1-4,000.cdb",
        "mcdb-v1-4,001.cdb",
        "mcdb-v1-4,010.cdb",
        "mcdb-v1-4,011.cdb"
      ]
    );
  }

  #[test]
  fn test_rejects_bad_options() {
    let dir = TempDir::new().unwrap();

    let mut opts = WriterOptions::new(dir.path());
    opts.shard_count = (MAX_SHARDS + 1) as i64;
    assert!(matches!(ShardedWriter::with_options(opts), Err(Error::Config(_))));

    let mut opts = WriterOptions::new(dir.path());
    opts.max_shard_size = 100;
    assert!(matches!(ShardedWriter::with_options(opts), Err(Error::Config(_))));

    assert!(shard_files(dir.path()).is_empty());
  }

  #[test]
  fn test_fixed_writer_reports_capacity() {
    let dir = TempDir::new().unwrap();
    let mut opts = WriterOptions::new(dir.path());
    opts.shard_count = 1;
    opts.max_shard_size = 4096;

    let mut writer = ShardedWriter::with_options(opts).unwrap();
    let value = [0u8; 1000];
    writer.put(b"a", &value).unwrap();
    let err = writer.put(b"b", &value).unwrap_err();
    assert!(err.is_capacity_exceeded());

    // Still usable after the error.
    writer.put(b"d", b"small").unwrap();
    writer.close().unwrap();
    assert_eq!(writer.shard_count(), 1);
  }

  #[test]
  fn test_oversized_record_fails_without_growing() {
    let dir = TempDir::new().unwrap();
    let mut opts = WriterOptions::new(dir.path());
    opts.max_shard_size = 4096;

    let mut writer = ShardedWriter::with_options(opts).unwrap();
    let err = writer.put(b"big", &[0u8; 4096]).unwrap_err();
    assert!(matches!(err, Error::RecordTooLarge { limit: 4096, .. }));
    assert!(!err.is_capacity_exceeded());
    assert_eq!(writer.shard_count(), 2);
    assert!(!writer.is_closed());
  }

  #[test]
  fn test_cancel_during_growth_keeps_old_set() {
    let dir = TempDir::new().unwrap();
    let mut opts = WriterOptions::new(dir.path());
    opts.shard_count = -1;
    // Room for exactly 15 records of 8 + 6 + 100 bytes plus their slots.
    opts.max_shard_size = 4096;

    let mut writer = ShardedWriter::with_options(opts).unwrap();
    for i in 10..25 {
      writer.put(format!("key_{}", i).as_bytes(), &[i as u8; 100]).unwrap();
    }
    assert_eq!(writer.shard_count(), 1);

    // Passes the put itself, the pending record and one copied record.
    let cancel = CancelToken::after_checks(3);
    let err = writer.put_with(&cancel, b"key_25", &[25u8; 100]).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(writer.is_closed());
    assert!(matches!(writer.put(b"late", b"x"), Err(Error::Closed)));

    // The doubled attempt is gone; the old set reopens whole.
    assert_eq!(shard_files(dir.path()), vec!["mcdb-v1-1,0.cdb"]);
    let reader = ShardedReader::open(dir.path()).unwrap();
    assert_eq!(reader.shard_count(), 1);
    assert_eq!(reader.iter().count(), 15);
    for i in 10..25 {
      assert_eq!(reader.get(format!("key_{}", i).as_bytes()).unwrap().unwrap(), vec![i as u8; 100]);
    }
    assert_eq!(reader.get(b"key_25").unwrap(), None);
  }

  #[test]
  fn test_growth_replaces_files() {
    let dir = TempDir::new().unwrap();
    let mut opts = WriterOptions::new(dir.path());
    opts.max_shard_size = 8 * 1024;

    let mut writer = ShardedWriter::with_options(opts).unwrap();
    for i in 0..200 {
      writer.put(format!("key_{}", i).as_bytes(), &[i as u8; 100]).unwrap();
    }
    assert!(writer.shard_count() > 2);
    assert!(writer.growth_enabled());
    writer.close().unwrap();

    let count = writer.shard_count();
    let names = shard_files(dir.path());
    assert_eq!(names.len() as u64, count);
    assert!(names.iter().all(|n| n.starts_with(&format!("mcdb-v1-{},", count))));

    let reader = ShardedReader::open(dir.path()).unwrap();
    for i in 0..200 {
      assert_eq!(reader.get(format!("key_{}", i).as_bytes()).unwrap().unwrap(), vec![i as u8; 100]);
    }
  }

  #[test]
  fn test_put_after_close() {
    let dir = TempDir::new().unwrap();
    let mut writer = ShardedWriter::create(dir.path(), 2).unwrap();
    writer.close().unwrap();
    writer.close().unwrap();
    assert!(matches!(writer.put(b"k", b"v"), Err(Error::Closed)));
  }

  #[test]
  fn test_drop_closes() {
    let dir = TempDir::new().unwrap();
    {
      let mut writer = ShardedWriter::create(dir.path(), 2).unwrap();
      writer.put(b"k", b"v").unwrap();
    }
    let reader = ShardedReader::open(dir.path()).unwrap();
    assert_eq!(reader.get(b"k").unwrap().unwrap(), b"v");
  }

  #[test]
  fn test_load_simple_format() {
    let dir = TempDir::new().unwrap();
    let mut writer = ShardedWriter::create(dir.path(), 0).unwrap();
    let loaded = writer
      .load(&b"alpha\t1\nbeta 2\n"[..], DumpOptions::new(DumpFormat::Simple))
      .unwrap();
    assert_eq!(loaded, 2);
    writer.close().unwrap();

    let reader = ShardedReader::open(dir.path()).unwrap();
    assert_eq!(reader.get(b"beta").unwrap().unwrap(), b"2");
  }

  #[test]
  fn test_load_format_error_keeps_prior_records() {
    let dir = TempDir::new().unwrap();
    let mut writer = ShardedWriter::create(dir.path(), 2).unwrap();
    let err = writer
      .load(&b"+1,1:a->1\n+1,1:b=>2\n"[..], DumpOptions::default())
      .unwrap_err();
    assert!(matches!(err, Error::Format(_)));
    writer.close().unwrap();

    let reader = ShardedReader::open(dir.path()).unwrap();
    assert_eq!(reader.get(b"a").unwrap().unwrap(), b"1");
    assert_eq!(reader.get(b"b").unwrap(), None);
  }

  #[test]
  fn test_cancelled_put() {
    let dir = TempDir::new().unwrap();
    let mut writer = ShardedWriter::create(dir.path(), 2).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    assert!(matches!(writer.put_with(&cancel, b"k", b"v"), Err(Error::Cancelled)));
    writer.put(b"k", b"v").unwrap();
  }
}
