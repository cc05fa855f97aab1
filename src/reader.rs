//! ShardedReader implementation - read side of a shard set.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::cancel::CancelToken;
use crate::codec::RecordCodec;
use crate::config::{DumpOptions, ReaderOptions};
use crate::error::{Error, Result};
use crate::hash::{self, Router};
use crate::iter::ShardedIter;
use crate::naming::{FormatVersion, ShardLayout};
use crate::shard::ShardReader;

/// Read-only view over a finished shard set.
///
/// Opening validates the directory listing before any file is mapped, so a
/// partial or mixed set is rejected up front. The reader is `Send + Sync`;
/// share it behind an `Arc` for concurrent lookups and scans.
///
/// # Example
///
/// ```no_run
/// use ironcdb::ShardedReader;
///
/// # fn main() -> ironcdb::Result<()> {
/// let reader = ShardedReader::open("./cdb_data")?;
/// if let Some(value) = reader.get(b"user_123")? {
///     println!("{} bytes", value.len());
/// }
/// for record in reader.iter() {
///     let (key, value) = record?;
///     // ...
/// }
/// # Ok(())
/// # }
/// ```
pub struct ShardedReader {
  path: PathBuf,
  version: FormatVersion,
  router: Router,
  shards: Vec<ShardReader>,
  options: ReaderOptions,
  closed: bool,
}

impl ShardedReader {
  /// Opens a shard set with default options.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with(path, ReaderOptions::default())
  }

  /// Opens a shard set.
  ///
  /// # Behavior
  ///
  /// - A regular file is opened as a single-shard set (a plain cdb file).
  /// - A directory must hold exactly one complete `mcdb-*.cdb` set;
  ///   unrelated files are ignored.
  ///
  /// # Errors
  ///
  /// Returns `Structural` or `InvalidFilename` for a bad listing, `IoPath`
  /// when a file cannot be opened or mapped, and `Corruption` for a file
  /// too short to be a cdb.
  pub fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
    let path = path.as_ref();
    let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;

    if metadata.is_file() {
      let shard = ShardReader::open(path, hash::djb, options.read_strategy)?;
      tracing::debug!(target: "ironcdb", path = %path.display(), "opened single file as one shard");
      return Ok(Self {
        path: path.to_path_buf(),
        version: FormatVersion::V1,
        router: Router::new(1),
        shards: vec![shard],
        options,
        closed: false,
      });
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| Error::io(path, e))? {
      let entry = entry.map_err(|e| Error::io(path, e))?;
      // Shard names are ASCII; anything else cannot belong to the set.
      if let Ok(name) = entry.file_name().into_string() {
        names.push(name);
      }
    }

    let layout = ShardLayout::from_names(&names)?;
    let internal_hash = layout.version.internal_hash();

    let mut shards = Vec::with_capacity(layout.files.len());
    for name in &layout.files {
      shards.push(ShardReader::open(&path.join(name), internal_hash, options.read_strategy)?);
    }

    tracing::info!(
      target: "ironcdb",
      path = %path.display(),
      shards = shards.len(),
      version = %layout.version,
      "opened shard set"
    );

    Ok(Self {
      path: path.to_path_buf(),
      version: layout.version,
      router: Router::new(layout.shard_count()),
      shards,
      options,
      closed: false,
    })
  }

  /// Looks up the first value stored under `key`.
  ///
  /// Only the owning shard is consulted unless `try_all` is set, in which
  /// case a miss there falls back to every other shard in index order.
  pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    self.ensure_open()?;

    let owner = self.router.route(key);
    if let Some(value) = self.shards[owner].get(key)? {
      return Ok(Some(value));
    }
    if !self.options.try_all {
      return Ok(None);
    }

    for (index, shard) in self.shards.iter().enumerate() {
      if index == owner {
        continue;
      }
      if let Some(value) = shard.get(key)? {
        tracing::debug!(target: "ironcdb", owner, found_in = index, "key found outside its owning shard");
        return Ok(Some(value));
      }
    }
    Ok(None)
  }

  /// Returns an iterator over every record, shard by shard in index order.
  ///
  /// Duplicate keys are all yielded. A closed reader yields nothing.
  pub fn iter(&self) -> ShardedIter<'_> {
    ShardedIter::new(&self.shards)
  }

  /// Writes every record to `writer` in the given text format.
  pub fn dump<W: Write>(&self, writer: W, options: DumpOptions) -> Result<()> {
    self.dump_with(&CancelToken::never(), writer, options)
  }

  /// Like [`dump`](Self::dump), polling `cancel` once per record.
  ///
  /// Output is buffered and flushed once at the end; on error or
  /// cancellation whatever was already written stays written.
  pub fn dump_with<W: Write>(&self, cancel: &CancelToken, writer: W, options: DumpOptions) -> Result<()> {
    self.ensure_open()?;

    let codec = RecordCodec::from(options);
    let mut out = BufWriter::new(writer);
    let mut count = 0u64;

    for record in self.iter() {
      cancel.check()?;
      let (key, value) = record?;
      codec.encode(&mut out, &key, &value)?;
      count += 1;
    }
    out.flush()?;

    tracing::debug!(target: "ironcdb", path = %self.path.display(), records = count, "dumped shard set");
    Ok(())
  }

  /// Writes the records for the given keys, in the order given.
  ///
  /// Keys that are not present are skipped.
  pub fn dump_keys<W, I, K>(&self, writer: W, keys: I, options: DumpOptions) -> Result<()>
  where
    W: Write,
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
  {
    self.ensure_open()?;

    let codec = RecordCodec::from(options);
    let mut out = BufWriter::new(writer);

    for key in keys {
      let key = key.as_ref();
      match self.get(key)? {
        Some(value) => codec.encode(&mut out, key, &value)?,
        None => {
          tracing::debug!(target: "ironcdb", key = %String::from_utf8_lossy(key), "skipping absent key");
        }
      }
    }
    out.flush()?;
    Ok(())
  }

  /// Releases every shard handle. Idempotent.
  ///
  /// Lookups and dumps after `close` fail with `Error::Closed`.
  pub fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    self.shards.clear();
    tracing::debug!(target: "ironcdb", path = %self.path.display(), "closed shard set");
    Ok(())
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed {
      return Err(Error::Closed);
    }
    Ok(())
  }

  /// Number of shards in the set.
  pub fn shard_count(&self) -> u64 {
    self.router.shard_count()
  }

  pub fn version(&self) -> FormatVersion {
    self.version
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn router(&self) -> &Router {
    &self.router
  }
}
