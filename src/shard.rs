use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::{ReadStrategy, WriterOptions};
use crate::error::{Error, Result};
use crate::hash::HashFn;
use crate::table::{self, HEADER_SIZE, RecordHeader, Slot, TABLE_BYTES_PER_ENTRY, TablePointer};

use memmap2::Mmap;

/// A single shard file opened for BUILDING.
///
/// Records are appended as they arrive; the hash tables and the header are
/// written by `finish`. Until then the file is not a valid cdb.
pub struct ShardBuilder {
  path: PathBuf,
  file: BufWriter<File>,
  hash: HashFn,
  /// Offset where the next record goes.
  position: u64,
  entries: Vec<Slot>,
  max_size: u64,
  /// Set after a failed write; the buffered tail is then unknown.
  failed: bool,
}

impl ShardBuilder {
  pub fn create(path: PathBuf, hash: HashFn, options: &WriterOptions) -> Result<Self> {
    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    let mut file = BufWriter::with_capacity(options.write_buffer_size, file);

    // Reserve the header; it is rewritten on finish.
    file
      .write_all(&[0u8; HEADER_SIZE])
      .map_err(|e| Error::io(&path, e))?;

    Ok(Self {
      path,
      file,
      hash,
      position: HEADER_SIZE as u64,
      entries: Vec::new(),
      max_size: options.max_shard_size.min(u32::MAX as u64),
      failed: false,
    })
  }

  /// Appends a record.
  ///
  /// Fails with `CapacityExceeded` before writing anything if the finished
  /// file would not fit in `max_shard_size`; the builder stays usable.
  /// An I/O error is final: every later `put` and `finish` fails too.
  pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
    self.ensure_healthy()?;
    let header = RecordHeader {
      key_len: key.len().try_into().unwrap_or(u32::MAX),
      value_len: value.len().try_into().unwrap_or(u32::MAX),
    };
    let record_size = RecordHeader::SIZE as u64 + key.len() as u64 + value.len() as u64;
    let needed = self.position + record_size + (self.entries.len() as u64 + 1) * TABLE_BYTES_PER_ENTRY;
    if needed > self.max_size {
      return Err(Error::CapacityExceeded {
        path: self.path.clone(),
        needed,
        limit: self.max_size,
      });
    }

    let write = |file: &mut BufWriter<File>| -> std::io::Result<()> {
      header.write(file)?;
      file.write_all(key)?;
      file.write_all(value)
    };
    if let Err(e) = write(&mut self.file) {
      self.failed = true;
      return Err(Error::io(&self.path, e));
    }

    self.entries.push(Slot {
      hash: (self.hash)(key),
      // Bounded by max_size, which never exceeds u32::MAX.
      position: self.position as u32,
    });
    self.position += record_size;
    Ok(())
  }

  /// Writes the hash tables and header, then syncs the file.
  pub fn finish(mut self) -> Result<()> {
    self.ensure_healthy()?;
    let (pointers, tables) = table::build_tables(&self.entries, self.position as u32)?;

    let path = self.path.clone();
    let write = |file: &mut BufWriter<File>| -> std::io::Result<()> {
      file.write_all(&tables)?;
      file.seek(SeekFrom::Start(0))?;
      for pointer in &pointers {
        pointer.write(file)?;
      }
      file.flush()?;
      file.get_ref().sync_all()
    };
    write(&mut self.file).map_err(|e| Error::io(&path, e))?;

    tracing::debug!(target: "ironcdb", path = %path.display(), records = self.entries.len(), "finished shard");
    Ok(())
  }

  fn ensure_healthy(&self) -> Result<()> {
    if self.failed {
      return Err(Error::io(
        &self.path,
        std::io::Error::other("shard builder is unusable after an earlier write error"),
      ));
    }
    Ok(())
  }

  /// Size of a shard holding only this record.
  /// If it exceeds `max_size`, no shard count can hold the record.
  pub fn size_when_empty(key: &[u8], value: &[u8]) -> u64 {
    let record_size = RecordHeader::SIZE as u64 + key.len() as u64 + value.len() as u64;
    HEADER_SIZE as u64 + record_size + TABLE_BYTES_PER_ENTRY
  }

  pub fn max_size(&self) -> u64 {
    self.max_size
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Number of records written so far.
  pub fn len(&self) -> usize {
    self.entries.len()
  }
}

enum Source {
  Mmap(Mmap),
  Io { file: Mutex<File>, len: u64 },
}

/// A finished shard file opened for READING.
pub struct ShardReader {
  path: PathBuf,
  source: Source,
  hash: HashFn,
  header: Vec<TablePointer>,
  /// End of the record area: where the first hash table starts.
  data_end: u64,
}

impl ShardReader {
  pub fn open(path: &Path, hash: HashFn, strategy: ReadStrategy) -> Result<Self> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let len = file.metadata().map_err(|e| Error::io(path, e))?.len();
    if len < HEADER_SIZE as u64 {
      return Err(Error::Corruption(format!(
        "{}: {} bytes is too short for a cdb file",
        path.display(),
        len
      )));
    }

    let source = match strategy {
      ReadStrategy::Mmap => {
        // Safety: shard files are immutable once finished; a concurrent
        // truncation by another process is outside our contract.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path, e))?;
        Source::Mmap(mmap)
      }
      ReadStrategy::StandardIo => Source::Io {
        file: Mutex::new(file),
        len,
      },
    };

    let mut reader = Self {
      path: path.to_path_buf(),
      source,
      hash,
      header: Vec::new(),
      data_end: HEADER_SIZE as u64,
    };

    let header_bytes = reader.read_at(0, HEADER_SIZE as u64)?;
    let header = table::read_header(&header_bytes)?;
    drop(header_bytes);

    let data_end = header.iter().map(|p| p.position as u64).min().unwrap_or(HEADER_SIZE as u64);
    if data_end < HEADER_SIZE as u64 || data_end > reader.len() {
      return Err(Error::Corruption(format!(
        "{}: hash tables start at {}, outside {}..={}",
        path.display(),
        data_end,
        HEADER_SIZE,
        reader.len()
      )));
    }

    reader.header = header;
    reader.data_end = data_end;
    tracing::debug!(target: "ironcdb", path = %path.display(), bytes = reader.len(), "opened shard");
    Ok(reader)
  }

  fn len(&self) -> u64 {
    match &self.source {
      Source::Mmap(mmap) => mmap.len() as u64,
      Source::Io { len, .. } => *len,
    }
  }

  /// Reads `len` bytes at `offset`, borrowing from the map when possible.
  fn read_at(&self, offset: u64, len: u64) -> Result<Cow<'_, [u8]>> {
    let end = offset.checked_add(len).filter(|end| *end <= self.len()).ok_or_else(|| {
      Error::Corruption(format!(
        "{}: read of {} bytes at {} runs past end of file",
        self.path.display(),
        len,
        offset
      ))
    })?;

    match &self.source {
      Source::Mmap(mmap) => Ok(Cow::Borrowed(&mmap[offset as usize..end as usize])),
      Source::Io { file, .. } => {
        let mut buf = vec![0u8; len as usize];
        let mut file = file.lock();
        file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io(&self.path, e))?;
        file.read_exact(&mut buf).map_err(|e| Error::io(&self.path, e))?;
        Ok(Cow::Owned(buf))
      }
    }
  }

  fn record_header(&self, position: u64) -> Result<RecordHeader> {
    let bytes = self.read_at(position, RecordHeader::SIZE as u64)?;
    Ok(RecordHeader::read(&mut &bytes[..])?)
  }

  /// Returns the first value stored under `key`.
  pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let hash = (self.hash)(key);
    let pointer = self.header[table::table_of(hash)];
    if pointer.slots == 0 {
      return Ok(None);
    }

    let mut slot = table::start_slot(hash, pointer.slots);
    for _ in 0..pointer.slots {
      let slot_offset = pointer.position as u64 + slot as u64 * table::SLOT_SIZE as u64;
      let bytes = self.read_at(slot_offset, table::SLOT_SIZE as u64)?;
      let entry = Slot::read(&mut &bytes[..])?;

      if entry.position == 0 {
        return Ok(None);
      }
      if entry.hash == hash {
        let position = entry.position as u64;
        let header = self.record_header(position)?;
        if header.key_len as usize == key.len() {
          let key_start = position + RecordHeader::SIZE as u64;
          let found = self.read_at(key_start, header.key_len as u64)?;
          if &*found == key {
            let value = self.read_at(key_start + header.key_len as u64, header.value_len as u64)?;
            return Ok(Some(value.into_owned()));
          }
        }
      }

      slot = (slot + 1) % pointer.slots;
    }
    Ok(None)
  }

  /// Returns a cursor over every record in file order.
  pub fn iter(&self) -> ShardIter<'_> {
    ShardIter {
      reader: self,
      position: HEADER_SIZE as u64,
      failed: false,
    }
  }
}

/// Sequential cursor over one shard's records.
pub struct ShardIter<'a> {
  reader: &'a ShardReader,
  position: u64,
  failed: bool,
}

impl ShardIter<'_> {
  fn read_record(&mut self) -> Result<(Vec<u8>, Vec<u8>)> {
    let header = self.reader.record_header(self.position)?;
    let end = self.position + header.disk_size();
    if end > self.reader.data_end {
      return Err(Error::Corruption(format!(
        "{}: record at {} overruns the data area ({} > {})",
        self.reader.path.display(),
        self.position,
        end,
        self.reader.data_end
      )));
    }

    let key_start = self.position + RecordHeader::SIZE as u64;
    let key = self.reader.read_at(key_start, header.key_len as u64)?.into_owned();
    let value = self
      .reader
      .read_at(key_start + header.key_len as u64, header.value_len as u64)?
      .into_owned();
    self.position = end;
    Ok((key, value))
  }
}

impl Iterator for ShardIter<'_> {
  type Item = Result<(Vec<u8>, Vec<u8>)>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.failed || self.position >= self.reader.data_end {
      return None;
    }
    let record = self.read_record();
    self.failed = record.is_err();
    Some(record)
  }
}
