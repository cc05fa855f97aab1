//! On-disk layout of a single shard (a standard cdb file).
//!
//! ```text
//! [Header: 256 x (Position: 4, Slots: 4)]           2048 bytes
//! [Record: KeyLen: 4, ValueLen: 4, Key, Value] ...  starting at 2048
//! [Table 0: Slots x (Hash: 4, RecordPos: 4)] ... [Table 255]
//! ```
//!
//! All integers are little-endian `u32`, which caps a shard at 4 GiB.
//! A key with hash `h` lives in table `h & 0xff`, probing linearly from slot
//! `(h >> 8) % slots`. Every table has twice as many slots as entries, so an
//! empty slot (position 0) always ends a probe.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const TABLE_COUNT: usize = 256;
pub const HEADER_SIZE: usize = TABLE_COUNT * TablePointer::SIZE; // 2048 bytes
pub const SLOT_SIZE: usize = 8;

/// Table bytes a single entry costs once the file is finished (two slots).
pub const TABLE_BYTES_PER_ENTRY: u64 = 2 * SLOT_SIZE as u64;

/// One header entry: where a hash table starts and how many slots it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TablePointer {
  pub position: u32,
  pub slots: u32,
}

impl TablePointer {
  pub const SIZE: usize = 8;

  pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(self.position)?;
    writer.write_u32::<LittleEndian>(self.slots)
  }

  pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
    let position = reader.read_u32::<LittleEndian>()?;
    let slots = reader.read_u32::<LittleEndian>()?;
    Ok(Self { position, slots })
  }
}

/// Parses the 2048-byte header.
pub fn read_header(mut bytes: &[u8]) -> Result<Vec<TablePointer>> {
  if bytes.len() < HEADER_SIZE {
    return Err(Error::Corruption(format!(
      "cdb header truncated: {} of {} bytes",
      bytes.len(),
      HEADER_SIZE
    )));
  }
  (0..TABLE_COUNT)
    .map(|_| TablePointer::read(&mut bytes).map_err(Error::Io))
    .collect()
}

/// Length prefix of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
  pub key_len: u32,
  pub value_len: u32,
}

impl RecordHeader {
  pub const SIZE: usize = 8;

  pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(self.key_len)?;
    writer.write_u32::<LittleEndian>(self.value_len)
  }

  pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
    let key_len = reader.read_u32::<LittleEndian>()?;
    let value_len = reader.read_u32::<LittleEndian>()?;
    Ok(Self { key_len, value_len })
  }

  /// Bytes the record occupies on disk, prefix included.
  pub fn disk_size(&self) -> u64 {
    Self::SIZE as u64 + self.key_len as u64 + self.value_len as u64
  }
}

/// One hash table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slot {
  pub hash: u32,
  /// Record position; 0 marks an empty slot (records never start at 0).
  pub position: u32,
}

impl Slot {
  pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
    let hash = reader.read_u32::<LittleEndian>()?;
    let position = reader.read_u32::<LittleEndian>()?;
    Ok(Self { hash, position })
  }
}

#[inline]
pub fn table_of(hash: u32) -> usize {
  (hash & 0xff) as usize
}

#[inline]
pub fn start_slot(hash: u32, slots: u32) -> u32 {
  (hash >> 8) % slots
}

/// Builds the 256 hash tables for `entries` (hash, record position) in
/// insertion order. `tables_start` is the file offset right after the last
/// record. Returns the header pointers and the serialized tables.
pub fn build_tables(entries: &[Slot], tables_start: u32) -> Result<(Vec<TablePointer>, Vec<u8>)> {
  let mut counts = [0u32; TABLE_COUNT];
  for entry in entries {
    counts[table_of(entry.hash)] += 1;
  }

  let mut buckets: Vec<Vec<Slot>> = counts.iter().map(|&n| Vec::with_capacity(n as usize)).collect();
  for entry in entries {
    buckets[table_of(entry.hash)].push(*entry);
  }

  let mut pointers = Vec::with_capacity(TABLE_COUNT);
  let mut out = Vec::with_capacity(entries.len() * TABLE_BYTES_PER_ENTRY as usize);
  let mut position = tables_start as u64;

  for bucket in &buckets {
    let slots = bucket.len() as u32 * 2;
    let table_position = u32::try_from(position)
      .map_err(|_| Error::Corruption(format!("hash table offset {} exceeds 32 bits", position)))?;
    pointers.push(TablePointer {
      position: table_position,
      slots,
    });

    if slots == 0 {
      continue;
    }

    let mut table = vec![Slot::default(); slots as usize];
    for entry in bucket {
      let mut slot = start_slot(entry.hash, slots);
      while table[slot as usize].position != 0 {
        slot = (slot + 1) % slots;
      }
      table[slot as usize] = *entry;
    }

    for slot in &table {
      out.write_u32::<LittleEndian>(slot.hash)?;
      out.write_u32::<LittleEndian>(slot.position)?;
    }
    position += slots as u64 * SLOT_SIZE as u64;
  }

  Ok((pointers, out))
}
