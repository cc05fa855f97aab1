//! Text interchange formats for bulk dump and load.
//!
//! The cdbmake format is length-prefixed and byte-exact:
//!
//! ```text
//! +3,5:abc->hello\n
//! +3:abc\n            (keys only)
//! ```
//!
//! The simple format is line-oriented, `key<TAB>value\n` (or `key\n`), and is
//! split on the first tab or space when read back.

use std::io::{self, BufRead, Read, Write};

use crate::config::{DumpFormat, DumpOptions};
use crate::error::{Error, Result};

/// Key/value pair as it travels through dump and load.
pub type Record = (Vec<u8>, Vec<u8>);

/// Record encoding strategy, resolved once per dump or load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordCodec {
  Cdbmake,
  CdbmakeKeys,
  Simple,
  SimpleKeys,
}

impl From<DumpOptions> for RecordCodec {
  fn from(options: DumpOptions) -> Self {
    match (options.format, options.keys_only) {
      (DumpFormat::Cdbmake, false) => RecordCodec::Cdbmake,
      (DumpFormat::Cdbmake, true) => RecordCodec::CdbmakeKeys,
      (DumpFormat::Simple, false) => RecordCodec::Simple,
      (DumpFormat::Simple, true) => RecordCodec::SimpleKeys,
    }
  }
}

impl RecordCodec {
  pub fn encode<W: Write>(self, writer: &mut W, key: &[u8], value: &[u8]) -> io::Result<()> {
    match self {
      RecordCodec::Cdbmake => write_record(writer, key, value),
      RecordCodec::CdbmakeKeys => {
        write!(writer, "+{}:", key.len())?;
        writer.write_all(key)?;
        writer.write_all(b"\n")
      }
      RecordCodec::Simple => {
        writer.write_all(key)?;
        writer.write_all(b"\t")?;
        writer.write_all(value)?;
        writer.write_all(b"\n")
      }
      RecordCodec::SimpleKeys => {
        writer.write_all(key)?;
        writer.write_all(b"\n")
      }
    }
  }

  /// Wraps `reader` in a decoder yielding one record per call.
  pub fn decoder<R: BufRead>(self, reader: R) -> RecordDecoder<R> {
    RecordDecoder {
      codec: self,
      reader,
      line: Vec::new(),
      done: false,
    }
  }

  fn keys_only(self) -> bool {
    matches!(self, RecordCodec::CdbmakeKeys | RecordCodec::SimpleKeys)
  }
}

/// Writes one record in cdbmake format: `+klen,vlen:key->value\n`.
pub fn write_record<W: Write>(writer: &mut W, key: &[u8], value: &[u8]) -> io::Result<()> {
  write!(writer, "+{},{}:", key.len(), value.len())?;
  writer.write_all(key)?;
  writer.write_all(b"->")?;
  writer.write_all(value)?;
  writer.write_all(b"\n")
}

/// Streaming decoder over a buffered reader.
///
/// Yields `Ok(record)` per record; stops cleanly at end of input on a record
/// boundary. After the first error it yields nothing more.
pub struct RecordDecoder<R> {
  codec: RecordCodec,
  reader: R,
  line: Vec<u8>,
  done: bool,
}

impl<R: BufRead> RecordDecoder<R> {
  pub fn next_record(&mut self) -> Result<Option<Record>> {
    if self.done {
      return Ok(None);
    }
    let record = match self.codec {
      RecordCodec::Cdbmake | RecordCodec::CdbmakeKeys => self.next_cdbmake(),
      RecordCodec::Simple | RecordCodec::SimpleKeys => self.next_simple(),
    };
    if !matches!(record, Ok(Some(_))) {
      self.done = true;
    }
    record
  }

  fn next_cdbmake(&mut self) -> Result<Option<Record>> {
    match read_byte(&mut self.reader)? {
      None => return Ok(None),
      // A lone newline is cdbmake's end-of-input marker.
      Some(b'\n') => return Ok(None),
      Some(b'+') => {}
      Some(other) => {
        return Err(Error::Format(format!(
          "expected '+' at start of record, got {:?}",
          char::from(other)
        )));
      }
    }

    let (key_len, value_len) = if self.codec.keys_only() {
      (read_length(&mut self.reader, b':')?, 0)
    } else {
      let key_len = read_length(&mut self.reader, b',')?;
      (key_len, read_length(&mut self.reader, b':')?)
    };

    let key = read_exact_len(&mut self.reader, key_len, "key")?;
    if self.codec.keys_only() {
      expect_byte(&mut self.reader, b'\n', "\\n")?;
      return Ok(Some((key, Vec::new())));
    }

    let mut arrow = [0u8; 2];
    read_fully(&mut self.reader, &mut arrow, "separator")?;
    if &arrow != b"->" {
      return Err(Error::Format(format!(
        "wanted \"->\", got {:?}",
        String::from_utf8_lossy(&arrow)
      )));
    }

    let value = read_exact_len(&mut self.reader, value_len, "value")?;
    expect_byte(&mut self.reader, b'\n', "\\n")?;
    Ok(Some((key, value)))
  }

  fn next_simple(&mut self) -> Result<Option<Record>> {
    loop {
      self.line.clear();
      if self.reader.read_until(b'\n', &mut self.line)? == 0 {
        return Ok(None);
      }

      let mut line = self.line.as_slice();
      if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
      }
      if let Some(rest) = line.strip_suffix(b"\r") {
        line = rest;
      }
      if line.is_empty() {
        continue;
      }

      if self.codec.keys_only() {
        return Ok(Some((line.to_vec(), Vec::new())));
      }
      let record = match line.iter().position(|&b| b == b'\t' || b == b' ') {
        Some(at) => (line[..at].to_vec(), line[at + 1..].to_vec()),
        None => (line.to_vec(), Vec::new()),
      };
      return Ok(Some(record));
    }
  }
}

impl<R: BufRead> Iterator for RecordDecoder<R> {
  type Item = Result<Record>;

  fn next(&mut self) -> Option<Self::Item> {
    self.next_record().transpose()
  }
}

fn truncated(what: &str) -> Error {
  Error::Format(format!("truncated record: input ended inside {}", what))
}

fn read_byte<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
  let byte = match reader.fill_buf()?.first() {
    Some(&b) => b,
    None => return Ok(None),
  };
  reader.consume(1);
  Ok(Some(byte))
}

fn expect_byte<R: BufRead>(reader: &mut R, want: u8, shown: &str) -> Result<()> {
  match read_byte(reader)? {
    Some(b) if b == want => Ok(()),
    Some(b) => Err(Error::Format(format!(
      "wanted {}, got {:?}",
      shown,
      char::from(b)
    ))),
    None => Err(truncated(shown)),
  }
}

/// Reads a decimal length terminated by `terminator`.
fn read_length<R: BufRead>(reader: &mut R, terminator: u8) -> Result<u64> {
  let mut value: u64 = 0;
  let mut digits = 0;
  loop {
    match read_byte(reader)? {
      Some(b) if b.is_ascii_digit() => {
        value = value * 10 + u64::from(b - b'0');
        digits += 1;
        if value > u32::MAX as u64 {
          return Err(Error::Format("length prefix exceeds 4 GiB".into()));
        }
      }
      Some(b) if b == terminator && digits > 0 => return Ok(value),
      Some(b) => {
        return Err(Error::Format(format!(
          "bad length prefix: unexpected {:?}, wanted digit or {:?}",
          char::from(b),
          char::from(terminator)
        )));
      }
      None => return Err(truncated("length prefix")),
    }
  }
}

/// Reads exactly `len` bytes, growing the buffer only as data arrives.
fn read_exact_len<R: Read>(reader: &mut R, len: u64, what: &str) -> Result<Vec<u8>> {
  let mut buf = Vec::new();
  reader.by_ref().take(len).read_to_end(&mut buf)?;
  if (buf.len() as u64) < len {
    return Err(truncated(what));
  }
  Ok(buf)
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
  reader.read_exact(buf).map_err(|e| match e.kind() {
    io::ErrorKind::UnexpectedEof => truncated(what),
    _ => Error::Io(e),
  })
}
