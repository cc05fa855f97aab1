use crate::codec::Record;
use crate::error::Result;
use crate::shard::{ShardIter, ShardReader};

/// An iterator that sequentially yields every record of a shard set.
/// Walks shards in index order and each shard in file order, switching
/// shards transparently.
///
/// Stops for good after yielding an error.
pub struct ShardedIter<'r> {
  shards: &'r [ShardReader],

  /// Index of the shard the cursor is currently in.
  current_shard: usize,

  cursor: Option<ShardIter<'r>>,
}

impl<'r> ShardedIter<'r> {
  pub(crate) fn new(shards: &'r [ShardReader]) -> Self {
    Self {
      shards,
      current_shard: 0,
      cursor: shards.first().map(ShardReader::iter),
    }
  }

  /// Index of the shard the most recently yielded record came from.
  pub fn current_shard(&self) -> usize {
    self.current_shard
  }

  /// Tries to advance to the next shard file.
  fn switch_shard(&mut self) -> bool {
    self.current_shard += 1;
    self.cursor = self.shards.get(self.current_shard).map(ShardReader::iter);
    self.cursor.is_some()
  }
}

impl Iterator for ShardedIter<'_> {
  type Item = Result<Record>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      let cursor = self.cursor.as_mut()?;

      match cursor.next() {
        Some(Ok(record)) => return Some(Ok(record)),
        Some(Err(e)) => {
          self.cursor = None;
          return Some(Err(e));
        }
        None => {
          // EOF on current shard.
          if !self.switch_shard() {
            return None;
          }
        }
      }
    }
  }
}
