//! # IronCdb
//!
//! `ironcdb` stores one logical key-value set as a directory of standard
//! constant databases (cdb files), split by key hash. It lifts the 4 GiB
//! limit of a single cdb file while keeping every shard readable by plain
//! cdb tools.
//!
//! ## Key Features
//!
//! * **Deterministic Routing**: The top bits of a 32-bit FNV-1 hash pick the shard.
//! * **Self-Describing Layout**: File names carry version, shard count and index.
//! * **Auto-Growth**: A full shard doubles the shard count and rebuilds the set.
//! * **Lock-Free Reads**: Shards are memory-mapped and safe to share across threads.
//! * **Text Interchange**: Bulk load and dump in the cdbmake format.
//!
//! ## Example
//!
//! ```no_run
//! use ironcdb::{DumpOptions, ShardedReader, ShardedWriter};
//!
//! # fn main() -> ironcdb::Result<()> {
//! let mut writer = ShardedWriter::create("./cdb_data", 0)?;
//! writer.put(b"user_123", b"profile_data")?;
//! writer.close()?;
//!
//! let reader = ShardedReader::open("./cdb_data")?;
//! assert_eq!(reader.get(b"user_123")?.as_deref(), Some(&b"profile_data"[..]));
//!
//! // Text dump
//! reader.dump(std::io::stdout(), DumpOptions::default())?;
//! # Ok(())
//! # }
//! ```

mod cancel;
mod codec;
mod config;
mod error;
mod iter;
mod reader;
mod shard;
mod table;
mod writer;

pub mod hash;
pub mod naming;

// Re-exports for the flat public API
pub use cancel::CancelToken;
pub use codec::{Record, RecordCodec, RecordDecoder, write_record};
pub use config::{DumpFormat, DumpOptions, ReadStrategy, ReaderOptions, WriterOptions};
pub use error::{Error, Result};
pub use hash::{HashFn, Router};
pub use iter::ShardedIter;
pub use naming::{FormatVersion, ShardIdentity, ShardLayout};
pub use reader::ShardedReader;
pub use writer::ShardedWriter;
