//! # stashdb
//!
//! Storage engine for Stash, a persistent disk-backed cache.
//!
//! ## Layout
//! - **Index**: SQLite database holding one row per entry plus counters,
//!   settings and synchronization rows
//! - **Blob tree**: large payloads in their own files, written to `tmp/`
//!   and renamed into place
//! - **Codec**: inline-vs-file placement and the blob file header
//!
//! Several processes may open the same directory; the index serializes
//! their writes and every write transaction is retried while busy.

#![warn(missing_docs)]

mod codec;
mod directory;
mod error;
mod index;
mod key;
mod retry;
mod settings;

pub use codec::{decode_inline, encode, Encoded, Placement};
pub use directory::{BlobFile, Directory, INDEX_FILE};
pub use error::{Error, ErrorKind, Result};
pub use index::{
    now, EntryOrder, EntryRow, Index, IndexQueries, Keys, MetadataKey, NewEntry, Snapshot, Txn,
};
pub use key::{Key, Mode, Value};
pub use retry::{Backoff, BackoffPolicy, RetryPolicy};
pub use settings::{
    EvictionPolicy, Settings, SqliteSettings, DEFAULT_SIZE_LIMIT, DEFAULT_SIZE_THRESHOLD,
};
