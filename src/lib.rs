//! # kvstore
//!
//! The embeddable key-value storage engine behind a DMap partition: a
//! log-structured, append-only table engine with an in-memory index,
//! multi-table rotation under write pressure, background compaction, and a
//! transfer iterator for moving whole tables between nodes during cluster
//! rebalancing.
//!
//! This crate owns one partition's worth of data. The partition layer that
//! hashes keys into `HKey`s, the DMap service, cluster membership, and
//! replication all live above this crate and are not its concern — the
//! engine never hashes a key itself.
//!
//! # Quick Start
//!
//! ```
//! use kvstore::{Config, Engine, Entry};
//!
//! # fn main() -> kvstore::Result<()> {
//! let mut engine = Engine::start(Config::default())?;
//!
//! let hkey = 0x9e3779b9_7f4a7c15u64; // supplied by the caller, e.g. xxhash of the key
//! engine.put(hkey, Entry::new("session:42", b"active".to_vec(), 0, 0))?;
//! assert_eq!(engine.get(hkey)?.value, b"active");
//!
//! engine.delete(hkey)?;
//! assert!(engine.get(hkey).is_err());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! | Layer | Responsibility |
//! |---|---|
//! | [`Entry`] | Self-describing binary encoding of one record. |
//! | [`Table`] | One arena plus its index; `ReadWrite -> ReadOnly -> Recycled`. |
//! | [`Engine`] | Ordered tables, dispatch, rotation, compaction, fork, transfer. |
//!
//! Only the last table in an engine's list is ever writable. Reads and
//! deletes search newest table to oldest, so a newer write always shadows
//! an older copy of the same key. See [`Engine`]'s own documentation for the
//! single-writer concurrency contract: the engine holds no internal locks,
//! and a caller sharing one instance across threads must serialize its own
//! mutating calls.

pub use kvstore_storage::{
    Config, Engine, Entry, Error, Result, Stats, Table, TableState, TableStats,
    TransferIterator, DEFAULT_TABLE_SIZE, MAX_KEY_LEN,
};
