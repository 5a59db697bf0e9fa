//! The embeddable key-value storage engine behind a single DMap partition.
//!
//! A partition owns one [`Engine`]. The engine is a log-structured,
//! append-only collection of [`Table`]s: entries are written to the
//! youngest (writable) table, reads shadow across the whole list newest to
//! oldest, and [`Engine::compact_tables`] relocates survivors out of aging
//! tables so they can be reclaimed. None of this is synchronized
//! internally — see the module-level notes on [`Engine`] for the
//! single-writer contract a caller must uphold.
//!
//! ```
//! use kvstore_core::Config;
//! use kvstore_storage::{Engine, Entry};
//!
//! let mut engine = Engine::start(Config::default()).unwrap();
//! engine.put(1, Entry::new("greeting", b"hello".to_vec(), 0, 0)).unwrap();
//! assert_eq!(engine.get(1).unwrap().value, b"hello");
//! ```

mod clock;
mod engine;
mod entry;
mod stats;
mod table;
mod transfer;

pub use engine::Engine;
pub use entry::{Entry, MAX_KEY_LEN};
pub use stats::Stats;
pub use table::{Table, TableState, TableStats};
pub use transfer::TransferIterator;

pub use kvstore_core::{Config, Error, Result, DEFAULT_TABLE_SIZE};
