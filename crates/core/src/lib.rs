//! Shared types for the kvstore storage engine: errors, the result alias,
//! and engine configuration.
//!
//! This crate has no storage logic of its own; it exists so that
//! `kvstore-storage` and any future consumer share one definition of
//! "what can go wrong" and "how is the engine configured".

mod config;
mod error;

pub use config::{Config, DEFAULT_TABLE_SIZE};
pub use error::{Error, Result};
