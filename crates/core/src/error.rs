//! Error types for the storage engine
//!
//! The engine is a library, not a service: every failure that a caller can
//! reasonably hit is a typed variant here, not a panic. Panics are reserved
//! for structural invariant violations (a corrupt index pointing past the
//! arena offset) that indicate a bug rather than a misuse of the API.

use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the storage engine's public contract.
///
/// ## Error Categories
///
/// - **User errors**: [`Error::KeyNotFound`], [`Error::KeyTooLarge`],
///   [`Error::EndOfStream`] are expected outcomes of normal operation and
///   carry no diagnostics beyond the kind.
/// - **Integrity errors**: [`Error::MalformedEntry`] indicates a bug or data
///   corruption; callers should treat it as fatal rather than retry.
/// - **Configuration errors**: [`Error::ConfigInvalid`] is returned eagerly,
///   at configuration time, rather than surfacing as a panic on first use.
#[derive(Debug, Error)]
pub enum Error {
    /// No entry exists for the given key.
    #[error("key not found")]
    KeyNotFound,

    /// The key exceeds the 256-byte encoding limit.
    #[error("key too large: {len} bytes (max 256)")]
    KeyTooLarge {
        /// The length of the rejected key, in bytes.
        len: usize,
    },

    /// Whole-engine export was requested while more than one table exists.
    #[error("engine is fragmented across {num_tables} tables; single-blob export is unavailable")]
    Fragmented {
        /// How many tables the engine currently holds.
        num_tables: usize,
    },

    /// The transfer iterator has no more tables to export.
    #[error("transfer iterator exhausted")]
    EndOfStream,

    /// Decoding failed: a length prefix in the byte stream overflowed the
    /// buffer it was read from.
    #[error("malformed entry: {reason}")]
    MalformedEntry {
        /// Human-readable description of what was wrong with the encoding.
        reason: String,
    },

    /// The supplied configuration cannot produce a usable engine (for
    /// example, a zero-sized table).
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        /// Human-readable description of the invalid setting.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_message() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
    }

    #[test]
    fn key_too_large_message_includes_length() {
        let err = Error::KeyTooLarge { len: 300 };
        assert!(err.to_string().contains("300"));
    }

    #[test]
    fn fragmented_message_includes_table_count() {
        let err = Error::Fragmented { num_tables: 3 };
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn malformed_entry_carries_reason() {
        let err = Error::MalformedEntry {
            reason: "value_len overflows buffer".to_string(),
        };
        assert!(err.to_string().contains("value_len overflows buffer"));
    }
}
