//! Self-describing binary encoding for one stored record.
//!
//! Layout (big-endian, packed, no padding):
//!
//! ```text
//! u8    key_len
//! bytes key                 (key_len bytes)
//! u64   timestamp
//! u64   ttl
//! u32   value_len
//! bytes value                (value_len bytes)
//! ```
//!
//! `last_access` is deliberately not part of this layout; see the table
//! module for why it lives in a parallel map instead.

use kvstore_core::{Error, Result};

/// Maximum encodable key length, in bytes. Keys strictly shorter than this
/// are accepted; the length prefix is a single `u8`, so a key of exactly
/// `MAX_KEY_LEN` bytes would wrap to a zero length byte and corrupt the
/// record, which is why the check in `encode` is `>=`, not `>`.
pub const MAX_KEY_LEN: usize = 256;

/// Byte offset, from the start of an encoded record, where the `timestamp`
/// field begins. Used by in-place patches (`update_ttl`) that must not
/// re-encode the whole record.
pub fn timestamp_offset(key_len: usize) -> usize {
    1 + key_len
}

/// A single stored record.
///
/// `last_access` is carried on the in-memory value but is not part of the
/// wire encoding produced by [`Entry::encode`]; a freshly [`Entry::decode`]d
/// entry always has `last_access == 0`. Callers that need the true
/// last-access time should use the table's own accessor, which reads it out
/// of the parallel map rather than the decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub ttl: i64,
    pub last_access: i64,
}

impl Entry {
    /// Builds a new entry with `last_access` unset.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, timestamp: i64, ttl: i64) -> Self {
        Entry {
            key: key.into(),
            value: value.into(),
            timestamp,
            ttl,
            last_access: 0,
        }
    }

    /// The size, in bytes, this entry would occupy once encoded.
    pub fn encoded_len(&self) -> usize {
        1 + self.key.len() + 8 + 8 + 4 + self.value.len()
    }

    /// Encodes this entry into a freshly allocated byte buffer.
    ///
    /// Returns [`Error::KeyTooLarge`] if the key is not strictly shorter
    /// than [`MAX_KEY_LEN`] (a key of exactly `MAX_KEY_LEN` bytes cannot be
    /// represented by the single-byte length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let key_bytes = self.key.as_bytes();
        if key_bytes.len() >= MAX_KEY_LEN {
            return Err(Error::KeyTooLarge { len: key_bytes.len() });
        }
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(key_bytes.len() as u8);
        buf.extend_from_slice(key_bytes);
        buf.extend_from_slice(&(self.timestamp as u64).to_be_bytes());
        buf.extend_from_slice(&(self.ttl as u64).to_be_bytes());
        buf.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.value);
        Ok(buf)
    }

    /// Decodes an entry from the start of `bytes`. Trailing bytes beyond the
    /// encoded record are ignored, so callers may pass a slice that runs to
    /// the end of the arena rather than computing an exact end bound.
    ///
    /// Fails with [`Error::MalformedEntry`] if any length prefix would read
    /// past the end of `bytes`, or if the key bytes are not valid UTF-8.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let key_len = read_u8(bytes, &mut pos)? as usize;
        let key_bytes = read_slice(bytes, &mut pos, key_len)?;
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| malformed("key is not valid utf-8"))?;
        let timestamp = read_u64(bytes, &mut pos)? as i64;
        let ttl = read_u64(bytes, &mut pos)? as i64;
        let value_len = read_u32(bytes, &mut pos)? as usize;
        let value = read_slice(bytes, &mut pos, value_len)?.to_vec();

        Ok(Entry {
            key,
            value,
            timestamp,
            ttl,
            last_access: 0,
        })
    }

    /// Decodes only the key, skipping the value bytes entirely.
    pub fn decode_key(bytes: &[u8]) -> Result<String> {
        let mut pos = 0usize;
        let key_len = read_u8(bytes, &mut pos)? as usize;
        let key_bytes = read_slice(bytes, &mut pos, key_len)?;
        String::from_utf8(key_bytes.to_vec()).map_err(|_| malformed("key is not valid utf-8"))
    }

    /// Decodes only the TTL field, skipping key validation and the value.
    pub fn decode_ttl(bytes: &[u8]) -> Result<i64> {
        let mut pos = 0usize;
        let key_len = read_u8(bytes, &mut pos)? as usize;
        pos += key_len;
        let _timestamp = read_u64(bytes, &mut pos)?;
        let ttl = read_u64(bytes, &mut pos)? as i64;
        Ok(ttl)
    }

    /// The total encoded length of the record starting at `bytes[0]`,
    /// without decoding the value.
    pub fn record_len(bytes: &[u8]) -> Result<usize> {
        let mut pos = 0usize;
        let key_len = read_u8(bytes, &mut pos)? as usize;
        pos += key_len;
        let _timestamp = read_u64(bytes, &mut pos)?;
        let _ttl = read_u64(bytes, &mut pos)?;
        let value_len = read_u32(bytes, &mut pos)? as usize;
        pos.checked_add(value_len)
            .ok_or_else(|| malformed("length prefix overflowed"))
    }

    /// Patches the `timestamp` and `ttl` fields of an already-encoded
    /// record in place, without touching the key or value bytes.
    pub fn patch_ttl(bytes: &mut [u8], timestamp: i64, ttl: i64) -> Result<()> {
        let key_len = *bytes.first().ok_or_else(|| malformed("missing key_len"))? as usize;
        let off = timestamp_offset(key_len);
        let end = off + 16;
        let slice = bytes
            .get_mut(off..end)
            .ok_or_else(|| malformed("record truncated at ttl/timestamp fields"))?;
        slice[0..8].copy_from_slice(&(timestamp as u64).to_be_bytes());
        slice[8..16].copy_from_slice(&(ttl as u64).to_be_bytes());
        Ok(())
    }
}

fn malformed(reason: &str) -> Error {
    Error::MalformedEntry {
        reason: reason.to_string(),
    }
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let b = *bytes
        .get(*pos)
        .ok_or_else(|| malformed("buffer truncated reading key_len"))?;
    *pos += 1;
    Ok(b)
}

fn read_slice<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| malformed("length prefix overflowed"))?;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| malformed("buffer truncated reading bytes"))?;
    *pos = end;
    Ok(slice)
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let slice = read_slice(bytes, pos, 8)?;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, pos, 4)?;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Round-trip law from the codec's own contract: decode(encode(e)) == e
        // for every field, over arbitrary keys (within the one-byte length
        // prefix's range), values, and signed timestamps/ttls.
        #[test]
        fn round_trips_for_any_valid_entry(
            key in "[a-zA-Z0-9_:]{0,255}",
            value in proptest::collection::vec(any::<u8>(), 0..256),
            timestamp in any::<i64>(),
            ttl in any::<i64>(),
        ) {
            let e = Entry::new(key, value, timestamp, ttl);
            let encoded = e.encode().unwrap();
            let decoded = Entry::decode(&encoded).unwrap();
            prop_assert_eq!(decoded.key, e.key);
            prop_assert_eq!(decoded.value, e.value);
            prop_assert_eq!(decoded.timestamp, e.timestamp);
            prop_assert_eq!(decoded.ttl, e.ttl);
        }

        #[test]
        fn decode_never_panics_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = Entry::decode(&bytes);
        }
    }
}
