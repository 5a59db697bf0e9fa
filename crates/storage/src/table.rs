//! A single append-only arena plus the index over it.
//!
//! A `Table` is the unit of allocation, compaction, and transfer. It never
//! synchronizes internally — callers (the [`crate::engine::Engine`]) are
//! expected to serialize mutations, per the single-writer model.

use rustc_hash::FxHashMap;

use kvstore_core::{Error, Result};

use crate::entry::Entry;

/// Lifecycle state of a table. Transitions are one-way:
/// `ReadWrite -> ReadOnly -> Recycled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    ReadWrite,
    ReadOnly,
    Recycled,
}

/// Per-table counters, also used as the basis for engine-wide [`crate::Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub allocated: usize,
    pub inuse: usize,
    pub garbage: usize,
    pub length: usize,
}

/// One contiguous byte arena with an index from `HKey` to byte offset.
pub struct Table {
    arena: Vec<u8>,
    offset: usize,
    index: FxHashMap<u64, u32>,
    last_access: FxHashMap<u64, i64>,
    state: TableState,
    inuse: usize,
    garbage: usize,
}

impl Table {
    /// Allocates a new, empty, writable table with the given arena capacity.
    pub fn new(capacity: usize) -> Self {
        Table {
            arena: vec![0u8; capacity],
            offset: 0,
            index: FxHashMap::default(),
            last_access: FxHashMap::default(),
            state: TableState::ReadWrite,
            inuse: 0,
            garbage: 0,
        }
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    /// Moves the table to `ReadOnly`. Only valid from `ReadWrite`.
    pub fn seal(&mut self) {
        debug_assert_eq!(self.state, TableState::ReadWrite);
        self.state = TableState::ReadOnly;
    }

    /// Moves the table to `Recycled`. Only valid from `ReadOnly`.
    pub fn recycle(&mut self) {
        debug_assert_eq!(self.state, TableState::ReadOnly);
        self.state = TableState::Recycled;
    }

    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            allocated: self.arena.len(),
            inuse: self.inuse,
            garbage: self.garbage,
            length: self.index.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, hkey: u64) -> bool {
        self.index.contains_key(&hkey)
    }

    fn record_at(&self, offset: u32) -> &[u8] {
        &self.arena[offset as usize..]
    }

    /// Inserts or overwrites `hkey`. Returns `NotEnoughSpace` if the encoded
    /// entry does not fit in the remaining arena; the table is left
    /// unmodified in that case.
    pub(crate) fn put(&mut self, hkey: u64, entry: &Entry) -> std::result::Result<(), PutError> {
        let encoded = entry.encode().map_err(PutError::Rejected)?;
        if self.offset + encoded.len() > self.arena.len() {
            return Err(PutError::NotEnoughSpace);
        }

        if let Some(&old_offset) = self.index.get(&hkey) {
            let old_len = Entry::record_len(self.record_at(old_offset))
                .expect("previously stored record must decode");
            self.inuse -= old_len;
            self.garbage += old_len;
        }

        let start = self.offset;
        self.arena[start..start + encoded.len()].copy_from_slice(&encoded);
        self.index.insert(hkey, start as u32);
        self.last_access.insert(hkey, crate::clock::now_nanos());
        self.offset += encoded.len();
        self.inuse += encoded.len();
        Ok(())
    }

    pub fn get(&mut self, hkey: u64) -> Result<Entry> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)?;
        let mut entry = Entry::decode(self.record_at(offset))?;
        let access_time = crate::clock::now_nanos();
        self.last_access.insert(hkey, access_time);
        entry.last_access = access_time;
        Ok(entry)
    }

    /// Reads an entry without updating `last_access`. Used by compaction and
    /// export so that relocating data does not masquerade as a read.
    pub fn peek(&self, hkey: u64) -> Result<Entry> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)?;
        let mut entry = Entry::decode(self.record_at(offset))?;
        entry.last_access = *self.last_access.get(&hkey).unwrap_or(&0);
        Ok(entry)
    }

    pub fn get_raw(&self, hkey: u64) -> Result<Vec<u8>> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)?;
        let len = Entry::record_len(self.record_at(offset))?;
        Ok(self.arena[offset as usize..offset as usize + len].to_vec())
    }

    pub fn delete(&mut self, hkey: u64) -> Result<()> {
        let offset = self.index.remove(&hkey).ok_or(Error::KeyNotFound)?;
        let len = Entry::record_len(self.record_at(offset))
            .expect("previously stored record must decode");
        self.inuse -= len;
        self.garbage += len;
        self.last_access.remove(&hkey);
        Ok(())
    }

    pub fn update_ttl(&mut self, hkey: u64, ttl: i64, timestamp: i64) -> Result<()> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)? as usize;
        Entry::patch_ttl(&mut self.arena[offset..], timestamp, ttl)
    }

    pub fn get_key(&self, hkey: u64) -> Result<String> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)?;
        Entry::decode_key(self.record_at(offset))
    }

    pub fn get_ttl(&self, hkey: u64) -> Result<i64> {
        let offset = *self.index.get(&hkey).ok_or(Error::KeyNotFound)?;
        Entry::decode_ttl(self.record_at(offset))
    }

    pub fn get_last_access(&self, hkey: u64) -> Result<i64> {
        if !self.index.contains_key(&hkey) {
            return Err(Error::KeyNotFound);
        }
        Ok(*self.last_access.get(&hkey).unwrap_or(&0))
    }

    pub fn check(&self, hkey: u64) -> bool {
        self.index.contains_key(&hkey)
    }

    /// Visits every live entry in arbitrary order. The visitor returns
    /// `false` to stop iteration early.
    pub fn range(&self, mut visit: impl FnMut(u64, &Entry) -> bool) -> Result<()> {
        for (&hkey, &offset) in self.index.iter() {
            let mut entry = Entry::decode(self.record_at(offset))?;
            entry.last_access = *self.last_access.get(&hkey).unwrap_or(&0);
            if !visit(hkey, &entry) {
                break;
            }
        }
        Ok(())
    }

    /// Visits every live key whose decoded key starts with `prefix`.
    pub fn regex_match_on_keys(
        &self,
        prefix: &str,
        mut visit: impl FnMut(u64, &str) -> bool,
    ) -> Result<()> {
        for (&hkey, &offset) in self.index.iter() {
            let key = Entry::decode_key(self.record_at(offset))?;
            if key.starts_with(prefix) && !visit(hkey, &key) {
                break;
            }
        }
        Ok(())
    }

    /// Serializes the whole table: capacity, append offset, arena bytes up
    /// to the offset, and the index/last_access maps.
    pub fn export(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.offset + self.index.len() * 20 + 32);
        buf.extend_from_slice(&(self.arena.len() as u64).to_be_bytes());
        buf.extend_from_slice(&(self.offset as u64).to_be_bytes());
        buf.extend_from_slice(&self.arena[..self.offset]);
        buf.extend_from_slice(&(self.index.len() as u64).to_be_bytes());
        for (&hkey, &offset) in self.index.iter() {
            buf.extend_from_slice(&hkey.to_be_bytes());
            buf.extend_from_slice(&offset.to_be_bytes());
            let access = *self.last_access.get(&hkey).unwrap_or(&0);
            buf.extend_from_slice(&(access as u64).to_be_bytes());
        }
        buf
    }

    /// Rebuilds a `ReadOnly` table from bytes produced by [`Table::export`].
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let capacity = read_u64(bytes, &mut pos)? as usize;
        let offset = read_u64(bytes, &mut pos)? as usize;
        let arena_bytes = bytes
            .get(pos..pos + offset)
            .ok_or_else(|| malformed("arena truncated"))?;
        let mut arena = vec![0u8; capacity];
        arena[..offset].copy_from_slice(arena_bytes);
        pos += offset;

        let count = read_u64(bytes, &mut pos)? as usize;
        let mut index = FxHashMap::default();
        let mut last_access = FxHashMap::default();
        let mut inuse = 0usize;
        index.reserve(count);
        for _ in 0..count {
            let hkey = read_u64(bytes, &mut pos)?;
            let rec_offset = read_u32(bytes, &mut pos)?;
            let access = read_u64(bytes, &mut pos)? as i64;
            let len = Entry::record_len(&arena[rec_offset as usize..])?;
            inuse += len;
            index.insert(hkey, rec_offset);
            last_access.insert(hkey, access);
        }

        Ok(Table {
            arena,
            offset,
            index,
            last_access,
            state: TableState::ReadOnly,
            inuse,
            garbage: offset.saturating_sub(inuse),
        })
    }
}

fn malformed(reason: &str) -> Error {
    Error::MalformedEntry {
        reason: reason.to_string(),
    }
}

fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let end = *pos + 8;
    let slice = bytes.get(*pos..end).ok_or_else(|| malformed("truncated table export"))?;
    *pos = end;
    Ok(u64::from_be_bytes(slice.try_into().unwrap()))
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = bytes.get(*pos..end).ok_or_else(|| malformed("truncated table export"))?;
    *pos = end;
    Ok(u32::from_be_bytes(slice.try_into().unwrap()))
}

/// Outcome of a table-local `put`, distinguishing the internal capacity
/// signal from a genuine, caller-visible rejection.
pub(crate) enum PutError {
    NotEnoughSpace,
    Rejected(Error),
}
