//! The multi-table engine: dispatch, rotation, compaction, fork.

use tracing::{debug, trace, warn};

use kvstore_core::{Config, Error, Result};

use crate::entry::Entry;
use crate::stats::Stats;
use crate::table::{PutError, Table, TableState};
use crate::transfer::TransferIterator;

/// The embeddable key-value storage engine.
///
/// Holds an ordered list of [`Table`]s, oldest first. Only the last table
/// may be writable; every read and delete dispatches across the whole list,
/// newest first, so a newer write always shadows an older copy. `Engine` is
/// a plain owned structure with no internal locking: callers that share one
/// instance across threads are responsible for serializing mutations
/// themselves (see the concurrency notes on the crate root).
pub struct Engine {
    tables: Vec<Table>,
    config: Config,
}

impl Engine {
    /// Validates `config` and starts a fresh engine with one empty,
    /// writable table.
    pub fn start(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Engine {
            tables: vec![Table::new(config.table_size)],
            config,
        })
    }

    /// Validates and installs a new configuration. Already-allocated tables
    /// keep their existing capacity; the new `table_size` applies to future
    /// rotations.
    pub fn set_config(&mut self, config: Config) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Canonical engine name, matching the identifier the partition layer
    /// looks up storage engines by.
    pub fn name(&self) -> &'static str {
        "kvstore"
    }

    /// Builds an empty entry template for callers that want to fill in
    /// fields before a `put`.
    pub fn new_entry(&self) -> Entry {
        Entry::new(String::new(), Vec::new(), 0, 0)
    }

    /// No-op lifecycle hook: the engine holds no external resources to
    /// release. Present for parity with the trait surface other storage
    /// backends in this lineage implement.
    pub fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drops every table, releasing all stored data.
    pub fn destroy(&mut self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }

    /// Produces an empty sibling engine. The child shares no state with the
    /// parent; it starts with its own single writable table.
    pub fn fork(&self, config_override: Option<Config>) -> Result<Engine> {
        Engine::start(config_override.unwrap_or(self.config))
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// The lifecycle state of each table, oldest first. Exposed so callers
    /// (and tests) can confirm the "only the tail is writable" invariant
    /// without reaching into the engine's table list directly.
    pub fn table_states(&self) -> Vec<TableState> {
        self.tables.iter().map(|t| t.state()).collect()
    }

    fn ensure_tail(&mut self) {
        if self.tables.is_empty() {
            self.tables.push(Table::new(self.config.table_size));
        }
    }

    fn tail_index(&self) -> usize {
        self.tables.len() - 1
    }

    /// Inserts `entry` under `hkey`. Evicts any stale copy held by an older
    /// table first, then writes to the tail, rotating to a new table and
    /// retrying exactly once if the tail has no room.
    pub fn put(&mut self, hkey: u64, mut entry: Entry) -> Result<()> {
        self.ensure_tail();
        self.evict_stale_duplicate(hkey)?;
        entry.last_access = crate::clock::now_nanos();
        self.put_on_tail(hkey, &entry)
    }

    /// Inserts already-encoded bytes, used by `import` so the merge policy
    /// stays with the caller while still going through the normal
    /// rotation/eviction path.
    pub fn put_raw(&mut self, hkey: u64, bytes: &[u8]) -> Result<()> {
        let entry = Entry::decode(bytes)?;
        self.put(hkey, entry)
    }

    fn evict_stale_duplicate(&mut self, hkey: u64) -> Result<()> {
        let tail = self.tail_index();
        for i in 0..tail {
            if self.tables[i].contains(hkey) {
                self.tables[i].delete(hkey)?;
                trace!(table = i, hkey, "evicted stale duplicate before put");
            }
        }
        Ok(())
    }

    fn put_on_tail(&mut self, hkey: u64, entry: &Entry) -> Result<()> {
        let tail = self.tail_index();
        match self.tables[tail].put(hkey, entry) {
            Ok(()) => {
                trace!(table = tail, hkey, "put");
                Ok(())
            }
            Err(PutError::Rejected(e)) => Err(e),
            Err(PutError::NotEnoughSpace) => {
                self.rotate(entry.encoded_len());
                let tail = self.tail_index();
                match self.tables[tail].put(hkey, entry) {
                    Ok(()) => {
                        trace!(table = tail, hkey, "put after rotation");
                        Ok(())
                    }
                    Err(PutError::Rejected(e)) => Err(e),
                    Err(PutError::NotEnoughSpace) => {
                        warn!(
                            hkey,
                            size = entry.encoded_len(),
                            "put retried after NotEnoughSpace failed twice"
                        );
                        Err(Error::KeyTooLarge {
                            len: entry.encoded_len(),
                        })
                    }
                }
            }
        }
    }

    fn rotate(&mut self, min_size: usize) {
        let tail = self.tail_index();
        let retiring_stats = self.tables[tail].stats();
        self.tables[tail].seal();
        let capacity = new_table_capacity(self.config.table_size, min_size);
        debug!(
            retiring_table = tail,
            retiring_inuse = retiring_stats.inuse,
            retiring_garbage = retiring_stats.garbage,
            new_capacity = capacity,
            "rotating to new writable table"
        );
        self.tables.push(Table::new(capacity));
    }

    /// Looks up `hkey`, searching newest table to oldest. Updates
    /// `last_access` on the hit.
    pub fn get(&mut self, hkey: u64) -> Result<Entry> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                let entry = self.tables[i].get(hkey)?;
                trace!(table = i, hkey, "get hit");
                return Ok(entry);
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Returns the already-encoded bytes for `hkey`, without decoding them.
    pub fn get_raw(&self, hkey: u64) -> Result<Vec<u8>> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                return self.tables[i].get_raw(hkey);
            }
        }
        Err(Error::KeyNotFound)
    }

    pub fn get_key(&self, hkey: u64) -> Result<String> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                return self.tables[i].get_key(hkey);
            }
        }
        Err(Error::KeyNotFound)
    }

    pub fn get_ttl(&self, hkey: u64) -> Result<i64> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                return self.tables[i].get_ttl(hkey);
            }
        }
        Err(Error::KeyNotFound)
    }

    pub fn get_last_access(&self, hkey: u64) -> Result<i64> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                return self.tables[i].get_last_access(hkey);
            }
        }
        Err(Error::KeyNotFound)
    }

    pub fn check(&self, hkey: u64) -> bool {
        self.tables.iter().any(|t| t.contains(hkey))
    }

    /// Removes `hkey` from whichever table holds it (there is at most one,
    /// by the put-time eviction invariant).
    pub fn delete(&mut self, hkey: u64) -> Result<()> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                self.tables[i].delete(hkey)?;
                trace!(table = i, hkey, "delete");
                return Ok(());
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Patches the TTL and timestamp of whichever table holds `hkey`,
    /// taking the new values from `entry` (its key and value are ignored).
    pub fn update_ttl(&mut self, hkey: u64, entry: Entry) -> Result<()> {
        for i in (0..self.tables.len()).rev() {
            if self.tables[i].contains(hkey) {
                return self.tables[i].update_ttl(hkey, entry.ttl, entry.timestamp);
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Visits every live entry across every table, in unspecified order.
    /// The visitor returns `false` to stop early.
    pub fn range(&self, mut visit: impl FnMut(u64, &Entry) -> bool) -> Result<()> {
        for table in &self.tables {
            let mut stop = false;
            table.range(|hkey, entry| {
                if !visit(hkey, entry) {
                    stop = true;
                    false
                } else {
                    true
                }
            })?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Visits every live key starting with `prefix`, across every table.
    pub fn regex_match_on_keys(
        &self,
        prefix: &str,
        mut visit: impl FnMut(u64, &str) -> bool,
    ) -> Result<()> {
        for table in &self.tables {
            let mut stop = false;
            table.regex_match_on_keys(prefix, |hkey, key| {
                if !visit(hkey, key) {
                    stop = true;
                    false
                } else {
                    true
                }
            })?;
            if stop {
                break;
            }
        }
        Ok(())
    }

    /// Aggregates per-table counters into engine-wide statistics.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            num_tables: self.tables.len(),
            ..Default::default()
        };
        for table in &self.tables {
            let t = table.stats();
            stats.allocated += t.allocated;
            stats.inuse += t.inuse;
            stats.garbage += t.garbage;
            stats.length += t.length;
        }
        stats
    }

    /// Serializes the entire engine as a single blob. Only possible with
    /// exactly one table; a fragmented engine (more than one table) must be
    /// drained with [`Engine::transfer_iterator`] instead.
    pub fn export(&self) -> Result<Vec<u8>> {
        if self.tables.len() != 1 {
            return Err(Error::Fragmented {
                num_tables: self.tables.len(),
            });
        }
        Ok(self.tables[0].export())
    }

    /// Decodes a table exported by [`Table::export`] (directly, or via a
    /// [`TransferIterator`] step) and applies each entry through `apply_fn`,
    /// leaving the merge policy — overwrite, skip-if-newer, etc. — to the
    /// caller.
    ///
    /// This does not touch `self`'s own tables: it is a free decode-and-apply
    /// step so that `apply_fn` is free to call back into a *different*
    /// engine's `put` (the usual case when draining a [`TransferIterator`]
    /// into a receiving engine) without aliasing `self`.
    pub fn import(bytes: &[u8], mut apply_fn: impl FnMut(u64, Entry) -> Result<()>) -> Result<()> {
        let table = Table::import(bytes)?;
        let mut first_err = None;
        table
            .range(|hkey, entry| {
                if let Err(e) = apply_fn(hkey, entry.clone()) {
                    first_err = Some(e);
                    return false;
                }
                true
            })
            .ok();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Relocates live entries from the oldest non-tail, non-empty table
    /// into the writable tail, then recycles the now-empty source table.
    /// Processes exactly one table per call so the caller can interleave
    /// other work. Returns `true` while further tables still hold live
    /// entries, `false` once compaction has nothing left to do.
    pub fn compact_tables(&mut self) -> Result<bool> {
        self.recycle_empty_non_tail_tables();

        let tail = self.tail_index();
        let candidate = (0..tail).find(|&i| self.tables[i].len() > 0);
        let Some(idx) = candidate else {
            return Ok(false);
        };

        let before = self.tables[idx].stats();
        debug!(table = idx, live = before.length, "compaction step start");

        let mut relocations = Vec::with_capacity(before.length);
        self.tables[idx].range(|hkey, entry| {
            relocations.push((hkey, entry.clone()));
            true
        })?;

        let moved = relocations.len();
        for (hkey, entry) in relocations {
            self.put_on_tail(hkey, &entry)?;
            self.tables[idx].delete(hkey)?;
        }

        self.tables[idx].recycle();
        self.tables.remove(idx);
        debug!(table = idx, moved, "compaction step finished");

        let remaining = self.tables.len() > 1
            && (0..self.tables.len() - 1).any(|i| self.tables[i].len() > 0);
        Ok(remaining)
    }

    fn recycle_empty_non_tail_tables(&mut self) {
        let mut i = 0;
        while i + 1 < self.tables.len() {
            if self.tables[i].state() == TableState::ReadOnly && self.tables[i].is_empty() {
                self.tables[i].recycle();
                self.tables.remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Builds an iterator that drains tables oldest-first for cluster
    /// rebalancing.
    pub fn transfer_iterator(&mut self) -> TransferIterator<'_> {
        TransferIterator::new(self)
    }

    pub(crate) fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub(crate) fn tables_mut(&mut self) -> &mut Vec<Table> {
        &mut self.tables
    }
}

fn new_table_capacity(table_size: usize, min_size: usize) -> usize {
    if min_size <= table_size {
        table_size
    } else {
        let multiples = (min_size + table_size - 1) / table_size;
        multiples * table_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(table_size: usize) -> Config {
        Config { table_size }
    }

    fn e(key: &str, value: &[u8], ttl: i64) -> Entry {
        Entry::new(key, value.to_vec(), 1, ttl)
    }

    #[test]
    fn put_then_get_100_entries() {
        let mut engine = Engine::start(Config::default()).unwrap();
        for i in 0..100u64 {
            let key = format!("{i:09}");
            let value = format!("{i:025}");
            engine.put(i, e(&key, value.as_bytes(), i as i64)).unwrap();
        }
        for i in 0..100u64 {
            let got = engine.get(i).unwrap();
            assert_eq!(got.key, format!("{i:09}"));
            assert_eq!(got.value, format!("{i:025}").into_bytes());
            assert_eq!(got.ttl, i as i64);
        }
    }

    #[test]
    fn delete_accounting_matches_previous_inuse() {
        let mut engine = Engine::start(Config::default()).unwrap();
        for i in 0..100u64 {
            engine.put(i, e(&format!("{i:09}"), &[0u8; 25], 0)).unwrap();
        }
        let inuse_before = engine.stats().inuse;
        for i in 0..100u64 {
            engine.delete(i).unwrap();
        }
        let stats = engine.stats();
        assert_eq!(stats.inuse, 0);
        assert_eq!(stats.length, 0);
        assert_eq!(stats.garbage, inuse_before);
    }

    #[test]
    fn put_of_existing_key_evicts_older_copy() {
        let mut engine = Engine::start(cfg(200)).unwrap();
        engine.put(1, e("k", &[0u8; 100], 0)).unwrap();
        engine.put(2, e("k2", &[0u8; 100], 0)).unwrap();
        assert!(engine.num_tables() >= 2, "second put should have rotated tables");

        engine.put(1, e("k", b"updated", 0)).unwrap();
        let got = engine.get(1).unwrap();
        assert_eq!(got.value, b"updated");

        let live_copies = engine.tables().iter().filter(|t| t.contains(1)).count();
        assert_eq!(live_copies, 1, "at most one table may hold a live copy of hkey 1");
    }

    #[test]
    fn only_last_table_is_writable() {
        let mut engine = Engine::start(cfg(64)).unwrap();
        for i in 0..20u64 {
            engine.put(i, e(&format!("k{i}"), &[0u8; 16], 0)).unwrap();
        }
        for (idx, table) in engine.tables().iter().enumerate() {
            if idx == engine.tables().len() - 1 {
                assert_eq!(table.state(), TableState::ReadWrite);
            } else {
                assert_eq!(table.state(), TableState::ReadOnly);
            }
        }
    }

    #[test]
    fn fork_is_isolated_from_parent() {
        let mut parent = Engine::start(Config::default()).unwrap();
        for i in 0..10u64 {
            parent.put(i, e(&format!("k{i}"), b"v", 0)).unwrap();
        }
        let child = parent.fork(None).unwrap();
        let stats = child.stats();
        assert_eq!(stats.allocated, Config::default().table_size);
        assert_eq!(stats.inuse, 0);
        assert_eq!(stats.garbage, 0);
        assert_eq!(stats.length, 0);
        assert_eq!(stats.num_tables, 1);
        for i in 0..10u64 {
            assert!(matches!(child.get_raw(i), Err(Error::KeyNotFound)));
        }
    }

    #[test]
    fn regex_match_counts_even_keys() {
        let mut engine = Engine::start(Config::default()).unwrap();
        for i in 0..100u64 {
            let key = if i % 2 == 0 { format!("even:{i}") } else { format!("odd:{i}") };
            engine.put(i, e(&key, b"v", 0)).unwrap();
        }
        let mut count = 0;
        engine.regex_match_on_keys("even:", |_, _| {
            count += 1;
            true
        }).unwrap();
        assert_eq!(count, 50);
    }

    #[test]
    fn rotation_grows_table_count_under_pure_volume() {
        // With no overwrites, every table's bytes stay live: compaction has
        // nothing to reclaim, so the table count tracks data volume rather
        // than shrinking.
        let mut engine = Engine::start(cfg(256)).unwrap();
        for i in 0..30u64 {
            engine.put(i, e(&format!("k{i:03}"), &[0u8; 16], 0)).unwrap();
        }
        assert!(engine.num_tables() > 1);
        for i in 0..30u64 {
            assert!(engine.get(i).is_ok());
        }
    }

    #[test]
    fn compact_tables_reclaims_tables_that_are_entirely_garbage() {
        // Repeatedly overwrite a handful of keys: every earlier table ends
        // up holding only stale (garbage) copies, while the live values sit
        // on the tail. Compaction should recycle the all-garbage tables
        // without needing to relocate anything.
        let mut engine = Engine::start(cfg(256)).unwrap();
        for round in 0..40u64 {
            for k in 0..5u64 {
                engine.put(k, e(&format!("key{k}"), format!("v{round}").as_bytes(), 0)).unwrap();
            }
        }
        assert!(engine.num_tables() > 1);

        let mut iterations = 0;
        while engine.compact_tables().unwrap() {
            iterations += 1;
            assert!(iterations < 1000, "compaction did not converge");
        }

        assert_eq!(engine.num_tables(), 1);
        for k in 0..5u64 {
            assert_eq!(engine.get(k).unwrap().value, b"v39");
        }
    }

    #[test]
    fn export_refuses_when_fragmented() {
        let mut engine = Engine::start(cfg(64)).unwrap();
        for i in 0..20u64 {
            engine.put(i, e(&format!("k{i}"), &[0u8; 16], 0)).unwrap();
        }
        assert!(engine.num_tables() > 1);
        assert!(matches!(engine.export(), Err(Error::Fragmented { .. })));
    }

    #[test]
    fn zero_table_size_is_rejected_at_start() {
        assert!(matches!(Engine::start(cfg(0)), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn put_larger_than_table_size_rotates_to_a_bigger_table() {
        let mut engine = Engine::start(cfg(64)).unwrap();
        let big_value = vec![0u8; 10_000];
        engine.put(1, e("k", &big_value, 0)).unwrap();
        let got = engine.get(1).unwrap();
        assert_eq!(got.value, big_value);
    }

    #[test]
    fn new_table_capacity_rounds_up_to_a_multiple_of_table_size() {
        assert_eq!(new_table_capacity(1024, 100), 1024);
        assert_eq!(new_table_capacity(1024, 1024), 1024);
        assert_eq!(new_table_capacity(1024, 1025), 2048);
        assert_eq!(new_table_capacity(1024, 5000), 5120);
    }

    #[test]
    fn indices_stay_consistent_after_random_ops() {
        use rand::prelude::*;

        let mut engine = Engine::start(cfg(512)).unwrap();
        let mut rng = rand::thread_rng();
        let mut live: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();

        for _ in 0..2000 {
            let hkey = rng.gen_range(0..50u64);
            match rng.gen_range(0..3) {
                0 => {
                    let value: Vec<u8> = (0..rng.gen_range(0..32)).map(|_| rng.gen()).collect();
                    engine.put(hkey, e(&format!("k{hkey}"), &value, 0)).unwrap();
                    live.insert(hkey, value);
                }
                1 => {
                    let existed = engine.delete(hkey).is_ok();
                    assert_eq!(existed, live.remove(&hkey).is_some());
                }
                _ => {
                    let got = engine.get(hkey);
                    assert_eq!(got.is_ok(), live.contains_key(&hkey));
                    if let Ok(entry) = got {
                        assert_eq!(&entry.value, live.get(&hkey).unwrap());
                    }
                }
            }

            // Invariant: at most one table holds a live copy of any hkey.
            let copies = engine.tables().iter().filter(|t| t.contains(hkey)).count();
            assert!(copies <= 1, "hkey {hkey} duplicated across tables");
        }

        let stats = engine.stats();
        assert_eq!(stats.length, live.len());
        for table in engine.tables() {
            let t = table.stats();
            assert!(t.inuse + t.garbage <= t.allocated);
        }
        for (&hkey, value) in &live {
            assert_eq!(&engine.get(hkey).unwrap().value, value);
        }
    }
}
