//! Oldest-first bulk export, used to move tables between engines during
//! cluster rebalancing.
//!
//! The phased `next -> export -> pop` protocol exists so the receiver is
//! known to hold a table's bytes durably before the source engine discards
//! them: `pop` is a separate step from `export`, not folded into it.

use kvstore_core::{Error, Result};

use crate::engine::Engine;

/// Drains an [`Engine`]'s tables oldest-first.
pub struct TransferIterator<'a> {
    engine: &'a mut Engine,
    current: Option<usize>,
}

impl<'a> TransferIterator<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        TransferIterator { engine, current: None }
    }

    /// Advances to the next non-empty table, oldest first. Returns `false`
    /// once no table with live entries remains.
    pub fn next(&mut self) -> bool {
        let found = (0..self.engine.tables().len()).find(|&i| self.engine.tables()[i].len() > 0);
        self.current = found;
        found.is_some()
    }

    /// Serializes the current table. Fails with [`Error::EndOfStream`] if
    /// `next` has not been called, or has already returned `false`.
    pub fn export(&self) -> Result<Vec<u8>> {
        let idx = self.current.ok_or(Error::EndOfStream)?;
        Ok(self.engine.tables()[idx].export())
    }

    /// Removes the current table from the source engine. A no-op if the
    /// iterator is not positioned on a table. After `pop`, `next` must be
    /// called again before `export`.
    pub fn pop(&mut self) {
        if let Some(idx) = self.current.take() {
            self.engine.tables_mut().remove(idx);
        }
    }
}
