//! The write path: sequence reservation and optimistic memtable routing.
//!
//! There is no writer queue. Each writer reserves its sequence range with
//! one fetch-add, then finds the memtable whose window covers that range.
//! When the range falls past the mutable table's window the writer itself
//! performs the rotation: it builds a successor table and installs it with
//! a single compare-and-swap, losing gracefully if another writer got
//! there first. Writers only block while an immutable table is still being
//! flushed and their sequence needs a window beyond it.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::{BatchOp, EngineInner, WriteBatch};
use crate::error::{Error, Result};
use crate::key::{InternalKey, ValueKind};
use crate::memtable::{FlushState, MemTable};

impl EngineInner {
    /// Reserve sequences for `batch` and apply it to the right memtable.
    pub(crate) fn route_write(self: &Arc<Self>, batch: &WriteBatch) -> Result<()> {
        if let Some(e) = self.background_error() {
            return Err(e);
        }
        if self.is_shutting_down() {
            return Err(Error::IO("shutting down".to_string()));
        }

        let count = batch.count() as u64;
        debug_assert!(count >= 1 && count <= self.options.memtable_seq_size);
        let base_seq = self.seq.reserve(count);

        let mem = self.pick_table(base_seq)?;
        debug_assert!(mem.contains_seq(base_seq + count - 1));

        for (i, op) in batch.ops().iter().enumerate() {
            let seq = base_seq + i as u64;
            match op {
                BatchOp::Put(key, value) => {
                    mem.insert(InternalKey::new(key.clone(), seq, ValueKind::Value), value.clone());
                }
                BatchOp::Delete(key) => {
                    mem.insert(InternalKey::new(key.clone(), seq, ValueKind::Deletion), Vec::new());
                }
            }
        }

        // the write is now visible to any snapshot at or past its sequence
        self.versions.set_last_sequence(base_seq + count - 1);
        Ok(())
    }

    /// The optimistic switching protocol. Returns the table whose window
    /// contains `seq`, rotating the mutable table if this writer gets
    /// there first.
    pub(crate) fn pick_table(self: &Arc<Self>, seq: u64) -> Result<Arc<MemTable>> {
        loop {
            let mem = self.mem.load_full();
            if mem.contains_seq(seq) {
                return Ok(mem);
            }

            if seq < mem.first_seq() {
                // Our window was rotated out while we were between the
                // reservation and this load; the table must be (or is
                // about to become) the immutable one. `imm` is published
                // after the mem swap, so briefly spin on the gap.
                if let Some(imm) = self.imm.load_full() {
                    if imm.contains_seq(seq) {
                        return Ok(imm);
                    }
                }
                std::thread::yield_now();
                continue;
            }

            // seq is past the mutable window: a rotation is needed
            if self.imm.load().is_some() {
                // previous table still flushing; wait for the slot
                self.wait_for_memtable_room()?;
                continue;
            }

            if let Some(e) = self.background_error() {
                // a poisoned engine stops creating new tables
                return Err(e);
            }

            let next = Arc::new(MemTable::new(
                mem.largest_seq() + 1,
                self.options.memtable_seq_size,
            ));
            mem.set_flush_state(FlushState::FlushRequested);

            let prev = self.mem.compare_and_swap(&mem, Arc::clone(&next));
            if Arc::ptr_eq(&*prev, &mem) {
                // rotation winner: publish the retired table, then kick
                // the flush pipeline
                debug_assert!(self.imm.load().is_none());
                self.imm.store(Some(Arc::clone(&mem)));
                tracing::debug!(
                    retired_first = mem.first_seq(),
                    retired_largest = mem.largest_seq(),
                    new_largest = next.largest_seq(),
                    "memtable rotated"
                );
                self.maybe_schedule_flush();
                if next.contains_seq(seq) {
                    return Ok(next);
                }
                // reserved range lies even further ahead; rotate again
            }
            // CAS loser: the candidate table is dropped and the loop
            // re-reads the fresh pointers
        }
    }

    /// Park until the immutable slot clears. Bounded waits double as the
    /// lost-wakeup guard; the flush worker broadcasts on completion and
    /// periodically while it waits for window stragglers.
    fn wait_for_memtable_room(&self) -> Result<()> {
        let (lock, cv) = &self.memtable_full;
        let guard = lock.lock()?;
        if let Some(e) = self.background_error() {
            return Err(e);
        }
        if self.is_shutting_down() {
            return Err(Error::IO("shutting down".to_string()));
        }
        if self.imm.load().is_some() {
            let (_guard, _timeout) = cv
                .wait_timeout(guard, Duration::from_millis(10))
                .map_err(Error::from)?;
        }
        Ok(())
    }
}
