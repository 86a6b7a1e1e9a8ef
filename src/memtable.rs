//! Sequence-windowed in-memory write buffer.
//!
//! Unlike a size-rotated memtable, each table here owns an exclusive window
//! of sequence numbers `[first_seq, largest_seq]` fixed at construction.
//! A writer holding sequence `s` stores into exactly the table whose window
//! contains `s`; the table becomes eligible for flush only once every
//! reserved slot in its window has landed (`able_to_flush`), so a flush can
//! never race past a straggling writer.
//!
//! Inserts and reads are lock-free through `crossbeam_skiplist::SkipMap`;
//! within one user key, entries sort newest-sequence-first.

use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::key::{InternalKey, LookupKey, ValueKind};

/// Flush lifecycle. Transitions are forward-only: the rotator requests,
/// the scheduler schedules, the flush worker completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FlushState {
    Open = 0,
    FlushRequested = 1,
    FlushScheduled = 2,
    Flushed = 3,
}

impl FlushState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FlushState::Open,
            1 => FlushState::FlushRequested,
            2 => FlushState::FlushScheduled,
            _ => FlushState::Flushed,
        }
    }
}

pub struct MemTable {
    table: SkipMap<InternalKey, Vec<u8>>,
    first_seq: u64,
    largest_seq: u64,
    applied_kvs: AtomicU64,
    mem_usage: AtomicUsize,
    flush_state: AtomicU8,
}

impl MemTable {
    /// A table authorized to hold sequences `[first_seq, first_seq + window_size - 1]`.
    pub fn new(first_seq: u64, window_size: u64) -> Self {
        debug_assert!(window_size > 0);
        Self {
            table: SkipMap::new(),
            first_seq,
            largest_seq: first_seq + window_size - 1,
            applied_kvs: AtomicU64::new(0),
            mem_usage: AtomicUsize::new(0),
            flush_state: AtomicU8::new(FlushState::Open as u8),
        }
    }

    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    pub fn largest_seq(&self) -> u64 {
        self.largest_seq
    }

    pub fn window_size(&self) -> u64 {
        self.largest_seq - self.first_seq + 1
    }

    pub fn contains_seq(&self, seq: u64) -> bool {
        seq >= self.first_seq && seq <= self.largest_seq
    }

    /// Add one entry. The caller must hold a reference and the entry's
    /// sequence must lie inside this table's window.
    pub fn insert(&self, key: InternalKey, value: Vec<u8>) {
        debug_assert!(self.contains_seq(key.seq));
        let entry_size = key.approximate_size() + value.len();
        self.table.insert(key, value);
        self.mem_usage.fetch_add(entry_size, Ordering::Relaxed);
        self.applied_kvs.fetch_add(1, Ordering::Release);
    }

    /// Newest entry for the lookup's user key with sequence at or below the
    /// snapshot. `Some(Err(NotFound))` means a tombstone shadows the key;
    /// `None` means this table knows nothing about it.
    pub fn get(&self, lookup: &LookupKey) -> Option<Result<Vec<u8>>> {
        let seek = lookup.seek_key();
        let entry = self.table.range((Bound::Included(seek), Bound::Unbounded)).next()?;
        if entry.key().user_key != lookup.user_key {
            return None;
        }
        match entry.key().kind {
            ValueKind::Value => Some(Ok(entry.value().clone())),
            ValueKind::Deletion => Some(Err(Error::NotFound)),
        }
    }

    /// Restartable forward iterator over internal entries in order. Holds
    /// its own reference so it stays valid across rotations.
    pub fn iter(self: &Arc<Self>) -> MemTableIterator {
        MemTableIterator {
            table: Arc::clone(self),
            last_key: None,
        }
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.mem_usage.load(Ordering::Relaxed)
    }

    /// Entries applied so far. Equals `window_size` only after every
    /// writer that reserved a slot in the window has landed.
    pub fn applied_kv_count(&self) -> u64 {
        self.applied_kvs.load(Ordering::Acquire)
    }

    pub fn kv_count(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Derived, never stored: true once every reserved sequence landed.
    pub fn able_to_flush(&self) -> bool {
        self.applied_kv_count() == self.window_size()
    }

    pub fn flush_state(&self) -> FlushState {
        FlushState::from_u8(self.flush_state.load(Ordering::Acquire))
    }

    /// Advance the flush state. Backward transitions are ignored, so the
    /// three writers of this field (rotator, scheduler, flush worker) can
    /// never unwind each other.
    pub fn set_flush_state(&self, state: FlushState) {
        self.flush_state.fetch_max(state as u8, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("first_seq", &self.first_seq)
            .field("largest_seq", &self.largest_seq)
            .field("applied", &self.applied_kv_count())
            .field("flush_state", &self.flush_state())
            .finish()
    }
}

/// Forward iterator that re-seeks past the last yielded key on every step,
/// so it survives concurrent inserts into the same table.
pub struct MemTableIterator {
    table: Arc<MemTable>,
    last_key: Option<InternalKey>,
}

impl Iterator for MemTableIterator {
    type Item = (InternalKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let range = match self.last_key.take() {
            Some(last) => (Bound::Excluded(last), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };
        let entry = self.table.table.range(range).next()?;
        let key = entry.key().clone();
        let value = entry.value().clone();
        self.last_key = Some(key.clone());
        Some((key, value))
    }
}
