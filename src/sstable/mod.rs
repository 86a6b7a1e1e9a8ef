//! Immutable sorted tables stored in the chunk store.
//!
//! A table is three chunk regions: prefix-compressed data blocks, a sparse
//! index mapping each block's first key to its offset, and an optional
//! filter built by the configured policy. The regions are written once at
//! flush time and never mutated; readers address them through the handles
//! carried in the table's metadata.

pub mod block;
pub mod builder;
pub mod reader;

pub use builder::{TableBuilder, TableOutput};
pub use reader::{Table, TableIterator};

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// Open-table cache keyed by file number. Parsing a table's index region
/// costs a chunk read, so readers share one `Table` per file; capacity is
/// bounded by `max_open_files` with least-recently-opened eviction.
pub struct TableCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    tables: HashMap<u64, Arc<Table>>,
    order: VecDeque<u64>,
}

impl TableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                tables: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Fetch the open table for `number`, opening it with `open` on a miss.
    pub fn get_or_open<F>(&self, number: u64, open: F) -> Result<Arc<Table>>
    where
        F: FnOnce() -> Result<Table>,
    {
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(table) = inner.tables.get(&number).cloned() {
                // refresh recency
                inner.order.retain(|n| *n != number);
                inner.order.push_back(number);
                return Ok(table);
            }
        }

        // Open outside the lock; a racing opener just wastes one parse.
        let table = Arc::new(open()?);
        let mut inner = self.inner.lock().unwrap();
        if !inner.tables.contains_key(&number) {
            inner.tables.insert(number, Arc::clone(&table));
            inner.order.push_back(number);
            while inner.tables.len() > self.capacity {
                if let Some(evict) = inner.order.pop_front() {
                    inner.tables.remove(&evict);
                }
            }
        }
        Ok(table)
    }

    /// Drop a flushed-away or compacted-away table.
    pub fn evict(&self, number: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tables.remove(&number);
        inner.order.retain(|n| *n != number);
    }
}
