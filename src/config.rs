use std::sync::Arc;

use crate::chunk::ChunkStore;
use crate::comparator::{BytewiseComparator, Comparator};
use crate::filter::FilterPolicy;
use crate::snapshot::Snapshot;

/// Default number of sequence slots a memtable reserves. A table rotates
/// when the next write's sequence falls past its window, not when a byte
/// budget is hit.
pub const DEFAULT_MEMTABLE_SEQ_SIZE: u64 = 1 << 16;

/// Engine configuration. Values are sanitized (clipped into their legal
/// ranges) when the database is opened.
#[derive(Clone)]
pub struct Options {
    /// User-key ordering. The comparator name is recorded in the manifest
    /// and must match on reopen.
    pub comparator: Arc<dyn Comparator>,

    /// Optional filter policy consulted before chunk reads on the read
    /// path. `None` disables filter chunks entirely.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Create the database if the directory holds none.
    pub create_if_missing: bool,

    /// Fail `open` if a database already exists.
    pub error_if_exists: bool,

    /// When true, manifest corruption aborts recovery; when false it is
    /// logged and the damaged tail is skipped.
    pub paranoid_checks: bool,

    /// Approximate in-memory budget per memtable, in bytes. Clipped to
    /// [64 KiB, 1 GiB].
    pub write_buffer_size: usize,

    /// Upper bound on a single table's payload. Clipped to [1 MiB, 1 GiB].
    pub max_file_size: usize,

    /// Target uncompressed size of a data block. Clipped to [1 KiB, 4 MiB].
    pub block_size: usize,

    /// Clipped to [74, 50000]. The engine itself holds no file descriptors
    /// per table (payloads live in the chunk store); the bound still guards
    /// manifest/lock handles on shared hosts.
    pub max_open_files: usize,

    /// Accepted for option-file compatibility. The lock-free write path
    /// carries no write-ahead log, so there is nothing to reuse.
    pub reuse_logs: bool,

    /// Number of sequence slots per memtable window.
    pub memtable_seq_size: u64,

    /// Background flush worker threads.
    pub max_background_flushes: usize,

    /// The memory-node pool holding table payloads. `None` provisions a
    /// fresh in-process heap pool, which is what tests use.
    pub chunk_store: Option<Arc<dyn ChunkStore>>,

    /// Identity of this compute node, recorded as `creator_node_id` on
    /// every table it flushes.
    pub node_id: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator: Arc::new(BytewiseComparator),
            filter_policy: None,
            create_if_missing: false,
            error_if_exists: false,
            paranoid_checks: false,
            write_buffer_size: 4 << 20,
            max_file_size: 2 << 20,
            block_size: 4 << 10,
            max_open_files: 1000,
            reuse_logs: false,
            memtable_seq_size: DEFAULT_MEMTABLE_SEQ_SIZE,
            max_background_flushes: 4,
            chunk_store: None,
            node_id: 0,
        }
    }
}

fn clip<T: Ord>(value: T, min: T, max: T) -> T {
    value.clamp(min, max)
}

impl Options {
    /// Clamp user-supplied values into their legal ranges. Mirrors what a
    /// careful operator would get anyway; never fails.
    pub fn sanitize(mut self) -> Self {
        self.write_buffer_size = clip(self.write_buffer_size, 64 << 10, 1 << 30);
        self.max_file_size = clip(self.max_file_size, 1 << 20, 1 << 30);
        self.block_size = clip(self.block_size, 1 << 10, 4 << 20);
        self.max_open_files = clip(self.max_open_files, 74, 50_000);
        self.memtable_seq_size = self.memtable_seq_size.max(1);
        self.max_background_flushes = self.max_background_flushes.max(1);
        self
    }

    pub fn comparator(mut self, comparator: Arc<dyn Comparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn filter_policy(mut self, policy: Arc<dyn FilterPolicy>) -> Self {
        self.filter_policy = Some(policy);
        self
    }

    pub fn create_if_missing(mut self, yes: bool) -> Self {
        self.create_if_missing = yes;
        self
    }

    pub fn error_if_exists(mut self, yes: bool) -> Self {
        self.error_if_exists = yes;
        self
    }

    pub fn paranoid_checks(mut self, yes: bool) -> Self {
        self.paranoid_checks = yes;
        self
    }

    pub fn write_buffer_size(mut self, bytes: usize) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn max_file_size(mut self, bytes: usize) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn memtable_seq_size(mut self, slots: u64) -> Self {
        self.memtable_seq_size = slots;
        self
    }

    pub fn max_background_flushes(mut self, workers: usize) -> Self {
        self.max_background_flushes = workers;
        self
    }

    pub fn chunk_store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.chunk_store = Some(store);
        self
    }

    pub fn node_id(mut self, id: u8) -> Self {
        self.node_id = id;
        self
    }
}

/// Per-write options.
#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Kept for API compatibility; the write path has no log to sync.
    pub sync: bool,
}

/// Per-read options.
#[derive(Clone, Default)]
pub struct ReadOptions {
    /// Read as of this snapshot instead of the latest sequence.
    pub snapshot: Option<Snapshot>,
    /// Verify block checksums on every chunk read.
    pub verify_checksums: bool,
}

impl ReadOptions {
    pub fn snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }
}
