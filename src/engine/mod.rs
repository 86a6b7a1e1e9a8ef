//! The engine: public `Db` handle and the shared inner state every
//! component hangs off.
//!
//! Writers run lock-free through the sequence allocator and the memtable
//! router (`write.rs`); flushes run on the background scheduler
//! (`flush.rs`); reads pin `mem`, `imm`, and the current version by
//! reference and never block rotation.

pub mod flush;
pub mod write;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::chunk::{ChunkStore, HeapChunkStore};
use crate::config::{Options, ReadOptions, WriteOptions};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::iterator::{DbIterator, EntryIter};
use crate::key::LookupKey;
use crate::manifest::{current_file_name, lock_file_name};
use crate::memtable::MemTable;
use crate::sequence::SequenceAllocator;
use crate::snapshot::{Snapshot, SnapshotRegistry};
use crate::sstable::{Table, TableCache, TableIterator};
use crate::version::{RemoteTableMeta, VersionEdit, VersionSet, NUM_LEVELS};

use self::flush::{FlushScheduler, LevelStats};

/// Property name prefix recognized by [`Db::get_property`].
const PROPERTY_PREFIX: &str = "dlsm.";

/// An ordered set of updates applied under one sequence reservation. This
/// revision of the engine accepts exactly one operation per batch; the
/// routing layer underneath already handles larger reservations.
#[derive(Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

#[derive(Debug)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Shared engine state. Everything is reachable from here; there are no
/// hidden globals.
pub(crate) struct EngineInner {
    pub(crate) options: Options,
    pub(crate) store: Arc<dyn ChunkStore>,
    pub(crate) versions: VersionSet,
    pub(crate) seq: SequenceAllocator,
    pub(crate) snapshots: SnapshotRegistry,

    /// Mutable memtable; swapped by the rotation CAS.
    pub(crate) mem: ArcSwap<MemTable>,
    /// At most one retired table awaiting flush.
    pub(crate) imm: ArcSwapOption<MemTable>,
    /// Largest sequence whose window has completed its flush. Readers use
    /// it to detect the instant between the rotation CAS and the `imm`
    /// publication, when the retired window is reachable from neither
    /// pointer.
    pub(crate) flushed_through: AtomicU64,
    /// Writers park here while `imm` blocks a needed rotation.
    pub(crate) memtable_full: (Mutex<()>, Condvar),

    pub(crate) table_cache: TableCache,
    flush_scheduler: FlushScheduler,

    /// Sticky background failure; once set, writes surface it and the
    /// rotator refuses to create new tables.
    pub(crate) bg_error: Mutex<Option<Error>>,
    pub(crate) shutting_down: AtomicBool,

    pub(crate) stats: Mutex<Vec<LevelStats>>,
    /// File numbers being written by in-flight flushes.
    pub(crate) pending_outputs: Mutex<HashSet<u64>>,

    _lock: FileLock,
}

impl EngineInner {
    pub(crate) fn flush_scheduler(&self) -> &FlushScheduler {
        &self.flush_scheduler
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn background_error(&self) -> Option<Error> {
        self.bg_error.lock().unwrap().clone()
    }

    pub(crate) fn record_background_error(&self, e: Error) {
        let mut slot = self.bg_error.lock().unwrap();
        if slot.is_none() {
            tracing::error!(err = %e, "background error latched");
            *slot = Some(e);
            drop(slot);
            self.broadcast_memtable_full();
        }
    }

    /// Wake every writer parked on the rotation condvar. Taking the lock
    /// first pairs the notify with the waiters' condition re-check.
    pub(crate) fn broadcast_memtable_full(&self) {
        let (lock, cv) = &self.memtable_full;
        let _guard = lock.lock().unwrap();
        cv.notify_all();
    }

    fn snapshot_seq(&self, opts: &ReadOptions) -> u64 {
        opts.snapshot
            .map(|s| s.sequence())
            .unwrap_or_else(|| self.versions.last_sequence())
    }

    fn open_table(&self, meta: &RemoteTableMeta) -> Result<Arc<Table>> {
        self.table_cache.get_or_open(meta.number, || {
            Table::open(
                Arc::clone(&self.store),
                meta.data.clone(),
                &meta.index,
                meta.filter.as_ref(),
                self.options.filter_policy.clone(),
            )
        })
    }

    /// Consistent (mem, imm) pair. A rotation publishes `imm` just after
    /// the mem swap; in that instant the retired window is reachable from
    /// neither pointer, which the flushed-through watermark detects. Spin
    /// until the window is covered again.
    pub(crate) fn pin_memtables(&self) -> (Arc<MemTable>, Option<Arc<MemTable>>) {
        loop {
            let mem = self.mem.load_full();
            let imm = self.imm.load_full();
            if imm.is_some()
                || mem.first_seq() == self.flushed_through.load(Ordering::Acquire) + 1
            {
                return (mem, imm);
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let lookup = LookupKey::new(key.to_vec(), self.snapshot_seq(opts));

        let (mem, imm) = self.pin_memtables();
        if let Some(hit) = mem.get(&lookup) {
            return resolve_hit(hit);
        }
        if let Some(imm) = imm {
            if let Some(hit) = imm.get(&lookup) {
                return resolve_hit(hit);
            }
        }

        let current = self.versions.current();
        for meta in current.candidates(key) {
            let table = self.open_table(&meta)?;
            match table.get(&lookup, opts.verify_checksums)? {
                Some(hit) => return resolve_hit(hit),
                None => {
                    // charge a seek miss against the file's credit
                    meta.allowed_seeks.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn iter(&self, opts: &ReadOptions) -> Result<DbIterator> {
        let snapshot_seq = self.snapshot_seq(opts);
        let (mem, imm) = self.pin_memtables();
        let current = self.versions.current();

        let mut sources: Vec<EntryIter> = Vec::new();
        sources.push(Box::new(mem.iter().map(Ok)));
        if let Some(imm) = imm {
            sources.push(Box::new(imm.iter().map(Ok)));
        }
        // level 0 newest-first, then deeper levels in key order
        for meta in current.level_files(0).iter().rev() {
            let table = self.open_table(meta)?;
            sources.push(Box::new(TableIterator::new(table, opts.verify_checksums)));
        }
        for level in 1..NUM_LEVELS {
            for meta in current.level_files(level) {
                let table = self.open_table(meta)?;
                sources.push(Box::new(TableIterator::new(table, opts.verify_checksums)));
            }
        }

        DbIterator::new(sources, snapshot_seq, current)
    }

    fn property(&self, name: &str) -> Option<String> {
        let name = name.strip_prefix(PROPERTY_PREFIX)?;

        if let Some(level) = name.strip_prefix("num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(self.versions.num_level_files(level).to_string());
        }

        match name {
            "stats" => {
                let current = self.versions.current();
                let stats = self.stats.lock().unwrap();
                let mut out = String::from(
                    "                               Flushes\n\
                     Level  Files Size(MB) Time(sec) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                for level in 0..NUM_LEVELS {
                    let files = current.num_level_files(level);
                    let s = stats[level];
                    if files == 0 && s.count == 0 {
                        continue;
                    }
                    out.push_str(&format!(
                        "{level:>5} {files:>6} {:>8.2} {:>9.3} {:>9.2}\n",
                        current.level_size(level) as f64 / 1048576.0,
                        s.micros as f64 / 1e6,
                        s.bytes_written as f64 / 1048576.0,
                    ));
                }
                Some(out)
            }
            "sstables" => Some(self.versions.current().describe()),
            "approximate-memory-usage" => {
                let mut total = self.mem.load().approximate_memory_usage();
                if let Some(imm) = self.imm.load_full() {
                    total += imm.approximate_memory_usage();
                }
                Some(total.to_string())
            }
            _ => None,
        }
    }

    /// Block until the immutable slot is empty, scheduling flushes as
    /// needed.
    fn wait_imm_drained(self: &Arc<Self>) -> Result<()> {
        loop {
            if self.imm.load().is_none() {
                return Ok(());
            }
            if let Some(e) = self.background_error() {
                return Err(e);
            }
            if self.is_shutting_down() {
                return Err(Error::IO("shutting down".to_string()));
            }
            self.maybe_schedule_flush();
            let (lock, cv) = &self.memtable_full;
            let guard = lock.lock()?;
            if self.imm.load().is_some() {
                let _ = cv
                    .wait_timeout(guard, Duration::from_millis(10))
                    .map_err(Error::from)?;
            }
        }
    }

    /// Manual compaction: settle the flush pipeline, then trivially move
    /// eligible files toward the bottom, level by level, up to the highest
    /// level overlapping the range.
    fn compact_range(
        self: &Arc<Self>,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        self.wait_imm_drained()?;

        let max_level_with_files = {
            let current = self.versions.current();
            (1..NUM_LEVELS)
                .filter(|level| current.overlap_in_level(*level, begin, end))
                .max()
                .unwrap_or(1)
        };

        for level in 0..max_level_with_files {
            self.move_level_inputs(level, begin, end)?;
        }
        Ok(())
    }

    /// Trivial moves for one level: any input file disjoint from the next
    /// level (with bounded grandparent overlap) is re-homed one level down
    /// by a delete+add edit. Merging compaction belongs to the memory
    /// node.
    fn move_level_inputs(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let current = self.versions.current();
        for meta in current.overlapping_inputs(level, begin, end) {
            if meta.under_compaction.swap(true, Ordering::AcqRel) {
                continue;
            }

            let disjoint_below = !current.overlap_in_level(
                level + 1,
                Some(&meta.smallest.user_key),
                Some(&meta.largest.user_key),
            );
            let grandparent_ok = level + 2 >= NUM_LEVELS || {
                let bytes: u64 = current
                    .overlapping_inputs(
                        level + 2,
                        Some(&meta.smallest.user_key),
                        Some(&meta.largest.user_key),
                    )
                    .iter()
                    .map(|f| f.file_size)
                    .sum();
                bytes <= 10 * current.max_file_size()
            };

            if disjoint_below && grandparent_ok {
                let mut edit = VersionEdit::new();
                edit.delete_file(level as u32, meta.number, meta.creator_node_id);
                edit.add_file(level as u32 + 1, Arc::clone(&meta));
                match self.versions.log_and_apply(edit) {
                    Ok(()) => {
                        tracing::info!(
                            number = meta.number,
                            from = level,
                            to = level + 1,
                            "trivially moved table"
                        );
                    }
                    Err(Error::Corruption(msg)) => {
                        // a racing flush landed an overlapping file after
                        // the eligibility check; the move simply no longer
                        // applies
                        tracing::warn!(number = meta.number, msg = %msg, "trivial move skipped");
                    }
                    Err(e) => {
                        meta.under_compaction.store(false, Ordering::Release);
                        return Err(e);
                    }
                }
            }
            meta.under_compaction.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn close(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broadcast_memtable_full();
        self.flush_scheduler.shutdown();
        tracing::info!(dir = %self.versions.dir().display(), "database closed");
    }
}

fn resolve_hit(hit: Result<Vec<u8>>) -> Result<Option<Vec<u8>>> {
    match hit {
        Ok(value) => Ok(Some(value)),
        Err(Error::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Handle to an open database. Cheap to share behind an `Arc`; all
/// methods take `&self`.
pub struct Db {
    inner: Arc<EngineInner>,
}

impl Db {
    /// Open (or create) the database at `path`.
    pub fn open(options: Options, path: impl AsRef<Path>) -> Result<Db> {
        let options = options.sanitize();
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let lock = FileLock::lock(lock_file_name(path))
            .map_err(|e| Error::IO(format!("cannot lock {}: {e}", path.display())))?;

        let exists = current_file_name(path).exists();
        let versions = if exists {
            if options.error_if_exists {
                return Err(crate::invalid_argument!(
                    "{} exists (error_if_exists is true)",
                    path.display()
                ));
            }
            VersionSet::recover(
                path,
                Arc::clone(&options.comparator),
                options.max_file_size as u64,
                options.paranoid_checks,
            )?
        } else {
            if !options.create_if_missing {
                return Err(crate::invalid_argument!(
                    "{} does not exist (create_if_missing is false)",
                    path.display()
                ));
            }
            VersionSet::create(
                path,
                Arc::clone(&options.comparator),
                options.max_file_size as u64,
            )?
        };

        let store = options
            .chunk_store
            .clone()
            .unwrap_or_else(|| Arc::new(HeapChunkStore::new(options.node_id)) as Arc<dyn ChunkStore>);

        let last_sequence = versions.last_sequence();
        let seq = SequenceAllocator::new(last_sequence);
        let mem = MemTable::new(last_sequence + 1, options.memtable_seq_size);
        let flush_scheduler = FlushScheduler::new(options.max_background_flushes)?;
        let table_cache = TableCache::new(options.max_open_files);

        let inner = Arc::new(EngineInner {
            options,
            store,
            versions,
            seq,
            snapshots: SnapshotRegistry::new(),
            mem: ArcSwap::from_pointee(mem),
            imm: ArcSwapOption::const_empty(),
            flushed_through: AtomicU64::new(last_sequence),
            memtable_full: (Mutex::new(()), Condvar::new()),
            table_cache,
            flush_scheduler,
            bg_error: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            stats: Mutex::new(vec![LevelStats::default(); NUM_LEVELS]),
            pending_outputs: Mutex::new(HashSet::new()),
            _lock: lock,
        });
        inner.flush_scheduler.start_tick(&inner);

        Ok(Db { inner })
    }

    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, &batch)
    }

    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, &batch)
    }

    /// Apply a batch. Must contain exactly one operation in this revision;
    /// the sequence reservation underneath already supports more.
    pub fn write(&self, _opts: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        if batch.count() != 1 {
            return Err(crate::invalid_argument!(
                "write batch must contain exactly one kv, got {}",
                batch.count()
            ));
        }
        self.inner.route_write(batch)
    }

    /// Point lookup. `Ok(None)` for a missing or deleted key.
    pub fn get(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(opts, key)
    }

    /// Forward iterator over the database as of the read snapshot.
    pub fn new_iterator(&self, opts: &ReadOptions) -> Result<DbIterator> {
        self.inner.iter(opts)
    }

    pub fn get_snapshot(&self) -> Snapshot {
        self.inner
            .snapshots
            .new_snapshot(self.inner.versions.last_sequence())
    }

    pub fn release_snapshot(&self, snapshot: Snapshot) {
        self.inner.snapshots.release(snapshot);
    }

    /// Engine introspection. Recognized names: `dlsm.num-files-at-level<N>`,
    /// `dlsm.stats`, `dlsm.sstables`, `dlsm.approximate-memory-usage`.
    pub fn get_property(&self, name: &str) -> Option<String> {
        self.inner.property(name)
    }

    /// Flush what can be flushed, then trivially move files toward the
    /// bottom of the tree across the given user-key range.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Stop background work and refuse further writes. Idempotent; also
    /// runs on drop.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.close();
    }
}
