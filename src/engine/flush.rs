//! Background flush scheduling and the memtable flush itself.
//!
//! The scheduler owns a small tokio runtime: flush jobs run on its blocking
//! pool, a periodic tick re-checks for work the event-driven path missed,
//! and a broadcast channel drives graceful shutdown. The flush job proper
//! is synchronous code; it spins briefly for the table's sequence window to
//! fill, serializes it into the chunk store, and installs the result
//! through a version edit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::engine::EngineInner;
use crate::error::{Error, Result};
use crate::memtable::{FlushState, MemTable};
use crate::version::{RemoteTableMeta, VersionEdit, NUM_LEVELS};
use crate::sstable::TableBuilder;

/// A task the scheduler runs on a fixed interval until shutdown.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    async fn execute(&self) -> Result<()>;
}

/// Re-checks for flushable state on a timer. The event-driven path (the
/// rotation winner calling `maybe_schedule_flush`) covers the common case;
/// this tick is the liveness backstop.
pub struct FlushTick {
    engine: Weak<EngineInner>,
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTick {
    fn name(&self) -> &'static str {
        "flush-tick"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn execute(&self) -> Result<()> {
        if let Some(engine) = self.engine.upgrade() {
            engine.maybe_schedule_flush();
        }
        Ok(())
    }
}

/// Owns the background workers. At most one flush job is in flight at a
/// time (there is at most one immutable memtable); the blocking pool is
/// still sized by `max_background_flushes` for the multi-imm extension.
pub struct FlushScheduler {
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    shutdown_tx: broadcast::Sender<()>,
    scheduled: AtomicBool,
}

impl FlushScheduler {
    pub fn new(max_background_flushes: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_background_flushes.max(1))
            .thread_name("dlsm-flush")
            .enable_time()
            .build()
            .map_err(|e| Error::IO(format!("failed to start flush runtime: {e}")))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            shutdown_tx,
            scheduled: AtomicBool::new(false),
        })
    }

    /// Start the periodic liveness tick for `engine`.
    pub fn start_tick(&self, engine: &Arc<EngineInner>) {
        self.register(FlushTick {
            engine: Arc::downgrade(engine),
        });
    }

    /// Spawn a periodic background task in the runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: T) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let guard = self.runtime.lock().unwrap();
        let Some(runtime) = guard.as_ref() else {
            return;
        };
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(task = task.name(), err = %e, "background task failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(task = task.name(), "background task shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Claim the single flush slot; false if a job is already queued or
    /// running.
    pub fn try_mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    /// Run one flush job on the blocking pool.
    pub fn spawn_flush(&self, engine: Arc<EngineInner>) {
        let guard = self.runtime.lock().unwrap();
        let Some(runtime) = guard.as_ref() else {
            self.mark_completed();
            return;
        };
        runtime.spawn_blocking(move || {
            engine.compact_memtable();
            engine.flush_scheduler().mark_completed();
            // the previous flush may have unblocked a rotation that now
            // needs service
            engine.maybe_schedule_flush();
        });
    }

    /// Signal every loop, then wait out in-flight jobs.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_timeout(Duration::from_secs(10));
        }
    }
}

/// Per-level flush/compaction counters backing the `stats` property.
#[derive(Clone, Copy, Debug, Default)]
pub struct LevelStats {
    pub micros: u64,
    pub bytes_written: u64,
    pub count: u64,
}

impl LevelStats {
    pub fn add(&mut self, micros: u64, bytes_written: u64) {
        self.micros += micros;
        self.bytes_written += bytes_written;
        self.count += 1;
    }
}

impl EngineInner {
    /// Idempotent: enqueue a flush worker if there is work and the engine
    /// is healthy. Called by the rotation winner, the periodic tick, and
    /// each finishing flush job.
    pub(crate) fn maybe_schedule_flush(self: &Arc<Self>) {
        if self.is_shutting_down() || self.background_error().is_some() {
            return;
        }
        if self.imm.load().is_none() {
            return;
        }
        if !self.flush_scheduler().try_mark_scheduled() {
            return;
        }
        self.flush_scheduler().spawn_flush(Arc::clone(self));
    }

    /// The flush job: wait for the immutable table's window to fill,
    /// serialize it, install the output, release the table.
    pub(crate) fn compact_memtable(&self) {
        let Some(imm) = self.imm.load_full() else {
            return;
        };
        if imm.flush_state() >= FlushState::FlushScheduled {
            return;
        }

        // Every reserved sequence must land before the table may flush.
        // Periodically broadcast in case a writer rotated but its wakeup
        // was lost while we waited.
        let mut spins = 0u32;
        while !imm.able_to_flush() {
            if self.is_shutting_down() {
                return;
            }
            std::thread::sleep(Duration::from_micros(500));
            spins += 1;
            if spins == 10 {
                self.broadcast_memtable_full();
                spins = 0;
            }
        }

        imm.set_flush_state(FlushState::FlushScheduled);
        let start = Instant::now();

        match self.write_remote_table(&imm) {
            Ok((level, bytes_written)) => {
                let micros = start.elapsed().as_micros() as u64;
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats[level.min(NUM_LEVELS - 1)].add(micros, bytes_written);
                }
                // mark the window covered by the published version before
                // the imm pointer goes away, so readers never see a gap
                self.flushed_through
                    .store(imm.largest_seq(), Ordering::Release);
                self.imm.store(None);
                imm.set_flush_state(FlushState::Flushed);
                self.broadcast_memtable_full();
                tracing::info!(
                    first_seq = imm.first_seq(),
                    largest_seq = imm.largest_seq(),
                    level,
                    bytes = bytes_written,
                    micros,
                    "memtable flushed"
                );
            }
            Err(e) => {
                // sticky: the state machine does not advance and writers
                // surface the error from now on
                self.record_background_error(e);
            }
        }
    }

    /// Serialize `imm` into a new remote table and log the edit installing
    /// it. Returns the chosen level and bytes written.
    fn write_remote_table(&self, imm: &Arc<MemTable>) -> Result<(usize, u64)> {
        let number = self.versions.new_file_number();
        self.pending_outputs.lock().unwrap().insert(number);
        tracing::debug!(number, kvs = imm.kv_count(), "building remote table");

        let result = (|| {
            let mut builder = TableBuilder::new(
                self.options.block_size,
                self.options.filter_policy.clone(),
            );
            for (key, value) in imm.iter() {
                builder.add(&key, &value);
            }
            let output = builder.finish(self.store.as_ref())?;

            if self.is_shutting_down() {
                if let Some(output) = &output {
                    let mut orphans = vec![output.data.clone(), output.index.clone()];
                    orphans.extend(output.filter.clone());
                    let _ = self.store.free_batch(&orphans);
                }
                return Err(Error::IO(
                    "Deleting DB during memtable compaction".to_string(),
                ));
            }

            let Some(output) = output else {
                // window fully applied but nothing materialized; nothing
                // to install
                return Ok((0, 0));
            };

            let base = self.versions.current();
            let level = base
                .pick_level_for_memtable_output(&output.smallest.user_key, &output.largest.user_key);

            let meta = Arc::new(
                RemoteTableMeta::new(
                    number,
                    level as u32,
                    output.file_size,
                    output.num_entries,
                    output.smallest,
                    output.largest,
                    self.store.node_id(),
                    output.data,
                    output.index,
                    output.filter,
                )
                .owned_by(Arc::clone(&self.store)),
            );

            let mut edit = VersionEdit::new();
            edit.set_log_number(0);
            edit.add_file(level as u32, Arc::clone(&meta));
            if let Err(e) = self.versions.log_and_apply(edit) {
                // never published: release the freshly written chunks
                meta.mark_retired(true);
                return Err(e);
            }

            Ok((level, output.file_size))
        })();

        self.pending_outputs.lock().unwrap().remove(&number);
        result
    }
}
