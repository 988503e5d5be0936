//! Storage core: owns the fingerprint-to-series map, routes appends through
//! head chunks, runs the persist queue and background maintenance loops,
//! resolves label matchers via the index, and serves iterators.
//!
//! The series map is striped: shard = fingerprint mod stripe count. One
//! stripe lock serializes appends, eviction and pinning for a fingerprint.
//! Lock order is stripe, then chunk descriptor, then index; a debug-build
//! checker asserts it.

use crate::chunk::{ChunkBufferPool, ChunkVariant, MIN_CHUNK_SIZE};
use crate::error::{Result, StorageError};
use crate::index::MetricIndex;
use crate::kv::LogStore;
use crate::matcher::{LabelMatcher, MatchType};
use crate::persistence::{CheckpointEntry, DiskPersistence};
use crate::preload::Preloader;
use crate::series::{ChunkDesc, MemorySeries, SeriesIterator};
use crate::telemetry::{store_metrics, EventListener, StoreEvent};
use crate::types::{is_valid_label_name, Fingerprint, Metric, Sample, SamplePair, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Debug-build lock-order checker. Locks are ranked stripe < descriptor <
/// index; acquiring a lock of rank not above the highest currently held on
/// the same thread panics in debug builds and compiles to nothing in
/// release builds.
pub(crate) mod lockcheck {
    pub(crate) const SHARD: u8 = 1;
    pub(crate) const DESC: u8 = 2;
    pub(crate) const INDEX: u8 = 3;

    #[cfg(debug_assertions)]
    mod imp {
        use std::cell::Cell;

        thread_local! {
            static CURRENT: Cell<u8> = const { Cell::new(0) };
        }

        pub struct LevelGuard {
            prev: u8,
        }

        pub fn enter(level: u8) -> LevelGuard {
            CURRENT.with(|c| {
                let prev = c.get();
                assert!(
                    level > prev,
                    "lock order violation: acquiring level {} while holding level {}",
                    level,
                    prev
                );
                c.set(level);
                LevelGuard { prev }
            })
        }

        impl Drop for LevelGuard {
            fn drop(&mut self) {
                CURRENT.with(|c| c.set(self.prev));
            }
        }
    }

    #[cfg(not(debug_assertions))]
    mod imp {
        pub struct LevelGuard;

        pub fn enter(_level: u8) -> LevelGuard {
            LevelGuard
        }
    }

    pub(crate) use imp::{enter, LevelGuard};
}

/// A chunk handed to the persistence pipeline: the worker re-reads the
/// descriptor state instead of holding any back-pointer into the series.
pub struct PersistRequest {
    pub fingerprint: Fingerprint,
    pub desc: Arc<ChunkDesc>,
}

/// Bounded persist queue handle. A full queue blocks the sender, which is
/// the ingest backpressure: producers slow down instead of data being
/// dropped.
#[derive(Clone)]
pub(crate) struct PersistQueue {
    tx: SyncSender<PersistRequest>,
    len: Arc<AtomicUsize>,
}

impl PersistQueue {
    pub(crate) fn new(tx: SyncSender<PersistRequest>) -> PersistQueue {
        PersistQueue {
            tx,
            len: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn send(&self, req: PersistRequest) -> Result<()> {
        self.tx
            .send(req)
            .map_err(|_| StorageError::PersistQueueClosed)?;
        let len = self.len.fetch_add(1, Ordering::Relaxed) + 1;
        store_metrics::set_persist_queue_length(len);
        Ok(())
    }

    fn mark_taken(len: &Arc<AtomicUsize>) {
        let remaining = len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .unwrap_or(0)
            .saturating_sub(1);
        store_metrics::set_persist_queue_length(remaining);
    }
}

/// Configuration of the storage core.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory: chunk files, checkpoint, and the index store.
    pub base_path: std::path::PathBuf,
    /// Bytes per chunk record, tag and header included.
    pub chunk_size: usize,
    /// Capacity of the bounded persist queue.
    pub persist_queue_capacity: usize,
    /// Interval between eviction passes.
    pub evict_interval: Duration,
    /// Interval between checkpoints of the series map and open heads.
    pub checkpoint_interval: Duration,
    /// Age past which a chunk body may be dropped from memory.
    pub chunk_ttl: Duration,
    /// Stripe count for the fingerprint lock.
    pub num_fingerprint_stripes: usize,
    /// Encoding hint for newly opened head chunks.
    pub compression_variant: ChunkVariant,
    /// Deadline for a single preload request.
    pub preload_deadline: Duration,
    /// Drop the tail of a series file past a corrupt record instead of
    /// failing the series.
    pub truncate_corrupt_series_files: bool,
    /// Structured event hook (no-op by default).
    pub event_listener: Arc<dyn EventListener>,
}

impl StorageConfig {
    pub fn new<P: Into<std::path::PathBuf>>(base_path: P) -> StorageConfig {
        StorageConfig {
            base_path: base_path.into(),
            ..StorageConfig::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(StorageError::Background(format!(
                "chunk_size {} below minimum {}",
                self.chunk_size, MIN_CHUNK_SIZE
            )));
        }
        if self.num_fingerprint_stripes == 0 {
            return Err(StorageError::Background(
                "num_fingerprint_stripes must be at least 1".to_string(),
            ));
        }
        if self.persist_queue_capacity == 0 {
            return Err(StorageError::Background(
                "persist_queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            base_path: std::path::PathBuf::from("./data"),
            chunk_size: 1024,
            persist_queue_capacity: 1024,
            evict_interval: Duration::from_secs(60),
            checkpoint_interval: Duration::from_secs(300),
            chunk_ttl: Duration::from_secs(60 * 60),
            num_fingerprint_stripes: 64,
            compression_variant: ChunkVariant::DeltaEncoded,
            preload_deadline: Duration::from_secs(30),
            truncate_corrupt_series_files: false,
            event_listener: crate::telemetry::noop_event_listener(),
        }
    }
}

type Shard = Mutex<HashMap<Fingerprint, MemorySeries>>;

enum LoopCommand {
    Shutdown,
}

/// The storage engine handle. All background tasks receive clones of the
/// component handles; there is no process-wide singleton.
pub struct MemorySeriesStorage {
    config: StorageConfig,
    shards: Arc<Vec<Shard>>,
    pool: Arc<ChunkBufferPool>,
    persistence: Arc<DiskPersistence>,
    index: Arc<MetricIndex>,
    events: Arc<dyn EventListener>,
    queue: Mutex<Option<PersistQueue>>,
    persist_rx: Mutex<Option<Receiver<PersistRequest>>>,
    queue_len: Arc<AtomicUsize>,
    loops: Mutex<Vec<(Sender<LoopCommand>, JoinHandle<()>)>>,
    persist_handle: Mutex<Option<JoinHandle<()>>>,
    serving: AtomicBool,
    closed: AtomicBool,
}

impl MemorySeriesStorage {
    /// Opens (and recovers) a storage directory. Background loops are not
    /// running until [`serve`](Self::serve) is called.
    pub fn open(config: StorageConfig) -> Result<Arc<MemorySeriesStorage>> {
        config.validate()?;
        let events = Arc::clone(&config.event_listener);
        let pool = Arc::new(ChunkBufferPool::new(config.chunk_size));
        let persistence = Arc::new(DiskPersistence::new(
            &config.base_path,
            config.chunk_size,
            config.truncate_corrupt_series_files,
        )?);
        let kv = Arc::new(LogStore::open(config.base_path.join("index"))?);
        let index = Arc::new(MetricIndex::new(kv, Arc::clone(&events)));

        let shards: Vec<Shard> = (0..config.num_fingerprint_stripes)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let shards = Arc::new(shards);

        let (tx, rx) = mpsc::sync_channel(config.persist_queue_capacity);
        let queue = PersistQueue::new(tx);
        let queue_len = Arc::clone(&queue.len);

        let storage = MemorySeriesStorage {
            config,
            shards,
            pool,
            persistence,
            index,
            events,
            queue: Mutex::new(Some(queue)),
            persist_rx: Mutex::new(Some(rx)),
            queue_len,
            loops: Mutex::new(Vec::new()),
            persist_handle: Mutex::new(None),
            serving: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        storage.recover()?;
        Ok(Arc::new(storage))
    }

    /// Restores the series map from the checkpoint. A missing checkpoint is
    /// a cold start; a failing one is discarded (cold start with indexes
    /// preserved) and reported.
    fn recover(&self) -> Result<()> {
        let entries = match self.persistence.load_series_map_and_heads(&self.pool) {
            Ok(Some(entries)) => entries,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.events.on_event(StoreEvent::CheckpointDiscarded {
                    error: e.to_string(),
                });
                return Ok(());
            }
        };

        let mut total = 0usize;
        for entry in entries {
            let fp = entry.fingerprint;
            let mut series = if entry.head_persisted {
                // Every chunk of the series is in the chunk store;
                // descriptors are loaded lazily on first use.
                MemorySeries::unarchived(entry.metric)
            } else {
                let head = entry.head.ok_or_else(|| StorageError::Corruption {
                    details: "checkpoint entry lost its head chunk".to_string(),
                    fingerprint: Some(fp),
                    timestamp: None,
                })?;
                let mut series = MemorySeries::new(entry.metric);
                series.last_sample_time = Some(head.last_time());
                // The restored head will be appended to the chunk store
                // after the chunks already there.
                series.chunk_descs_offset = self.persistence.chunk_count(fp)? as i64;
                series.chunk_descs.push(Arc::new(ChunkDesc::new(head)));
                series
            };
            if series.chunk_descs.is_empty() {
                series.chunk_descs_offset = -1;
            }
            let (mut shard, _level) = self.lock_shard(fp)?;
            shard.insert(fp, series);
            total += 1;
        }
        store_metrics::set_memory_series(total);
        Ok(())
    }

    /// Starts the persist worker and the eviction and checkpoint loops,
    /// then signals readiness.
    pub fn serve(&self, ready: Sender<()>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(StorageError::Background(
                "storage is already serving".to_string(),
            ));
        }

        let rx = self
            .persist_rx
            .lock()?
            .take()
            .ok_or_else(|| StorageError::Background("persist queue receiver gone".to_string()))?;
        let persistence = Arc::clone(&self.persistence);
        let events = Arc::clone(&self.events);
        let queue_len = Arc::clone(&self.queue_len);
        let persist_handle = thread::Builder::new()
            .name("varve-persist".to_string())
            .spawn(move || run_persist_worker(rx, persistence, events, queue_len))
            .map_err(|e| StorageError::Background(e.to_string()))?;
        *self.persist_handle.lock()? = Some(persist_handle);

        let mut loops = self.loops.lock()?;

        {
            let (tx, rx) = mpsc::channel();
            let shards = Arc::clone(&self.shards);
            let pool = Arc::clone(&self.pool);
            let persistence = Arc::clone(&self.persistence);
            let index = Arc::clone(&self.index);
            let events = Arc::clone(&self.events);
            let queue = self.queue_handle()?;
            let ttl = self.config.chunk_ttl;
            let interval = self.config.evict_interval;
            let handle = thread::Builder::new()
                .name("varve-evict".to_string())
                .spawn(move || loop {
                    match rx.recv_timeout(interval) {
                        Ok(LoopCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            evict_pass(&shards, &pool, &persistence, &index, &queue, &events, ttl);
                        }
                    }
                })
                .map_err(|e| StorageError::Background(e.to_string()))?;
            loops.push((tx, handle));
        }

        {
            let (tx, rx) = mpsc::channel();
            let shards = Arc::clone(&self.shards);
            let persistence = Arc::clone(&self.persistence);
            let events = Arc::clone(&self.events);
            let interval = self.config.checkpoint_interval;
            let handle = thread::Builder::new()
                .name("varve-checkpoint".to_string())
                .spawn(move || loop {
                    match rx.recv_timeout(interval) {
                        Ok(LoopCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = checkpoint_pass(&shards, &persistence, &events) {
                                events.on_event(StoreEvent::CheckpointFailed {
                                    error: e.to_string(),
                                });
                            }
                        }
                    }
                })
                .map_err(|e| StorageError::Background(e.to_string()))?;
            loops.push((tx, handle));
        }

        let _ = ready.send(());
        Ok(())
    }

    /// Stops the loops, drains the persist queue, writes a final checkpoint
    /// and closes persistence and index. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (tx, handle) in self.loops.lock()?.drain(..) {
            let _ = tx.send(LoopCommand::Shutdown);
            handle
                .join()
                .map_err(|_| StorageError::Background("maintenance loop panicked".to_string()))?;
        }

        // Dropping the sender lets the worker drain everything still queued
        // and exit; nothing is dropped on the floor.
        drop(self.queue.lock()?.take());
        if let Some(handle) = self.persist_handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| StorageError::Background("persist worker panicked".to_string()))?;
        }
        if let Some(rx) = self.persist_rx.lock()?.take() {
            // serve() was never called: drain the queue synchronously.
            run_persist_worker(
                rx,
                Arc::clone(&self.persistence),
                Arc::clone(&self.events),
                Arc::clone(&self.queue_len),
            );
        }

        checkpoint_pass(&self.shards, &self.persistence, &self.events)?;
        self.index.close()?;
        Ok(())
    }

    /// Stores a batch of samples. Samples for one fingerprint must arrive
    /// in non-decreasing timestamp order; a violating sample is rejected
    /// without aborting the rest of the batch.
    pub fn append_samples(&self, samples: &[Sample]) -> Result<()> {
        let mut errors: Vec<(usize, StorageError)> = Vec::new();
        for (i, sample) in samples.iter().enumerate() {
            match self.append_sample(sample) {
                Ok(()) => {}
                Err(e @ (StorageError::Closed | StorageError::PersistQueueClosed)) => return Err(e),
                Err(e) => errors.push((i, e)),
            }
        }
        store_metrics::record_samples_appended((samples.len() - errors.len()) as u64);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(StorageError::PartialAppend {
                total: samples.len(),
                errors,
            })
        }
    }

    /// Stores one sample, creating (or unarchiving) its series as needed.
    pub fn append_sample(&self, sample: &Sample) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        for name in sample.metric.keys() {
            if !is_valid_label_name(name) {
                return Err(StorageError::InvalidLabel(name.clone()));
            }
        }

        let fp = Fingerprint::from_metric(&sample.metric);
        let queue = self.queue_handle()?;
        let (mut shard, _level) = self.lock_shard(fp)?;

        if !shard.contains_key(&fp) {
            let series = if self.index.has_archived_metric(fp)?.is_some() {
                let metric = self.index.get_archived_metric(fp)?.ok_or_else(|| {
                    StorageError::Corruption {
                        details: "archived series has no metric entry".to_string(),
                        fingerprint: Some(fp),
                        timestamp: None,
                    }
                })?;
                self.index.unarchive_metric(fp)?;
                self.events
                    .on_event(StoreEvent::SeriesUnarchived { fingerprint: fp });
                store_metrics::record_series_unarchived();
                MemorySeries::unarchived(metric)
            } else {
                self.index.index_metric(fp, sample.metric.clone())?;
                store_metrics::record_series_created();
                MemorySeries::new(sample.metric.clone())
            };
            shard.insert(fp, series);
        }
        let series = shard
            .get_mut(&fp)
            .ok_or_else(|| StorageError::UnknownFingerprint(fp))?;

        let result = series.add(
            fp,
            SamplePair {
                timestamp: sample.timestamp,
                value: sample.value,
            },
            &queue,
            &self.pool,
            self.config.compression_variant,
            self.config.chunk_size,
        );
        if let Err(StorageError::OutOfOrder { timestamp, .. }) = &result {
            store_metrics::record_out_of_order();
            self.events.on_event(StoreEvent::OutOfOrderSample {
                fingerprint: fp,
                timestamp: *timestamp,
            });
        }
        result
    }

    /// Resolves label matchers to the deduplicated fingerprints of all
    /// matching series, in memory or archived. An empty intersection
    /// short-circuits.
    pub fn get_fingerprints_for_label_matchers(
        &self,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<Fingerprint>> {
        let mut sets: Vec<BTreeSet<Fingerprint>> = Vec::with_capacity(matchers.len());
        for matcher in matchers {
            let set: BTreeSet<Fingerprint> = match matcher.match_type {
                MatchType::Equal => self
                    .index
                    .get_fingerprints_for_label_pair(&matcher.name, &matcher.value)?
                    .into_iter()
                    .collect(),
                _ => {
                    let values = self.index.get_label_values_for_label_name(&matcher.name)?;
                    let mut set = BTreeSet::new();
                    for value in matcher.filter(values) {
                        set.extend(
                            self.index
                                .get_fingerprints_for_label_pair(&matcher.name, &value)?,
                        );
                    }
                    set
                }
            };
            if set.is_empty() {
                return Ok(Vec::new());
            }
            sets.push(set);
        }
        let Some((first, rest)) = sets.split_first() else {
            return Ok(Vec::new());
        };
        let mut base = first.clone();
        for set in rest {
            base = base.intersection(set).copied().collect();
            if base.is_empty() {
                return Ok(Vec::new());
            }
        }
        Ok(base.into_iter().collect())
    }

    /// Label values recorded in the index for `name`, including values of
    /// series whose indexing is still queued.
    pub fn get_label_values_for_label_name(&self, name: &str) -> Result<Vec<String>> {
        self.index.get_label_values_for_label_name(name)
    }

    /// All values of `name` across in-memory series metrics and the index.
    pub fn get_all_values_for_label(&self, name: &str) -> Result<Vec<String>> {
        let mut values: BTreeSet<String> =
            self.index.get_label_values_for_label_name(name)?.into_iter().collect();
        for shard in self.shards.iter() {
            let _level = lockcheck::enter(lockcheck::SHARD);
            let shard = shard.lock()?;
            for series in shard.values() {
                if let Some(value) = series.metric().get(name) {
                    values.insert(value.clone());
                }
            }
        }
        Ok(values.into_iter().collect())
    }

    /// The metric of a fingerprint, as an owned copy: callers cannot mutate
    /// stored state. Falls back to the index for archived series.
    pub fn get_metric_for_fingerprint(&self, fp: Fingerprint) -> Result<Option<Metric>> {
        {
            let (shard, _level) = self.lock_shard(fp)?;
            if let Some(series) = shard.get(&fp) {
                return Ok(Some(series.metric().clone()));
            }
        }
        self.index.get_metric_for_fingerprint(fp)
    }

    /// Iterator over the resident chunks of a series. Chunks that should be
    /// covered must be pinned via a [`Preloader`] first.
    pub fn new_iterator(&self, fp: Fingerprint) -> Result<SeriesIterator> {
        let (shard, _level) = self.lock_shard(fp)?;
        match shard.get(&fp) {
            Some(series) => Ok(series.new_iterator()),
            None => Err(StorageError::UnknownFingerprint(fp)),
        }
    }

    /// A preloader that pins `(fingerprint, range)` requests into memory for
    /// the lifetime of a query.
    pub fn new_preloader(&self) -> Preloader<'_> {
        Preloader::new(self)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Runs one eviction pass now. Returns (chunk bodies dropped, series
    /// archived).
    pub fn evict_now(&self) -> Result<(usize, usize)> {
        let queue = self.queue_handle()?;
        Ok(evict_pass(
            &self.shards,
            &self.pool,
            &self.persistence,
            &self.index,
            &queue,
            &self.events,
            self.config.chunk_ttl,
        ))
    }

    /// Writes a checkpoint now.
    pub fn checkpoint_now(&self) -> Result<std::path::PathBuf> {
        checkpoint_pass(&self.shards, &self.persistence, &self.events)
    }

    /// Barrier over the index batching thread; used by tests and archival.
    pub fn wait_for_indexing(&self) -> Result<()> {
        self.index.wait_for_indexing()
    }

    fn queue_handle(&self) -> Result<PersistQueue> {
        self.queue
            .lock()?
            .as_ref()
            .cloned()
            .ok_or(StorageError::Closed)
    }

    fn shard_for(&self, fp: Fingerprint) -> &Shard {
        &self.shards[(fp.0 % self.shards.len() as u64) as usize]
    }

    pub(crate) fn lock_shard(
        &self,
        fp: Fingerprint,
    ) -> Result<(
        MutexGuard<'_, HashMap<Fingerprint, MemorySeries>>,
        lockcheck::LevelGuard,
    )> {
        let level = lockcheck::enter(lockcheck::SHARD);
        let guard = self.shard_for(fp).lock()?;
        Ok((guard, level))
    }

    /// Locates (unarchiving and lazily loading descriptors as needed) the
    /// chunks of `fp` overlapping `[from, through]`, loads evicted bodies
    /// from the chunk store, and pins every selected chunk. On deadline
    /// expiry nothing stays pinned.
    pub(crate) fn pin_range(
        &self,
        fp: Fingerprint,
        from: Timestamp,
        through: Timestamp,
        deadline: Instant,
    ) -> Result<Vec<Arc<ChunkDesc>>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let (mut shard, _level) = self.lock_shard(fp)?;

        if !shard.contains_key(&fp) {
            if self.index.has_archived_metric(fp)?.is_none() {
                return Err(StorageError::UnknownFingerprint(fp));
            }
            let metric = self.index.get_archived_metric(fp)?.ok_or_else(|| {
                StorageError::Corruption {
                    details: "archived series has no metric entry".to_string(),
                    fingerprint: Some(fp),
                    timestamp: None,
                }
            })?;
            self.index.unarchive_metric(fp)?;
            self.events
                .on_event(StoreEvent::SeriesUnarchived { fingerprint: fp });
            store_metrics::record_series_unarchived();
            shard.insert(fp, MemorySeries::unarchived(metric));
        }
        let series = shard
            .get_mut(&fp)
            .ok_or_else(|| StorageError::UnknownFingerprint(fp))?;

        // Older descriptors may still be on disk only.
        if series.chunk_descs_offset != 0 {
            let before = series
                .chunk_descs
                .first()
                .map(|d| d.first_time())
                .unwrap_or(Timestamp::MAX);
            let mut loaded = self.persistence.load_chunk_descs(fp, before)?;
            loaded.extend(series.chunk_descs.drain(..));
            series.chunk_descs = loaded;
            series.chunk_descs_offset = 0;
        }
        if Instant::now() > deadline {
            store_metrics::record_preload_timeout();
            return Err(StorageError::PreloadDeadlineExceeded(
                self.config.preload_deadline,
            ));
        }

        let mut selected: Vec<(usize, Arc<ChunkDesc>)> = Vec::new();
        for (i, desc) in series.chunk_descs.iter().enumerate() {
            let overlaps = desc.with(|d| d.first_time <= through && d.last_time >= from);
            if overlaps {
                selected.push((i, Arc::clone(desc)));
            }
        }

        let missing: Vec<usize> = selected
            .iter()
            .filter(|(_, desc)| desc.with(|d| d.chunk.is_none()))
            .map(|(i, _)| *i)
            .collect();
        if !missing.is_empty() {
            let chunks = self.persistence.load_chunks(fp, &missing, 0, &self.pool)?;
            if Instant::now() > deadline {
                // Bodies stay installed (they are evictable again); no pins
                // were taken, so the request has no side effects.
                for (idx, chunk) in missing.iter().zip(chunks) {
                    series.chunk_descs[*idx].with(|d| {
                        if d.chunk.is_none() {
                            d.chunk = Some(chunk);
                        } else {
                            // Unreachable install race; return the buffer.
                            chunk.recycle(&self.pool);
                        }
                    });
                }
                store_metrics::record_preload_timeout();
                return Err(StorageError::PreloadDeadlineExceeded(
                    self.config.preload_deadline,
                ));
            }
            for (idx, chunk) in missing.iter().zip(chunks) {
                series.chunk_descs[*idx].with(|d| {
                    if d.chunk.is_none() {
                        d.chunk = Some(chunk);
                    } else {
                        chunk.recycle(&self.pool);
                    }
                });
            }
        }

        let pinned: Vec<Arc<ChunkDesc>> = selected.into_iter().map(|(_, d)| d).collect();
        for desc in &pinned {
            desc.pin();
        }
        store_metrics::record_preload_pins(pinned.len() as u64);
        Ok(pinned)
    }
}

impl Drop for MemorySeriesStorage {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_persist_worker(
    rx: Receiver<PersistRequest>,
    persistence: Arc<DiskPersistence>,
    events: Arc<dyn EventListener>,
    queue_len: Arc<AtomicUsize>,
) {
    events.on_event(StoreEvent::PersistWorkerStarted);
    for req in rx.iter() {
        PersistQueue::mark_taken(&queue_len);

        // A chunk already persisted since it was enqueued (or re-enqueued by
        // the eviction loop) is skipped.
        let chunk = req
            .desc
            .with(|d| if d.is_persisted() { None } else { d.chunk.clone() });
        let Some(chunk) = chunk else { continue };

        let start = Instant::now();
        match persistence.persist_chunk(req.fingerprint, &chunk) {
            Ok(_index) => {
                req.desc.with(|d| d.last_persist = SystemTime::now());
                store_metrics::record_persist(start.elapsed(), true);
            }
            Err(e) => {
                // Not requeued here; the eviction loop resubmits dirty
                // chunks on its next pass.
                store_metrics::record_persist(start.elapsed(), false);
                events.on_event(StoreEvent::ChunkPersistFailed {
                    fingerprint: req.fingerprint,
                    error: e.to_string(),
                });
            }
        }
    }
    events.on_event(StoreEvent::PersistWorkerStopping);
}

/// One pass of the eviction loop: re-enqueue dirty over-TTL chunks, drop
/// persisted cold bodies, archive series with nothing left in memory.
fn evict_pass(
    shards: &[Shard],
    pool: &ChunkBufferPool,
    persistence: &DiskPersistence,
    index: &MetricIndex,
    queue: &PersistQueue,
    events: &Arc<dyn EventListener>,
    ttl: Duration,
) -> (usize, usize) {
    let horizon = now_millis().saturating_sub(ttl.as_millis() as i64);
    let mut total_evicted = 0usize;
    let mut total_archived = 0usize;

    for shard in shards {
        let mut candidates: Vec<Fingerprint> = Vec::new();
        {
            let _level = lockcheck::enter(lockcheck::SHARD);
            let mut shard = match shard.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (fp, series) in shard.iter_mut() {
                // Dirty chunks past the TTL (including an idle head) go back
                // to the persist queue so the next pass can drop them.
                let desc_count = series.chunk_descs.len();
                for (i, desc) in series.chunk_descs.iter().enumerate() {
                    let dirty_and_old = desc.with(|d| {
                        d.chunk.is_some() && !d.is_persisted() && d.last_time < horizon
                    });
                    if dirty_and_old {
                        if i + 1 == desc_count {
                            series.head_closed = true;
                        }
                        if queue
                            .send(PersistRequest {
                                fingerprint: *fp,
                                desc: Arc::clone(desc),
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                }

                total_evicted += series.evict_older_than(horizon, pool);

                if series.fully_evicted() && !series.has_pins() {
                    candidates.push(*fp);
                }
            }
        }

        if candidates.is_empty() {
            continue;
        }
        // Archival must not outrun the index batch that records the metric.
        if index.wait_for_indexing().is_err() {
            continue;
        }

        let _level = lockcheck::enter(lockcheck::SHARD);
        let mut shard = match shard.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        for fp in candidates {
            let Some(series) = shard.get(&fp) else { continue };
            // Re-verify: appends or pins may have arrived in between.
            if !series.fully_evicted() || series.has_pins() {
                continue;
            }
            let bounds = match (series.first_time(), series.last_time()) {
                (Some(first), Some(last)) => Some((first, last)),
                _ => match persistence.load_chunk_descs(fp, Timestamp::MAX) {
                    Ok(descs) if !descs.is_empty() => Some((
                        descs[0].first_time(),
                        descs[descs.len() - 1].last_time(),
                    )),
                    _ => None,
                },
            };
            let Some((first, last)) = bounds else { continue };
            let metric = series.metric().clone();
            if index.archive_metric(fp, &metric, first, last).is_err() {
                continue;
            }
            shard.remove(&fp);
            total_archived += 1;
            events.on_event(StoreEvent::SeriesArchived { fingerprint: fp });
            store_metrics::record_series_archived();
        }
    }

    store_metrics::record_chunks_evicted(total_evicted as u64);
    events.on_event(StoreEvent::EvictionRun {
        chunks_evicted: total_evicted,
        series_archived: total_archived,
    });
    (total_evicted, total_archived)
}

/// Snapshots the series map shard by shard and writes the checkpoint.
/// Appends proceed on all shards but the one currently being copied.
fn checkpoint_pass(
    shards: &[Shard],
    persistence: &DiskPersistence,
    events: &Arc<dyn EventListener>,
) -> Result<std::path::PathBuf> {
    let start = Instant::now();
    let mut entries: Vec<CheckpointEntry> = Vec::new();
    for shard in shards {
        let _level = lockcheck::enter(lockcheck::SHARD);
        let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
        for (fp, series) in shard.iter() {
            let head = if series.head_persisted() {
                None
            } else {
                series.head().and_then(|d| d.with(|i| i.chunk.clone()))
            };
            // A series without any in-memory chunk bytes is recorded as
            // head-persisted; its data is reachable through the chunk store.
            let head_persisted = head.is_none();
            entries.push(CheckpointEntry {
                fingerprint: *fp,
                metric: series.metric().clone(),
                chunk_descs_offset: series.chunk_descs_offset,
                head_persisted,
                head,
            });
        }
    }

    let path = persistence.checkpoint_series_map_and_heads(&entries)?;
    store_metrics::record_checkpoint(start.elapsed(), entries.len());
    events.on_event(StoreEvent::CheckpointCreated {
        path: path.clone(),
        series: entries.len(),
    });
    Ok(path)
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}
