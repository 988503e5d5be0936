//! In-memory series: an ordered run of chunk descriptors for one metric.
//!
//! Only the last descriptor (the head) may hold an open chunk. Closed chunks
//! are enqueued for persistence when they are spawned; evicted chunks keep
//! their descriptor (with time bounds) in memory so queries can find and
//! reload them by on-disk index.

use crate::chunk::{Chunk, ChunkBufferPool, ChunkVariant};
use crate::error::{Result, StorageError};
use crate::storage::{lockcheck, PersistQueue, PersistRequest};
use crate::types::{Fingerprint, Interval, Metric, SamplePair, Timestamp};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Mutable state of a chunk descriptor, guarded by the descriptor's lock.
#[derive(Debug)]
pub(crate) struct ChunkDescInner {
    /// The chunk body, or `None` once evicted from memory.
    pub chunk: Option<Chunk>,
    pub first_time: Timestamp,
    pub last_time: Timestamp,
    /// Pin count. A pinned body is never evicted.
    pub ref_count: u32,
    pub last_write: SystemTime,
    pub last_persist: SystemTime,
}

impl ChunkDescInner {
    pub fn is_persisted(&self) -> bool {
        self.last_persist >= self.last_write
    }
}

/// Descriptor of one chunk of a series. Shared between the owning series,
/// the persist queue and iterators, hence `Arc`-wrapped and interior-locked.
#[derive(Debug)]
pub struct ChunkDesc {
    inner: Mutex<ChunkDescInner>,
}

impl ChunkDesc {
    pub(crate) fn new(chunk: Chunk) -> ChunkDesc {
        ChunkDesc {
            inner: Mutex::new(ChunkDescInner {
                first_time: chunk.first_time(),
                last_time: chunk.last_time(),
                chunk: Some(chunk),
                ref_count: 0,
                last_write: SystemTime::now(),
                last_persist: UNIX_EPOCH,
            }),
        }
    }

    /// Descriptor for a chunk that lives on disk: times known, body absent.
    pub(crate) fn new_evicted(first_time: Timestamp, last_time: Timestamp) -> ChunkDesc {
        ChunkDesc {
            inner: Mutex::new(ChunkDescInner {
                chunk: None,
                first_time,
                last_time,
                ref_count: 0,
                last_write: UNIX_EPOCH,
                last_persist: SystemTime::now(),
            }),
        }
    }

    /// Runs `f` with the descriptor locked. Descriptor locks rank below the
    /// series shard lock and above index internals.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut ChunkDescInner) -> R) -> R {
        let _level = lockcheck::enter(lockcheck::DESC);
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn first_time(&self) -> Timestamp {
        self.with(|i| i.first_time)
    }

    pub fn last_time(&self) -> Timestamp {
        self.with(|i| i.last_time)
    }

    pub fn is_persisted(&self) -> bool {
        self.with(|i| i.is_persisted())
    }

    pub(crate) fn pin(&self) {
        self.with(|i| i.ref_count += 1);
    }

    pub(crate) fn unpin(&self) {
        self.with(|i| i.ref_count = i.ref_count.saturating_sub(1));
    }
}

/// One series held in memory: its metric and chronologically ordered chunk
/// descriptors. Descriptors cover disjoint, adjacent time ranges.
#[derive(Debug)]
pub struct MemorySeries {
    pub(crate) metric: Metric,
    pub(crate) chunk_descs: Vec<Arc<ChunkDesc>>,
    /// On-disk chunk index of `chunk_descs[0]`; -1 when descriptors have not
    /// been loaded from disk yet (freshly unarchived series).
    pub(crate) chunk_descs_offset: i64,
    /// Restored head-persisted flag; only consulted while `chunk_descs` is
    /// empty (after checkpoint recovery or unarchival).
    pub(crate) head_chunk_persisted: bool,
    /// Set by the eviction loop when an idle head was handed to the persist
    /// queue; the next append starts a fresh head instead of extending it.
    pub(crate) head_closed: bool,
    pub(crate) last_sample_time: Option<Timestamp>,
}

impl MemorySeries {
    pub(crate) fn new(metric: Metric) -> MemorySeries {
        MemorySeries {
            metric,
            chunk_descs: Vec::new(),
            chunk_descs_offset: 0,
            head_chunk_persisted: false,
            head_closed: false,
            last_sample_time: None,
        }
    }

    /// A series pulled back from the archive: all of its chunks are on disk,
    /// descriptors are loaded lazily.
    pub(crate) fn unarchived(metric: Metric) -> MemorySeries {
        MemorySeries {
            metric,
            chunk_descs: Vec::new(),
            chunk_descs_offset: -1,
            head_chunk_persisted: true,
            head_closed: true,
            last_sample_time: None,
        }
    }

    /// Appends a sample to the head chunk, spawning and enqueueing closed
    /// chunks as needed. A full persist queue blocks the append.
    pub(crate) fn add(
        &mut self,
        fp: Fingerprint,
        sample: SamplePair,
        persist_queue: &PersistQueue,
        pool: &ChunkBufferPool,
        variant: ChunkVariant,
        chunk_size: usize,
    ) -> Result<()> {
        if let Some(last) = self.last_sample_time {
            if sample.timestamp < last {
                return Err(StorageError::OutOfOrder {
                    fingerprint: fp,
                    timestamp: sample.timestamp,
                    last_timestamp: last,
                });
            }
        }

        let mut to_enqueue: Vec<Arc<ChunkDesc>> = Vec::new();

        if self.head_is_appendable() {
            let head = Arc::clone(self.chunk_descs.last().ok_or_else(head_missing)?);
            let now = SystemTime::now();
            let trailing = head.with(|inner| -> Result<Vec<Chunk>> {
                let chunk = inner.chunk.take().ok_or_else(head_missing)?;
                let mut chunks = chunk.add(sample, pool)?;
                let rest = chunks.split_off(1);
                let first = chunks.into_iter().next().ok_or_else(head_missing)?;
                inner.first_time = first.first_time();
                inner.last_time = first.last_time();
                inner.chunk = Some(first);
                inner.last_write = now;
                Ok(rest)
            })?;
            if !trailing.is_empty() {
                // The head was closed by the overflow or transcode; hand it
                // to the persistence pipeline. All trailing chunks but the
                // last are closed too; the last is the new open head.
                to_enqueue.push(Arc::clone(&head));
                let closed = trailing.len() - 1;
                for (i, chunk) in trailing.into_iter().enumerate() {
                    let desc = Arc::new(ChunkDesc::new(chunk));
                    if i < closed {
                        to_enqueue.push(Arc::clone(&desc));
                    }
                    self.chunk_descs.push(desc);
                }
            }
        } else {
            let mut chunks = Chunk::new(variant, chunk_size, pool).add(sample, pool)?;
            let chunk = chunks.pop().ok_or_else(head_missing)?;
            self.chunk_descs.push(Arc::new(ChunkDesc::new(chunk)));
            self.head_chunk_persisted = false;
            self.head_closed = false;
        }

        self.last_sample_time = Some(sample.timestamp);

        for desc in to_enqueue {
            persist_queue.send(PersistRequest {
                fingerprint: fp,
                desc,
            })?;
        }
        Ok(())
    }

    fn head_is_appendable(&self) -> bool {
        if self.head_closed {
            return false;
        }
        match self.chunk_descs.last() {
            Some(desc) => desc.with(|i| i.chunk.is_some() && !i.is_persisted()),
            None => false,
        }
    }

    /// Drops the bodies of leading chunks that are older than `t`, persisted
    /// and unpinned. Stops at the first descriptor failing the predicate.
    /// Descriptors themselves are retained with their time bounds.
    pub(crate) fn evict_older_than(&mut self, t: Timestamp, pool: &ChunkBufferPool) -> usize {
        let mut evicted = 0;
        for desc in &self.chunk_descs {
            let stop = desc.with(|inner| {
                if inner.chunk.is_none() {
                    return false;
                }
                if inner.last_time >= t || inner.ref_count > 0 || !inner.is_persisted() {
                    return true;
                }
                if let Some(chunk) = inner.chunk.take() {
                    chunk.recycle(pool);
                    evicted += 1;
                }
                false
            });
            if stop {
                break;
            }
        }
        evicted
    }

    /// Whether the head chunk exists on disk (restored flag while no
    /// descriptors are resident).
    pub(crate) fn head_persisted(&self) -> bool {
        match self.chunk_descs.last() {
            Some(desc) => desc.is_persisted(),
            None => self.head_chunk_persisted,
        }
    }

    pub(crate) fn head(&self) -> Option<&Arc<ChunkDesc>> {
        self.chunk_descs.last()
    }

    pub(crate) fn fully_evicted(&self) -> bool {
        self.head_persisted() && self.chunk_descs.iter().all(|d| d.with(|i| i.chunk.is_none()))
    }

    pub(crate) fn has_pins(&self) -> bool {
        self.chunk_descs.iter().any(|d| d.with(|i| i.ref_count > 0))
    }

    pub(crate) fn first_time(&self) -> Option<Timestamp> {
        self.chunk_descs.first().map(|d| d.first_time())
    }

    pub(crate) fn last_time(&self) -> Option<Timestamp> {
        self.chunk_descs
            .last()
            .map(|d| d.last_time())
            .or(self.last_sample_time)
    }

    pub(crate) fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Snapshots the resident chunk list for iteration. The iterator pins
    /// every snapshotted chunk and caps each at its sample count at snapshot
    /// time, so later appends and transcodes are invisible to it.
    pub(crate) fn new_iterator(&self) -> SeriesIterator {
        let mut chunks = Vec::with_capacity(self.chunk_descs.len());
        for desc in &self.chunk_descs {
            let snapshot = desc.with(|inner| {
                inner.chunk.as_ref().map(|c| {
                    inner.ref_count += 1;
                    let len = c.len();
                    (len, c.first_time(), c.sample_at(len - 1).timestamp)
                })
            });
            if let Some((len, first_time, last_time)) = snapshot {
                chunks.push(PinnedChunk {
                    desc: Arc::clone(desc),
                    len,
                    first_time,
                    last_time,
                });
            }
        }
        SeriesIterator { chunks }
    }
}

fn head_missing() -> StorageError {
    StorageError::Background("head chunk body missing".to_string())
}

struct PinnedChunk {
    desc: Arc<ChunkDesc>,
    len: usize,
    first_time: Timestamp,
    last_time: Timestamp,
}

impl PinnedChunk {
    fn query<R>(&self, f: impl FnOnce(&Chunk, usize) -> R) -> Option<R> {
        self.desc
            .with(|inner| inner.chunk.as_ref().map(|c| f(c, self.len)))
    }
}

/// Iterator over the samples of one series, yielding values in strict
/// timestamp order. Holds a pinned snapshot of the chunk list taken at
/// creation; dropped pins are released automatically.
pub struct SeriesIterator {
    chunks: Vec<PinnedChunk>,
}

impl SeriesIterator {
    /// Index of the first snapshotted chunk whose last sample is at or after
    /// `t`, or `len` if none.
    fn first_chunk_at_or_after(&self, t: Timestamp) -> usize {
        self.chunks.partition_point(|c| c.last_time < t)
    }

    /// The two samples adjacent to `t`: a single sample on exact match, the
    /// nearest endpoint outside the series, one sample from each neighbor
    /// when `t` falls between two chunks.
    pub fn value_at_time(&self, t: Timestamp) -> Vec<SamplePair> {
        let n = self.chunks.len();
        if n == 0 {
            return Vec::new();
        }
        if t <= self.chunks[0].first_time {
            return self.chunks[0]
                .query(|c, len| c.cursor_capped(len).value_at_time(t))
                .unwrap_or_default();
        }
        if t >= self.chunks[n - 1].last_time {
            return self.chunks[n - 1]
                .query(|c, len| c.cursor_capped(len).value_at_time(t))
                .unwrap_or_default();
        }
        let i = self.first_chunk_at_or_after(t);
        if t < self.chunks[i].first_time {
            // Between two chunks: one sample from each neighbor.
            let mut out = self.chunks[i - 1]
                .query(|c, len| c.cursor_capped(len).value_at_time(t))
                .unwrap_or_default();
            out.truncate(1);
            if let Some(mut next) = self.chunks[i].query(|c, len| c.cursor_capped(len).value_at_time(t)) {
                next.truncate(1);
                out.append(&mut next);
            }
            out
        } else {
            self.chunks[i]
                .query(|c, len| c.cursor_capped(len).value_at_time(t))
                .unwrap_or_default()
        }
    }

    /// All samples within the closed interval, in order.
    pub fn range_values(&self, interval: Interval) -> Vec<SamplePair> {
        let mut values = Vec::new();
        for chunk in &self.chunks[self.first_chunk_at_or_after(interval.oldest_inclusive)..] {
            if chunk.first_time > interval.newest_inclusive {
                break;
            }
            if let Some(mut part) = chunk.query(|c, len| c.cursor_capped(len).range_values(interval))
            {
                values.append(&mut part);
            }
        }
        values
    }

    /// The first and last samples within the closed interval, across chunks.
    pub fn boundary_values(&self, interval: Interval) -> Vec<SamplePair> {
        let first = self.first_sample_at_or_after(interval.oldest_inclusive);
        let last = self.last_sample_at_or_before(interval.newest_inclusive);
        match (first, last) {
            (Some(f), Some(l))
                if f.timestamp <= interval.newest_inclusive
                    && l.timestamp >= interval.oldest_inclusive =>
            {
                if f.timestamp >= l.timestamp {
                    vec![f]
                } else {
                    vec![f, l]
                }
            }
            _ => Vec::new(),
        }
    }

    fn first_sample_at_or_after(&self, t: Timestamp) -> Option<SamplePair> {
        let i = self.first_chunk_at_or_after(t);
        self.chunks.get(i).and_then(|chunk| {
            chunk
                .query(|c, len| {
                    c.cursor_capped(len)
                        .boundary_values(Interval {
                            oldest_inclusive: t,
                            newest_inclusive: Timestamp::MAX,
                        })
                        .first()
                        .copied()
                })
                .flatten()
        })
    }

    fn last_sample_at_or_before(&self, t: Timestamp) -> Option<SamplePair> {
        let i = self.chunks.partition_point(|c| c.first_time <= t);
        if i == 0 {
            return None;
        }
        self.chunks[i - 1]
            .query(|c, len| {
                c.cursor_capped(len)
                    .boundary_values(Interval {
                        oldest_inclusive: Timestamp::MIN,
                        newest_inclusive: t,
                    })
                    .last()
                    .copied()
            })
            .flatten()
    }
}

impl Drop for SeriesIterator {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            chunk.desc.unpin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const CHUNK_SIZE: usize = 1024;

    fn pair(t: Timestamp, v: f64) -> SamplePair {
        SamplePair {
            timestamp: t,
            value: v,
        }
    }

    fn queue(capacity: usize) -> (PersistQueue, mpsc::Receiver<PersistRequest>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        (PersistQueue::new(tx), rx)
    }

    fn series_with(samples: &[SamplePair]) -> (MemorySeries, mpsc::Receiver<PersistRequest>, ChunkBufferPool) {
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let (q, rx) = queue(1024);
        let mut series = MemorySeries::new(Metric::new());
        let fp = Fingerprint(1);
        for &s in samples {
            series
                .add(fp, s, &q, &pool, ChunkVariant::DeltaEncoded, CHUNK_SIZE)
                .unwrap();
        }
        (series, rx, pool)
    }

    #[test]
    fn add_appends_in_order_and_rejects_regressions() {
        let (mut series, _rx, pool) = series_with(&[pair(0, 1.0), pair(15, 1.0)]);
        let (q, _rx2) = queue(16);
        let err = series
            .add(
                Fingerprint(1),
                pair(10, 2.0),
                &q,
                &pool,
                ChunkVariant::DeltaEncoded,
                CHUNK_SIZE,
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::OutOfOrder { .. }));

        // The series keeps accepting in-order samples afterwards.
        series
            .add(
                Fingerprint(1),
                pair(30, 0.0),
                &q,
                &pool,
                ChunkVariant::DeltaEncoded,
                CHUNK_SIZE,
            )
            .unwrap();
        assert_eq!(series.last_sample_time, Some(30));
    }

    #[test]
    fn closed_chunks_are_enqueued_for_persistence() {
        // 501 one-byte samples fill the first chunk; the 502nd closes it.
        let samples: Vec<_> = (0..502).map(|i| pair(i, 0.0)).collect();
        let (series, rx, _pool) = series_with(&samples);
        assert_eq!(series.chunk_descs.len(), 2);

        let req = rx.try_recv().expect("closed head enqueued");
        assert_eq!(req.fingerprint, Fingerprint(1));
        assert_eq!(req.desc.first_time(), 0);
        assert_eq!(req.desc.last_time(), 500);
        assert!(rx.try_recv().is_err(), "open head must not be enqueued");
    }

    #[test]
    fn eviction_requires_persistence_and_no_pins() {
        let samples: Vec<_> = (0..502).map(|i| pair(i, 0.0)).collect();
        let (mut series, rx, pool) = series_with(&samples);
        let closed = rx.try_recv().unwrap().desc;

        // Unpersisted: nothing may be dropped.
        assert_eq!(series.evict_older_than(Timestamp::MAX, &pool), 0);

        closed.with(|i| i.last_persist = SystemTime::now());
        closed.pin();
        assert_eq!(series.evict_older_than(Timestamp::MAX, &pool), 0);

        closed.unpin();
        assert_eq!(series.evict_older_than(Timestamp::MAX, &pool), 1);
        assert!(closed.with(|i| i.chunk.is_none()));
        // Descriptor survives with its time bounds.
        assert_eq!(series.chunk_descs.len(), 2);
        assert_eq!(series.chunk_descs[0].first_time(), 0);
        assert_eq!(series.chunk_descs[0].last_time(), 500);
    }

    #[test]
    fn eviction_stops_at_first_retained_chunk() {
        let samples: Vec<_> = (0..1004).map(|i| pair(i, 0.0)).collect();
        let (mut series, rx, pool) = series_with(&samples);
        assert_eq!(series.chunk_descs.len(), 3);

        // Persist only the second closed chunk; the first stays dirty and
        // must block eviction of everything behind it.
        let _first = rx.try_recv().unwrap().desc;
        let second = rx.try_recv().unwrap().desc;
        second.with(|i| i.last_persist = SystemTime::now());

        assert_eq!(series.evict_older_than(Timestamp::MAX, &pool), 0);
    }

    #[test]
    fn iterator_is_isolated_from_later_appends() {
        let (mut series, _rx, pool) = series_with(&[pair(0, 1.0), pair(15, 1.0)]);
        let iter = series.new_iterator();

        let (q, _rx2) = queue(16);
        series
            .add(
                Fingerprint(1),
                pair(30, 9.0),
                &q,
                &pool,
                ChunkVariant::DeltaEncoded,
                CHUNK_SIZE,
            )
            .unwrap();

        let all = iter.range_values(Interval {
            oldest_inclusive: 0,
            newest_inclusive: 100,
        });
        assert_eq!(all, vec![pair(0, 1.0), pair(15, 1.0)]);

        // A fresh iterator sees the new sample.
        let fresh = series.new_iterator();
        assert_eq!(
            fresh.range_values(Interval {
                oldest_inclusive: 0,
                newest_inclusive: 100,
            }),
            vec![pair(0, 1.0), pair(15, 1.0), pair(30, 9.0)]
        );
    }

    #[test]
    fn iterator_pins_and_unpins_chunks() {
        let (series, _rx, _pool) = series_with(&[pair(0, 1.0)]);
        let desc = Arc::clone(&series.chunk_descs[0]);
        {
            let _iter = series.new_iterator();
            assert_eq!(desc.with(|i| i.ref_count), 1);
        }
        assert_eq!(desc.with(|i| i.ref_count), 0);
    }

    #[test]
    fn value_at_time_between_chunks_returns_neighbors() {
        let samples: Vec<_> = (0..502).map(|i| pair(i * 10, i as f64)).collect();
        let (series, _rx, _pool) = series_with(&samples);
        assert!(series.chunk_descs.len() >= 2);

        let iter = series.new_iterator();
        // Exactly on a sample.
        assert_eq!(iter.value_at_time(100), vec![pair(100, 10.0)]);
        // Before the series.
        assert_eq!(iter.value_at_time(-5), vec![pair(0, 0.0)]);
        // After the series.
        assert_eq!(iter.value_at_time(i64::MAX - 1), vec![pair(5010, 501.0)]);
        // Between two samples inside one chunk.
        assert_eq!(iter.value_at_time(15), vec![pair(10, 1.0), pair(20, 2.0)]);
    }

    #[test]
    fn boundary_values_match_range_ends() {
        let samples: Vec<_> = (0..502).map(|i| pair(i * 10, i as f64)).collect();
        let (series, _rx, _pool) = series_with(&samples);
        let iter = series.new_iterator();

        let iv = Interval {
            oldest_inclusive: 95,
            newest_inclusive: 4321,
        };
        let range = iter.range_values(iv);
        let bounds = iter.boundary_values(iv);
        assert_eq!(bounds.first(), range.first());
        assert_eq!(bounds.last(), range.last());

        let empty = Interval {
            oldest_inclusive: 5011,
            newest_inclusive: 6000,
        };
        assert!(iter.boundary_values(empty).is_empty());
    }
}
