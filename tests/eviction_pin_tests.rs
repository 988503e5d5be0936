//! Eviction, pinning and archival: cold chunk bodies are dropped only when
//! persisted and unpinned; fully evicted series move to the archived index
//! and come back on demand.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use varve::{
    Fingerprint, Interval, MemorySeriesStorage, Metric, Sample, StorageConfig, StorageError,
    METRIC_NAME_LABEL,
};

fn metric(name: &str) -> Metric {
    let mut m = HashMap::new();
    m.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
    m
}

fn sample(m: &Metric, t: i64, v: f64) -> Sample {
    Sample {
        metric: m.clone(),
        timestamp: t,
        value: v,
    }
}

/// Sample timestamps in these tests are near the epoch, so they are far
/// older than `now - chunk_ttl` for any reasonable TTL: every unpinned,
/// persisted chunk is eligible for eviction from the start.
fn open_storage(dir: &TempDir) -> std::sync::Arc<MemorySeriesStorage> {
    let storage = MemorySeriesStorage::open(StorageConfig::new(dir.path())).unwrap();
    let (ready_tx, ready_rx) = mpsc::channel();
    storage.serve(ready_tx).unwrap();
    ready_rx.recv().unwrap();
    storage
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(20));
    }
}

/// Three chunks: two closed (0..=500, 501..=1001), one open head (1002..).
fn fill_three_chunks(storage: &MemorySeriesStorage, m: &Metric) {
    let samples: Vec<Sample> = (0..1004).map(|i| sample(m, i, 0.0)).collect();
    storage.append_samples(&samples).unwrap();
}

#[test]
fn eviction_drops_unpinned_chunks_and_keeps_pinned_ones() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let m = metric("pinned_series");
    let fp = Fingerprint::from_metric(&m);
    fill_three_chunks(&storage, &m);

    // Pin everything from the second chunk on; the first chunk stays
    // unpinned and is evicted as soon as the worker has persisted it.
    let mut preloader = storage.new_preloader();
    preloader.preload_range(fp, 501, i64::MAX).unwrap();

    let mut evicted = 0usize;
    wait_until("first chunk eviction", || {
        evicted += storage.evict_now().unwrap().0;
        evicted >= 1
    });

    let iter = storage.new_iterator(fp).unwrap();
    let visible = iter.range_values(Interval {
        oldest_inclusive: 0,
        newest_inclusive: i64::MAX,
    });
    // The evicted first chunk is no longer resident; pinned data is intact.
    assert_eq!(visible.first().map(|s| s.timestamp), Some(501));
    assert_eq!(visible.len(), 1004 - 501);
    drop(iter);

    // Releasing the pins makes the rest evictable, and the series is
    // eventually archived.
    preloader.close();
    wait_until("series archival", || storage.evict_now().unwrap().1 >= 1);
    assert!(matches!(
        storage.new_iterator(fp),
        Err(StorageError::UnknownFingerprint(_))
    ));
    // The metric itself survives in the index.
    assert_eq!(storage.get_metric_for_fingerprint(fp).unwrap(), Some(m));

    storage.close().unwrap();
}

#[test]
fn preload_restores_archived_series_from_disk() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let m = metric("archived_series");
    let fp = Fingerprint::from_metric(&m);
    fill_three_chunks(&storage, &m);

    wait_until("series archival", || storage.evict_now().unwrap().1 >= 1);

    // Preloading unarchives the series and loads every chunk back.
    let mut preloader = storage.new_preloader();
    preloader.preload_range(fp, 0, i64::MAX).unwrap();
    let iter = storage.new_iterator(fp).unwrap();
    let all = iter.range_values(Interval {
        oldest_inclusive: 0,
        newest_inclusive: i64::MAX,
    });
    assert_eq!(all.len(), 1004);
    assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    preloader.close();
    storage.close().unwrap();
}

#[test]
fn append_unarchives_a_series() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let m = metric("reappearing_series");
    let fp = Fingerprint::from_metric(&m);
    fill_three_chunks(&storage, &m);

    wait_until("series archival", || storage.evict_now().unwrap().1 >= 1);

    // A new sample brings the series back into memory.
    storage.append_samples(&[sample(&m, 5000, 7.0)]).unwrap();
    let iter = storage.new_iterator(fp).unwrap();
    let recent = iter.range_values(Interval {
        oldest_inclusive: 4000,
        newest_inclusive: 6000,
    });
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].value, 7.0);
    drop(iter);

    // The on-disk history is reachable again through a preload.
    let mut preloader = storage.new_preloader();
    preloader.preload_range(fp, 0, i64::MAX).unwrap();
    let iter = storage.new_iterator(fp).unwrap();
    let all = iter.range_values(Interval {
        oldest_inclusive: 0,
        newest_inclusive: i64::MAX,
    });
    assert_eq!(all.len(), 1005);
    assert_eq!(all.last().map(|s| s.value), Some(7.0));

    preloader.close();
    storage.close().unwrap();
}

#[test]
fn preloading_an_unknown_fingerprint_fails() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let mut preloader = storage.new_preloader();
    assert!(matches!(
        preloader.preload_range(Fingerprint(42), 0, 100),
        Err(StorageError::UnknownFingerprint(_))
    ));
    drop(preloader);
    storage.close().unwrap();
}

#[test]
fn dropped_preloader_releases_pins() {
    let dir = TempDir::new().unwrap();
    let storage = open_storage(&dir);
    let m = metric("auto_release");
    let fp = Fingerprint::from_metric(&m);
    fill_three_chunks(&storage, &m);

    {
        let mut preloader = storage.new_preloader();
        preloader.preload_range(fp, 0, i64::MAX).unwrap();
        // Dropped without close(): pins must still be released.
    }

    wait_until("series archival after drop", || {
        storage.evict_now().unwrap().1 >= 1
    });
    storage.close().unwrap();
}
