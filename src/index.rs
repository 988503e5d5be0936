//! Label index: persistent maps from fingerprints to metrics, label pairs to
//! fingerprint sets, label names to value sets, and the archived-series
//! membership index with time bounds.
//!
//! Metric (un)indexing is batched on a dedicated thread for ingest
//! throughput; readers merge the not-yet-committed batch so freshly created
//! series are immediately resolvable. [`MetricIndex::wait_for_indexing`] is
//! the barrier that drains the batch, used by tests and by archival
//! decisions that depend on index freshness.

use crate::error::{Result, StorageError};
use crate::kv::{read_length_prefixed, read_var_u64, write_length_prefixed, write_var_u64,
    KeyValueStore};
use crate::storage::lockcheck;
use crate::telemetry::{EventListener, StoreEvent};
use crate::types::{Fingerprint, Metric, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const KEY_METRIC: u8 = b'm';
const KEY_LABEL_PAIR: u8 = b'p';
const KEY_LABEL_NAME: u8 = b'l';
const KEY_ARCHIVED: u8 = b'a';

const BATCH_INTERVAL: Duration = Duration::from_millis(250);
const MAX_BATCH: usize = 1024;

#[derive(Debug, Clone)]
enum IndexOp {
    Index { fp: Fingerprint, metric: Metric },
    Unindex { fp: Fingerprint, metric: Metric },
}

enum IndexCommand {
    Op(IndexOp),
    Barrier(Sender<()>),
    Shutdown,
}

/// The persistent label index over a [`KeyValueStore`].
pub struct MetricIndex {
    store: Arc<dyn KeyValueStore>,
    tx: Mutex<Option<Sender<IndexCommand>>>,
    /// Mirror of operations sent to the batching thread but not yet
    /// committed. Readers overlay these on store contents.
    pending: Arc<Mutex<Vec<IndexOp>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MetricIndex {
    pub fn new(store: Arc<dyn KeyValueStore>, events: Arc<dyn EventListener>) -> MetricIndex {
        let (tx, rx) = mpsc::channel::<IndexCommand>();
        let pending = Arc::new(Mutex::new(Vec::new()));

        let store_clone = Arc::clone(&store);
        let pending_clone = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("varve-indexer".to_string())
            .spawn(move || {
                let mut batch: Vec<IndexOp> = Vec::new();
                let apply = |batch: &mut Vec<IndexOp>| {
                    if batch.is_empty() {
                        return;
                    }
                    let applied = batch.len();
                    match apply_ops(store_clone.as_ref(), batch) {
                        Ok(()) => {}
                        Err(e) => {
                            events.on_event(StoreEvent::IndexBatchFailed {
                                error: e.to_string(),
                            });
                        }
                    }
                    batch.clear();
                    // Applied (or dropped) operations leave the pending
                    // mirror even on failure, otherwise readers would trust
                    // them forever.
                    let mut pending = pending_clone.lock().unwrap_or_else(|e| e.into_inner());
                    let n = applied.min(pending.len());
                    pending.drain(..n);
                };

                loop {
                    match rx.recv_timeout(BATCH_INTERVAL) {
                        Ok(IndexCommand::Op(op)) => {
                            batch.push(op);
                            if batch.len() >= MAX_BATCH {
                                apply(&mut batch);
                            }
                        }
                        Ok(IndexCommand::Barrier(ack)) => {
                            apply(&mut batch);
                            let _ = ack.send(());
                        }
                        Ok(IndexCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            apply(&mut batch);
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            apply(&mut batch);
                        }
                    }
                }
            })
            .expect("failed to spawn indexer thread");

        MetricIndex {
            store,
            tx: Mutex::new(Some(tx)),
            pending,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn send(&self, cmd: IndexCommand) -> Result<()> {
        let tx = self.tx.lock()?;
        match tx.as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| StorageError::Closed),
            None => Err(StorageError::Closed),
        }
    }

    /// Adds `fp -> metric` and every label of the metric to the index.
    /// Idempotent; applied asynchronously.
    pub fn index_metric(&self, fp: Fingerprint, metric: Metric) -> Result<()> {
        self.submit(IndexOp::Index { fp, metric })
    }

    /// Removes `fp -> metric` and the metric's labels. Set entries that
    /// become empty are deleted. Applied asynchronously.
    pub fn unindex_metric(&self, fp: Fingerprint, metric: Metric) -> Result<()> {
        self.submit(IndexOp::Unindex { fp, metric })
    }

    /// The pending mirror and the channel must agree on operation order, so
    /// the push and the send happen under one lock.
    fn submit(&self, op: IndexOp) -> Result<()> {
        let _level = lockcheck::enter(lockcheck::INDEX);
        let mut pending = self.pending.lock()?;
        pending.push(op.clone());
        if let Err(e) = self.send(IndexCommand::Op(op)) {
            pending.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until every previously submitted indexing operation has been
    /// committed to the store.
    pub fn wait_for_indexing(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(IndexCommand::Barrier(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|_| StorageError::Background("indexer thread gone".to_string()))
    }

    pub fn get_fingerprints_for_label_pair(&self, name: &str, value: &str) -> Result<Vec<Fingerprint>> {
        // Snapshot the pending batch before reading the store: an operation
        // committed in between is then seen at least once, and the overlay
        // is idempotent.
        let pending = self.pending_snapshot()?;
        let mut set: BTreeSet<Fingerprint> = match self.store.get(&label_pair_key(name, value))? {
            Some(bytes) => decode_fingerprint_set(&bytes)?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        for op in pending {
            match op {
                IndexOp::Index { fp, metric } => {
                    if metric.get(name).map(String::as_str) == Some(value) {
                        set.insert(fp);
                    }
                }
                IndexOp::Unindex { fp, metric } => {
                    if metric.get(name).map(String::as_str) == Some(value) {
                        set.remove(&fp);
                    }
                }
            }
        }
        Ok(set.into_iter().collect())
    }

    pub fn get_label_values_for_label_name(&self, name: &str) -> Result<Vec<String>> {
        let pending = self.pending_snapshot()?;
        let mut values: BTreeSet<String> = match self.store.get(&label_name_key(name))? {
            Some(bytes) => decode_value_set(&bytes)?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        for op in pending {
            if let IndexOp::Index { metric, .. } = op {
                if let Some(v) = metric.get(name) {
                    values.insert(v.clone());
                }
            }
        }
        Ok(values.into_iter().collect())
    }

    /// The metric recorded for `fp`, from the pending batch or the store.
    pub fn get_metric_for_fingerprint(&self, fp: Fingerprint) -> Result<Option<Metric>> {
        for op in self.pending_snapshot()?.into_iter().rev() {
            match op {
                IndexOp::Index { fp: f, metric } if f == fp => return Ok(Some(metric)),
                IndexOp::Unindex { fp: f, .. } if f == fp => return Ok(None),
                _ => {}
            }
        }
        match self.store.get(&metric_key(fp))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Records `fp` as archived with its series time bounds. The metric
    /// entry is (re)written so unarchival works even across index loss of
    /// the batched entries.
    pub fn archive_metric(
        &self,
        fp: Fingerprint,
        metric: &Metric,
        first_time: Timestamp,
        last_time: Timestamp,
    ) -> Result<()> {
        let metric_bytes =
            bincode::serialize(metric).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.store.put(&metric_key(fp), &metric_bytes)?;
        let mut bounds = Vec::with_capacity(16);
        bounds.extend_from_slice(&first_time.to_le_bytes());
        bounds.extend_from_slice(&last_time.to_le_bytes());
        self.store.put(&archived_key(fp), &bounds)
    }

    /// Removes the archived marker. Returns whether it existed.
    pub fn unarchive_metric(&self, fp: Fingerprint) -> Result<bool> {
        self.store.delete(&archived_key(fp))
    }

    /// Time bounds of an archived series, if `fp` is archived.
    pub fn has_archived_metric(&self, fp: Fingerprint) -> Result<Option<(Timestamp, Timestamp)>> {
        match self.store.get(&archived_key(fp))? {
            Some(bytes) if bytes.len() == 16 => {
                let first = i64::from_le_bytes(bytes[..8].try_into().unwrap_or_default());
                let last = i64::from_le_bytes(bytes[8..].try_into().unwrap_or_default());
                Ok(Some((first, last)))
            }
            Some(_) => Err(StorageError::Corruption {
                details: "archived time-range entry has wrong length".to_string(),
                fingerprint: Some(fp),
                timestamp: None,
            }),
            None => Ok(None),
        }
    }

    pub fn get_archived_metric(&self, fp: Fingerprint) -> Result<Option<Metric>> {
        self.get_metric_for_fingerprint(fp)
    }

    pub fn close(&self) -> Result<()> {
        let tx = self.tx.lock()?.take();
        if let Some(tx) = tx {
            let _ = tx.send(IndexCommand::Shutdown);
        }
        if let Some(handle) = self.handle.lock()?.take() {
            handle
                .join()
                .map_err(|_| StorageError::Background("indexer thread panicked".to_string()))?;
        }
        self.store.close()
    }

    fn pending_snapshot(&self) -> Result<Vec<IndexOp>> {
        let _level = lockcheck::enter(lockcheck::INDEX);
        Ok(self.pending.lock()?.clone())
    }
}

/// Applies a batch of operations with read-modify-write staging, committed
/// as a single store batch.
fn apply_ops(store: &dyn KeyValueStore, ops: &[IndexOp]) -> Result<()> {
    // Staged view: key -> Some(new value) or None (delete).
    let mut staged: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();

    let read = |staged: &HashMap<Vec<u8>, Option<Vec<u8>>>, key: &[u8]| -> Result<Option<Vec<u8>>> {
        match staged.get(key) {
            Some(v) => Ok(v.clone()),
            None => store.get(key),
        }
    };

    for op in ops {
        match op {
            IndexOp::Index { fp, metric } => {
                let metric_bytes = bincode::serialize(metric)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                staged.insert(metric_key(*fp).to_vec(), Some(metric_bytes));
                for (name, value) in metric {
                    let pkey = label_pair_key(name, value);
                    let mut fps: BTreeSet<Fingerprint> = match read(&staged, &pkey)? {
                        Some(bytes) => decode_fingerprint_set(&bytes)?.into_iter().collect(),
                        None => BTreeSet::new(),
                    };
                    fps.insert(*fp);
                    staged.insert(pkey, Some(encode_fingerprint_set(&fps)));

                    let lkey = label_name_key(name);
                    let mut values: BTreeSet<String> = match read(&staged, &lkey)? {
                        Some(bytes) => decode_value_set(&bytes)?.into_iter().collect(),
                        None => BTreeSet::new(),
                    };
                    values.insert(value.clone());
                    staged.insert(lkey, Some(encode_value_set(&values)));
                }
            }
            IndexOp::Unindex { fp, metric } => {
                staged.insert(metric_key(*fp).to_vec(), None);
                for (name, value) in metric {
                    let pkey = label_pair_key(name, value);
                    let mut fps: BTreeSet<Fingerprint> = match read(&staged, &pkey)? {
                        Some(bytes) => decode_fingerprint_set(&bytes)?.into_iter().collect(),
                        None => BTreeSet::new(),
                    };
                    fps.remove(fp);
                    if fps.is_empty() {
                        staged.insert(pkey, None);
                        // Last series carrying this pair: the value leaves
                        // the label-name set as well.
                        let lkey = label_name_key(name);
                        let mut values: BTreeSet<String> = match read(&staged, &lkey)? {
                            Some(bytes) => decode_value_set(&bytes)?.into_iter().collect(),
                            None => BTreeSet::new(),
                        };
                        values.remove(value);
                        if values.is_empty() {
                            staged.insert(lkey, None);
                        } else {
                            staged.insert(lkey, Some(encode_value_set(&values)));
                        }
                    } else {
                        staged.insert(pkey, Some(encode_fingerprint_set(&fps)));
                    }
                }
            }
        }
    }

    let mut batch = store.new_batch();
    for (key, value) in staged {
        match value {
            Some(v) => batch.put(&key, &v),
            None => batch.delete(&key),
        }
    }
    store.commit(batch)
}

fn metric_key(fp: Fingerprint) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = KEY_METRIC;
    key[1..].copy_from_slice(&fp.0.to_be_bytes());
    key
}

fn archived_key(fp: Fingerprint) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = KEY_ARCHIVED;
    key[1..].copy_from_slice(&fp.0.to_be_bytes());
    key
}

fn label_pair_key(name: &str, value: &str) -> Vec<u8> {
    let mut key = vec![KEY_LABEL_PAIR];
    write_length_prefixed(&mut key, name.as_bytes());
    write_length_prefixed(&mut key, value.as_bytes());
    key
}

fn label_name_key(name: &str) -> Vec<u8> {
    let mut key = vec![KEY_LABEL_NAME];
    write_length_prefixed(&mut key, name.as_bytes());
    key
}

/// Fingerprint sets are stored as a varint count followed by sorted u64 LE
/// entries.
fn encode_fingerprint_set(fps: &BTreeSet<Fingerprint>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 * fps.len() + 4);
    write_var_u64(&mut buf, fps.len() as u64);
    for fp in fps {
        buf.extend_from_slice(&fp.0.to_le_bytes());
    }
    buf
}

fn decode_fingerprint_set(bytes: &[u8]) -> Result<Vec<Fingerprint>> {
    let mut cur = bytes;
    let count = read_var_u64(&mut cur)? as usize;
    let mut fps = Vec::with_capacity(count);
    for _ in 0..count {
        let mut word = [0u8; 8];
        std::io::Read::read_exact(&mut cur, &mut word)?;
        fps.push(Fingerprint(u64::from_le_bytes(word)));
    }
    Ok(fps)
}

/// Label value sets are stored as a varint count followed by
/// length-prefixed UTF-8 values, sorted.
fn encode_value_set(values: &BTreeSet<String>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_var_u64(&mut buf, values.len() as u64);
    for value in values {
        write_length_prefixed(&mut buf, value.as_bytes());
    }
    buf
}

fn decode_value_set(bytes: &[u8]) -> Result<Vec<String>> {
    let mut cur = bytes;
    let count = read_var_u64(&mut cur)? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let raw = read_length_prefixed(&mut cur)?;
        values.push(
            String::from_utf8(raw).map_err(|e| StorageError::Serialization(e.to_string()))?,
        );
    }
    Ok(values)
}
