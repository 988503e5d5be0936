//! Disk persistence: append-only per-series chunk files and the checkpoint
//! of the series map with open head chunks.
//!
//! Chunk files are sharded by the first two hex digits of the fingerprint
//! (`ab/cdef0123456789.vdb`). Records are fixed-size, so chunk N of a series
//! is addressed directly at byte `N * chunk_size` without scanning.
//!
//! The checkpoint is a single file, replaced atomically via write-to-temp +
//! rename + directory sync. A checkpoint that fails validation is treated as
//! absent by the caller (cold start with indexes intact).

use crate::chunk::{Chunk, ChunkBufferPool};
use crate::error::{Result, StorageError};
use crate::kv::{read_framed, read_length_prefixed, read_var_i64, sync_dir, write_framed,
    write_length_prefixed, write_var_i64};
use crate::series::ChunkDesc;
use crate::types::{Fingerprint, Metric, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CHECKPOINT_MAGIC: &[u8; 4] = b"VRVC";
const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_FILE: &str = "heads.vck";
const SERIES_FILE_SUFFIX: &str = ".vdb";

/// One series entry of the checkpoint: identity, on-disk descriptor offset,
/// and the open head chunk when it is not in the chunk store yet.
#[derive(Debug)]
pub struct CheckpointEntry {
    pub fingerprint: Fingerprint,
    pub metric: Metric,
    pub chunk_descs_offset: i64,
    pub head_persisted: bool,
    pub head: Option<Chunk>,
}

/// Chunk-store and checkpoint persistence rooted at one directory.
#[derive(Debug)]
pub struct DiskPersistence {
    base_path: PathBuf,
    chunk_size: usize,
    truncate_corrupt: bool,
}

impl DiskPersistence {
    pub fn new<P: AsRef<Path>>(
        base_path: P,
        chunk_size: usize,
        truncate_corrupt: bool,
    ) -> Result<DiskPersistence> {
        fs::create_dir_all(&base_path)?;
        Ok(DiskPersistence {
            base_path: base_path.as_ref().to_path_buf(),
            chunk_size,
            truncate_corrupt,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn series_path(&self, fp: Fingerprint) -> PathBuf {
        let hex = fp.to_string();
        self.base_path
            .join(&hex[..2])
            .join(format!("{}{}", &hex[2..], SERIES_FILE_SUFFIX))
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.base_path.join(CHECKPOINT_FILE)
    }

    /// Appends a marshaled chunk to the series file and returns its 0-based
    /// record index. Writing the same closed chunk at the same position
    /// again would produce identical bytes; callers guarantee each closed
    /// chunk is appended exactly once, in series order.
    pub fn persist_chunk(&self, fp: Fingerprint, chunk: &Chunk) -> Result<usize> {
        let path = self.series_path(fp);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        if len % self.chunk_size as u64 != 0 {
            return Err(self.series_corruption(
                fp,
                format!("series file length {} not a record multiple", len),
            ));
        }
        let index = (len / self.chunk_size as u64) as usize;
        let mut writer = BufWriter::new(file);
        chunk.marshal(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(index)
    }

    /// Loads the chunks at the given indexes (relative to `index_offset`).
    pub fn load_chunks(
        &self,
        fp: Fingerprint,
        indexes: &[usize],
        index_offset: usize,
        pool: &ChunkBufferPool,
    ) -> Result<Vec<Chunk>> {
        let path = self.series_path(fp);
        let mut file = File::open(&path)?;
        let mut record = vec![0u8; self.chunk_size];
        let mut chunks = Vec::with_capacity(indexes.len());
        for &index in indexes {
            let offset = (index_offset + index) as u64 * self.chunk_size as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut record).map_err(|e| {
                if e.kind() == ErrorKind::UnexpectedEof {
                    self.series_corruption(
                        fp,
                        format!("chunk record {} past end of series file", index_offset + index),
                    )
                } else {
                    StorageError::Io(e)
                }
            })?;
            let chunk = Chunk::unmarshal(&record, pool)
                .map_err(|e| self.attach_fingerprint(e, fp))?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    /// Streams the series file, decoding only record headers, and returns
    /// evicted chunk descriptors for every chunk whose last sample is older
    /// than `before`. Stops at the first record at or past `before`.
    pub fn load_chunk_descs(
        &self,
        fp: Fingerprint,
        before: Timestamp,
    ) -> Result<Vec<Arc<ChunkDesc>>> {
        let path = self.series_path(fp);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len % self.chunk_size as u64 != 0 && !self.truncate_corrupt {
            return Err(self.series_corruption(
                fp,
                format!("series file length {} not a record multiple", len),
            ));
        }

        let mut reader = BufReader::new(file);
        let mut record = vec![0u8; self.chunk_size];
        let mut descs = Vec::new();
        let mut offset = 0u64;
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            match Chunk::read_header(&record) {
                Ok((first_time, last_time)) => {
                    if last_time >= before {
                        break;
                    }
                    descs.push(Arc::new(ChunkDesc::new_evicted(first_time, last_time)));
                }
                Err(e) => {
                    if self.truncate_corrupt {
                        self.truncate_series_file(fp, offset)?;
                        break;
                    }
                    return Err(self.attach_fingerprint(e, fp));
                }
            }
            offset += self.chunk_size as u64;
        }
        Ok(descs)
    }

    /// Rewrites the series file without the leading chunks whose last sample
    /// is older than `before`. Removes the file when nothing remains.
    /// Returns the number of dropped chunks.
    pub fn drop_chunks(&self, fp: Fingerprint, before: Timestamp) -> Result<usize> {
        let path = self.series_path(fp);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut record = vec![0u8; self.chunk_size];
        let mut kept: Vec<u8> = Vec::new();
        let mut dropped = 0usize;
        let mut keeping = false;
        loop {
            match reader.read_exact(&mut record) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if !keeping {
                let (_, last_time) =
                    Chunk::read_header(&record).map_err(|e| self.attach_fingerprint(e, fp))?;
                if last_time < before {
                    dropped += 1;
                    continue;
                }
                keeping = true;
            }
            kept.extend_from_slice(&record);
        }
        if dropped == 0 {
            return Ok(0);
        }

        if kept.is_empty() {
            fs::remove_file(&path)?;
            return Ok(dropped);
        }
        let tmp = path.with_extension("vdb.tmp");
        let mut out = File::create(&tmp)?;
        out.write_all(&kept)?;
        out.sync_data()?;
        fs::rename(&tmp, &path)?;
        if let Some(dir) = path.parent() {
            sync_dir(dir)?;
        }
        Ok(dropped)
    }

    /// Writes the checkpoint atomically: series identities, descriptor
    /// offsets, and the bytes of every head chunk that is not yet in the
    /// chunk store.
    pub fn checkpoint_series_map_and_heads(&self, entries: &[CheckpointEntry]) -> Result<PathBuf> {
        let mut payload = Vec::new();
        for entry in entries {
            payload.extend_from_slice(&entry.fingerprint.0.to_le_bytes());
            let metric_bytes = bincode::serialize(&entry.metric)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            write_length_prefixed(&mut payload, &metric_bytes);
            write_var_i64(&mut payload, entry.chunk_descs_offset);
            payload.push(entry.head_persisted as u8);
            if !entry.head_persisted {
                let head = entry.head.as_ref().ok_or_else(|| {
                    StorageError::Background(format!(
                        "series {} has unpersisted head but no chunk bytes",
                        entry.fingerprint
                    ))
                })?;
                payload.extend_from_slice(&head.to_record());
            }
        }

        let path = self.checkpoint_path();
        let tmp = path.with_extension("vck.tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(CHECKPOINT_MAGIC)?;
        out.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
        write_framed(&mut out, &payload)?;
        out.flush()?;
        out.get_ref().sync_data()?;
        drop(out);
        fs::rename(&tmp, &path)?;
        sync_dir(&self.base_path)?;
        Ok(path)
    }

    /// Loads the series map from the checkpoint. `Ok(None)` means no
    /// checkpoint exists (cold start). Validation failures are errors; the
    /// caller decides whether to fall back to a cold start.
    pub fn load_series_map_and_heads(
        &self,
        pool: &ChunkBufferPool,
    ) -> Result<Option<Vec<CheckpointEntry>>> {
        let path = self.checkpoint_path();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != CHECKPOINT_MAGIC {
            return Err(checkpoint_corruption(format!(
                "bad checkpoint magic {:02x?}",
                magic
            )));
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != CHECKPOINT_VERSION {
            return Err(checkpoint_corruption(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }
        let payload = read_framed(&mut reader)?
            .ok_or_else(|| checkpoint_corruption("checkpoint body missing or torn".to_string()))?;

        let mut cur: &[u8] = &payload;
        let mut entries = Vec::new();
        while !cur.is_empty() {
            let mut fp_bytes = [0u8; 8];
            cur.read_exact(&mut fp_bytes)?;
            let fingerprint = Fingerprint(u64::from_le_bytes(fp_bytes));
            let metric_bytes = read_length_prefixed(&mut cur)?;
            let metric: Metric = bincode::deserialize(&metric_bytes)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let chunk_descs_offset = read_var_i64(&mut cur)?;
            let mut flag = [0u8; 1];
            cur.read_exact(&mut flag)?;
            let head_persisted = match flag[0] {
                0 => false,
                1 => true,
                other => {
                    return Err(checkpoint_corruption(format!(
                        "bad head-persisted flag {}",
                        other
                    )))
                }
            };
            let head = if head_persisted {
                None
            } else {
                if cur.len() < self.chunk_size {
                    return Err(checkpoint_corruption(
                        "checkpoint truncated inside head chunk".to_string(),
                    ));
                }
                let (record, rest) = cur.split_at(self.chunk_size);
                cur = rest;
                Some(Chunk::unmarshal(record, pool)?)
            };
            entries.push(CheckpointEntry {
                fingerprint,
                metric,
                chunk_descs_offset,
                head_persisted,
                head,
            });
        }
        Ok(Some(entries))
    }

    /// Number of whole records currently in the series file.
    pub fn chunk_count(&self, fp: Fingerprint) -> Result<usize> {
        match fs::metadata(self.series_path(fp)) {
            Ok(md) => Ok((md.len() / self.chunk_size as u64) as usize),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn truncate_series_file(&self, fp: Fingerprint, keep_bytes: u64) -> Result<()> {
        let path = self.series_path(fp);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(keep_bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn series_corruption(&self, fp: Fingerprint, details: String) -> StorageError {
        StorageError::Corruption {
            details,
            fingerprint: Some(fp),
            timestamp: None,
        }
    }

    fn attach_fingerprint(&self, err: StorageError, fp: Fingerprint) -> StorageError {
        match err {
            StorageError::Corruption {
                details, timestamp, ..
            } => StorageError::Corruption {
                details,
                fingerprint: Some(fp),
                timestamp,
            },
            other => other,
        }
    }
}

fn checkpoint_corruption(details: String) -> StorageError {
    StorageError::Corruption {
        details,
        fingerprint: None,
        timestamp: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkVariant;
    use crate::types::SamplePair;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const CHUNK_SIZE: usize = 1024;

    fn pair(t: Timestamp, v: f64) -> SamplePair {
        SamplePair {
            timestamp: t,
            value: v,
        }
    }

    fn chunk_with(pool: &ChunkBufferPool, samples: &[SamplePair]) -> Chunk {
        let mut chunks = vec![Chunk::new(ChunkVariant::DeltaEncoded, CHUNK_SIZE, pool)];
        for &s in samples {
            let head = chunks.pop().unwrap();
            chunks.extend(head.add(s, pool).unwrap());
        }
        assert_eq!(chunks.len(), 1, "test samples must fit one chunk");
        chunks.pop().unwrap()
    }

    fn metric(name: &str) -> Metric {
        let mut m = HashMap::new();
        m.insert("__name__".to_string(), name.to_string());
        m
    }

    #[test]
    fn persist_and_load_by_index() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let fp = Fingerprint(0xab12_cd34_ef56_0078);

        let c0 = chunk_with(&pool, &[pair(0, 1.0), pair(10, 2.0)]);
        let c1 = chunk_with(&pool, &[pair(20, 3.0), pair(30, 4.0)]);
        assert_eq!(p.persist_chunk(fp, &c0).unwrap(), 0);
        assert_eq!(p.persist_chunk(fp, &c1).unwrap(), 1);
        assert_eq!(p.chunk_count(fp).unwrap(), 2);

        let loaded = p.load_chunks(fp, &[1, 0], 0, &pool).unwrap();
        assert_eq!(loaded[0].decode_all(), c1.decode_all());
        assert_eq!(loaded[1].decode_all(), c0.decode_all());

        // Relative indexes against an offset.
        let loaded = p.load_chunks(fp, &[0], 1, &pool).unwrap();
        assert_eq!(loaded[0].decode_all(), c1.decode_all());
    }

    #[test]
    fn persisting_identical_chunks_yields_identical_records() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let fp = Fingerprint(7);

        let chunk = chunk_with(&pool, &[pair(0, 1.0), pair(10, 2.0)]);
        let i0 = p.persist_chunk(fp, &chunk).unwrap();
        let i1 = p.persist_chunk(fp, &chunk).unwrap();
        assert_eq!((i0, i1), (0, 1));

        let loaded = p.load_chunks(fp, &[0, 1], 0, &pool).unwrap();
        assert_eq!(loaded[0].to_record(), loaded[1].to_record());
    }

    #[test]
    fn load_chunk_descs_stops_before_time() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let fp = Fingerprint(9);

        p.persist_chunk(fp, &chunk_with(&pool, &[pair(0, 1.0), pair(10, 1.0)]))
            .unwrap();
        p.persist_chunk(fp, &chunk_with(&pool, &[pair(20, 1.0), pair(30, 1.0)]))
            .unwrap();
        p.persist_chunk(fp, &chunk_with(&pool, &[pair(40, 1.0), pair(50, 1.0)]))
            .unwrap();

        let descs = p.load_chunk_descs(fp, 40).unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].first_time(), 0);
        assert_eq!(descs[0].last_time(), 10);
        assert_eq!(descs[1].last_time(), 30);
        assert!(!descs[0].with(|i| i.chunk.is_some()));

        assert!(p.load_chunk_descs(Fingerprint(404), 100).unwrap().is_empty());
    }

    #[test]
    fn drop_chunks_rewrites_prefix() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let fp = Fingerprint(11);

        p.persist_chunk(fp, &chunk_with(&pool, &[pair(0, 1.0), pair(10, 1.0)]))
            .unwrap();
        p.persist_chunk(fp, &chunk_with(&pool, &[pair(20, 1.0), pair(30, 1.0)]))
            .unwrap();

        assert_eq!(p.drop_chunks(fp, 15).unwrap(), 1);
        assert_eq!(p.chunk_count(fp).unwrap(), 1);
        let remaining = p.load_chunks(fp, &[0], 0, &pool).unwrap();
        assert_eq!(remaining[0].first_time(), 20);

        // Dropping everything removes the file.
        assert_eq!(p.drop_chunks(fp, 1000).unwrap(), 1);
        assert_eq!(p.chunk_count(fp).unwrap(), 0);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);

        let head = chunk_with(&pool, &[pair(100, 0.5), pair(115, 0.75)]);
        let entries = vec![
            CheckpointEntry {
                fingerprint: Fingerprint(1),
                metric: metric("up"),
                chunk_descs_offset: 0,
                head_persisted: false,
                head: Some(head.clone()),
            },
            CheckpointEntry {
                fingerprint: Fingerprint(2),
                metric: metric("down"),
                chunk_descs_offset: -1,
                head_persisted: true,
                head: None,
            },
        ];
        p.checkpoint_series_map_and_heads(&entries).unwrap();

        let loaded = p.load_series_map_and_heads(&pool).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].fingerprint, Fingerprint(1));
        assert_eq!(loaded[0].metric, metric("up"));
        assert!(!loaded[0].head_persisted);
        assert_eq!(
            loaded[0].head.as_ref().unwrap().decode_all(),
            head.decode_all()
        );
        assert_eq!(loaded[1].chunk_descs_offset, -1);
        assert!(loaded[1].head_persisted);
        assert!(loaded[1].head.is_none());
    }

    #[test]
    fn missing_checkpoint_is_cold_start() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        assert!(p.load_series_map_and_heads(&pool).unwrap().is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let p = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);

        p.checkpoint_series_map_and_heads(&[]).unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            p.load_series_map_and_heads(&pool),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn corrupt_record_fails_or_truncates_per_config() {
        let dir = TempDir::new().unwrap();
        let pool = ChunkBufferPool::new(CHUNK_SIZE);
        let fp = Fingerprint(21);

        let strict = DiskPersistence::new(dir.path(), CHUNK_SIZE, false).unwrap();
        strict
            .persist_chunk(fp, &chunk_with(&pool, &[pair(0, 1.0), pair(10, 1.0)]))
            .unwrap();
        strict
            .persist_chunk(fp, &chunk_with(&pool, &[pair(20, 1.0), pair(30, 1.0)]))
            .unwrap();

        // Corrupt the second record's variant tag.
        let path = strict.series_path(fp);
        let mut bytes = fs::read(&path).unwrap();
        bytes[CHUNK_SIZE] = 0x77;
        fs::write(&path, &bytes).unwrap();

        let err = strict.load_chunk_descs(fp, Timestamp::MAX).unwrap_err();
        match err {
            StorageError::Corruption { fingerprint, .. } => assert_eq!(fingerprint, Some(fp)),
            other => panic!("unexpected error: {other}"),
        }

        let lenient = DiskPersistence::new(dir.path(), CHUNK_SIZE, true).unwrap();
        let descs = lenient.load_chunk_descs(fp, Timestamp::MAX).unwrap();
        assert_eq!(descs.len(), 1);
        assert_eq!(lenient.chunk_count(fp).unwrap(), 1);
    }
}
