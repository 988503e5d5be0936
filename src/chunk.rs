//! Chunk codec: fixed-size encoded runs of samples within one series.
//!
//! A chunk is a fixed-capacity record (default 1024 bytes) holding samples in
//! strict non-decreasing timestamp order, in one of two self-describing
//! variants:
//!
//! - *Delta-encoded*: a base timestamp and base value plus per-sample deltas,
//!   stored with the smallest width (1/2/4/8 bytes for timestamps; 1/2/4/8
//!   byte integers or 4/8 byte floats for values) that represents every
//!   sample losslessly. Widths only ever grow, via transcode.
//! - *Uncompressed*: 16 bytes per sample (8-byte LE timestamp, 8-byte LE
//!   IEEE-754 value), the fallback when no delta width is lossless.
//!
//! The on-disk record is `[1-byte variant tag][header][payload][padding]`,
//! exactly `chunk_size` bytes, so record N of a series file starts at byte
//! `N * chunk_size`.

use crate::error::{Result, StorageError};
use crate::telemetry::store_metrics;
use crate::types::{Interval, SamplePair, Timestamp};
use std::io::Write;
use std::sync::Mutex;

const DELTA_TAG: u8 = 0x00;
const UNCOMPRESSED_TAG: u8 = 0x01;

/// Bytes before the delta payload: tag, time width, value width, int flag,
/// count (u16), base time (i64), base value (f64).
const DELTA_HEADER_LEN: usize = 22;
/// Bytes before the uncompressed payload: tag, count (u16).
const UNCOMPRESSED_HEADER_LEN: usize = 3;
const UNCOMPRESSED_SAMPLE_LEN: usize = 16;

/// The smallest record size the codec accepts. Anything below this cannot
/// hold even a single uncompressed sample.
pub const MIN_CHUNK_SIZE: usize = 64;

/// Encoding variant for chunks. Used both as the record tag and as the
/// configuration hint for newly opened head chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVariant {
    DeltaEncoded,
    Uncompressed,
}

/// Pool of fixed-size payload buffers, reused across chunk opens, loads and
/// evictions so steady-state ingest does not allocate per chunk.
#[derive(Debug)]
pub struct ChunkBufferPool {
    buf_size: usize,
    max_pooled: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl ChunkBufferPool {
    pub fn new(buf_size: usize) -> ChunkBufferPool {
        ChunkBufferPool {
            buf_size,
            max_pooled: 1024,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size))
    }

    pub fn give(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A chunk in one of its two encodings.
#[derive(Debug, Clone)]
pub enum Chunk {
    Delta(DeltaChunk),
    Uncompressed(UncompressedChunk),
}

impl Chunk {
    /// Opens an empty chunk of the hinted variant.
    pub fn new(variant: ChunkVariant, chunk_size: usize, pool: &ChunkBufferPool) -> Chunk {
        match variant {
            ChunkVariant::DeltaEncoded => Chunk::Delta(DeltaChunk::open(chunk_size, pool)),
            ChunkVariant::Uncompressed => {
                Chunk::Uncompressed(UncompressedChunk::open(chunk_size, pool))
            }
        }
    }

    pub fn variant(&self) -> ChunkVariant {
        match self {
            Chunk::Delta(_) => ChunkVariant::DeltaEncoded,
            Chunk::Uncompressed(_) => ChunkVariant::Uncompressed,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Chunk::Delta(c) => c.count as usize,
            Chunk::Uncompressed(c) => c.count as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_size(&self) -> usize {
        match self {
            Chunk::Delta(c) => c.chunk_size,
            Chunk::Uncompressed(c) => c.chunk_size,
        }
    }

    /// Timestamp of the first sample. O(1).
    pub fn first_time(&self) -> Timestamp {
        match self {
            Chunk::Delta(c) => c.base_time,
            Chunk::Uncompressed(c) => c.sample_at(0).timestamp,
        }
    }

    /// Timestamp of the last sample. O(1).
    pub fn last_time(&self) -> Timestamp {
        match self {
            Chunk::Delta(c) => c.sample_at(c.count as usize - 1).timestamp,
            Chunk::Uncompressed(c) => c.sample_at(c.count as usize - 1).timestamp,
        }
    }

    pub fn sample_at(&self, i: usize) -> SamplePair {
        match self {
            Chunk::Delta(c) => c.sample_at(i),
            Chunk::Uncompressed(c) => c.sample_at(i),
        }
    }

    pub fn decode_all(&self) -> Vec<SamplePair> {
        (0..self.len()).map(|i| self.sample_at(i)).collect()
    }

    /// Appends a sample. Returns a list of one or more chunks:
    ///
    /// - `[self]` if the sample fits the current encoding and capacity;
    /// - `[self, open]` if capacity was exhausted: `self` is closed and the
    ///   returned open successor begins with the sample;
    /// - a transcoded replacement list when the delta encoding cannot
    ///   represent the sample. The caller replaces its chunk with the first
    ///   element and appends the rest as new chunks; only the last element
    ///   is open.
    ///
    /// Timestamps must be non-decreasing; an older timestamp is an
    /// `Encoding` error.
    pub fn add(mut self, sample: SamplePair, pool: &ChunkBufferPool) -> Result<Vec<Chunk>> {
        if !self.is_empty() && sample.timestamp < self.last_time() {
            return Err(StorageError::Encoding(format!(
                "sample timestamp {} precedes chunk end {}",
                sample.timestamp,
                self.last_time()
            )));
        }
        let outcome = match &mut self {
            Chunk::Delta(c) => c.try_push(sample),
            Chunk::Uncompressed(c) => {
                if c.try_push(sample) {
                    PushOutcome::Stored
                } else {
                    PushOutcome::Full
                }
            }
        };
        match outcome {
            PushOutcome::Stored => Ok(vec![self]),
            PushOutcome::Full => overflow(self, sample, pool),
            PushOutcome::NeedsTranscode => {
                let samples = self.decode_all();
                let dst = plan_transcode(&samples, sample, self.chunk_size(), pool);
                self.recycle(pool);
                store_metrics::record_transcode();
                transcode_and_add(dst, &samples, sample, pool)
            }
        }
    }

    /// Returns the payload buffer to the pool. Call when dropping a chunk
    /// body (eviction, transcode) rather than letting the allocation die.
    pub fn recycle(self, pool: &ChunkBufferPool) {
        match self {
            Chunk::Delta(c) => pool.give(c.payload),
            Chunk::Uncompressed(c) => pool.give(c.payload),
        }
    }

    /// Writes the self-describing fixed-size record for this chunk.
    pub fn marshal<W: Write>(&self, w: &mut W) -> Result<()> {
        let record = self.to_record();
        w.write_all(&record)?;
        Ok(())
    }

    pub fn to_record(&self) -> Vec<u8> {
        let chunk_size = self.chunk_size();
        let mut record = Vec::with_capacity(chunk_size);
        match self {
            Chunk::Delta(c) => {
                record.push(DELTA_TAG);
                record.push(c.time_width);
                record.push(c.value_width);
                record.push(c.value_is_int as u8);
                record.extend_from_slice(&c.count.to_le_bytes());
                record.extend_from_slice(&c.base_time.to_le_bytes());
                record.extend_from_slice(&c.base_value.to_le_bytes());
                record.extend_from_slice(&c.payload);
            }
            Chunk::Uncompressed(c) => {
                record.push(UNCOMPRESSED_TAG);
                record.extend_from_slice(&c.count.to_le_bytes());
                record.extend_from_slice(&c.payload);
            }
        }
        record.resize(chunk_size, 0);
        record
    }

    /// Decodes a full record. The record length defines the chunk size.
    pub fn unmarshal(record: &[u8], pool: &ChunkBufferPool) -> Result<Chunk> {
        let chunk_size = record.len();
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(corruption(format!("chunk record too short: {}", chunk_size)));
        }
        match record[0] {
            DELTA_TAG => {
                let time_width = record[1];
                let value_width = record[2];
                let value_is_int = match record[3] {
                    0 => false,
                    1 => true,
                    other => return Err(corruption(format!("bad int flag {}", other))),
                };
                if !matches!(time_width, 1 | 2 | 4 | 8) {
                    return Err(corruption(format!("bad time width {}", time_width)));
                }
                match (value_is_int, value_width) {
                    (true, 1 | 2 | 4 | 8) | (false, 4 | 8) => {}
                    _ => return Err(corruption(format!("bad value width {}", value_width))),
                }
                let count = u16::from_le_bytes([record[4], record[5]]);
                let base_time = i64::from_le_bytes(record[6..14].try_into().unwrap());
                let base_value = f64::from_le_bytes(record[14..22].try_into().unwrap());
                let sample_width = (time_width + value_width) as usize;
                let payload_len = count as usize * sample_width;
                if DELTA_HEADER_LEN + payload_len > chunk_size {
                    return Err(corruption(format!(
                        "delta payload of {} samples overflows record",
                        count
                    )));
                }
                let mut payload = pool.get();
                payload.extend_from_slice(&record[DELTA_HEADER_LEN..DELTA_HEADER_LEN + payload_len]);
                let chunk = DeltaChunk {
                    chunk_size,
                    time_width,
                    value_width,
                    value_is_int,
                    count,
                    base_time,
                    base_value,
                    payload,
                };
                let mut prev = chunk.base_time;
                for i in 0..count as usize {
                    let ts = chunk.sample_at(i).timestamp;
                    if ts < prev {
                        pool_give(pool, chunk.payload);
                        return Err(corruption(format!(
                            "non-monotonic timestamps in delta chunk at sample {}",
                            i
                        )));
                    }
                    prev = ts;
                }
                Ok(Chunk::Delta(chunk))
            }
            UNCOMPRESSED_TAG => {
                let count = u16::from_le_bytes([record[1], record[2]]);
                let payload_len = count as usize * UNCOMPRESSED_SAMPLE_LEN;
                if UNCOMPRESSED_HEADER_LEN + payload_len > chunk_size {
                    return Err(corruption(format!(
                        "uncompressed payload of {} samples overflows record",
                        count
                    )));
                }
                let mut payload = pool.get();
                payload.extend_from_slice(
                    &record[UNCOMPRESSED_HEADER_LEN..UNCOMPRESSED_HEADER_LEN + payload_len],
                );
                let chunk = UncompressedChunk {
                    chunk_size,
                    count,
                    payload,
                };
                let mut prev = i64::MIN;
                for i in 0..count as usize {
                    let ts = chunk.sample_at(i).timestamp;
                    if ts < prev {
                        pool_give(pool, chunk.payload);
                        return Err(corruption(format!(
                            "non-monotonic timestamps in uncompressed chunk at sample {}",
                            i
                        )));
                    }
                    prev = ts;
                }
                Ok(Chunk::Uncompressed(chunk))
            }
            other => Err(corruption(format!("unknown chunk variant tag {:#04x}", other))),
        }
    }

    /// Decodes only the time bounds of a record, without materializing
    /// samples. Used by the persistence layer to build chunk descriptors.
    pub fn read_header(record: &[u8]) -> Result<(Timestamp, Timestamp)> {
        if record.len() < MIN_CHUNK_SIZE {
            return Err(corruption(format!("chunk record too short: {}", record.len())));
        }
        match record[0] {
            DELTA_TAG => {
                let time_width = record[1] as usize;
                let value_width = record[2] as usize;
                let count = u16::from_le_bytes([record[4], record[5]]) as usize;
                if count == 0 {
                    return Err(corruption("empty delta chunk record".to_string()));
                }
                let base_time = i64::from_le_bytes(record[6..14].try_into().unwrap());
                let sample_width = time_width + value_width;
                let off = DELTA_HEADER_LEN + (count - 1) * sample_width;
                if off + time_width > record.len() || !matches!(time_width, 1 | 2 | 4 | 8) {
                    return Err(corruption("truncated delta chunk record".to_string()));
                }
                let dt = read_unsigned(&record[off..], time_width);
                Ok((base_time, base_time + dt as i64))
            }
            UNCOMPRESSED_TAG => {
                let count = u16::from_le_bytes([record[1], record[2]]) as usize;
                if count == 0 {
                    return Err(corruption("empty uncompressed chunk record".to_string()));
                }
                let last_off = UNCOMPRESSED_HEADER_LEN + (count - 1) * UNCOMPRESSED_SAMPLE_LEN;
                if last_off + 8 > record.len() {
                    return Err(corruption("truncated uncompressed chunk record".to_string()));
                }
                let first = i64::from_le_bytes(
                    record[UNCOMPRESSED_HEADER_LEN..UNCOMPRESSED_HEADER_LEN + 8]
                        .try_into()
                        .unwrap(),
                );
                let last = i64::from_le_bytes(record[last_off..last_off + 8].try_into().unwrap());
                Ok((first, last))
            }
            other => Err(corruption(format!("unknown chunk variant tag {:#04x}", other))),
        }
    }

    pub fn cursor(&self) -> ChunkCursor<'_> {
        self.cursor_capped(self.len())
    }

    /// A cursor restricted to the first `len` samples. Iterators use this to
    /// keep a fixed view of a head chunk that may keep growing.
    pub fn cursor_capped(&self, len: usize) -> ChunkCursor<'_> {
        ChunkCursor {
            chunk: self,
            len: len.min(self.len()),
        }
    }
}

fn corruption(details: String) -> StorageError {
    StorageError::Corruption {
        details,
        fingerprint: None,
        timestamp: None,
    }
}

fn pool_give(pool: &ChunkBufferPool, buf: Vec<u8>) {
    pool.give(buf);
}

/// Closes `full` and opens a successor beginning with `sample`.
fn overflow(full: Chunk, sample: SamplePair, pool: &ChunkBufferPool) -> Result<Vec<Chunk>> {
    let successor = Chunk::new(full.variant(), full.chunk_size(), pool);
    let mut out = successor.add(sample, pool)?;
    out.insert(0, full);
    Ok(out)
}

/// Chooses the destination chunk for a transcode: the minimal delta widths
/// that hold every existing sample plus the new one, or the uncompressed
/// variant when no delta width is lossless.
fn plan_transcode(
    samples: &[SamplePair],
    new: SamplePair,
    chunk_size: usize,
    pool: &ChunkBufferPool,
) -> Chunk {
    let base_time = samples.first().map_or(new.timestamp, |s| s.timestamp);
    let base_value = samples.first().map_or(new.value, |s| s.value);

    let mut time_width = 1u8;
    let mut all = samples.to_vec();
    all.push(new);
    for s in &all {
        time_width = time_width.max(unsigned_width((s.timestamp - base_time) as u64));
    }

    let mut int_width = 1u8;
    let mut ints_ok = true;
    let mut f32_ok = true;
    let mut f64_ok = true;
    for s in &all {
        match int_delta_width(base_value, s.value) {
            Some(w) => int_width = int_width.max(w),
            None => ints_ok = false,
        }
        if !f32_roundtrips(base_value, s.value) {
            f32_ok = false;
        }
        if !f64_roundtrips(base_value, s.value) {
            f64_ok = false;
        }
    }

    let encoding = if ints_ok {
        Some((int_width, true))
    } else if f32_ok {
        Some((4, false))
    } else if f64_ok {
        Some((8, false))
    } else {
        None
    };

    match encoding {
        Some((value_width, value_is_int)) => Chunk::Delta(DeltaChunk {
            chunk_size,
            time_width,
            value_width,
            value_is_int,
            count: 0,
            base_time: 0,
            base_value: 0.0,
            payload: pool.get(),
        }),
        None => Chunk::Uncompressed(UncompressedChunk::open(chunk_size, pool)),
    }
}

/// Re-adds every sample of a transcoded chunk, then the new sample, into
/// `dst`, spilling into successors on overflow. The returned list replaces
/// the source chunk; only the last element is open.
fn transcode_and_add(
    dst: Chunk,
    samples: &[SamplePair],
    new: SamplePair,
    pool: &ChunkBufferPool,
) -> Result<Vec<Chunk>> {
    let mut body: Vec<Chunk> = Vec::new();
    let mut head = dst;
    for s in samples.iter().copied().chain(std::iter::once(new)) {
        let mut out = head.add(s, pool)?;
        head = out.pop().ok_or_else(|| {
            StorageError::Encoding("chunk add returned no chunks".to_string())
        })?;
        body.append(&mut out);
    }
    body.push(head);
    Ok(body)
}

enum PushOutcome {
    Stored,
    Full,
    NeedsTranscode,
}

/// Delta-encoded chunk: base sample plus fixed-width per-sample deltas.
#[derive(Debug, Clone)]
pub struct DeltaChunk {
    chunk_size: usize,
    time_width: u8,
    value_width: u8,
    value_is_int: bool,
    count: u16,
    base_time: Timestamp,
    base_value: f64,
    payload: Vec<u8>,
}

impl DeltaChunk {
    fn open(chunk_size: usize, pool: &ChunkBufferPool) -> DeltaChunk {
        DeltaChunk {
            chunk_size,
            time_width: 1,
            value_width: 1,
            value_is_int: true,
            count: 0,
            base_time: 0,
            base_value: 0.0,
            payload: pool.get(),
        }
    }

    fn sample_width(&self) -> usize {
        (self.time_width + self.value_width) as usize
    }

    fn capacity(&self) -> usize {
        ((self.chunk_size - DELTA_HEADER_LEN) / self.sample_width()).min(u16::MAX as usize)
    }

    fn try_push(&mut self, sample: SamplePair) -> PushOutcome {
        if self.count == 0 {
            self.base_time = sample.timestamp;
            self.base_value = sample.value;
            self.encode(sample);
            return PushOutcome::Stored;
        }

        // A full chunk closes regardless of representability; the successor
        // starts fresh with the sample. Transcode only rewrites open chunks.
        if self.count as usize >= self.capacity() {
            return PushOutcome::Full;
        }

        let dt = (sample.timestamp - self.base_time) as u64;
        let fits_time = unsigned_width(dt) <= self.time_width;
        let fits_value = if self.value_is_int {
            matches!(int_delta_width(self.base_value, sample.value), Some(w) if w <= self.value_width)
        } else if self.value_width == 4 {
            f32_roundtrips(self.base_value, sample.value)
        } else {
            f64_roundtrips(self.base_value, sample.value)
        };

        if !fits_time || !fits_value {
            return PushOutcome::NeedsTranscode;
        }
        self.encode(sample);
        PushOutcome::Stored
    }

    fn encode(&mut self, sample: SamplePair) {
        let dt = (sample.timestamp - self.base_time) as u64;
        write_unsigned(&mut self.payload, dt, self.time_width as usize);
        if self.value_is_int {
            let dv = (sample.value - self.base_value) as i64;
            write_signed(&mut self.payload, dv, self.value_width as usize);
        } else if self.value_width == 4 {
            let dv = (sample.value - self.base_value) as f32;
            self.payload.extend_from_slice(&dv.to_le_bytes());
        } else {
            let dv = sample.value - self.base_value;
            self.payload.extend_from_slice(&dv.to_le_bytes());
        }
        self.count += 1;
    }

    fn sample_at(&self, i: usize) -> SamplePair {
        debug_assert!(i < self.count as usize);
        let off = i * self.sample_width();
        let tw = self.time_width as usize;
        let dt = read_unsigned(&self.payload[off..], tw);
        let value = if self.value_is_int {
            let dv = read_signed(&self.payload[off + tw..], self.value_width as usize);
            self.base_value + dv as f64
        } else if self.value_width == 4 {
            let bits: [u8; 4] = self.payload[off + tw..off + tw + 4].try_into().unwrap();
            self.base_value + f32::from_le_bytes(bits) as f64
        } else {
            let bits: [u8; 8] = self.payload[off + tw..off + tw + 8].try_into().unwrap();
            self.base_value + f64::from_le_bytes(bits)
        };
        SamplePair {
            timestamp: self.base_time + dt as i64,
            value,
        }
    }
}

/// Uncompressed chunk: raw 16-byte samples.
#[derive(Debug, Clone)]
pub struct UncompressedChunk {
    chunk_size: usize,
    count: u16,
    payload: Vec<u8>,
}

impl UncompressedChunk {
    fn open(chunk_size: usize, pool: &ChunkBufferPool) -> UncompressedChunk {
        UncompressedChunk {
            chunk_size,
            count: 0,
            payload: pool.get(),
        }
    }

    fn capacity(&self) -> usize {
        ((self.chunk_size - UNCOMPRESSED_HEADER_LEN) / UNCOMPRESSED_SAMPLE_LEN)
            .min(u16::MAX as usize)
    }

    fn try_push(&mut self, sample: SamplePair) -> bool {
        if self.count as usize >= self.capacity() {
            return false;
        }
        self.payload.extend_from_slice(&sample.timestamp.to_le_bytes());
        self.payload.extend_from_slice(&sample.value.to_le_bytes());
        self.count += 1;
        true
    }

    fn sample_at(&self, i: usize) -> SamplePair {
        debug_assert!(i < self.count as usize);
        let off = i * UNCOMPRESSED_SAMPLE_LEN;
        let timestamp = i64::from_le_bytes(self.payload[off..off + 8].try_into().unwrap());
        let value = f64::from_le_bytes(self.payload[off + 8..off + 16].try_into().unwrap());
        SamplePair { timestamp, value }
    }
}

/// Cursor over the samples of one chunk. All lookups binary-search by
/// timestamp, O(log n) in the chunk's sample count.
pub struct ChunkCursor<'a> {
    chunk: &'a Chunk,
    len: usize,
}

impl ChunkCursor<'_> {
    /// Index of the first sample with timestamp >= t, or `len` if none.
    fn first_at_or_after(&self, t: Timestamp) -> usize {
        let n = self.len;
        let mut lo = 0;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.chunk.sample_at(mid).timestamp < t {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// The two samples bracketing `t`; a single sample if `t` falls exactly
    /// on one; the nearest endpoint if `t` is outside the chunk.
    pub fn value_at_time(&self, t: Timestamp) -> Vec<SamplePair> {
        let n = self.len;
        if n == 0 {
            return Vec::new();
        }
        let idx = self.first_at_or_after(t);
        if idx == n {
            return vec![self.chunk.sample_at(n - 1)];
        }
        let at = self.chunk.sample_at(idx);
        if at.timestamp == t || idx == 0 {
            return vec![at];
        }
        vec![self.chunk.sample_at(idx - 1), at]
    }

    /// All samples with `oldest_inclusive <= ts <= newest_inclusive`, in order.
    pub fn range_values(&self, interval: Interval) -> Vec<SamplePair> {
        let n = self.len;
        let mut out = Vec::new();
        let mut idx = self.first_at_or_after(interval.oldest_inclusive);
        while idx < n {
            let s = self.chunk.sample_at(idx);
            if s.timestamp > interval.newest_inclusive {
                break;
            }
            out.push(s);
            idx += 1;
        }
        out
    }

    /// The first sample >= `oldest_inclusive` and the last sample <=
    /// `newest_inclusive`. One sample if they coincide, none if the interval
    /// misses the chunk.
    pub fn boundary_values(&self, interval: Interval) -> Vec<SamplePair> {
        let n = self.len;
        let first = self.first_at_or_after(interval.oldest_inclusive);
        if first == n {
            return Vec::new();
        }
        let mut last = self.first_at_or_after(interval.newest_inclusive);
        if last < n && self.chunk.sample_at(last).timestamp == interval.newest_inclusive {
            last += 1;
        }
        if last <= first {
            return Vec::new();
        }
        let first_sample = self.chunk.sample_at(first);
        if last - 1 == first {
            return vec![first_sample];
        }
        vec![first_sample, self.chunk.sample_at(last - 1)]
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        !self.chunk.is_empty() && self.chunk.first_time() <= t && t <= self.chunk.last_time()
    }
}

fn unsigned_width(v: u64) -> u8 {
    if v <= u8::MAX as u64 {
        1
    } else if v <= u16::MAX as u64 {
        2
    } else if v <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

/// The smallest signed width whose delta from `base` reproduces `v` exactly,
/// if any.
fn int_delta_width(base: f64, v: f64) -> Option<u8> {
    let dv = v - base;
    if !dv.is_finite() || dv != dv.trunc() {
        return None;
    }
    if dv < i64::MIN as f64 || dv > i64::MAX as f64 {
        return None;
    }
    let di = dv as i64;
    if base + di as f64 != v {
        return None;
    }
    Some(if di >= i8::MIN as i64 && di <= i8::MAX as i64 {
        1
    } else if di >= i16::MIN as i64 && di <= i16::MAX as i64 {
        2
    } else if di >= i32::MIN as i64 && di <= i32::MAX as i64 {
        4
    } else {
        8
    })
}

fn f32_roundtrips(base: f64, v: f64) -> bool {
    let dv = (v - base) as f32;
    base + dv as f64 == v
}

fn f64_roundtrips(base: f64, v: f64) -> bool {
    let dv = v - base;
    dv.is_finite() && base + dv == v
}

fn write_unsigned(buf: &mut Vec<u8>, v: u64, width: usize) {
    buf.extend_from_slice(&v.to_le_bytes()[..width]);
}

fn read_unsigned(buf: &[u8], width: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buf[..width]);
    u64::from_le_bytes(bytes)
}

fn write_signed(buf: &mut Vec<u8>, v: i64, width: usize) {
    buf.extend_from_slice(&v.to_le_bytes()[..width]);
}

fn read_signed(buf: &[u8], width: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&buf[..width]);
    // Sign-extend from the top bit of the stored width.
    if width < 8 && bytes[width - 1] & 0x80 != 0 {
        for b in bytes.iter_mut().skip(width) {
            *b = 0xff;
        }
    }
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ChunkBufferPool {
        ChunkBufferPool::new(1024)
    }

    fn pair(t: Timestamp, v: f64) -> SamplePair {
        SamplePair {
            timestamp: t,
            value: v,
        }
    }

    /// Appends samples, collecting closed chunks and returning the open head.
    fn add_all(pool: &ChunkBufferPool, samples: &[SamplePair]) -> Vec<Chunk> {
        let mut chunks = vec![Chunk::new(ChunkVariant::DeltaEncoded, 1024, pool)];
        for &s in samples {
            let head = chunks.pop().unwrap();
            chunks.extend(head.add(s, pool).unwrap());
        }
        chunks
    }

    fn decode_chunks(chunks: &[Chunk]) -> Vec<SamplePair> {
        chunks.iter().flat_map(|c| c.decode_all()).collect()
    }

    #[test]
    fn small_deltas_stay_in_one_narrow_chunk() {
        let pool = pool();
        let samples: Vec<_> = (0..100).map(|i| pair(i, i as f64)).collect();
        let chunks = add_all(&pool, &samples);
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Delta(c) => {
                assert_eq!(c.time_width, 1);
                assert_eq!(c.value_width, 1);
                assert!(c.value_is_int);
            }
            _ => panic!("expected delta chunk"),
        }
        assert_eq!(decode_chunks(&chunks), samples);
    }

    #[test]
    fn wide_timestamp_delta_forces_transcode() {
        let pool = pool();
        let samples = vec![pair(0, 1.0), pair(100, 2.0), pair(70_000, 3.0)];
        let chunks = add_all(&pool, &samples);
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            Chunk::Delta(c) => assert_eq!(c.time_width, 4),
            _ => panic!("expected delta chunk"),
        }
        assert_eq!(decode_chunks(&chunks), samples);
    }

    #[test]
    fn fractional_value_transcodes_to_float() {
        let pool = pool();
        let samples = vec![pair(0, 1.0), pair(10, 1.5)];
        let chunks = add_all(&pool, &samples);
        match &chunks[0] {
            Chunk::Delta(c) => assert!(!c.value_is_int),
            _ => panic!("expected delta chunk"),
        }
        assert_eq!(decode_chunks(&chunks), samples);
    }

    #[test]
    fn nan_value_falls_back_to_uncompressed() {
        let pool = pool();
        let samples = vec![pair(0, 1.0), pair(10, f64::NAN)];
        let chunks = add_all(&pool, &samples);
        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Chunk::Uncompressed(_)));
        let decoded = chunks[0].decode_all();
        assert_eq!(decoded[0], pair(0, 1.0));
        assert_eq!(decoded[1].timestamp, 10);
        assert!(decoded[1].value.is_nan());
    }

    #[test]
    fn overflow_closes_chunk_and_opens_successor() {
        let pool = pool();
        // 1-byte time and value widths hold (1024 - 22) / 2 = 501 samples.
        let samples: Vec<_> = (0..502).map(|i| pair(i / 3, 0.0)).collect();
        let chunks = add_all(&pool, &samples);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 501);
        assert_eq!(chunks[1].len(), 1);
        assert_eq!(decode_chunks(&chunks), samples);
        assert_eq!(chunks[1].first_time(), samples[501].timestamp);
    }

    #[test]
    fn transcode_preserves_samples_across_overflow() {
        let pool = pool();
        // Fill a narrow chunk almost fully, then force a wider width so the
        // transcoded payload no longer fits in one chunk.
        let mut samples: Vec<_> = (0..500).map(|i| pair(i, (i % 100) as f64)).collect();
        samples.push(pair(500, 1e9));
        let chunks = add_all(&pool, &samples);
        assert!(chunks.len() > 1);
        assert_eq!(decode_chunks(&chunks), samples);
    }

    #[test]
    fn equal_timestamps_are_accepted() {
        let pool = pool();
        let samples = vec![pair(5, 1.0), pair(5, 2.0), pair(6, 3.0)];
        let chunks = add_all(&pool, &samples);
        assert_eq!(decode_chunks(&chunks), samples);
    }

    #[test]
    fn decreasing_timestamp_is_rejected() {
        let pool = pool();
        let chunk = Chunk::new(ChunkVariant::DeltaEncoded, 1024, &pool);
        let mut chunks = chunk.add(pair(10, 1.0), &pool).unwrap();
        let err = chunks.pop().unwrap().add(pair(9, 1.0), &pool).unwrap_err();
        assert!(matches!(err, StorageError::Encoding(_)));
    }

    #[test]
    fn marshal_unmarshal_round_trip() {
        let pool = pool();
        let samples = vec![pair(0, 1.0), pair(15, 1.25), pair(30, -7.5)];
        let chunks = add_all(&pool, &samples);
        let record = chunks[0].to_record();
        assert_eq!(record.len(), 1024);
        let decoded = Chunk::unmarshal(&record, &pool).unwrap();
        assert_eq!(decoded.decode_all(), samples);
        assert_eq!(decoded.first_time(), 0);
        assert_eq!(decoded.last_time(), 30);
    }

    #[test]
    fn unmarshal_rejects_unknown_tag_and_bad_counts() {
        let pool = pool();
        let mut record = vec![0u8; 1024];
        record[0] = 0x7f;
        assert!(matches!(
            Chunk::unmarshal(&record, &pool),
            Err(StorageError::Corruption { .. })
        ));

        let chunks = add_all(&pool, &[pair(0, 1.0)]);
        let mut record = chunks[0].to_record();
        record[4] = 0xff;
        record[5] = 0xff;
        assert!(matches!(
            Chunk::unmarshal(&record, &pool),
            Err(StorageError::Corruption { .. })
        ));
    }

    #[test]
    fn read_header_matches_full_decode() {
        let pool = pool();
        let samples = vec![pair(100, 1.0), pair(2000, 2.0), pair(70_000, 2.5)];
        let chunks = add_all(&pool, &samples);
        for chunk in &chunks {
            let record = chunk.to_record();
            let (first, last) = Chunk::read_header(&record).unwrap();
            assert_eq!(first, chunk.first_time());
            assert_eq!(last, chunk.last_time());
        }
    }

    #[test]
    fn cursor_value_at_time_brackets() {
        let pool = pool();
        let samples = vec![pair(0, 1.0), pair(15, 1.0), pair(30, 0.0)];
        let chunks = add_all(&pool, &samples);
        let chunk = &chunks[0];

        assert_eq!(chunk.cursor().value_at_time(15), vec![pair(15, 1.0)]);
        assert_eq!(
            chunk.cursor().value_at_time(7),
            vec![pair(0, 1.0), pair(15, 1.0)]
        );
        assert_eq!(chunk.cursor().value_at_time(-5), vec![pair(0, 1.0)]);
        assert_eq!(chunk.cursor().value_at_time(99), vec![pair(30, 0.0)]);
    }

    #[test]
    fn cursor_range_and_boundary_values() {
        let pool = pool();
        let samples: Vec<_> = (0..10).map(|i| pair(i * 10, i as f64)).collect();
        let chunks = add_all(&pool, &samples);
        let cursor = chunks[0].cursor();

        let iv = Interval {
            oldest_inclusive: 25,
            newest_inclusive: 65,
        };
        assert_eq!(
            cursor.range_values(iv),
            vec![pair(30, 3.0), pair(40, 4.0), pair(50, 5.0), pair(60, 6.0)]
        );
        assert_eq!(cursor.boundary_values(iv), vec![pair(30, 3.0), pair(60, 6.0)]);

        let empty = Interval {
            oldest_inclusive: 91,
            newest_inclusive: 95,
        };
        assert!(cursor.range_values(empty).is_empty());
        assert!(cursor.boundary_values(empty).is_empty());

        let single = Interval {
            oldest_inclusive: 28,
            newest_inclusive: 32,
        };
        assert_eq!(cursor.boundary_values(single), vec![pair(30, 3.0)]);

        assert!(cursor.contains(0));
        assert!(cursor.contains(90));
        assert!(!cursor.contains(91));
    }

    #[test]
    fn recycle_returns_buffers_to_pool() {
        let pool = pool();
        let chunk = Chunk::new(ChunkVariant::DeltaEncoded, 1024, &pool);
        let chunks = chunk.add(pair(0, 1.0), &pool).unwrap();
        for c in chunks {
            c.recycle(&pool);
        }
        assert_eq!(pool.pooled(), 1);
        // The next open reuses the pooled buffer.
        let _chunk = Chunk::new(ChunkVariant::DeltaEncoded, 1024, &pool);
        assert_eq!(pool.pooled(), 0);
    }
}
