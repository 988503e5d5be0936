#![doc = r#"
varve: tiered time-series storage core

A storage engine for numeric metric samples. Producers push streams of
`(metric, timestamp, value)` samples; consumers resolve label matchers to
series and run chronologically ordered range queries over them. The engine
holds recent data in memory as compact column-oriented chunks, spills closed
chunks to append-only per-series files through a bounded persist queue,
periodically checkpoints open heads for crash recovery, evicts cold chunk
bodies, archives idle series into a persistent label index, and pins
query-scoped snapshots of chunks via preloaders.

Key entry points:
- [`MemorySeriesStorage`]: the engine handle (`open`, `serve`, `close`).
- [`StorageConfig`]: tuning knobs (chunk size, queue depth, TTL, intervals).
- [`Preloader`] and [`SeriesIterator`]: the query-side protocol.

The query/expression evaluator, rule engine, HTTP surface and operator
tooling are clients of this crate, not part of it.
"#]

pub mod chunk;
pub mod error;
pub mod index;
pub mod kv;
pub mod matcher;
pub mod persistence;
pub mod preload;
pub mod series;
pub mod storage;
pub mod telemetry;
pub mod types;

/// The engine handle: series map, persist queue, background maintenance.
pub use crate::storage::{MemorySeriesStorage, StorageConfig};
/// Error type for storage operations.
pub use crate::error::{Result, StorageError};
/// Chunk encoding variants and the shared buffer pool.
pub use crate::chunk::{Chunk, ChunkBufferPool, ChunkVariant};
/// Label matchers used to resolve queries to fingerprints.
pub use crate::matcher::{LabelMatcher, MatchType};
/// Pinning protocol for query snapshots.
pub use crate::preload::Preloader;
/// Per-series iterator over pinned chunks.
pub use crate::series::SeriesIterator;
/// Structured event hook for observability.
pub use crate::telemetry::{noop_event_listener, EventListener, StoreEvent};
/// Core data model types.
pub use crate::types::{
    Fingerprint, Interval, Metric, Sample, SamplePair, Timestamp, Value, METRIC_NAME_LABEL,
};

/// Default bytes per chunk record.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Default capacity of the bounded persist queue.
pub const DEFAULT_PERSIST_QUEUE_CAPACITY: usize = 1024;
