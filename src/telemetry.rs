use std::path::PathBuf;
use std::sync::Arc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::types::{Fingerprint, Timestamp};

/// Structured, in-process event hook for observability.
///
/// This crate is a library; it never prints or logs on its own. Embedders
/// provide an implementation that forwards these events to `tracing`, `log`,
/// metrics, or custom sinks. Background loops report their failures
/// exclusively through this hook.
pub trait EventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: StoreEvent);
}

/// Structured events emitted by the storage core.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    PersistWorkerStarted,
    PersistWorkerStopping,

    ChunkPersistFailed { fingerprint: Fingerprint, error: String },

    EvictionRun { chunks_evicted: usize, series_archived: usize },
    SeriesArchived { fingerprint: Fingerprint },
    SeriesUnarchived { fingerprint: Fingerprint },

    CheckpointCreated { path: PathBuf, series: usize },
    CheckpointFailed { error: String },
    /// An existing checkpoint failed validation; the engine cold-starts
    /// with indexes intact.
    CheckpointDiscarded { error: String },

    IndexBatchFailed { error: String },

    OutOfOrderSample { fingerprint: Fingerprint, timestamp: Timestamp },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: StoreEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation and in-process scraping.
///
/// ## Key properties
/// - Library-safe: emitting metrics is effectively a no-op until a recorder is installed.
/// - Serverless scraping: callers can render Prometheus exposition text in-process.
/// - Low operational overhead: a lightweight upkeep thread keeps histograms bounded.
pub mod store_metrics {
    use super::*;

    use ::metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    #[cfg(feature = "prometheus")]
    use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

    // --- metric names ---
    //
    // Notes:
    // - Counters are exposed as `<name>_total` by the Prometheus exporter.
    // - Histograms are exposed as `<name>_bucket`, `<name>_sum`, `<name>_count`.

    pub const SAMPLES_APPENDED: &str = "varve_samples_appended";
    pub const SAMPLES_OUT_OF_ORDER: &str = "varve_samples_out_of_order";
    pub const MEMORY_SERIES: &str = "varve_memory_series";
    pub const SERIES_ARCHIVED: &str = "varve_series_archived";
    pub const SERIES_UNARCHIVED: &str = "varve_series_unarchived";

    pub const CHUNKS_PERSISTED: &str = "varve_chunks_persisted";
    pub const CHUNK_PERSIST_FAILURES: &str = "varve_chunk_persist_failures";
    pub const PERSIST_DURATION_SECONDS: &str = "varve_chunk_persist_duration_seconds";
    pub const PERSIST_QUEUE_LENGTH: &str = "varve_persist_queue_length";

    pub const CHUNK_TRANSCODES: &str = "varve_chunk_transcodes";
    pub const CHUNKS_EVICTED: &str = "varve_chunks_evicted";

    pub const CHECKPOINT_DURATION_SECONDS: &str = "varve_checkpoint_duration_seconds";
    pub const CHECKPOINT_SERIES: &str = "varve_checkpoint_series";

    pub const PRELOAD_PINNED_CHUNKS: &str = "varve_preload_pinned_chunks";
    pub const PRELOAD_TIMEOUTS: &str = "varve_preload_timeouts";

    /// Handle to the in-process Prometheus recorder/scrape renderer.
    ///
    /// This does **not** start an HTTP server. Call [`InProcessPrometheus::render`] to scrape.
    #[cfg(feature = "prometheus")]
    pub struct InProcessPrometheus {
        handle: PrometheusHandle,
        stop: Arc<AtomicBool>,
        upkeep_thread: Mutex<Option<JoinHandle<()>>>,
    }

    #[cfg(feature = "prometheus")]
    impl std::fmt::Debug for InProcessPrometheus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("InProcessPrometheus")
                .field("stop", &self.stop)
                .field("upkeep_thread", &self.upkeep_thread)
                .finish()
        }
    }

    #[cfg(feature = "prometheus")]
    impl InProcessPrometheus {
        /// Installs a global Prometheus recorder (once per process) and starts a small upkeep thread.
        ///
        /// The upkeep thread periodically calls `run_upkeep()` to keep exporter internals healthy
        /// (e.g. histogram maintenance). This is required when using `install_recorder`.
        pub fn install(upkeep_interval: Duration) -> Result<Self, MetricsInitError> {
            describe_all();

            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .map_err(MetricsInitError::from_build_error)?;

            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            let handle_clone = handle.clone();
            let upkeep_thread = std::thread::Builder::new()
                .name("varve-metrics-upkeep".to_string())
                .spawn(move || {
                    while !stop_clone.load(Ordering::Relaxed) {
                        std::thread::sleep(upkeep_interval);
                        handle_clone.run_upkeep();
                    }
                })
                .map_err(|e| MetricsInitError::ThreadSpawn(e.to_string()))?;

            Ok(Self {
                handle,
                stop,
                upkeep_thread: Mutex::new(Some(upkeep_thread)),
            })
        }

        /// Renders the current metrics in the Prometheus text exposition format.
        pub fn render(&self) -> String {
            self.handle.render()
        }
    }

    #[cfg(feature = "prometheus")]
    impl Drop for InProcessPrometheus {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Ok(mut guard) = self.upkeep_thread.lock() {
                if let Some(t) = guard.take() {
                    let _ = t.join();
                }
            }
        }
    }

    #[cfg(feature = "prometheus")]
    #[derive(Debug, thiserror::Error)]
    pub enum MetricsInitError {
        #[error("metrics recorder already installed")]
        AlreadyInstalled,
        #[error("failed to install prometheus recorder: {0}")]
        Install(String),
        #[error("failed to spawn upkeep thread: {0}")]
        ThreadSpawn(String),
    }

    #[cfg(feature = "prometheus")]
    impl MetricsInitError {
        fn from_build_error(e: BuildError) -> Self {
            match e {
                BuildError::FailedToSetGlobalRecorder(_) => MetricsInitError::AlreadyInstalled,
                other => MetricsInitError::Install(other.to_string()),
            }
        }
    }

    #[inline]
    pub fn record_samples_appended(samples: u64) {
        if samples > 0 {
            ::metrics::counter!(SAMPLES_APPENDED).increment(samples);
        }
    }

    #[inline]
    pub fn record_out_of_order() {
        ::metrics::counter!(SAMPLES_OUT_OF_ORDER).increment(1);
    }

    #[inline]
    pub fn set_memory_series(series: usize) {
        ::metrics::gauge!(MEMORY_SERIES).set(series as f64);
    }

    #[inline]
    pub fn record_series_created() {
        ::metrics::gauge!(MEMORY_SERIES).increment(1.0);
    }

    #[inline]
    pub fn record_series_archived() {
        ::metrics::counter!(SERIES_ARCHIVED).increment(1);
        ::metrics::gauge!(MEMORY_SERIES).decrement(1.0);
    }

    #[inline]
    pub fn record_series_unarchived() {
        ::metrics::counter!(SERIES_UNARCHIVED).increment(1);
        ::metrics::gauge!(MEMORY_SERIES).increment(1.0);
    }

    #[inline]
    pub fn record_persist(duration: Duration, ok: bool) {
        ::metrics::histogram!(PERSIST_DURATION_SECONDS).record(duration.as_secs_f64());
        if ok {
            ::metrics::counter!(CHUNKS_PERSISTED).increment(1);
        } else {
            ::metrics::counter!(CHUNK_PERSIST_FAILURES).increment(1);
        }
    }

    #[inline]
    pub fn set_persist_queue_length(len: usize) {
        ::metrics::gauge!(PERSIST_QUEUE_LENGTH).set(len as f64);
    }

    #[inline]
    pub fn record_transcode() {
        ::metrics::counter!(CHUNK_TRANSCODES).increment(1);
    }

    #[inline]
    pub fn record_chunks_evicted(chunks: u64) {
        if chunks > 0 {
            ::metrics::counter!(CHUNKS_EVICTED).increment(chunks);
        }
    }

    #[inline]
    pub fn record_checkpoint(duration: Duration, series: usize) {
        ::metrics::histogram!(CHECKPOINT_DURATION_SECONDS).record(duration.as_secs_f64());
        ::metrics::gauge!(CHECKPOINT_SERIES).set(series as f64);
    }

    #[inline]
    pub fn record_preload_pins(chunks: u64) {
        if chunks > 0 {
            ::metrics::counter!(PRELOAD_PINNED_CHUNKS).increment(chunks);
        }
    }

    #[inline]
    pub fn record_preload_timeout() {
        ::metrics::counter!(PRELOAD_TIMEOUTS).increment(1);
    }

    fn describe_all() {
        // Counters
        describe_counter!(
            SAMPLES_APPENDED,
            Unit::Count,
            "Total number of samples accepted by append_samples."
        );
        describe_counter!(
            SAMPLES_OUT_OF_ORDER,
            Unit::Count,
            "Total number of samples rejected for violating per-series timestamp order."
        );
        describe_counter!(
            SERIES_ARCHIVED,
            Unit::Count,
            "Total number of series evicted from memory into the archived index."
        );
        describe_counter!(
            SERIES_UNARCHIVED,
            Unit::Count,
            "Total number of archived series pulled back into memory."
        );
        describe_counter!(
            CHUNKS_PERSISTED,
            Unit::Count,
            "Total number of chunks written to the chunk store."
        );
        describe_counter!(
            CHUNK_PERSIST_FAILURES,
            Unit::Count,
            "Total number of failed chunk writes (retried by the eviction loop)."
        );
        describe_counter!(
            CHUNK_TRANSCODES,
            Unit::Count,
            "Total number of chunks rewritten to a wider encoding."
        );
        describe_counter!(
            CHUNKS_EVICTED,
            Unit::Count,
            "Total number of chunk bodies dropped from memory."
        );
        describe_counter!(
            PRELOAD_PINNED_CHUNKS,
            Unit::Count,
            "Total number of chunks pinned by preload requests."
        );
        describe_counter!(
            PRELOAD_TIMEOUTS,
            Unit::Count,
            "Total number of preload requests that hit their deadline."
        );

        // Histograms
        describe_histogram!(
            PERSIST_DURATION_SECONDS,
            Unit::Seconds,
            "Duration of single-chunk writes in the persist worker, success or failure."
        );
        describe_histogram!(
            CHECKPOINT_DURATION_SECONDS,
            Unit::Seconds,
            "Time to write and durably install a series-map checkpoint."
        );

        // Gauges
        describe_gauge!(
            MEMORY_SERIES,
            Unit::Count,
            "Number of series currently held in memory."
        );
        describe_gauge!(
            PERSIST_QUEUE_LENGTH,
            Unit::Count,
            "Number of chunk persist requests waiting in the bounded queue."
        );
        describe_gauge!(
            CHECKPOINT_SERIES,
            Unit::Count,
            "Number of series covered by the most recent checkpoint."
        );
    }
}
