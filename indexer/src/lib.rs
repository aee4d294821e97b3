//! The indexer service.
//!
//! A long-running consumer that polls a topic for [`BatchInfo`]
//! notifications, streams the referenced chunk files from storage with a
//! wire-level field filter, buffers chunks across notification batches,
//! flushes them transactionally into a [`QueryStore`], and acknowledges
//! only batch messages whose every chunk has been flushed.

mod buffer;
mod store;

pub use buffer::{BatchKey, ChunkBuffer, FlushResult};
pub use store::{rows_from_chunk, CellRow, MemoryQueryStore, QueryStore, TickRow};

use evochora_app_config::IndexerConfig;
use evochora_channel::{bounded, Receiver, TryRecvError, SIGNAL_CHANNEL_SIZE};
use evochora_logger::{debug, info, warn};
use evochora_notify::{AckHandle, NotifyError, TopicResource};
use evochora_protocol::{BatchInfo, ChunkFilter, SimulationMetadata, Topology as WireTopology};
use evochora_stop_handler::StopHandler;
use evochora_storage::{read_message, StorageError, StorageResource};
use evochora_types::{Shape, Topology};
use parking_lot::Mutex;
use prost::Message;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Indexer failures.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Storage read failure; the current iteration fails and the message
    /// is redelivered.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Topic failure.
    #[error(transparent)]
    Notify(#[from] NotifyError),
    /// A notification payload failed to parse.
    #[error("corrupt notification payload: {0}")]
    Envelope(#[from] prost::DecodeError),
    /// Downstream write failure after retries.
    #[error("query store write failed: {0}")]
    Store(String),
    /// Run metadata never became available.
    #[error("metadata for run {0} not available")]
    Metadata(String),
    /// The service is already running.
    #[error("indexer already started")]
    AlreadyStarted,
}

/// Shorthand result type for indexer operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Service lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Not running.
    Stopped = 0,
    /// Waiting for run metadata.
    Starting = 1,
    /// Consuming notifications.
    Running = 2,
    /// Draining after a stop request.
    Stopping = 3,
    /// Stopped after an unrecoverable failure.
    Error = 4,
}

impl ServiceState {
    fn from_u8(raw: u8) -> ServiceState {
        match raw {
            1 => ServiceState::Starting,
            2 => ServiceState::Running,
            3 => ServiceState::Stopping,
            4 => ServiceState::Error,
            _ => ServiceState::Stopped,
        }
    }
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Fully drained and acknowledged batch messages.
    pub batches_processed: u64,
    /// Sum of `tick_count` across flushed chunks.
    pub ticks_processed: u64,
    /// Running and free of recent failures.
    pub is_healthy: bool,
    /// Unix milliseconds of the last successful flush.
    pub last_flush_ms: u64,
}

#[derive(Default)]
struct Metrics {
    batches_processed: AtomicU64,
    ticks_processed: AtomicU64,
    healthy: AtomicBool,
    last_flush_ms: AtomicU64,
}

struct Inner {
    config: IndexerConfig,
    run_id: String,
    group: String,
    filter: ChunkFilter,
    storage: Arc<dyn StorageResource>,
    topic: Arc<TopicResource>,
    store: Arc<dyn QueryStore>,
    state: AtomicU8,
    metrics: Metrics,
}

/// The indexer service handle.
pub struct IndexerService {
    inner: Arc<Inner>,
    handle: Mutex<Option<StopHandler<()>>>,
}

const MERGE_ATTEMPTS: u32 = 5;
const MERGE_BACKOFF: Duration = Duration::from_millis(100);

impl IndexerService {
    /// Builds a service; `filter` selects which chunk fields this indexer
    /// materialises (an organism indexer skips cells and vice versa).
    pub fn new(
        config: IndexerConfig,
        run_id: &str,
        group: &str,
        filter: ChunkFilter,
        storage: Arc<dyn StorageResource>,
        topic: Arc<TopicResource>,
        store: Arc<dyn QueryStore>,
    ) -> IndexerService {
        IndexerService {
            inner: Arc::new(Inner {
                config,
                run_id: run_id.to_owned(),
                group: group.to_owned(),
                filter,
                storage,
                topic,
                store,
                state: AtomicU8::new(ServiceState::Stopped as u8),
                metrics: Metrics::default(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        let metrics = &self.inner.metrics;
        MetricsSnapshot {
            batches_processed: metrics.batches_processed.load(Ordering::Relaxed),
            ticks_processed: metrics.ticks_processed.load(Ordering::Relaxed),
            is_healthy: metrics.healthy.load(Ordering::Relaxed)
                && self.state() == ServiceState::Running,
            last_flush_ms: metrics.last_flush_ms.load(Ordering::Relaxed),
        }
    }

    /// Starts the service thread. Returns once the thread is spawned; use
    /// [`state`] to observe the metadata-gating progress.
    ///
    /// [`state`]: IndexerService::state
    pub fn start(&self) -> Result<()> {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            return Err(IndexerError::AlreadyStarted);
        }
        self.inner
            .state
            .store(ServiceState::Starting as u8, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let (signal_tx, signal_rx) = bounded::<()>(SIGNAL_CHANNEL_SIZE);
        let name = format!("indexer-{}", self.inner.run_id);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || service_main(&inner, &signal_rx))
            .expect("spawn indexer service");
        *guard = Some(StopHandler::new(&name, signal_tx, thread));
        Ok(())
    }

    /// Stops the service, draining the in-flight work: the current flush
    /// completes, half-processed batches stay unacknowledged.
    pub fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let current = self.state();
            if current == ServiceState::Starting || current == ServiceState::Running {
                self.inner
                    .state
                    .store(ServiceState::Stopping as u8, Ordering::SeqCst);
            }
            handle.stop();
        }
    }
}

impl Drop for IndexerService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn service_main(inner: &Inner, signal: &Receiver<()>) {
    let shape = match await_metadata(inner, signal) {
        Ok(Some(shape)) => shape,
        Ok(None) => {
            inner
                .state
                .store(ServiceState::Stopped as u8, Ordering::SeqCst);
            return;
        }
        Err(error) => {
            warn!("indexer {}: {}", inner.run_id, error);
            inner.state.store(ServiceState::Error as u8, Ordering::SeqCst);
            return;
        }
    };

    let reader = match inner.topic.reader(&inner.group) {
        Ok(reader) => reader,
        Err(error) => {
            warn!("indexer {}: broker init failed: {}", inner.run_id, error);
            inner.state.store(ServiceState::Error as u8, Ordering::SeqCst);
            return;
        }
    };

    inner
        .state
        .store(ServiceState::Running as u8, Ordering::SeqCst);
    inner.metrics.healthy.store(true, Ordering::Relaxed);
    info!(
        "indexer {} running (group {}, shape {:?})",
        inner.run_id,
        inner.group,
        shape.dims()
    );

    let mut buffer: ChunkBuffer<AckHandle> = ChunkBuffer::default();
    let mut last_flush = Instant::now();
    let poll_timeout = Duration::from_millis(inner.config.topic_poll_timeout_ms);
    let flush_timeout = Duration::from_millis(inner.config.flush_timeout_ms);

    loop {
        match signal.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => break,
        }

        match reader.receive(poll_timeout) {
            Ok(Some((envelope, ack))) => match BatchInfo::decode(envelope.payload.as_slice()) {
                Ok(info) => {
                    if let Err(error) = ingest(inner, &mut buffer, info, ack) {
                        // no ack: the topic redelivers after the claim
                        // timeout or on restart
                        warn!("indexer {}: iteration failed: {}", inner.run_id, error);
                        inner.metrics.healthy.store(false, Ordering::Relaxed);
                    }
                }
                Err(error) => {
                    warn!(
                        "indexer {}: corrupt envelope {}: {}",
                        inner.run_id, envelope.message_id, error
                    );
                }
            },
            Ok(None) => {}
            Err(error) => {
                warn!("indexer {}: receive failed: {}", inner.run_id, error);
                inner.metrics.healthy.store(false, Ordering::Relaxed);
            }
        }

        if buffer.len() >= inner.config.insert_batch_size
            || last_flush.elapsed() >= flush_timeout
        {
            if !flush_once(inner, &mut buffer, &shape) {
                inner.state.store(ServiceState::Error as u8, Ordering::SeqCst);
                return;
            }
            last_flush = Instant::now();
        }
    }

    // drain: one final flush; partially streamed batches stay unacked
    while !buffer.is_empty() {
        if !flush_once(inner, &mut buffer, &shape) {
            inner.state.store(ServiceState::Error as u8, Ordering::SeqCst);
            return;
        }
    }
    flush_once(inner, &mut buffer, &shape);
    inner
        .state
        .store(ServiceState::Stopped as u8, Ordering::SeqCst);
    debug!("indexer {} stopped", inner.run_id);
}

/// Polls the metadata store until the run's configuration appears.
///
/// `Ok(None)` means a stop request arrived while waiting.
fn await_metadata(inner: &Inner, signal: &Receiver<()>) -> Result<Option<Shape>> {
    let deadline = Instant::now()
        + Duration::from_millis(inner.config.metadata_max_poll_duration_ms);
    let poll = Duration::from_millis(inner.config.metadata_poll_interval_ms.max(1));
    loop {
        if let Some(key) = inner.storage.find_metadata_path(&inner.run_id)? {
            let metadata: SimulationMetadata = read_message(inner.storage.as_ref(), &key)?;
            if metadata.shape.is_empty() || metadata.shape.iter().any(|d| *d <= 0) {
                return Err(IndexerError::Metadata(format!(
                    "{} has invalid shape {:?}",
                    inner.run_id, metadata.shape
                )));
            }
            let topology = if metadata.topology == WireTopology::Toroidal as i32 {
                Topology::Toroidal
            } else {
                Topology::Bounded
            };
            return Ok(Some(Shape::new(metadata.shape.clone(), topology)));
        }
        if Instant::now() >= deadline {
            return Err(IndexerError::Metadata(inner.run_id.clone()));
        }
        match signal.recv_timeout(poll) {
            Err(evochora_channel::RecvTimeoutError::Timeout) => {}
            _ => return Ok(None),
        }
    }
}

/// Streams one notified batch file into the buffer.
fn ingest(
    inner: &Inner,
    buffer: &mut ChunkBuffer<AckHandle>,
    info: BatchInfo,
    ack: AckHandle,
) -> Result<()> {
    debug!(
        "indexer {}: batch {} (ticks {}..={})",
        inner.run_id, info.storage_path, info.tick_start, info.tick_end
    );
    let key = buffer.begin_batch(ack);
    let streamed = inner.storage.for_each_chunk(
        &info.storage_path,
        inner.filter,
        &mut |chunk| {
            buffer.push(key, chunk);
            Ok(())
        },
    );
    match streamed {
        Ok(()) => {
            buffer.end_batch(key);
            Ok(())
        }
        Err(error) => {
            buffer.abort_batch(key);
            Err(error.into())
        }
    }
}

/// One transactional flush. Returns `false` when the downstream writer
/// keeps failing and the service must transition to error.
fn flush_once(inner: &Inner, buffer: &mut ChunkBuffer<AckHandle>, shape: &Shape) -> bool {
    let result = buffer.flush(inner.config.insert_batch_size);
    if result.chunks.is_empty() && result.completed.is_empty() {
        return true;
    }

    let rows: Vec<TickRow> = result
        .chunks
        .iter()
        .flat_map(|chunk| rows_from_chunk(chunk, shape))
        .collect();
    if !rows.is_empty() {
        let mut attempt = 0;
        loop {
            match inner.store.merge(&rows) {
                Ok(()) => break,
                Err(error) if attempt + 1 < MERGE_ATTEMPTS => {
                    attempt += 1;
                    let backoff = MERGE_BACKOFF * 2u32.pow(attempt);
                    warn!(
                        "indexer {}: merge attempt {} failed, retrying in {:?}: {}",
                        inner.run_id, attempt, backoff, error
                    );
                    thread::sleep(backoff);
                }
                Err(error) => {
                    warn!(
                        "indexer {}: merge failed after {} attempts: {}",
                        inner.run_id, MERGE_ATTEMPTS, error
                    );
                    return false;
                }
            }
        }
    }

    let completed = result.completed.len() as u64;
    for ack in result.completed {
        if let Err(error) = ack.ack() {
            warn!("indexer {}: ack failed: {}", inner.run_id, error);
        }
    }
    inner
        .metrics
        .ticks_processed
        .fetch_add(result.tick_count.max(0) as u64, Ordering::Relaxed);
    inner
        .metrics
        .batches_processed
        .fetch_add(completed, Ordering::Relaxed);
    inner
        .metrics
        .last_flush_ms
        .store(evochora_systemtime::unix_time_as_millis(), Ordering::Relaxed);
    inner.metrics.healthy.store(true, Ordering::Relaxed);
    true
}

#[cfg(test)]
mod tests;
