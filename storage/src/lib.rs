//! Content-addressed hierarchical batch storage.
//!
//! [`StorageResource`] is the abstraction the pipeline and the indexer
//! talk to; [`FilesystemStorage`] is the bundled implementation. Object
//! stores can implement the same trait; the listing primitive and the
//! dedup rule are the contract resume correctness rests on.

mod fs;
pub mod path;

pub use fs::FilesystemStorage;

use evochora_protocol::{ChunkFilter, ChunkHeader, ProtocolError, TickDataChunk};
use prost::Message;
use thiserror::Error;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A caller-supplied key failed validation. Never logged at error.
    #[error("invalid storage key {key:?}: {reason}")]
    InvalidKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A caller-supplied argument failed validation.
    #[error("invalid storage request: {0}")]
    InvalidRequest(String),
    /// The storage root is unusable.
    #[error("storage root {root}: {reason}")]
    BadRoot {
        /// Configured root.
        root: String,
        /// Why it is unusable.
        reason: String,
    },
    /// Filesystem failure, with the key it happened on.
    #[error("storage io on {key}: {source}")]
    Io {
        /// Key being accessed.
        key: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A batch file's frames failed to parse.
    #[error("corrupt batch data in {key}: {source}")]
    Corrupt {
        /// Key being read.
        key: String,
        /// Underlying codec error.
        source: ProtocolError,
    },
    /// A message file failed to parse.
    #[error("corrupt message in {key}: {source}")]
    CorruptMessage {
        /// Key being read.
        key: String,
        /// Underlying decode error.
        source: prost::DecodeError,
    },
}

/// Shorthand result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Listing order for batch files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest batch first.
    #[default]
    Ascending,
    /// Newest batch first.
    Descending,
}

/// One page of batch file keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchListing {
    /// Keys in the requested order.
    pub paths: Vec<String>,
    /// Token resuming after the last returned key, if more remain.
    pub next_token: Option<String>,
}

/// Outcome of a streamed batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    /// Final key of the batch file.
    pub path: String,
    /// First tick covered.
    pub first_tick: i64,
    /// Last tick covered.
    pub last_tick: i64,
    /// Number of chunks written.
    pub chunk_count: usize,
}

/// The storage abstraction shared by the pipeline and all consumers.
///
/// All read methods are safe for arbitrary concurrent callers. Writes to
/// different keys are independent; same-key writers are serialised only by
/// the backend's own rename semantics.
pub trait StorageResource: Send + Sync {
    /// Streams a chunk batch to its content-addressed key and returns the
    /// final path. The file appears atomically or not at all.
    fn write_chunk_batch_streaming(
        &self,
        chunks: &mut dyn Iterator<Item = TickDataChunk>,
    ) -> Result<WriteResult>;

    /// Writes an already-encoded message under `key` atomically.
    fn write_message_bytes(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Reads and decompresses the message file at `key`.
    fn read_message_bytes(&self, key: &str) -> Result<Vec<u8>>;

    /// Streams raw chunk frames from a batch file; peak heap is one chunk.
    fn for_each_raw_chunk(
        &self,
        key: &str,
        consumer: &mut dyn FnMut(&ChunkHeader, &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Streams decoded chunks from a batch file, applying a wire-level
    /// field filter while scanning.
    fn for_each_chunk(
        &self,
        key: &str,
        filter: ChunkFilter,
        consumer: &mut dyn FnMut(TickDataChunk) -> Result<()>,
    ) -> Result<()>;

    /// The single listing primitive. `prefix` is a run id; pagination via
    /// `continuation_token`; `start_tick`/`end_tick` keep batches whose
    /// range overlaps; duplicates by `first_tick` resolve to the smaller
    /// `last_tick` with a warning.
    fn list_batch_files(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
        max_results: usize,
        start_tick: Option<i64>,
        end_tick: Option<i64>,
        sort_order: SortOrder,
    ) -> Result<BatchListing>;

    /// Key of the run's metadata message, if present.
    fn find_metadata_path(&self, run_id: &str) -> Result<Option<String>>;

    /// Key of the newest batch file of the newest run matching the prefix,
    /// found without listing the whole tree.
    fn find_last_batch_file(&self, run_id_prefix: &str) -> Result<Option<String>>;

    /// Run ids with data, optionally restricted to runs touched after the
    /// given unix-millisecond timestamp.
    fn list_run_ids(&self, after_timestamp_ms: Option<u64>) -> Result<Vec<String>>;

    /// Moves a batch file to the superseded area. Never deletes.
    fn move_to_superseded(&self, key: &str) -> Result<()>;

    /// Convenience: every batch file of a run, oldest first.
    fn list_all_batch_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_batch_files(
                prefix,
                token.as_deref(),
                1_000,
                None,
                None,
                SortOrder::Ascending,
            )?;
            paths.extend(page.paths);
            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(paths),
            }
        }
    }

    /// Convenience: materialises every chunk of one batch file.
    ///
    /// Legacy shape kept for tools; pipeline code must stream.
    fn read_all_chunks(&self, key: &str) -> Result<Vec<TickDataChunk>> {
        let mut chunks = Vec::new();
        self.for_each_chunk(key, ChunkFilter::All, &mut |chunk| {
            chunks.push(chunk);
            Ok(())
        })?;
        Ok(chunks)
    }
}

/// Reads and decodes a typed message from storage.
pub fn read_message<M: Message + Default>(
    storage: &dyn StorageResource,
    key: &str,
) -> Result<M> {
    let bytes = storage.read_message_bytes(key)?;
    M::decode(bytes.as_slice()).map_err(|source| StorageError::CorruptMessage {
        key: key.to_owned(),
        source,
    })
}

/// Encodes and writes a typed message to storage.
pub fn write_message<M: Message>(
    storage: &dyn StorageResource,
    key: &str,
    message: &M,
) -> Result<()> {
    storage.write_message_bytes(key, &message.encode_to_vec())
}
