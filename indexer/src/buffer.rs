//! Chunk buffering with cross-batch acknowledgement discipline.
//!
//! Chunks from several notification batches accumulate here between
//! flushes. A batch message may only be acknowledged once *every* chunk
//! that originated from it has been flushed downstream; this component
//! tracks a remaining-chunk counter per batch and reports the fully
//! drained batches, in the order they first entered the buffer, with each
//! flush.

use evochora_protocol::TickDataChunk;
use std::collections::{BTreeMap, VecDeque};

/// Opaque handle for one tracked batch message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchKey(u64);

struct TrackedBatch<A> {
    ack: A,
    /// Chunks seen for this batch that have not been flushed yet.
    remaining: usize,
    /// Set once the whole batch file has been streamed into the buffer;
    /// before that, a zero counter means nothing.
    fully_enqueued: bool,
}

/// Result of one flush.
pub struct FlushResult<A> {
    /// Chunks drained downstream, oldest first.
    pub chunks: Vec<TickDataChunk>,
    /// Ack payloads of batch messages that are now fully drained, in the
    /// order the batches first entered the buffer.
    pub completed: Vec<A>,
    /// Sum of `tick_count` over the flushed chunks.
    pub tick_count: i64,
}

/// FIFO chunk buffer tracking batch-message drainage.
pub struct ChunkBuffer<A> {
    chunks: VecDeque<(BatchKey, TickDataChunk)>,
    batches: BTreeMap<BatchKey, TrackedBatch<A>>,
    next_key: u64,
}

impl<A> Default for ChunkBuffer<A> {
    fn default() -> Self {
        ChunkBuffer {
            chunks: VecDeque::new(),
            batches: BTreeMap::new(),
            next_key: 0,
        }
    }
}

impl<A> ChunkBuffer<A> {
    /// Starts tracking a batch message; its chunks follow via [`push`].
    ///
    /// [`push`]: ChunkBuffer::push
    pub fn begin_batch(&mut self, ack: A) -> BatchKey {
        let key = BatchKey(self.next_key);
        self.next_key += 1;
        self.batches.insert(
            key,
            TrackedBatch {
                ack,
                remaining: 0,
                fully_enqueued: false,
            },
        );
        key
    }

    /// Adds one chunk originating from `batch`.
    pub fn push(&mut self, batch: BatchKey, chunk: TickDataChunk) {
        if let Some(tracked) = self.batches.get_mut(&batch) {
            tracked.remaining += 1;
            self.chunks.push_back((batch, chunk));
        }
    }

    /// Marks the batch as fully streamed; it becomes completable once its
    /// counter drains to zero.
    pub fn end_batch(&mut self, batch: BatchKey) {
        if let Some(tracked) = self.batches.get_mut(&batch) {
            tracked.fully_enqueued = true;
        }
    }

    /// Stops tracking a batch whose streaming failed, dropping its
    /// unflushed chunks. The message is never acknowledged and the topic
    /// will redeliver it.
    pub fn abort_batch(&mut self, batch: BatchKey) -> Option<A> {
        self.chunks.retain(|(key, _)| *key != batch);
        self.batches.remove(&batch).map(|tracked| tracked.ack)
    }

    /// Buffered chunk count.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drains up to `max_chunks` chunks and reports newly drained batches.
    pub fn flush(&mut self, max_chunks: usize) -> FlushResult<A> {
        let take = max_chunks.min(self.chunks.len());
        let mut chunks = Vec::with_capacity(take);
        let mut tick_count = 0i64;
        for _ in 0..take {
            let (key, chunk) = self.chunks.pop_front().expect("len checked");
            let tracked = self.batches.get_mut(&key).expect("chunk without batch");
            tracked.remaining -= 1;
            tick_count += i64::from(chunk.tick_count);
            chunks.push(chunk);
        }

        // completable batches, in first-entered order (keys are issued
        // monotonically)
        let done: Vec<BatchKey> = self
            .batches
            .iter()
            .filter(|(_, t)| t.fully_enqueued && t.remaining == 0)
            .map(|(key, _)| *key)
            .collect();
        let completed = done
            .into_iter()
            .filter_map(|key| self.batches.remove(&key).map(|t| t.ack))
            .collect();
        FlushResult {
            chunks,
            completed,
            tick_count,
        }
    }
}
