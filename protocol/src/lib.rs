//! Evochora wire messages and the chunk batch framing codec.
//!
//! A batch file is a sequence of length-delimited protobuf `TickDataChunk`
//! messages streamed through an optional compression codec. The read side
//! never materialises more than one chunk at a time.

mod codec;
mod messages;

pub use codec::{
    compress_bytes, decompress_bytes, for_each_chunk, for_each_raw_chunk, read_all_chunks,
    write_chunks, ChunkFilter, Compression, ProtocolError, Result,
};
pub use messages::{
    BatchInfo, CellDataColumns, ChunkHeader, DeltaType, OrganismState, SimulationMetadata,
    TickData, TickDataChunk, TickDelta, TopicEnvelope, Topology,
};
