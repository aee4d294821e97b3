//! Length-delimited chunk framing with streaming compression.

use crate::messages::{filtered, ChunkHeader, TickDataChunk};
use prost::Message;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// Framing codec failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying stream failure.
    #[error("chunk stream io error: {0}")]
    Io(#[from] io::Error),
    /// A frame did not parse as the expected message.
    #[error("corrupt chunk frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Shorthand result type for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Largest accepted frame; anything bigger is treated as corruption.
const MAX_FRAME_SIZE: u64 = 1 << 30;

/// Stream compression applied around the length-delimited frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Frames are written as-is.
    None,
    /// Frames are streamed through zstd.
    #[default]
    Zstd,
}

impl Compression {
    /// File extension carrying the codec: `pb` or `pb.zst`.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::None => "pb",
            Compression::Zstd => "pb.zst",
        }
    }

    /// Recovers the codec from a file name.
    pub fn from_path(path: &Path) -> Option<Compression> {
        let name = path.file_name()?.to_str()?;
        if name.ends_with(".pb.zst") {
            Some(Compression::Zstd)
        } else if name.ends_with(".pb") {
            Some(Compression::None)
        } else {
            None
        }
    }

    /// Parses the codec name used in configuration files.
    pub fn from_name(name: &str) -> Option<Compression> {
        match name {
            "none" => Some(Compression::None),
            "zstd" => Some(Compression::Zstd),
            _ => None,
        }
    }
}

enum FrameSink<W: Write> {
    Plain(BufWriter<W>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<W>>),
}

impl<W: Write> FrameSink<W> {
    fn new(writer: W, compression: Compression, level: i32) -> io::Result<FrameSink<W>> {
        let buffered = BufWriter::new(writer);
        Ok(match compression {
            Compression::None => FrameSink::Plain(buffered),
            Compression::Zstd => {
                FrameSink::Zstd(zstd::stream::write::Encoder::new(buffered, level)?)
            }
        })
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        match self {
            FrameSink::Plain(w) => w.write_all(frame),
            FrameSink::Zstd(w) => w.write_all(frame),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            FrameSink::Plain(mut w) => w.flush(),
            FrameSink::Zstd(w) => w.finish()?.flush(),
        }
    }
}

/// Streams `chunks` as length-delimited frames into `writer`.
///
/// Only one encoded chunk is resident at a time; there is no whole-batch
/// buffer. Returns the number of chunks written.
pub fn write_chunks<W: Write, C: std::borrow::Borrow<TickDataChunk>>(
    writer: W,
    compression: Compression,
    level: i32,
    chunks: impl IntoIterator<Item = C>,
) -> Result<usize> {
    let mut sink = FrameSink::new(writer, compression, level)?;
    let mut frame = Vec::new();
    let mut written = 0;
    for chunk in chunks {
        frame.clear();
        chunk
            .borrow()
            .encode_length_delimited(&mut frame)
            .expect("Vec<u8> writes are infallible");
        sink.write_frame(&frame)?;
        written += 1;
    }
    sink.finish()?;
    Ok(written)
}

/// Compresses a whole message body (metadata files, not chunk streams).
pub fn compress_bytes(bytes: &[u8], compression: Compression, level: i32) -> io::Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Zstd => zstd::stream::encode_all(bytes, level),
    }
}

/// Decompresses a whole message body.
pub fn decompress_bytes(bytes: &[u8], compression: Compression) -> io::Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Zstd => zstd::stream::decode_all(bytes),
    }
}

enum FrameSource<R: Read> {
    Plain(BufReader<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
}

impl<R: Read> FrameSource<R> {
    fn new(reader: R, compression: Compression) -> io::Result<FrameSource<R>> {
        Ok(match compression {
            Compression::None => FrameSource::Plain(BufReader::new(reader)),
            Compression::Zstd => FrameSource::Zstd(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

impl<R: Read> Read for FrameSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FrameSource::Plain(r) => r.read(buf),
            FrameSource::Zstd(r) => r.read(buf),
        }
    }
}

/// Reads the next frame length. `None` at a clean end of stream; an EOF
/// inside the varint or an oversized length is corruption.
fn read_frame_len<R: Read>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) if shift == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside frame length",
                ))
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        value |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            if value > MAX_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame length {} exceeds limit", value),
                ));
            }
            return Ok(Some(value));
        }
        shift += 7;
        if shift >= 64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "frame length varint too long",
            ));
        }
    }
}

/// Streams raw chunk frames, handing `(header, frame_bytes)` to `consumer`.
///
/// The header is recovered by a partial parse of the frame; the frame
/// buffer is reused, so peak heap stays at one chunk.
pub fn for_each_raw_chunk<R: Read>(
    reader: R,
    compression: Compression,
    mut consumer: impl FnMut(&ChunkHeader, &[u8]) -> Result<()>,
) -> Result<()> {
    let mut source = FrameSource::new(reader, compression)?;
    let mut frame = Vec::new();
    while let Some(len) = read_frame_len(&mut source)? {
        frame.clear();
        frame.resize(len as usize, 0);
        source.read_exact(&mut frame)?;
        let header = ChunkHeader::decode(frame.as_slice())?;
        consumer(&header, &frame)?;
    }
    Ok(())
}

/// Selects which chunk fields the reader materialises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkFilter {
    /// Parse everything.
    #[default]
    All,
    /// Discard organism states while scanning.
    SkipOrganisms,
    /// Discard cell columns while scanning.
    SkipCells,
}

/// Streams decoded chunks, applying `filter` at the wire level: skipped
/// fields are discarded during the scan and never allocated.
pub fn for_each_chunk<R: Read>(
    reader: R,
    compression: Compression,
    filter: ChunkFilter,
    mut consumer: impl FnMut(TickDataChunk) -> Result<()>,
) -> Result<()> {
    for_each_raw_chunk(reader, compression, |_, frame| {
        let chunk = match filter {
            ChunkFilter::All => TickDataChunk::decode(frame)?,
            ChunkFilter::SkipOrganisms => {
                TickDataChunk::from(filtered::TickDataChunkSkipOrganisms::decode(frame)?)
            }
            ChunkFilter::SkipCells => {
                TickDataChunk::from(filtered::TickDataChunkSkipCells::decode(frame)?)
            }
        };
        consumer(chunk)
    })
}

/// Materialises every chunk of a stream.
///
/// Convenience wrapper for tools and tests; pipeline code must stream
/// through [`for_each_chunk`] instead.
pub fn read_all_chunks<R: Read>(reader: R, compression: Compression) -> Result<Vec<TickDataChunk>> {
    let mut chunks = Vec::new();
    for_each_chunk(reader, compression, ChunkFilter::All, |chunk| {
        chunks.push(chunk);
        Ok(())
    })?;
    Ok(chunks)
}
