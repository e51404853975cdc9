//! Upload: chunk, compress, send.

use super::{expect_success, FrameWriter, PipelineOptions, TransferResult};
use crate::compression::{CompressionContextPool, Compressor};
use crate::connection::Stream;
use crate::error::Result;
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Bytes of an upload source.
pub enum SourceData {
    /// Zero-length files cannot be mapped.
    Empty,
    Mapped(Mmap),
    Memory(Bytes),
}

impl SourceData {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Mapped(mmap) => mmap.as_ref(),
            Self::Memory(bytes) => bytes.as_ref(),
        }
    }
}

/// Map the whole file read-only.
pub fn map_source(path: &Path) -> Result<SourceData> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(SourceData::Empty);
    }
    // SAFETY: the mapping is read-only; artifacts are not modified while
    // they are being uploaded.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(SourceData::Mapped(mmap))
}

/// Send `data` on `stream` as compressed frames of at most
/// `options.buffer_size` source bytes each, then read the response.
///
/// An empty source still produces one (empty) frame carrying end-of-stream.
pub async fn upload(
    stream: &mut Stream,
    data: &[u8],
    pool: &CompressionContextPool<Compressor>,
    options: &PipelineOptions,
) -> Result<TransferResult> {
    let chunk_size = options.buffer_size.max(1);
    let mut hasher = blake3::Hasher::new();
    let mut writer = FrameWriter::new(stream, pool.checkout()?);

    if data.is_empty() {
        writer.write(&[], true).await?;
    } else {
        let total = data.len().div_ceil(chunk_size);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            hasher.update(chunk);
            writer.write(chunk, i + 1 == total).await?;
        }
    }

    let wire_size = writer.wire_size();
    let frames = writer.frames();
    let stream = writer.into_stream();

    expect_success(stream).await?;

    tracing::debug!(
        stream_id = stream.id(),
        frames,
        wire_size,
        file_size = data.len(),
        "upload complete"
    );
    Ok(TransferResult::complete(wire_size, data.len() as u64, &hasher))
}
