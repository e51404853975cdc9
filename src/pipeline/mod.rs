//! Streaming transfer pipeline.
//!
//! Upload: source bytes → fixed-size chunks → one compressed frame per chunk.
//! Download: frames → incremental decompression → [`ChunkSink`].
//!
//! Every frame write is awaited before the next chunk is prepared, which
//! bounds memory to roughly one buffer regardless of payload size.

pub mod download;
pub mod upload;

pub use download::download;
pub use upload::{map_source, upload, SourceData};

use crate::compression::{Compressor, PooledContext};
use crate::config::DEFAULT_BUFFER_SIZE;
use crate::connection::Stream;
use crate::error::{Result, TransferError};
use crate::transport::{Frame, StatusClass};
use async_trait::async_trait;
use bytes::Bytes;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Uncompressed bytes per upload frame
    pub buffer_size: usize,
    /// Cap on one decompression output buffer
    pub max_output_buffer: usize,
    /// Cap on one file write during archive extraction
    pub max_write_chunk: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_output_buffer: DEFAULT_BUFFER_SIZE,
            max_write_chunk: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Complete,
    /// The object did not exist and the caller asked for a sentinel.
    NotFound,
}

impl TransferStatus {
    /// Numeric form; the not-found sentinel is `-1`.
    pub fn code(self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::NotFound => -1,
        }
    }
}

/// Outcome of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Compressed bytes on the wire
    pub wire_size: u64,
    /// Logical (uncompressed) bytes
    pub file_size: u64,
    /// Hex BLAKE3 of the logical bytes
    pub digest: Option<String>,
    pub status: TransferStatus,
}

impl TransferResult {
    pub fn complete(wire_size: u64, file_size: u64, hasher: &blake3::Hasher) -> Self {
        Self {
            wire_size,
            file_size,
            digest: Some(hex::encode(hasher.finalize().as_bytes())),
            status: TransferStatus::Complete,
        }
    }

    pub fn not_found() -> Self {
        Self {
            wire_size: 0,
            file_size: 0,
            digest: None,
            status: TransferStatus::NotFound,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == TransferStatus::NotFound
    }
}

/// What a download does with a 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotFoundPolicy {
    /// Raise `UnexpectedStatus { status: 404 }`.
    #[default]
    Fail,
    /// Return [`TransferResult::not_found`].
    Sentinel,
}

/// Destination for decompressed download bytes.
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Called once after the last chunk of a successful transfer.
    async fn finish(&mut self) -> Result<()>;

    /// Drop everything written so far.
    async fn discard(&mut self);
}

#[async_trait]
impl ChunkSink for Vec<u8> {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn discard(&mut self) {
        self.clear();
    }
}

/// Writes into `<dest>.part` and renames over `dest` on finish.
///
/// The partial file is removed on discard, or on drop if the transfer never
/// finished.
pub struct FileSink {
    dest: PathBuf,
    part: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl FileSink {
    pub async fn create(dest: &Path) -> Result<Self> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let part = part_path(dest);
        let file = File::create(&part).await?;
        Ok(Self {
            dest: dest.to_path_buf(),
            part,
            file: Some(file),
            finished: false,
        })
    }

    pub fn part_path(&self) -> &Path {
        &self.part
    }
}

/// Check that a download into `dest` can succeed locally: parent
/// directories are created and a part file can be written. Local problems
/// surface here, before any stream is opened.
pub async fn prepare_destination(dest: &Path) -> Result<()> {
    if fs::metadata(dest).await.is_ok_and(|m| m.is_dir()) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} is a directory", dest.display()),
        )
        .into());
    }
    let mut sink = FileSink::create(dest).await?;
    sink.discard().await;
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.part, &self.dest).await?;
        self.finished = true;
        Ok(())
    }

    async fn discard(&mut self) {
        self.file = None;
        if let Err(e) = fs::remove_file(&self.part).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", self.part.display(), e);
            }
        }
        self.finished = true;
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if !self.finished {
            self.file = None;
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

/// Read the response head of a finished upload and reject non-2xx statuses.
pub async fn expect_success(stream: &mut Stream) -> Result<()> {
    let head = stream.response().await?;
    if head.class() != StatusClass::Success {
        return Err(TransferError::UnexpectedStatus {
            status: head.status,
        });
    }
    Ok(())
}

/// Compresses chunks into frames on one stream and counts wire bytes.
pub struct FrameWriter<'a> {
    stream: &'a mut Stream,
    compressor: PooledContext<Compressor>,
    scratch: Vec<u8>,
    wire_size: u64,
    frames: usize,
}

impl<'a> FrameWriter<'a> {
    pub fn new(stream: &'a mut Stream, compressor: PooledContext<Compressor>) -> Self {
        Self {
            stream,
            compressor,
            scratch: Vec::new(),
            wire_size: 0,
            frames: 0,
        }
    }

    /// Compress `chunk` as one frame and wait until the transport accepts it.
    pub async fn write(&mut self, chunk: &[u8], end_of_stream: bool) -> Result<()> {
        let len = self.compressor.compress_chunk(chunk, &mut self.scratch)?;
        let frame = Frame {
            data: Bytes::copy_from_slice(&self.scratch),
            end_of_stream,
        };
        self.stream.send(frame).await?;
        self.wire_size += len as u64;
        self.frames += 1;
        tracing::trace!(
            stream_id = self.stream.id(),
            raw = chunk.len(),
            compressed = len,
            end_of_stream,
            "frame sent"
        );
        Ok(())
    }

    pub fn wire_size(&self) -> u64 {
        self.wire_size
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Give the stream back, returning the compressor to its pool.
    pub fn into_stream(self) -> &'a mut Stream {
        self.stream
    }
}
