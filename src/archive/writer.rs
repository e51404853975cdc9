//! Archive writer.
//!
//! Walks a directory tree and streams it as an archive through a
//! [`FrameWriter`]. Headers and file bytes share one rotating buffer of
//! `buffer_size` bytes; each time it fills it becomes one compressed frame.
//! The central directory rides in the last frame when it fits, otherwise it
//! is sent as its own final frame.

use super::{
    central_directory_len, local_record_len, put_central_directory, put_local_header,
    ArchiveEntry,
};
use crate::compression::{CompressionContextPool, Compressor};
use crate::connection::Stream;
use crate::error::{ArchiveError, Result, TransferError};
use crate::pipeline::{expect_success, FrameWriter, PipelineOptions, TransferResult};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedSource {
    File { path: PathBuf, size: u64 },
    /// Empty directory marker
    Dir,
}

/// One archive member, decided before any bytes are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedEntry {
    pub name: String,
    pub source: PlannedSource,
}

impl PlannedEntry {
    fn size(&self) -> u64 {
        match self.source {
            PlannedSource::File { size, .. } => size,
            PlannedSource::Dir => 0,
        }
    }
}

/// Walk `root` in file-name order. Regular files become entries, and
/// directories without children become `name/` markers. Symlinks and other
/// special files are skipped.
pub fn plan_entries(root: &Path) -> Result<Vec<PlannedEntry>> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }

    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut planned = Vec::new();
    for result in walker {
        let dent = result.map_err(|e| TransferError::Other(e.into()))?;
        if dent.depth() == 0 {
            continue;
        }
        let Some(file_type) = dent.file_type() else {
            continue;
        };
        let rel = dent.path().strip_prefix(root).unwrap_or(dent.path());
        let name = entry_name(rel)?;

        if file_type.is_file() {
            let size = dent
                .metadata()
                .map_err(|e| TransferError::Other(e.into()))?
                .len();
            planned.push(PlannedEntry {
                name,
                source: PlannedSource::File {
                    path: dent.path().to_path_buf(),
                    size,
                },
            });
        } else if file_type.is_dir() {
            if std::fs::read_dir(dent.path())?.next().is_none() {
                planned.push(PlannedEntry {
                    name: format!("{}/", name),
                    source: PlannedSource::Dir,
                });
            }
        } else {
            tracing::debug!(path = %dent.path().display(), "skipping special file");
        }
    }

    if planned.len() > u16::MAX as usize {
        return Err(ArchiveError::TooManyEntries(planned.len()).into());
    }
    Ok(planned)
}

/// `/`-separated UTF-8 name for a path relative to the archive root.
fn entry_name(rel: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or(ArchiveError::InvalidName)?);
            }
            _ => return Err(ArchiveError::UnsafeName(rel.display().to_string()).into()),
        }
    }
    Ok(parts.join("/"))
}

struct RotatingBuffer<'a> {
    frames: FrameWriter<'a>,
    buf: Vec<u8>,
    capacity: usize,
    hasher: blake3::Hasher,
    logical: u64,
}

impl<'a> RotatingBuffer<'a> {
    fn room(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    async fn rotate(&mut self, end_of_stream: bool) -> Result<()> {
        self.hasher.update(&self.buf);
        self.logical += self.buf.len() as u64;
        self.frames.write(&self.buf, end_of_stream).await?;
        self.buf.clear();
        Ok(())
    }

    /// Make room for `len` more bytes, rotating if the buffer holds data
    /// that would overflow it.
    async fn reserve(&mut self, len: usize) -> Result<()> {
        if !self.buf.is_empty() && len > self.room() {
            self.rotate(false).await?;
        }
        Ok(())
    }

    async fn copy_file(&mut self, path: &Path, size: u64) -> Result<()> {
        let mut file = File::open(path).await?;
        let mut remaining = size;
        while remaining > 0 {
            if self.room() == 0 {
                self.rotate(false).await?;
            }
            let want = (self.room() as u64).min(remaining) as usize;
            let start = self.buf.len();
            self.buf.resize(start + want, 0);
            let n = file.read(&mut self.buf[start..]).await?;
            self.buf.truncate(start + n);
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} shrank while archiving", path.display()),
                )
                .into());
            }
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// [`plan_entries`] on the blocking pool.
pub async fn plan_archive(root: &Path) -> Result<Vec<PlannedEntry>> {
    let walk_root = root.to_path_buf();
    tokio::task::spawn_blocking(move || plan_entries(&walk_root))
        .await
        .map_err(|e| TransferError::Other(e.into()))?
}

/// Stream the planned entries of `root` as an archive on `stream` and read
/// the response. `file_size` in the result counts archive bytes before
/// compression.
pub async fn write_archive(
    stream: &mut Stream,
    root: &Path,
    planned: &[PlannedEntry],
    pool: &CompressionContextPool<Compressor>,
    options: &PipelineOptions,
) -> Result<TransferResult> {
    let capacity = options.buffer_size.max(1);
    let mut out = RotatingBuffer {
        frames: FrameWriter::new(stream, pool.checkout()?),
        buf: Vec::with_capacity(capacity),
        capacity,
        hasher: blake3::Hasher::new(),
        logical: 0,
    };

    let mut index = Vec::with_capacity(planned.len());
    let mut offset = 0u64;
    for planned_entry in planned {
        let entry = ArchiveEntry {
            name: planned_entry.name.clone(),
            size: planned_entry.size(),
            offset,
        };
        let header_len = local_record_len(&entry.name);
        out.reserve(header_len).await?;
        put_local_header(&mut out.buf, &entry)?;
        offset += header_len as u64;

        if let PlannedSource::File { path, size } = &planned_entry.source {
            out.copy_file(path, *size).await?;
            offset += size;
        }
        index.push(entry);
    }

    out.reserve(central_directory_len(&index)).await?;
    put_central_directory(&mut out.buf, &index, offset)?;
    out.rotate(true).await?;

    let wire_size = out.frames.wire_size();
    let frames = out.frames.frames();
    let logical = out.logical;
    let hasher = out.hasher;
    let stream = out.frames.into_stream();
    expect_success(stream).await?;

    tracing::debug!(
        root = %root.display(),
        entries = index.len(),
        frames,
        wire_size,
        logical,
        "archive uploaded"
    );
    Ok(TransferResult::complete(wire_size, logical, &hasher))
}
