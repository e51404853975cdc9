//! Incremental archive reader.
//!
//! Parses the archive as decompressed chunks arrive and extracts entries
//! under a root directory. Headers and names may straddle chunk boundaries;
//! partial records are kept in a small residual buffer and parsing resumes
//! exactly where the previous chunk stopped.
//!
//! ```text
//! Header --30 bytes--> Name --name_len bytes--> Data --size bytes--> Header
//!   |                    '-- dir marker ------------------------------^
//!   '-- central directory / end record --> Done (rest ignored)
//! ```

use super::{
    parse_local_header, signature, validate_entry_name, ArchiveEntry,
    CENTRAL_DIRECTORY_SIGNATURE, END_OF_CENTRAL_DIRECTORY_SIGNATURE, LOCAL_HEADER_LEN,
    LOCAL_HEADER_SIGNATURE,
};
use crate::error::{ArchiveError, Result};
use crate::pipeline::ChunkSink;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

#[derive(Debug)]
enum State {
    ReadingHeader,
    ReadingName { size: u64, name_len: usize, extra_len: u16 },
    ReadingData { entry: ArchiveEntry, path: PathBuf },
    Done,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

pub struct ArchiveReader {
    root: PathBuf,
    state: State,
    residual: Vec<u8>,
    file: Option<File>,
    /// Bytes still expected for the current entry
    remaining: u64,
    /// Write position inside the current file
    offset: u64,
    /// Archive bytes consumed so far
    position: u64,
    record_start: u64,
    max_write: usize,
    stats: ReaderStats,
}

impl ArchiveReader {
    /// Extract into `root`. Single file writes are capped at `max_write` bytes.
    pub fn new(root: impl Into<PathBuf>, max_write: usize) -> Self {
        Self {
            root: root.into(),
            state: State::ReadingHeader,
            residual: Vec::with_capacity(LOCAL_HEADER_LEN),
            file: None,
            remaining: 0,
            offset: 0,
            position: 0,
            record_start: 0,
            max_write: max_write.max(1),
            stats: ReaderStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// The end of the entry stream has been seen.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Feed the next decompressed chunk.
    pub async fn feed(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let used = match self.state {
                State::Done => return Ok(()),
                State::ReadingHeader => self.read_header(data)?,
                State::ReadingName { .. } => self.read_name(data).await?,
                State::ReadingData { .. } => self.read_data(data).await?,
            };
            self.position += used as u64;
            data = &data[used..];
        }
        Ok(())
    }

    fn read_header(&mut self, data: &[u8]) -> Result<usize> {
        if self.residual.is_empty() {
            self.record_start = self.position;
        }
        let had = self.residual.len();
        let take = (LOCAL_HEADER_LEN - had).min(data.len());
        self.residual.extend_from_slice(&data[..take]);

        // Check as soon as the signature is complete.
        if let Some(sig) = signature(&self.residual) {
            match sig {
                CENTRAL_DIRECTORY_SIGNATURE | END_OF_CENTRAL_DIRECTORY_SIGNATURE => {
                    tracing::debug!(offset = self.record_start, "end of entries");
                    self.residual.clear();
                    self.state = State::Done;
                    return Ok(take);
                }
                LOCAL_HEADER_SIGNATURE => {}
                other => return Err(ArchiveError::BadSignature(other).into()),
            }
        }
        if self.residual.len() < LOCAL_HEADER_LEN {
            return Ok(take);
        }

        let header = parse_local_header(&self.residual);
        self.residual.clear();
        if header.name_len == 0 {
            return Err(ArchiveError::EmptyName.into());
        }
        self.state = State::ReadingName {
            size: header.size as u64,
            name_len: header.name_len as usize,
            extra_len: header.extra_len,
        };
        Ok(take)
    }

    async fn read_name(&mut self, data: &[u8]) -> Result<usize> {
        let State::ReadingName {
            size,
            name_len,
            extra_len,
        } = self.state
        else {
            return Ok(0);
        };
        let take = (name_len - self.residual.len()).min(data.len());
        self.residual.extend_from_slice(&data[..take]);
        if self.residual.len() < name_len {
            return Ok(take);
        }

        let name = String::from_utf8(std::mem::take(&mut self.residual))
            .map_err(|_| ArchiveError::InvalidName)?;
        if extra_len != 0 {
            return Err(ArchiveError::ExtraField {
                name,
                len: extra_len,
            }
            .into());
        }
        let entry = ArchiveEntry {
            name,
            size,
            offset: self.record_start,
        };

        if entry.is_dir() {
            let path = validate_entry_name(&self.root, entry.name.trim_end_matches('/'))?;
            fs::create_dir_all(&path).await?;
            tracing::trace!(name = %entry.name, "directory");
            self.stats.directories += 1;
            self.state = State::ReadingHeader;
            return Ok(take);
        }

        let path = validate_entry_name(&self.root, &entry.name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.file = Some(File::create(&path).await?);
        self.remaining = entry.size;
        self.offset = 0;
        if self.remaining == 0 {
            self.close_entry(&entry).await?;
        } else {
            self.state = State::ReadingData { entry, path };
        }
        Ok(take)
    }

    async fn read_data(&mut self, data: &[u8]) -> Result<usize> {
        let n = (self.remaining.min(data.len() as u64) as usize).min(self.max_write);
        if let Some(file) = self.file.as_mut() {
            file.write_all(&data[..n]).await?;
        }
        self.remaining -= n as u64;
        self.offset += n as u64;

        if self.remaining == 0 {
            let state = std::mem::replace(&mut self.state, State::ReadingHeader);
            if let State::ReadingData { entry, .. } = state {
                self.close_entry(&entry).await?;
            }
        }
        Ok(n)
    }

    async fn close_entry(&mut self, entry: &ArchiveEntry) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        tracing::trace!(name = %entry.name, size = entry.size, offset = entry.offset, "extracted");
        self.stats.files += 1;
        self.stats.bytes += entry.size;
        self.offset = 0;
        self.state = State::ReadingHeader;
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for ArchiveReader {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.feed(data).await
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.is_done() {
            return Err(ArchiveError::Truncated("before the central directory").into());
        }
        tracing::debug!(
            root = %self.root.display(),
            files = self.stats.files,
            directories = self.stats.directories,
            bytes = self.stats.bytes,
            "archive extracted"
        );
        Ok(())
    }

    async fn discard(&mut self) {
        self.file = None;
        if let State::ReadingData { path, .. } = &self.state {
            if let Err(e) = fs::remove_file(path).await {
                tracing::warn!("Failed to remove partial {}: {}", path.display(), e);
            }
        }
        self.residual.clear();
        self.state = State::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{put_central_directory, put_local_header};
    use crate::error::TransferError;
    use proptest::prelude::*;
    use tempfile::TempDir;

    /// Build an archive in memory the same way the writer lays it out.
    fn build(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut entries = Vec::new();
        for (name, data) in files {
            let entry = ArchiveEntry {
                name: name.to_string(),
                size: data.len() as u64,
                offset: buf.len() as u64,
            };
            put_local_header(&mut buf, &entry).unwrap();
            buf.extend_from_slice(data);
            entries.push(entry);
        }
        let cd_offset = buf.len() as u64;
        put_central_directory(&mut buf, &entries, cd_offset).unwrap();
        buf
    }

    async fn extract(archive: &[u8], split: usize, root: &Path) -> Result<ReaderStats> {
        let mut reader = ArchiveReader::new(root, 5);
        for chunk in archive.chunks(split.max(1)) {
            reader.write_chunk(chunk).await?;
        }
        reader.finish().await?;
        Ok(reader.stats())
    }

    #[tokio::test]
    async fn test_extracts_files_dirs_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let archive = build(&[
            ("a.txt", b"alpha"),
            ("empty/", b""),
            ("nested/deep/b.bin", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]),
            ("zero", b""),
        ]);
        let stats = extract(&archive, 7, dir.path()).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"alpha");
        assert!(dir.path().join("empty").is_dir());
        assert_eq!(
            std::fs::read(dir.path().join("nested/deep/b.bin")).unwrap(),
            (1..=11).collect::<Vec<u8>>()
        );
        assert_eq!(std::fs::read(dir.path().join("zero")).unwrap(), b"");
        assert_eq!(
            stats,
            ReaderStats {
                files: 3,
                directories: 1,
                bytes: 16
            }
        );
    }

    #[tokio::test]
    async fn test_empty_archive() {
        let dir = TempDir::new().unwrap();
        let stats = extract(&build(&[]), 3, dir.path()).await.unwrap();
        assert_eq!(stats, ReaderStats::default());
    }

    #[tokio::test]
    async fn test_input_after_terminator_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut archive = build(&[("f", b"x")]);
        archive.extend_from_slice(b"trailing garbage");
        extract(&archive, 1, dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_signature() {
        let dir = TempDir::new().unwrap();
        let err = extract(b"PK\x09\x09rest of a header......", 4, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Archive(ArchiveError::BadSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_extra_field() {
        let dir = TempDir::new().unwrap();
        let mut archive = build(&[("f", b"x")]);
        archive[28] = 4;
        let err = extract(&archive, 64, dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Archive(ArchiveError::ExtraField { len: 4, .. })
        ));
        assert!(!dir.path().join("f").exists());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let archive = build(&[("../escape", b"x")]);
        let err = extract(&archive, 64, &root).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Archive(ArchiveError::UnsafeName(_))
        ));
        assert!(!dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_truncated_archive_fails_finish() {
        let dir = TempDir::new().unwrap();
        let archive = build(&[("f", b"abcdef")]);
        let err = extract(&archive[..33], 64, dir.path()).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::Archive(ArchiveError::Truncated(_))
        ));
    }

    #[tokio::test]
    async fn test_discard_removes_partial_file() {
        let dir = TempDir::new().unwrap();
        let archive = build(&[("partial", b"0123456789")]);
        let mut reader = ArchiveReader::new(dir.path(), 4);
        reader.write_chunk(&archive[..LOCAL_HEADER_LEN + 7 + 3]).await.unwrap();
        assert!(dir.path().join("partial").exists());
        reader.discard().await;
        assert!(!dir.path().join("partial").exists());
    }

    proptest! {
        #[test]
        fn prop_any_split_reproduces_files(
            sizes in proptest::collection::vec(0usize..300, 0..8),
            split in 1usize..64,
        ) {
            let contents: Vec<Vec<u8>> = sizes
                .iter()
                .enumerate()
                .map(|(i, n)| (0..*n).map(|b| (b * 7 + i) as u8).collect())
                .collect();
            let names: Vec<String> = (0..sizes.len()).map(|i| format!("d{}/file-{}", i % 3, i)).collect();
            let files: Vec<(&str, &[u8])> = names
                .iter()
                .zip(&contents)
                .map(|(n, c)| (n.as_str(), c.as_slice()))
                .collect();
            let archive = build(&files);

            let dir = TempDir::new().unwrap();
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let stats = rt.block_on(extract(&archive, split, dir.path())).unwrap();

            prop_assert_eq!(stats.files, files.len());
            for (name, data) in files {
                prop_assert_eq!(std::fs::read(dir.path().join(name)).unwrap(), data.to_vec());
            }
        }
    }
}
