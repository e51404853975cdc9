//! Directory archive codec.
//!
//! A stored (uncompressed) ZIP-style container: one local record per entry,
//! followed by central-directory records and an end-of-central-directory
//! record. The whole archive is compressed frame by frame by the pipeline.
//!
//! Only archives written by [`writer`] are accepted by [`reader`]: entries
//! never carry an extra field, CRC fields are zero and the reader stops at
//! the first central-directory byte.
//!
//! Wire format: all multi-byte integers are little-endian.

pub mod reader;
pub mod writer;

pub use reader::{ArchiveReader, ReaderStats};
pub use writer::{plan_archive, write_archive, PlannedEntry};

use crate::error::ArchiveError;
use bytes::{Buf, BufMut};
use std::path::{Component, Path, PathBuf};

// =============================================================================
// Record layout
// =============================================================================

pub const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub const CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0201_4b50;
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;

/// Fixed part of a local record, before the name
pub const LOCAL_HEADER_LEN: usize = 30;

/// Fixed part of a central-directory record, before the name
pub const CENTRAL_HEADER_LEN: usize = 46;

pub const END_OF_CENTRAL_DIRECTORY_LEN: usize = 22;

/// "Version needed to extract": 2.0, stored entries only
const VERSION: u16 = 20;

/// Byte offset of the compressed-size field inside a local header
const LOCAL_SIZE_OFFSET: usize = 18;

/// Byte offset of the name-length field inside a local header
const LOCAL_NAME_LEN_OFFSET: usize = 26;

/// One archive member. Directory markers have a name ending in `/` and size 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    /// Offset of the entry's local header from the start of the archive.
    pub offset: u64,
}

impl ArchiveEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Decoded fixed part of a local header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalHeader {
    pub size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

pub fn signature(buf: &[u8]) -> Option<u32> {
    buf.get(..4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn checked_u32(entry: &ArchiveEntry, value: u64) -> Result<u32, ArchiveError> {
    u32::try_from(value).map_err(|_| ArchiveError::EntryTooLarge {
        name: entry.name.clone(),
        size: value,
    })
}

/// Append the local header and name of `entry`.
pub fn put_local_header(buf: &mut impl BufMut, entry: &ArchiveEntry) -> Result<(), ArchiveError> {
    let size = checked_u32(entry, entry.size)?;
    let name_len = name_len(&entry.name)?;
    buf.put_u32_le(LOCAL_HEADER_SIGNATURE);
    buf.put_u16_le(VERSION);
    buf.put_u16_le(0); // flags
    buf.put_u16_le(0); // method: stored
    buf.put_u16_le(0); // mod time
    buf.put_u16_le(0); // mod date
    buf.put_u32_le(0); // crc32
    buf.put_u32_le(size); // compressed
    buf.put_u32_le(size); // uncompressed
    buf.put_u16_le(name_len);
    buf.put_u16_le(0); // extra
    buf.put_slice(entry.name.as_bytes());
    Ok(())
}

pub fn local_record_len(name: &str) -> usize {
    LOCAL_HEADER_LEN + name.len()
}

/// Decode the fixed 30-byte header. The signature must already be checked.
pub fn parse_local_header(header: &[u8]) -> LocalHeader {
    let mut size = &header[LOCAL_SIZE_OFFSET..];
    let mut lens = &header[LOCAL_NAME_LEN_OFFSET..];
    LocalHeader {
        size: size.get_u32_le(),
        name_len: lens.get_u16_le(),
        extra_len: lens.get_u16_le(),
    }
}

/// Serialize the central directory for `entries`, followed by the
/// end-of-central-directory record. `cd_offset` is where it starts.
pub fn put_central_directory(
    buf: &mut impl BufMut,
    entries: &[ArchiveEntry],
    cd_offset: u64,
) -> Result<(), ArchiveError> {
    let count = u16::try_from(entries.len())
        .map_err(|_| ArchiveError::TooManyEntries(entries.len()))?;
    let cd_start = u32::try_from(cd_offset).map_err(|_| ArchiveError::ArchiveTooLarge(cd_offset))?;

    let mut cd_len = 0usize;
    for entry in entries {
        let size = checked_u32(entry, entry.size)?;
        let offset =
            u32::try_from(entry.offset).map_err(|_| ArchiveError::ArchiveTooLarge(entry.offset))?;
        buf.put_u32_le(CENTRAL_DIRECTORY_SIGNATURE);
        buf.put_u16_le(VERSION); // made by
        buf.put_u16_le(VERSION); // needed
        buf.put_u16_le(0); // flags
        buf.put_u16_le(0); // method
        buf.put_u16_le(0); // time
        buf.put_u16_le(0); // date
        buf.put_u32_le(0); // crc32
        buf.put_u32_le(size);
        buf.put_u32_le(size);
        buf.put_u16_le(name_len(&entry.name)?);
        buf.put_u16_le(0); // extra
        buf.put_u16_le(0); // comment
        buf.put_u16_le(0); // disk start
        buf.put_u16_le(0); // internal attributes
        buf.put_u32_le(if entry.is_dir() { 0x10 } else { 0 }); // external attributes
        buf.put_u32_le(offset);
        buf.put_slice(entry.name.as_bytes());
        cd_len += CENTRAL_HEADER_LEN + entry.name.len();
    }

    buf.put_u32_le(END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    buf.put_u16_le(0); // this disk
    buf.put_u16_le(0); // disk with central directory
    buf.put_u16_le(count);
    buf.put_u16_le(count);
    buf.put_u32_le(cd_len as u32);
    buf.put_u32_le(cd_start);
    buf.put_u16_le(0); // comment
    Ok(())
}

pub fn central_directory_len(entries: &[ArchiveEntry]) -> usize {
    entries
        .iter()
        .map(|e| CENTRAL_HEADER_LEN + e.name.len())
        .sum::<usize>()
        + END_OF_CENTRAL_DIRECTORY_LEN
}

fn name_len(name: &str) -> Result<u16, ArchiveError> {
    if name.is_empty() {
        return Err(ArchiveError::EmptyName);
    }
    u16::try_from(name.len()).map_err(|_| ArchiveError::UnsafeName(name.to_string()))
}

// =============================================================================
// Entry names
// =============================================================================

/// Resolve an entry name (without any trailing `/`) under `root`, rejecting
/// names that could land outside it.
pub fn validate_entry_name(root: &Path, name: &str) -> Result<PathBuf, ArchiveError> {
    if name.is_empty() {
        return Err(ArchiveError::EmptyName);
    }
    if name.contains('\0') || name.contains('\\') {
        return Err(ArchiveError::UnsafeName(name.to_string()));
    }

    let rel_path = Path::new(name);
    if rel_path.is_absolute() {
        return Err(ArchiveError::UnsafeName(name.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(ArchiveError::UnsafeName(name.to_string()));
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return Err(ArchiveError::UnsafeName(name.to_string()));
    }
    Ok(full)
}

/// Normalize a path without touching the filesystem
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}
