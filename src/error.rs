//! Error taxonomy for artifact transfers.
//!
//! Every failure a transfer can hit resolves to one [`TransferError`]. The
//! retry engine classifies these variants (see [`crate::retry::Failure`]);
//! nothing here is fatal to the process.

use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The transport factory could not produce a connection.
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Peer announced it will not accept new streams on this connection.
    #[error("Connection going away (last stream {last_stream_id}, error code {error_code})")]
    GoAway {
        last_stream_id: u32,
        error_code: u32,
    },

    #[error("Stream refused by peer")]
    StreamRefused,

    /// Rate limiting signal from the peer.
    #[error("Peer asked to slow down")]
    SlowDown,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected response status {status}")]
    UnexpectedStatus { status: u16 },

    #[error("Operation cancelled")]
    Cancelled,

    /// Corrupted or out-of-bounds data. Never retried.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Aggregate raised once the retry budget is spent or a terminal failure
    /// was observed. `suppressed` holds the causes of earlier attempts.
    #[error(
        "Transfer failed after {attempts} attempt(s): {cause}{}",
        render_suppressed(.suppressed)
    )]
    RetryExhausted {
        attempts: u32,
        #[source]
        cause: Box<TransferError>,
        suppressed: Vec<TransferError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Status code carried by an `UnexpectedStatus` error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status } => Some(*status),
            _ => None,
        }
    }

    /// Suppressed causes of an aggregated error (empty for every other variant).
    pub fn suppressed(&self) -> &[TransferError] {
        match self {
            Self::RetryExhausted { suppressed, .. } => suppressed,
            _ => &[],
        }
    }
}

fn render_suppressed(suppressed: &[TransferError]) -> String {
    if suppressed.is_empty() {
        return String::new();
    }
    let mut out = String::from(" (suppressed:");
    for (i, cause) in suppressed.iter().enumerate() {
        out.push_str(&format!(" [{}] {}", i + 1, cause));
    }
    out.push(')');
    out
}

/// Violations of the archive container format produced by [`crate::archive`].
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Unknown record signature {0:#010x}")]
    BadSignature(u32),

    /// Only archives written by this crate are accepted, and those never
    /// carry an extra field.
    #[error("Entry {name:?} has a non-zero extra field length ({len})")]
    ExtraField { name: String, len: u16 },

    #[error("Entry name is empty")]
    EmptyName,

    #[error("Entry name is not valid UTF-8")]
    InvalidName,

    #[error("Unsafe entry name {0:?}")]
    UnsafeName(String),

    #[error("Entry {name:?} is too large ({size} bytes)")]
    EntryTooLarge { name: String, size: u64 },

    #[error("Too many entries ({0})")]
    TooManyEntries(usize),

    #[error("Archive exceeds the 32-bit offset range ({0} bytes)")]
    ArchiveTooLarge(u64),

    #[error("Archive truncated {0}")]
    Truncated(&'static str),
}

/// Where a cancellation originated. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    Caller,
    Connection,
}

impl fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Connection => write!(f, "connection teardown"),
        }
    }
}
