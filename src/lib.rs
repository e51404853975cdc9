//! Artifact transfer client.
//!
//! Uploads and downloads build artifacts (single files and whole directory
//! trees) over one shared multiplexed connection per endpoint, compressing
//! on the fly with zstd. Peer GOAWAY, refused streams, rate limiting and
//! transient failures are absorbed by a bounded retry policy.
//!
//! ```text
//! ArtifactClient
//!   └─ StreamOrchestrator ── RetryPolicy
//!        └─ ConnectionManager ── Connector (transport seam)
//!             └─ Stream
//!                  ├─ pipeline::upload / download ── CompressionContextPool
//!                  └─ archive::write_archive / ArchiveReader
//! ```

pub mod archive;
pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod telemetry;
pub mod transport;

pub use client::ArtifactClient;
pub use config::ClientConfig;
pub use endpoint::{Endpoint, Scheme};
pub use error::{ArchiveError, Result, TransferError};
pub use pipeline::{NotFoundPolicy, TransferResult, TransferStatus};
pub use telemetry::{EventSink, TransferEvent};
