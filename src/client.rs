//! Artifact transfer client.
//!
//! One `ArtifactClient` talks to one endpoint. It owns the connection
//! manager, the retry orchestrator and a compressor/decompressor pool pair;
//! every public operation is a single retried exchange.

use crate::archive::{plan_archive, write_archive, ArchiveReader};
use crate::compression::{CompressionContextPool, Compressor, Decompressor};
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Stream};
use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError};
use crate::orchestrator::StreamOrchestrator;
use crate::pipeline::{
    download, map_source, prepare_destination, upload, FileSink, NotFoundPolicy, PipelineOptions,
    SourceData, TransferResult,
};
use crate::telemetry::{EventSink, TracingSink};
use crate::transport::{Connector, Method, Request, StatusClass};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct ArtifactClient {
    orchestrator: StreamOrchestrator,
    compressors: CompressionContextPool<Compressor>,
    decompressors: CompressionContextPool<Decompressor>,
    options: PipelineOptions,
    config: ClientConfig,
}

impl ArtifactClient {
    /// Build a client that reports events through `tracing`.
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, config: ClientConfig) -> Result<Self> {
        Self::with_sink(endpoint, connector, config, Arc::new(TracingSink))
    }

    pub fn with_sink(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        config.validate()?;
        let connections = ConnectionManager::new(endpoint, connector, Arc::clone(&sink));
        let orchestrator = StreamOrchestrator::new(
            connections,
            config.retry_policy(),
            sink,
            CancellationToken::new(),
        );
        Ok(Self {
            orchestrator,
            compressors: CompressionContextPool::new(config.compression_level, config.pool_capacity),
            decompressors: CompressionContextPool::new(0, config.pool_capacity),
            options: config.pipeline_options(),
            config,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.orchestrator.connections().endpoint()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Token that aborts every in-flight and future operation of this client.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.orchestrator.cancellation_token().clone()
    }

    fn request(&self, method: Method, path: &str) -> Request {
        Request::new(method, path).authorized(self.endpoint())
    }

    /// Upload a file, mapped into memory, as a compressed object at `path`.
    pub async fn upload_file(&self, path: &str, source: &Path) -> Result<TransferResult> {
        let data = map_source(source)?;
        let result = self.upload_source(path, &data).await?;
        tracing::info!(
            path,
            source = %source.display(),
            file_size = result.file_size,
            wire_size = result.wire_size,
            "uploaded file"
        );
        Ok(result)
    }

    pub async fn upload_bytes(&self, path: &str, data: Bytes) -> Result<TransferResult> {
        let result = self.upload_source(path, &SourceData::Memory(data)).await?;
        tracing::info!(path, file_size = result.file_size, wire_size = result.wire_size, "uploaded bytes");
        Ok(result)
    }

    async fn upload_source(&self, path: &str, source: &SourceData) -> Result<TransferResult> {
        let data = source.as_slice();
        let pool = &self.compressors;
        let options = &self.options;
        self.orchestrator
            .execute(self.request(Method::Put, path), |mut stream: Stream| async move {
                upload(&mut stream, data, pool, options).await
            })
            .await
    }

    /// Upload the tree under `root` as one archive object at `path`. The
    /// tree is walked once, before any stream is opened.
    pub async fn upload_dir(&self, path: &str, root: &Path) -> Result<TransferResult> {
        let planned = plan_archive(root).await?;
        let planned = planned.as_slice();
        let pool = &self.compressors;
        let options = &self.options;
        let result = self
            .orchestrator
            .execute(self.request(Method::Put, path), |mut stream: Stream| async move {
                write_archive(&mut stream, root, planned, pool, options).await
            })
            .await?;
        tracing::info!(
            path,
            root = %root.display(),
            archive_size = result.file_size,
            wire_size = result.wire_size,
            "uploaded directory"
        );
        Ok(result)
    }

    /// Download the object at `path` into `dest`. `dest` only appears once
    /// the whole body has been received and verified.
    pub async fn download_file(
        &self,
        path: &str,
        dest: &Path,
        not_found: NotFoundPolicy,
    ) -> Result<TransferResult> {
        prepare_destination(dest).await?;
        let pool = &self.decompressors;
        let options = &self.options;
        let result = self
            .orchestrator
            .execute(self.request(Method::Get, path), |mut stream: Stream| async move {
                let mut sink = FileSink::create(dest).await?;
                download(&mut stream, &mut sink, pool, options, not_found).await
            })
            .await?;
        if !result.is_not_found() {
            tracing::info!(
                path,
                dest = %dest.display(),
                file_size = result.file_size,
                wire_size = result.wire_size,
                "downloaded file"
            );
        }
        Ok(result)
    }

    /// Download an archive object and extract it under `dest`.
    pub async fn download_dir(
        &self,
        path: &str,
        dest: &Path,
        not_found: NotFoundPolicy,
    ) -> Result<TransferResult> {
        tokio::fs::create_dir_all(dest).await?;
        let pool = &self.decompressors;
        let options = &self.options;
        self.orchestrator
            .execute(self.request(Method::Get, path), |mut stream: Stream| async move {
                let mut reader = ArchiveReader::new(dest, options.max_write_chunk);
                let result = download(&mut stream, &mut reader, pool, options, not_found).await?;
                if !result.is_not_found() {
                    let stats = reader.stats();
                    tracing::info!(
                        path,
                        dest = %dest.display(),
                        files = stats.files,
                        directories = stats.directories,
                        bytes = stats.bytes,
                        "downloaded directory"
                    );
                }
                Ok(result)
            })
            .await
    }

    /// Stored size of the object at `path`, or `None` if it does not exist.
    pub async fn head(&self, path: &str) -> Result<Option<u64>> {
        self.orchestrator
            .execute(self.request(Method::Head, path), |mut stream: Stream| async move {
                let head = stream.response().await?;
                match head.class() {
                    StatusClass::Success => Ok(Some(head.content_length.unwrap_or(0))),
                    StatusClass::NotFound => Ok(None),
                    _ => Err(TransferError::UnexpectedStatus {
                        status: head.status,
                    }),
                }
            })
            .await
    }

    /// Cancel in-flight work, close the connection and dispose pooled codec
    /// contexts. The client rejects further operations afterwards.
    pub async fn shutdown(&self) {
        self.orchestrator.cancellation_token().cancel();
        self.orchestrator.connections().close_all().await;
        let compressors = self.compressors.shutdown();
        let decompressors = self.decompressors.shutdown();
        tracing::debug!(compressors, decompressors, "client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use tempfile::TempDir;

    fn client(connector: &MemoryConnector) -> ArtifactClient {
        ArtifactClient::new(
            Endpoint::https("cache.example").with_credential("secret"),
            Arc::new(connector.clone()),
            ClientConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClientConfig {
            max_attempts: 0,
            ..Default::default()
        };
        let result = ArtifactClient::new(
            Endpoint::https("x"),
            Arc::new(MemoryConnector::new()),
            config,
        );
        assert!(matches!(result, Err(TransferError::Config(_))));
    }

    #[tokio::test]
    async fn test_requests_carry_credential() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        client.upload_bytes("/a", Bytes::from_static(b"x")).await.unwrap();
        let requests = connector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("authorization"), Some("secret"));
        assert_eq!(requests[0].method, Method::Put);
    }

    #[tokio::test]
    async fn test_head_reports_stored_size() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        assert_eq!(client.head("/a").await.unwrap(), None);
        client.upload_bytes("/a", Bytes::from_static(b"payload")).await.unwrap();
        let stored = connector.object("/a").unwrap().len() as u64;
        assert_eq!(client.head("/a").await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("in.bin");
        let dest = dir.path().join("out/out.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let connector = MemoryConnector::new();
        let client = client(&connector);
        let up = client.upload_file("/f", &src).await.unwrap();
        let down = client
            .download_file("/f", &dest, NotFoundPolicy::Fail)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(up.digest, down.digest);
        assert_eq!(up.wire_size, down.wire_size);
        assert_eq!(connector.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_missing_upload_root_fails_before_any_stream() {
        let dir = TempDir::new().unwrap();
        let connector = MemoryConnector::new();
        let client = client(&connector);
        let err = client
            .upload_dir("/t", &dir.path().join("not-here"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(connector.streams_opened(), 0);
        assert_eq!(connector.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_unwritable_destination_fails_before_any_stream() {
        let dir = TempDir::new().unwrap();
        let connector = MemoryConnector::new();
        let client = client(&connector);
        client.upload_bytes("/a", Bytes::from_static(b"x")).await.unwrap();
        let opened = connector.streams_opened();

        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let err = client
            .download_file("/a", &blocker.join("out.bin"), NotFoundPolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));

        let err = client
            .download_dir("/a", &blocker.join("tree"), NotFoundPolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert_eq!(connector.streams_opened(), opened);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_rejects_further_work() {
        let connector = MemoryConnector::new();
        let client = client(&connector);
        client.upload_bytes("/a", Bytes::from_static(b"x")).await.unwrap();
        client.shutdown().await;
        assert_eq!(connector.open_connections(), 0);
        let err = client.head("/a").await.unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }
}
