//! Connection lifecycle.
//!
//! [`ConnectionManager`] owns the single live multiplexed connection to one
//! endpoint. Reads are lock-free (`ArcSwapOption`); opening takes an async
//! mutex and re-checks under it, so concurrent `acquire` calls share one
//! connection. A connection is live while its liveness scope (a
//! `CancellationToken`) is not cancelled. Peer GOAWAY, stream refusal and
//! `close_all` cancel the scope and clear the slot; the next `acquire`
//! opens a fresh connection.
//!
//! Transport and stream teardown run on detached tasks, so they complete even
//! when the future that triggered them is dropped.

use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError};
use crate::telemetry::{EventSink, TransferEvent};
use crate::transport::{Connector, Frame, MuxConnection, PeerSignal, Request, ResponseHead, StreamIo};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

pub struct Connection {
    id: u64,
    transport: Arc<dyn MuxConnection>,
    scope: CancellationToken,
    created_at: Instant,
    /// `(last_stream_id, error_code)` of the peer GOAWAY that ended it, if any
    going_away: OnceLock<(u32, u32)>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        !self.scope.is_cancelled()
    }

    /// Liveness scope. Cancelled exactly once, when the connection is torn down.
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Open a new stream bound to this connection's liveness scope.
    ///
    /// Fails with `GoAway` if the peer retired the connection, or
    /// `Cancelled` if it was torn down locally.
    pub async fn open_stream(&self, request: Request) -> Result<Stream> {
        if !self.is_alive() {
            return Err(match self.going_away.get() {
                Some(&(last_stream_id, error_code)) => TransferError::GoAway {
                    last_stream_id,
                    error_code,
                },
                None => TransferError::Cancelled,
            });
        }
        let io = self.transport.open_stream(request).await?;
        tracing::debug!(connection_id = self.id, stream_id = io.id(), "stream opened");
        Ok(Stream {
            io: Some(io),
            scope: self.scope.clone(),
            connection_id: self.id,
        })
    }

    fn close_detached(&self) -> tokio::task::JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let id = self.id;
        tokio::spawn(async move {
            transport.close().await;
            tracing::debug!(connection_id = id, "transport closed");
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// One request/response exchange on a [`Connection`].
///
/// Dropping a stream that is still open while its connection is alive resets
/// it on a detached task.
pub struct Stream {
    io: Option<Box<dyn StreamIo>>,
    scope: CancellationToken,
    connection_id: u64,
}

impl Stream {
    fn io(&mut self) -> Result<&mut Box<dyn StreamIo>> {
        self.io
            .as_mut()
            .ok_or_else(|| TransferError::protocol("stream already closed"))
    }

    pub fn id(&self) -> u32 {
        self.io.as_ref().map_or(0, |io| io.id())
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        self.io()?.send(frame).await
    }

    pub async fn response(&mut self) -> Result<ResponseHead> {
        self.io()?.response().await
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>> {
        self.io()?.recv().await
    }

    pub fn is_open(&self) -> bool {
        self.io.as_ref().is_some_and(|io| io.is_open())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let Some(mut io) = self.io.take() else {
            return;
        };
        if !io.is_open() || self.scope.is_cancelled() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let stream_id = io.id();
                handle.spawn(async move {
                    io.close().await;
                    tracing::debug!(stream_id, "stream reset");
                });
            }
            Err(_) => tracing::warn!(stream_id = io.id(), "no runtime to reset stream on"),
        }
    }
}

struct Shared {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    current: ArcSwapOption<Connection>,
    open_lock: Mutex<()>,
    next_id: AtomicU64,
    sink: Arc<dyn EventSink>,
}

impl Shared {
    /// Clear the slot if it still holds `conn`, then tear `conn` down.
    fn invalidate(&self, conn: &Arc<Connection>) {
        let expected = Some(Arc::clone(conn));
        let previous = self.current.compare_and_swap(&expected, None::<Arc<Connection>>);
        let swapped = matches!(&*previous, Some(p) if Arc::ptr_eq(p, conn));
        if !conn.scope.is_cancelled() {
            conn.scope.cancel();
            conn.close_detached();
        }
        tracing::debug!(connection_id = conn.id, swapped, "connection invalidated");
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                connector,
                current: ArcSwapOption::empty(),
                open_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// The cached connection, if it is still alive.
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.shared.current.load_full().filter(|c| c.is_alive())
    }

    /// Return the live connection, opening one if needed.
    ///
    /// Connect failures are returned as-is; retrying is the caller's job.
    pub async fn acquire(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let _guard = self.shared.open_lock.lock().await;
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        let previous = self.shared.current.load_full();
        debug_assert!(
            previous.as_ref().map_or(true, |p| !p.is_alive()),
            "replacing a live connection"
        );

        let endpoint = &self.shared.endpoint;
        let transport = self
            .shared
            .connector
            .connect(endpoint)
            .await
            .map_err(|source| TransferError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let conn = Arc::new(Connection {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            transport,
            scope: CancellationToken::new(),
            created_at: Instant::now(),
            going_away: OnceLock::new(),
        });
        self.watch_go_away(&conn);
        self.shared.current.store(Some(Arc::clone(&conn)));

        self.shared.sink.emit(TransferEvent::ConnectionOpened {
            endpoint: endpoint.to_string(),
            connection_id: conn.id,
        });
        Ok(conn)
    }

    /// Tear down `conn` and clear the slot if it still holds it. A newer
    /// connection in the slot is left alone.
    pub fn invalidate(&self, conn: &Arc<Connection>) {
        self.shared.invalidate(conn);
    }

    /// Close the cached connection. The transport close runs to completion
    /// even if this future is dropped.
    pub async fn close_all(&self) {
        let Some(conn) = self.shared.current.swap(None) else {
            return;
        };
        conn.scope.cancel();
        if let Err(e) = conn.close_detached().await {
            tracing::warn!(connection_id = conn.id, "transport close task failed: {}", e);
        }
    }

    fn watch_go_away(&self, conn: &Arc<Connection>) {
        let mut signals = conn.transport.signals();
        let shared = Arc::clone(&self.shared);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    _ = conn.scope.cancelled() => return,
                    signal = signals.recv() => signal,
                };
                match signal {
                    Ok(PeerSignal::GoAway {
                        last_stream_id,
                        error_code,
                    }) => {
                        let _ = conn.going_away.set((last_stream_id, error_code));
                        shared.sink.emit(TransferEvent::GoingAway {
                            connection_id: conn.id,
                            last_stream_id,
                            error_code,
                        });
                        shared.invalidate(&conn);
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(connection_id = conn.id, skipped, "signal receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        shared.invalidate(&conn);
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::NoopSink;
    use crate::transport::{MemoryConnector, Method};
    use std::time::Duration;

    fn manager(connector: &MemoryConnector) -> ConnectionManager {
        ConnectionManager::new(
            Endpoint::https("memory"),
            Arc::new(connector.clone()),
            Arc::new(NoopSink),
        )
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_acquire_reuses_live_connection() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let a = mgr.acquire().await.unwrap();
        let b = mgr.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connections_opened(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_opens_once() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move { mgr.acquire().await.unwrap() })
            })
            .collect();
        let mut conns = Vec::new();
        for h in handles {
            conns.push(h.await.unwrap());
        }
        assert_eq!(connector.connections_opened(), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    }

    #[tokio::test]
    async fn test_go_away_forces_new_connection() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let first = mgr.acquire().await.unwrap();

        connector.go_away_all(0);
        wait_until(|| !first.is_alive()).await;

        let second = mgr.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_alive());
        assert_eq!(connector.connections_opened(), 2);
        wait_until(|| connector.open_connections() == 1).await;
    }

    #[tokio::test]
    async fn test_stale_invalidate_leaves_new_connection() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let first = mgr.acquire().await.unwrap();
        mgr.invalidate(&first);
        let second = mgr.acquire().await.unwrap();

        mgr.invalidate(&first);
        assert!(second.is_alive());
        assert!(Arc::ptr_eq(&mgr.current().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_without_retry() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(1);
        let mgr = manager(&connector);
        let err = mgr.acquire().await.unwrap_err();
        assert!(matches!(err, TransferError::Connect { .. }));
        assert!(mgr.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_all_closes_transport() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let conn = mgr.acquire().await.unwrap();
        mgr.close_all().await;
        assert!(!conn.is_alive());
        assert!(mgr.current().is_none());
        assert_eq!(connector.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_dropped_open_stream_is_reset() {
        let connector = MemoryConnector::new();
        connector.insert_object("/a", bytes::Bytes::from_static(b"xyz"));
        let mgr = manager(&connector);
        let conn = mgr.acquire().await.unwrap();
        let mut stream = conn.open_stream(Request::new(Method::Get, "/a")).await.unwrap();
        stream.response().await.unwrap();
        assert!(stream.is_open());
        drop(stream);
        wait_until(|| connector.streams_reset() == 1).await;
    }

    #[tokio::test]
    async fn test_stream_on_dead_connection_is_cancelled() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let conn = mgr.acquire().await.unwrap();
        mgr.invalidate(&conn);
        let err = conn
            .open_stream(Request::new(Method::Head, "/a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_on_retired_connection_reports_go_away() {
        let connector = MemoryConnector::new();
        let mgr = manager(&connector);
        let conn = mgr.acquire().await.unwrap();
        connector.go_away_all(7);
        wait_until(|| !conn.is_alive()).await;
        let err = conn
            .open_stream(Request::new(Method::Head, "/a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::GoAway { error_code: 7, .. }));
    }
}
