//! In-process loopback transport.
//!
//! `MemoryConnector` plays both sides: it hands out connections to a small
//! artifact store held in memory. Objects are stored exactly as uploaded
//! (compressed frames concatenated) and served back in fixed-size frames.
//! Faults can be queued to exercise refusal, rate limiting, status errors and
//! connection teardown without a network.

use super::{
    Connector, Frame, Method, MuxConnection, PeerSignal, Request, ResponseHead, StreamIo,
};
use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Default body frame size served by GET (64KB)
pub const DEFAULT_RESPONSE_CHUNK: usize = 64 * 1024;

/// Behaviour applied to the next opened stream instead of normal handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    RefuseStream,
    SlowDown,
    Status(u16),
    Protocol(String),
    /// Broadcast GOAWAY on the owning connection and never answer.
    GoAwayMidStream,
    /// Answer 200 with a body that is not valid compressed data.
    CorruptBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub len: usize,
    pub end_of_stream: bool,
}

#[derive(Default)]
struct ServerState {
    objects: Mutex<HashMap<String, Bytes>>,
    uploads: Mutex<HashMap<String, Vec<FrameRecord>>>,
    requests: Mutex<Vec<Request>>,
    faults: Mutex<VecDeque<Fault>>,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
    connect_failures: AtomicU32,
    connections_opened: AtomicU64,
    streams_opened: AtomicU64,
    streams_reset: AtomicU64,
    response_chunk: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<ServerState>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let state = ServerState::default();
        state
            .response_chunk
            .store(DEFAULT_RESPONSE_CHUNK, Ordering::Relaxed);
        Self {
            state: Arc::new(state),
        }
    }

    /// Size of the body frames served on GET.
    pub fn with_response_chunk(self, size: usize) -> Self {
        self.state
            .response_chunk
            .store(size.max(1), Ordering::Relaxed);
        self
    }

    pub fn insert_object(&self, path: impl Into<String>, data: Bytes) {
        lock(&self.state.objects).insert(path.into(), data);
    }

    pub fn object(&self, path: &str) -> Option<Bytes> {
        lock(&self.state.objects).get(path).cloned()
    }

    /// Frames received by the last completed PUT to `path`.
    pub fn frames(&self, path: &str) -> Vec<FrameRecord> {
        lock(&self.state.uploads)
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.state.requests).clone()
    }

    pub fn push_fault(&self, fault: Fault) {
        lock(&self.state.faults).push_back(fault);
    }

    pub fn push_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        lock(&self.state.faults).extend(faults);
    }

    pub fn pending_faults(&self) -> usize {
        lock(&self.state.faults).len()
    }

    /// Make the next `n` connect attempts fail with `ConnectionRefused`.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn streams_opened(&self) -> u64 {
        self.state.streams_opened.load(Ordering::SeqCst)
    }

    /// Streams closed by the client before the exchange completed.
    pub fn streams_reset(&self) -> u64 {
        self.state.streams_reset.load(Ordering::SeqCst)
    }

    /// Connections not yet closed by the client.
    pub fn open_connections(&self) -> usize {
        lock(&self.state.connections)
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Send GOAWAY on every open connection.
    pub fn go_away_all(&self, error_code: u32) {
        for conn in lock(&self.state.connections).iter() {
            if !conn.closed.load(Ordering::SeqCst) {
                conn.go_away(error_code);
            }
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Arc<dyn MuxConnection>> {
        let failures = &self.state.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection to {} refused", endpoint.authority()),
            ));
        }

        let id = self.state.connections_opened.fetch_add(1, Ordering::SeqCst) + 1;
        let (signals, _) = broadcast::channel(8);
        let conn = Arc::new(ConnectionState {
            id,
            signals,
            closed: AtomicBool::new(false),
            stream_counter: AtomicU32::new(0),
        });
        lock(&self.state.connections).push(conn.clone());
        tokio::task::yield_now().await;

        Ok(Arc::new(MemoryConnection {
            conn,
            server: self.state.clone(),
        }))
    }
}

struct ConnectionState {
    id: u64,
    signals: broadcast::Sender<PeerSignal>,
    closed: AtomicBool,
    /// Client streams use odd ids; holds the highest id handed out plus one.
    stream_counter: AtomicU32,
}

impl ConnectionState {
    fn go_away(&self, error_code: u32) {
        let last_stream_id = self.stream_counter.load(Ordering::SeqCst).saturating_sub(1);
        tracing::debug!(connection = self.id, last_stream_id, "memory transport: GOAWAY");
        // No subscribers is fine.
        let _ = self.signals.send(PeerSignal::GoAway {
            last_stream_id,
            error_code,
        });
    }
}

struct MemoryConnection {
    conn: Arc<ConnectionState>,
    server: Arc<ServerState>,
}

#[async_trait]
impl MuxConnection for MemoryConnection {
    async fn open_stream(&self, request: Request) -> Result<Box<dyn StreamIo>> {
        if self.conn.closed.load(Ordering::SeqCst) {
            return Err(TransferError::protocol("connection closed"));
        }
        let id = self.conn.stream_counter.fetch_add(2, Ordering::SeqCst) + 1;
        self.server.streams_opened.fetch_add(1, Ordering::SeqCst);
        lock(&self.server.requests).push(request.clone());
        let fault = lock(&self.server.faults).pop_front();

        Ok(Box::new(MemoryStream {
            id,
            request,
            fault,
            server: self.server.clone(),
            conn: self.conn.clone(),
            received: BytesMut::new(),
            frames: Vec::new(),
            eos_sent: false,
            head: None,
            body: VecDeque::new(),
            open: true,
        }))
    }

    fn signals(&self) -> broadcast::Receiver<PeerSignal> {
        self.conn.signals.subscribe()
    }

    async fn close(&self) {
        self.conn.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryStream {
    id: u32,
    request: Request,
    fault: Option<Fault>,
    server: Arc<ServerState>,
    conn: Arc<ConnectionState>,
    received: BytesMut,
    frames: Vec<FrameRecord>,
    eos_sent: bool,
    head: Option<ResponseHead>,
    body: VecDeque<Bytes>,
    open: bool,
}

impl MemoryStream {
    fn respond(&mut self, status: u16, body: Bytes) -> ResponseHead {
        let chunk = self.server.response_chunk.load(Ordering::Relaxed);
        let content_length = Some(body.len() as u64);
        let mut body = body;
        while !body.is_empty() {
            let n = chunk.min(body.len());
            self.body.push_back(body.split_to(n));
        }
        let head = ResponseHead {
            status,
            content_length,
        };
        self.head = Some(head);
        if self.body.is_empty() {
            self.open = false;
        }
        head
    }

    fn serve(&mut self) -> Result<ResponseHead> {
        match self.request.method {
            Method::Put => {
                if !self.eos_sent {
                    return Err(TransferError::protocol("request body not finished"));
                }
                let data = std::mem::take(&mut self.received).freeze();
                let path = self.request.path.clone();
                lock(&self.server.objects).insert(path.clone(), data);
                lock(&self.server.uploads).insert(path, std::mem::take(&mut self.frames));
                Ok(self.respond(201, Bytes::new()))
            }
            Method::Get => {
                let object = lock(&self.server.objects).get(&self.request.path).cloned();
                Ok(match object {
                    Some(data) => self.respond(200, data),
                    None => self.respond(404, Bytes::new()),
                })
            }
            Method::Head => {
                let len = lock(&self.server.objects)
                    .get(&self.request.path)
                    .map(|d| d.len() as u64);
                let head = match len {
                    Some(len) => ResponseHead {
                        status: 200,
                        content_length: Some(len),
                    },
                    None => ResponseHead {
                        status: 404,
                        content_length: None,
                    },
                };
                self.head = Some(head);
                self.open = false;
                Ok(head)
            }
        }
    }
}

#[async_trait]
impl StreamIo for MemoryStream {
    fn id(&self) -> u32 {
        self.id
    }

    async fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.open || self.conn.closed.load(Ordering::SeqCst) {
            return Err(TransferError::protocol("stream closed"));
        }
        if self.eos_sent {
            return Err(TransferError::protocol("frame after end of stream"));
        }
        if self.request.method != Method::Put {
            return Err(TransferError::protocol("unexpected request body"));
        }
        self.frames.push(FrameRecord {
            len: frame.data.len(),
            end_of_stream: frame.end_of_stream,
        });
        self.received.extend_from_slice(&frame.data);
        self.eos_sent = frame.end_of_stream;
        // Acknowledgement point.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn response(&mut self) -> Result<ResponseHead> {
        if let Some(head) = self.head {
            return Ok(head);
        }
        match self.fault.take() {
            Some(Fault::RefuseStream) => {
                self.open = false;
                Err(TransferError::StreamRefused)
            }
            Some(Fault::SlowDown) => {
                self.open = false;
                Err(TransferError::SlowDown)
            }
            Some(Fault::Protocol(msg)) => {
                self.open = false;
                Err(TransferError::Protocol(msg))
            }
            Some(Fault::Status(status)) => Ok(self.respond(status, Bytes::new())),
            Some(Fault::CorruptBody) => {
                Ok(self.respond(200, Bytes::from_static(b"definitely not zstd data")))
            }
            Some(Fault::GoAwayMidStream) => {
                self.conn.go_away(0);
                std::future::pending().await
            }
            None => self.serve(),
        }
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        if self.head.is_none() {
            return Err(TransferError::protocol("body requested before response head"));
        }
        match self.body.pop_front() {
            Some(data) => {
                let end_of_stream = self.body.is_empty();
                if end_of_stream {
                    self.open = false;
                }
                tokio::task::yield_now().await;
                Ok(Some(Frame {
                    data,
                    end_of_stream,
                }))
            }
            None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.server.streams_reset.fetch_add(1, Ordering::SeqCst);
        }
    }
}
