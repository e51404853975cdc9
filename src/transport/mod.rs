//! Transport seam.
//!
//! The secure, multiplexed transport (TLS negotiation, HTTP/2 framing) is an
//! external collaborator. This module fixes the shape the rest of the crate
//! needs from it: a [`Connector`] that opens [`MuxConnection`]s, which in turn
//! open one [`StreamIo`] per request/response exchange.
//!
//! ```text
//! Connector --connect--> MuxConnection --open_stream--> StreamIo
//!                              |                          send(Frame) (awaited = acked)
//!                              +-- signals(): GoAway      response() / recv()
//! ```

pub mod memory;

use crate::endpoint::Endpoint;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use memory::{Fault, FrameRecord, MemoryConnector};

pub const AUTHORIZATION_HEADER: &str = "authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
        }
    }

    /// Attach the endpoint's opaque credential, if it has one.
    pub fn authorized(mut self, endpoint: &Endpoint) -> Self {
        if let Some(credential) = endpoint.credential() {
            self.headers
                .push((AUTHORIZATION_HEADER.to_string(), credential.to_string()));
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// One DATA frame on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub end_of_stream: bool,
}

impl Frame {
    pub fn data(data: Bytes) -> Self {
        Self {
            data,
            end_of_stream: false,
        }
    }

    pub fn last(data: Bytes) -> Self {
        Self {
            data,
            end_of_stream: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    pub fn class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    Redirect,
    ServerError,
    ClientError,
}

impl StatusClass {
    pub fn of(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            404 => Self::NotFound,
            300..=399 => Self::Redirect,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }
}

/// Connection-level signals pushed by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSignal {
    GoAway { last_stream_id: u32, error_code: u32 },
}

/// Negotiates and returns a connected multiplexed transport.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Arc<dyn MuxConnection>>;
}

#[async_trait]
pub trait MuxConnection: Send + Sync {
    /// Open a new logical stream and send the request head on it.
    ///
    /// Per-stream refusals and rate limiting surface as
    /// [`TransferError::StreamRefused`](crate::TransferError::StreamRefused) and
    /// [`TransferError::SlowDown`](crate::TransferError::SlowDown) from any
    /// stream operation.
    async fn open_stream(&self, request: Request) -> Result<Box<dyn StreamIo>>;

    /// Subscribe to connection-level signals.
    fn signals(&self) -> broadcast::Receiver<PeerSignal>;

    /// Close the underlying transport. Must be idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait StreamIo: Send {
    fn id(&self) -> u32;

    /// Write one frame. Returns once the write has been accepted by the
    /// transport; callers must not prepare the next frame before that.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    async fn response(&mut self) -> Result<ResponseHead>;

    /// Next response body frame, `None` once the body is complete.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// `false` once the exchange completed in both directions or was reset.
    fn is_open(&self) -> bool;

    /// Reset the stream.
    async fn close(&mut self);
}
