//! Stream orchestration with bounded retries.
//!
//! [`StreamOrchestrator::execute`] runs one logical exchange: acquire the
//! live connection, open a fresh stream on it and drive the caller's unit of
//! work to completion. The attempt future races the caller's cancellation
//! token and the connection's liveness scope, so a torn-down connection
//! surfaces as `Cancelled` while the caller is still waiting. What happens
//! next is decided by [`RetryPolicy::decide`].

use crate::connection::{Connection, ConnectionManager, Stream};
use crate::error::{CancelOrigin, Result, TransferError};
use crate::retry::{Decision, Failure, RetryPolicy};
use crate::telemetry::{EventSink, TransferEvent};
use crate::transport::Request;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct StreamOrchestrator {
    connections: ConnectionManager,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl StreamOrchestrator {
    pub fn new(
        connections: ConnectionManager,
        policy: RetryPolicy,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connections,
            policy,
            sink,
            cancel,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Caller scope. Cancelling it aborts in-flight work without retrying.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `work` on a new stream for `request`, retrying per the policy.
    ///
    /// `work` is called once per attempt with a stream nobody else has
    /// touched; it must not assume any state from earlier attempts. If the
    /// work returns or is dropped with the stream still open, the stream is
    /// reset on a detached task.
    pub async fn execute<T, F, Fut>(&self, request: Request, mut work: F) -> Result<T>
    where
        F: FnMut(Stream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        let mut resets = 0u32;
        let mut suppressed = Vec::new();

        loop {
            let mut used = None;
            let err = match self.attempt(&request, &mut work, &mut used).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let failure = Failure::classify(&err, self.cancel.is_cancelled());
            let decision = self.policy.decide(failure, attempt, resets);
            tracing::debug!(
                path = %request.path,
                attempt,
                ?failure,
                ?decision,
                "attempt failed: {}",
                err
            );

            if failure == Failure::StreamRefused {
                if let Some(conn) = &used {
                    self.connections.invalidate(conn);
                    self.sink.emit(TransferEvent::StreamRefused {
                        connection_id: conn.id(),
                        attempt,
                    });
                }
            }

            match decision {
                Decision::Rethrow => {
                    if failure == Failure::CallerCancelled {
                        tracing::debug!(path = %request.path, origin = %CancelOrigin::Caller, "exchange cancelled");
                    }
                    return Err(err);
                }
                Decision::GiveUp => {
                    self.sink.emit(TransferEvent::RetryExhausted {
                        attempts: attempt,
                        suppressed: suppressed.len(),
                    });
                    return Err(TransferError::RetryExhausted {
                        attempts: attempt,
                        cause: Box::new(err),
                        suppressed,
                    });
                }
                Decision::RetryFree => {
                    resets += 1;
                    tracing::debug!(
                        path = %request.path,
                        attempt,
                        resets,
                        origin = %CancelOrigin::Connection,
                        "retrying after connection teardown"
                    );
                    continue;
                }
                Decision::Reconnect => {
                    tracing::warn!(path = %request.path, attempt, "stream refused, reconnecting");
                }
                Decision::Cooldown(cooldown) => {
                    self.sink
                        .emit(TransferEvent::RateLimited { attempt, cooldown });
                    self.pause(cooldown).await?;
                }
                Decision::Continue => {
                    tracing::warn!(path = %request.path, attempt, "protocol error, retrying: {}", err);
                }
                Decision::Backoff(delay) => {
                    tracing::warn!(
                        path = %request.path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after: {}",
                        err
                    );
                    self.pause(delay).await?;
                }
            }

            suppressed.push(err);
            attempt += 1;
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        request: &Request,
        work: &mut F,
        used: &mut Option<Arc<Connection>>,
    ) -> Result<T>
    where
        F: FnMut(Stream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            conn = self.connections.acquire() => conn?,
        };
        *used = Some(Arc::clone(&conn));

        let exchange = async {
            let stream = conn.open_stream(request.clone()).await?;
            tracing::debug!(
                connection_id = conn.id(),
                stream_id = stream.id(),
                path = %request.path,
                "exchange started"
            );
            work(stream).await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = conn.scope().cancelled() => Err(TransferError::Cancelled),
            result = exchange => result,
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
