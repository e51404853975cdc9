//! Retry classification and decision table.
//!
//! Every failed attempt is reduced to a [`Failure`] and fed to
//! [`RetryPolicy::decide`]. Whether a retry consumes an attempt lives in the
//! table, not in the orchestrator's control flow.
//!
//! | Failure             | attempts left        | last attempt |
//! |---------------------|----------------------|--------------|
//! | StreamRefused       | Reconnect            | GiveUp       |
//! | SlowDown            | Cooldown(fixed)      | GiveUp       |
//! | Protocol            | Continue             | Rethrow      |
//! | ConnectionTeardown  | RetryFree            | RetryFree    |
//! | CallerCancelled     | Rethrow              | Rethrow      |
//! | ClientStatus        | Rethrow              | Rethrow      |
//! | ServerStatus        | Backoff(random)      | GiveUp       |
//! | Transient           | Backoff(random)      | GiveUp       |
//! | Terminal            | GiveUp               | GiveUp       |
//!
//! `RetryFree` is bounded separately by `max_connection_resets`. A refused
//! stream always invalidates its connection, including on the last attempt.

use crate::error::TransferError;
use crate::transport::StatusClass;
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    StreamRefused,
    SlowDown,
    Protocol,
    /// Cancelled because the connection was torn down; the caller is still waiting.
    ConnectionTeardown,
    CallerCancelled,
    /// Non-5xx unexpected status.
    ClientStatus,
    ServerStatus,
    Transient,
    /// Corrupted or out-of-bounds data, or an already aggregated error.
    Terminal,
}

impl Failure {
    pub fn classify(err: &TransferError, caller_cancelled: bool) -> Self {
        match err {
            TransferError::StreamRefused => Self::StreamRefused,
            TransferError::SlowDown => Self::SlowDown,
            TransferError::Protocol(_) => Self::Protocol,
            TransferError::GoAway { .. } => Self::ConnectionTeardown,
            TransferError::Cancelled if caller_cancelled => Self::CallerCancelled,
            TransferError::Cancelled => Self::ConnectionTeardown,
            TransferError::UnexpectedStatus { status } => match StatusClass::of(*status) {
                StatusClass::ServerError => Self::ServerStatus,
                _ => Self::ClientStatus,
            },
            TransferError::Corrupted(_)
            | TransferError::Archive(_)
            | TransferError::Config(_)
            | TransferError::RetryExhausted { .. } => Self::Terminal,
            TransferError::Connect { .. } | TransferError::Io(_) | TransferError::Other(_) => {
                Self::Transient
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Retry on a new connection. The refused one is invalidated whatever
    /// the decision.
    Reconnect,
    /// Sleep for a fixed period, then retry.
    Cooldown(Duration),
    /// Retry right away.
    Continue,
    /// Retry right away without consuming an attempt.
    RetryFree,
    /// Sleep for a randomized period, then retry.
    Backoff(Duration),
    /// Return the error unchanged.
    Rethrow,
    /// Return an aggregate of this error and all earlier causes.
    GiveUp,
}

impl Decision {
    pub fn consumes_attempt(self) -> bool {
        !matches!(self, Self::RetryFree)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub max_connection_resets: u32,
    pub slow_down_cooldown: Duration,
    pub backoff_min: Duration,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        crate::config::ClientConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Decide what to do after `failure` on 1-based `attempt`, with
    /// `resets` attempt-free retries already spent.
    pub fn decide(&self, failure: Failure, attempt: u32, resets: u32) -> Decision {
        let more = attempt < self.max_attempts;
        match failure {
            Failure::StreamRefused if more => Decision::Reconnect,
            Failure::SlowDown if more => Decision::Cooldown(self.slow_down_cooldown),
            Failure::Protocol if more => Decision::Continue,
            Failure::Protocol => Decision::Rethrow,
            Failure::ConnectionTeardown if resets < self.max_connection_resets => {
                Decision::RetryFree
            }
            Failure::CallerCancelled | Failure::ClientStatus => Decision::Rethrow,
            Failure::ServerStatus | Failure::Transient if more => {
                Decision::Backoff(self.backoff_delay(attempt))
            }
            _ => Decision::GiveUp,
        }
    }

    /// Uniformly random in `[backoff_min, attempt * backoff_step]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let min = self.backoff_min;
        let max = (self.backoff_step * attempt.max(1)).max(min);
        let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(ms as u64)
    }
}
