//! Observability sink and logging bootstrap.
//!
//! Events are fire-and-forget: no transfer behaviour depends on whether a
//! sink consumes them.

use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    ConnectionOpened {
        endpoint: String,
        connection_id: u64,
    },
    GoingAway {
        connection_id: u64,
        last_stream_id: u32,
        error_code: u32,
    },
    StreamRefused {
        connection_id: u64,
        attempt: u32,
    },
    RateLimited {
        attempt: u32,
        cooldown: Duration,
    },
    RetryExhausted {
        attempts: u32,
        suppressed: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransferEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: TransferEvent) {
        match event {
            TransferEvent::ConnectionOpened {
                endpoint,
                connection_id,
            } => tracing::info!(%endpoint, connection_id, "connection opened"),
            TransferEvent::GoingAway {
                connection_id,
                last_stream_id,
                error_code,
            } => tracing::warn!(connection_id, last_stream_id, error_code, "connection going away"),
            TransferEvent::StreamRefused {
                connection_id,
                attempt,
            } => tracing::warn!(connection_id, attempt, "stream refused"),
            TransferEvent::RateLimited { attempt, cooldown } => {
                tracing::warn!(attempt, cooldown_ms = cooldown.as_millis() as u64, "rate limited")
            }
            TransferEvent::RetryExhausted {
                attempts,
                suppressed,
            } => tracing::error!(attempts, suppressed, "retry budget exhausted"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: TransferEvent) {}
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TransferEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TransferEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TransferEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Returns `false` if a subscriber was already set.
pub fn init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
