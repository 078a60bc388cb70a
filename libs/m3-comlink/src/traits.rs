//! Core Link Traits
//!
//! Interfaces the engine needs from its collaborators: the transport that
//! moves bytes, the interrupt registry, and the scheduler wake-up handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{InterruptSource, Reply, Request};

// ============================================================================
// Connection State
// ============================================================================

/// Connection state for a transport endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// Not initialized yet
    #[default]
    Uninitialized,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
    /// Connection lost, will retry on next request
    Disconnected,
    /// Connection closed normally
    Closed,
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Uninitialized => write!(f, "UNINITIALIZED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Process-wide channel to the backplane.
///
/// Opened once at startup and shared as `Arc<dyn M3Transport>` by every
/// record and by the dispatch queue worker.
#[async_trait]
pub trait M3Transport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Slot number of the CPU module this process runs on
    fn query_local_slot(&self) -> Result<u8>;

    /// Perform one transaction.
    ///
    /// A non-zero remote status is returned as `Ok(Reply)` with
    /// `error_code` set; `Err` means the transfer itself failed.
    async fn transfer(&self, request: &Request) -> Result<Reply>;

    fn connection_state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }
}

/// Associates an interrupt source with a scheduler wake-up
pub trait InterruptRegistrar: Send + Sync {
    fn register(&self, source: InterruptSource, wake: WakeTarget) -> Result<()>;
}

// ============================================================================
// Wake-up
// ============================================================================

/// Index of a record in the scheduler's table
pub type RecordId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The record's pending request has completed
    Completion,
    /// An interrupt source the record listens on fired
    Interrupt(InterruptSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub record: RecordId,
    pub reason: WakeReason,
}

/// Handle that asks the scheduler to process a record again
#[derive(Debug, Clone)]
pub struct WakeTarget {
    record: RecordId,
    tx: mpsc::UnboundedSender<WakeEvent>,
}

impl WakeTarget {
    pub fn new(record: RecordId, tx: mpsc::UnboundedSender<WakeEvent>) -> Self {
        Self { record, tx }
    }

    pub fn record(&self) -> RecordId {
        self.record
    }

    /// Returns false once the scheduler has gone away
    pub fn wake(&self, reason: WakeReason) -> bool {
        self.tx
            .send(WakeEvent {
                record: self.record,
                reason,
            })
            .is_ok()
    }
}

// ============================================================================
// Record Logger
// ============================================================================

/// Per-record logger; every line carries the record name
#[derive(Debug, Clone)]
pub struct RecordLogger {
    pub record_name: String,
}

impl RecordLogger {
    pub fn new(record_name: impl Into<String>) -> Self {
        Self {
            record_name: record_name.into(),
        }
    }

    /// Log initialization step
    pub fn log_init(&self, address: &str, message: &str) {
        tracing::info!(record = %self.record_name, "[INIT] {} - {}", address, message);
    }

    /// Log a submitted request
    pub fn log_request(&self, family: &str, id: u64) {
        tracing::debug!(record = %self.record_name, "[TX] {} #{}", family, id);
    }

    /// Log a completed response
    pub fn log_response(&self, id: u64, message: &str) {
        tracing::debug!(record = %self.record_name, "[RX] #{} {}", id, message);
    }

    /// Log protocol bytes
    pub fn log_frame(&self, direction: &str, data: &[u8]) {
        let hex_str = data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::trace!(
            record = %self.record_name,
            "[{}] {} bytes: [{}]",
            direction,
            data.len(),
            hex_str
        );
    }

    /// Log error
    pub fn log_error(&self, context: &str, error: &str) {
        tracing::error!(record = %self.record_name, "[ERROR] {} - {}", context, error);
    }

    /// Log a fail-soft data quality problem
    pub fn log_alarm(&self, message: &str) {
        tracing::warn!(record = %self.record_name, "[ALARM] {}", message);
    }
}
