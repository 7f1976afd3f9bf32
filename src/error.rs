//! Error types for the camera monitor.
//!
//! Two enums cover the whole taxonomy: [`ExecError`] classifies external
//! command failures so callers can pick a retry policy per kind, and
//! [`MonitorError`] carries lifecycle misuse and the direct-snapshot
//! failure chain, the only errors that ever surface to public callers.
//! Everything else is absorbed into device status and statistics.

use thiserror::Error;

/// Convenience alias for results using the monitor error type.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Classified failure from an external command invocation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("executable '{0}' not found")]
    ExecutableMissing(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device missing: {0}")]
    DeviceMissing(String),

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("cannot open device: {0}")]
    DeviceCannotOpen(String),

    #[error("command cancelled")]
    Cancelled,

    #[error("command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("command failed (exit {exit_code:?}): {message}")]
    Generic {
        message: String,
        exit_code: Option<i32>,
    },
}

impl ExecError {
    /// Transient failures worth retrying within the probe retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::DeviceBusy(_) | ExecError::Timeout { .. })
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("monitor is not running")]
    NotRunning,

    #[error("worker pool queue is full")]
    QueueFull,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("illegal status transition for '{path}': {from} -> {to}")]
    IllegalTransition {
        path: String,
        from: String,
        to: String,
    },

    #[error("snapshot capture failed: {0}")]
    Snapshot(#[from] ExecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
