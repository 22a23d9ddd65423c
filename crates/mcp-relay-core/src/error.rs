//! Error types for the relay bridge

use std::time::Duration;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// Worker process has not been started or has exited
    #[error("Worker process not running")]
    ProcessNotRunning,

    /// Worker process is already running
    #[error("Worker process already running")]
    WorkerAlreadyRunning,

    /// Worker process could not be launched
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// Pipe or socket I/O failed
    #[error("IPC error: {0}")]
    IpcError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Peer sent something we did not expect
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Worker did not answer the initialize request in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Uplink connector has been shut down
    #[error("Uplink closed")]
    UplinkClosed,

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Bad or missing configuration
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Startup failed and was rolled back
    #[error("Startup failed: {0}")]
    StartupFailed(String),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

/// JSON-RPC error codes used by the relay
pub mod error_codes {
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
}
