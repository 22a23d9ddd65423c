//! Boundary with the state-mutating service behind the bridge
//!
//! The bridge never interprets operations. It needs a way to invoke them, a
//! way to read the current state for late joiners, and a sink the service
//! reports changes to.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::BroadcastEvent;

/// Typed failure returned by a service call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    /// The service cannot be reached right now
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The operation was refused
    #[error("Operation rejected ({code}): {message}")]
    Rejected { code: i64, message: String },

    /// No answer within the call deadline
    #[error("Operation timed out")]
    Timeout,

    /// The answer could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Source of the full current state
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot(&self) -> serde_json::Value;
}

/// Where change notifications go
///
/// Implementations must not block the caller.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: BroadcastEvent);
}

/// Request/response access to the service
#[async_trait]
pub trait StateService: SnapshotSource {
    /// Invoke an operation by name
    async fn call(
        &self,
        operation: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ServiceError>;

    /// Names of the operations the service exposes
    fn operations(&self) -> Vec<String>;
}
