//! # mcp-relay-server
//!
//! The bridge between a local MCP worker and a remote relay.
//!
//! This crate provides:
//! - `BridgeSupervisor` owning the worker, the uplink and the broadcast hub
//! - Message translation between worker lines and uplink envelopes
//! - A tool service that calls into the worker and feeds observers
//! - The HTTP/SSE surface for local observers

pub mod http;
pub mod pending;
pub mod supervisor;
pub mod tools;
pub mod translator;

pub use http::{AppState, StatusSource, router, serve};
pub use pending::{PendingGuard, PendingRequests};
pub use supervisor::BridgeSupervisor;
pub use tools::{ToolSettings, WorkerToolService};
pub use translator::{Route, UplinkSink, WorkerSink};
