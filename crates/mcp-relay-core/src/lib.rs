//! # mcp-relay-core
//!
//! Core types shared by the relay bridge crates.
//!
//! This crate provides:
//! - Uplink envelopes and the hello announcement
//! - MCP JSON-RPC messages and request id allocation
//! - Broadcast events and bridge status
//! - Configuration file parsing
//! - The boundary traits for the state service behind the bridge

pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod jsonrpc;
pub mod service;
pub mod status;

pub use config::{BridgeSettings, ReconnectSettings, RelayConfig, UplinkSettings, WorkerSpec};
pub use envelope::{ClientInfo, Envelope, EnvelopeKind, Hello};
pub use error::{RelayError, Result, error_codes};
pub use event::BroadcastEvent;
pub use jsonrpc::{Notification, Request, RequestId, RequestIds};
pub use service::{EventSink, ServiceError, SnapshotSource, StateService};
pub use status::{BridgeStatus, ConnectionState, SupervisorState};

/// Raw JSON fragment as read from the worker or the relay
pub use serde_json::value::RawValue;
