//! # mcp-relay-uplink
//!
//! Persistent WebSocket connection to the remote MCP relay.
//!
//! The connector announces itself with a hello frame on every connect,
//! queues envelopes while the relay is unreachable and reconnects with
//! exponential backoff until its retry budget is spent.

pub mod connector;
pub mod policy;
pub mod queue;

pub use connector::{UplinkChannels, UplinkConfig, UplinkConnector, UplinkNotice, UplinkStatus};
pub use policy::ReconnectPolicy;
pub use queue::OutboundQueue;
