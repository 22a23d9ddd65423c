//! # mcp-relay-worker
//!
//! Stdio channel to the local MCP worker process.
//!
//! Messages are newline-delimited JSON. The channel spawns the worker, writes
//! one message per line and forwards every well-formed stdout line untouched.

pub mod channel;

pub use channel::{WorkerChannel, parse_line};
