//! Shared cell holding the latest state snapshot

use mcp_relay_core::SnapshotSource;
use parking_lot::RwLock;
use serde_json::Value;

/// Latest known state, written by the service and read by the hub
#[derive(Debug)]
pub struct SnapshotCell {
    value: RwLock<Value>,
}

impl SnapshotCell {
    pub fn new(initial: Value) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }

    /// Replace the stored snapshot
    pub fn replace(&self, value: Value) {
        *self.value.write() = value;
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

impl SnapshotSource for SnapshotCell {
    fn snapshot(&self) -> Value {
        self.get()
    }
}
