//! Correlation of bridge-originated requests with worker responses

use mcp_relay_core::RawValue;
use mcp_relay_core::RequestId;
use mcp_relay_core::jsonrpc::MessageProbe;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// Requests the bridge sent to the worker and is still waiting on
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<RequestId, oneshot::Sender<Box<RawValue>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for the response with this id
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<Box<RawValue>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Register a waiter that is removed again when the guard drops
    ///
    /// Covers requesters whose future is dropped before the answer arrives.
    pub fn register_guarded(
        &self,
        id: RequestId,
    ) -> (PendingGuard<'_>, oneshot::Receiver<Box<RawValue>>) {
        let rx = self.register(id.clone());
        (PendingGuard { table: self, id }, rx)
    }

    /// Stop waiting (e.g. after a timeout)
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.waiters.lock().remove(id).is_some()
    }

    /// Claim a worker message if it answers a pending request
    ///
    /// Returns the message back when it is not ours to consume.
    pub fn offer(&self, message: Box<RawValue>) -> Option<Box<RawValue>> {
        let id = match serde_json::from_str::<MessageProbe>(message.get()) {
            Ok(probe) => match probe.response_id() {
                Some(id) => id.clone(),
                None => return Some(message),
            },
            Err(_) => return Some(message),
        };

        let waiter = self.waiters.lock().remove(&id);
        match waiter {
            Some(tx) => {
                debug!(%id, "Response to bridge request received");
                if tx.send(message).is_err() {
                    debug!(%id, "Requester gone, dropping response");
                }
                None
            }
            None => Some(message),
        }
    }

    /// Abandon every waiter; their receivers observe a closed channel
    pub fn fail_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.waiters.lock());
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

/// Cancels its request id on drop; a no-op once the response was claimed
#[derive(Debug)]
pub struct PendingGuard<'a> {
    table: &'a PendingRequests,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel(&self.id) {
            debug!(id = %self.id, "Abandoned bridge request");
        }
    }
}
