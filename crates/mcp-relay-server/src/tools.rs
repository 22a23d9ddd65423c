//! Worker-backed state service
//!
//! Invokes the worker's MCP tools on behalf of local callers (the HTTP
//! surface) and reports the outcome to the broadcast hub. Requests carry
//! bridge ids and are answered through [`PendingRequests`], so they never
//! reach the relay.

use crate::pending::PendingRequests;
use async_trait::async_trait;
use mcp_relay_broadcast::SnapshotCell;
use mcp_relay_core::event::HINTS_PROVIDED;
use mcp_relay_core::jsonrpc::Response;
use mcp_relay_core::{
    BridgeSettings, BroadcastEvent, EventSink, Request, RequestIds, ServiceError,
    SnapshotSource, StateService, WorkerSpec, error_codes,
};
use mcp_relay_worker::WorkerChannel;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tool call behaviour
#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub call_timeout: Duration,
    /// Tool that returns the full state; used to refresh the snapshot
    pub state_tool: Option<String>,
    /// Tools whose success is broadcast, mapped to the event type
    pub event_types: BTreeMap<String, String>,
    /// Advertised tools; empty means any name is passed through
    pub tools: Vec<String>,
}

impl ToolSettings {
    pub fn from_config(bridge: &BridgeSettings, worker: &WorkerSpec) -> Self {
        Self {
            call_timeout: bridge.call_timeout(),
            state_tool: bridge.state_tool.clone(),
            event_types: bridge.event_types.clone(),
            tools: worker.tools.clone(),
        }
    }
}

/// [`StateService`] implemented by calling tools on the worker
pub struct WorkerToolService {
    worker: Arc<WorkerChannel>,
    pending: Arc<PendingRequests>,
    ids: Arc<RequestIds>,
    snapshot: Arc<SnapshotCell>,
    events: Arc<dyn EventSink>,
    settings: ToolSettings,
}

impl WorkerToolService {
    pub fn new(
        worker: Arc<WorkerChannel>,
        pending: Arc<PendingRequests>,
        ids: Arc<RequestIds>,
        snapshot: Arc<SnapshotCell>,
        events: Arc<dyn EventSink>,
        settings: ToolSettings,
    ) -> Self {
        Self {
            worker,
            pending,
            ids,
            snapshot,
            events,
            settings,
        }
    }

    /// Send a JSON-RPC request to the worker and wait for its result
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        if !self.worker.is_running() {
            return Err(ServiceError::Unavailable("worker process not running".into()));
        }

        let id = RequestIds::wire_id(self.ids.allocate());
        let (_guard, waiter) = self.pending.register_guarded(id.clone());
        let request = Request::new(id.clone(), method, params);
        debug!(%id, method, "Sending bridge request to worker");

        if let Err(e) = self.worker.send_message(&request).await {
            return Err(ServiceError::Unavailable(e.to_string()));
        }

        let raw = match tokio::time::timeout(self.settings.call_timeout, waiter).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(_)) => {
                return Err(ServiceError::Unavailable(
                    "bridge stopped before the worker answered".into(),
                ));
            }
            Err(_) => {
                warn!(%id, method, "Worker request timed out");
                return Err(ServiceError::Timeout);
            }
        };

        let response: Response = serde_json::from_str(raw.get())
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(ServiceError::Rejected {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Call a tool and unwrap its first text content block
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        let result = self
            .request(
                "tools/call",
                json!({
                    "name": name,
                    "arguments": arguments
                }),
            )
            .await?;
        unwrap_tool_result(result)
    }

    /// Re-read the state through the state tool; falls back to the cached copy
    pub async fn refresh_snapshot(&self) -> Value {
        let Some(tool) = self.settings.state_tool.as_deref() else {
            return self.snapshot.get();
        };
        match self.call_tool(tool, json!({})).await {
            Ok(state) => {
                self.snapshot.replace(state.clone());
                state
            }
            Err(e) => {
                warn!(tool, "Failed to refresh state snapshot: {}", e);
                self.snapshot.get()
            }
        }
    }

    fn event_type(&self, name: &str) -> Option<&str> {
        self.settings.event_types.get(name).map(String::as_str)
    }

    fn is_known(&self, name: &str) -> bool {
        self.settings.tools.is_empty() || self.settings.tools.iter().any(|t| t == name)
    }
}

impl SnapshotSource for WorkerToolService {
    fn snapshot(&self) -> Value {
        self.snapshot.get()
    }
}

#[async_trait]
impl StateService for WorkerToolService {
    async fn call(&self, operation: &str, arguments: Value) -> Result<Value, ServiceError> {
        if !self.is_known(operation) {
            return Err(ServiceError::Rejected {
                code: error_codes::METHOD_NOT_FOUND.into(),
                message: format!("Unknown tool: {}", operation),
            });
        }

        match self.call_tool(operation, arguments).await {
            Ok(result) => {
                if self.settings.state_tool.as_deref() == Some(operation) {
                    self.snapshot.replace(result.clone());
                }
                match self.event_type(operation) {
                    Some(HINTS_PROVIDED) => {
                        self.events.publish(BroadcastEvent::hints_provided(&result));
                    }
                    Some(event_type) => {
                        let state = self.refresh_snapshot().await;
                        info!(operation, event_type, "State changed");
                        self.events.publish(BroadcastEvent::state_changed(
                            event_type,
                            result.clone(),
                            state,
                        ));
                    }
                    None => {}
                }
                Ok(result)
            }
            Err(e) => {
                warn!(operation, "Tool call failed: {}", e);
                self.events
                    .publish(BroadcastEvent::error(operation, &e.to_string()));
                Err(e)
            }
        }
    }

    fn operations(&self) -> Vec<String> {
        self.settings.tools.clone()
    }
}

/// Extract the payload of an MCP tool result
///
/// The first `text` content block is parsed as JSON when possible and
/// returned as a string otherwise. `isError` results become rejections.
pub fn unwrap_tool_result(result: Value) -> Result<Value, ServiceError> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("text"))
        .and_then(|t| t.as_str());

    match (text, is_error) {
        (Some(text), false) => {
            Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
        }
        (Some(text), true) => Err(ServiceError::Rejected {
            code: error_codes::INVALID_PARAMS.into(),
            message: text.to_string(),
        }),
        (None, true) => Err(ServiceError::Rejected {
            code: error_codes::INVALID_PARAMS.into(),
            message: "tool reported an error".into(),
        }),
        (None, false) => Err(ServiceError::InvalidResponse(
            "tool result has no text content".into(),
        )),
    }
}
