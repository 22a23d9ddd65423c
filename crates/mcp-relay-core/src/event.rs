//! Broadcast event types pushed to observers

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Event type of the first frame every new subscriber receives
pub const CONNECTION_ESTABLISHED: &str = "connection_established";
/// Event type of the periodic liveness ping
pub const HEARTBEAT: &str = "heartbeat";
/// Event type published when an operation fails
pub const ERROR: &str = "error";

pub const GAME_STARTED: &str = "game_started";
pub const IDIOM_ADDED: &str = "idiom_added";
pub const AUTO_PLAY: &str = "auto_play";
/// Carries only the new state, no operation result
pub const GAME_RESET: &str = "game_reset";
/// Carries the hints and the character they start with, no state
pub const HINTS_PROVIDED: &str = "hints_provided";

/// A state-change notification: `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
        }
    }

    /// Welcome frame carrying the full current state
    pub fn connection_established(game_state: serde_json::Value) -> Self {
        Self::new(
            CONNECTION_ESTABLISHED,
            serde_json::json!({
                "message": "event stream connected",
                "gameState": game_state,
                "timestamp": timestamp(),
            }),
        )
    }

    /// Liveness ping, carries only a timestamp
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT, serde_json::json!({ "timestamp": timestamp() }))
    }

    /// Successful state-mutating operation
    ///
    /// The payload shape follows the event type: `game_reset` carries only
    /// the state, everything else the result and the state.
    pub fn state_changed(
        event_type: &str,
        result: serde_json::Value,
        game_state: serde_json::Value,
    ) -> Self {
        let data = if event_type == GAME_RESET {
            serde_json::json!({
                "gameState": game_state,
                "timestamp": timestamp(),
            })
        } else {
            serde_json::json!({
                "result": result,
                "gameState": game_state,
                "timestamp": timestamp(),
            })
        };
        Self::new(event_type, data)
    }

    /// Hints returned by a hint tool
    ///
    /// Accepts either `{hints, currentChar, ...}` or a bare hint list.
    pub fn hints_provided(result: &serde_json::Value) -> Self {
        let (hints, current_char) = match result.get("hints") {
            Some(hints) => (
                hints.clone(),
                result
                    .get("currentChar")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
            ),
            None => (result.clone(), serde_json::Value::Null),
        };
        Self::new(
            HINTS_PROVIDED,
            serde_json::json!({
                "hints": hints,
                "currentChar": current_char,
                "timestamp": timestamp(),
            }),
        )
    }

    /// Failed operation
    pub fn error(operation: &str, message: &str) -> Self {
        Self::new(
            ERROR,
            serde_json::json!({
                "error": message,
                "context": { "action": operation },
                "timestamp": timestamp(),
            }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// ISO-8601 UTC timestamp with millisecond precision
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
