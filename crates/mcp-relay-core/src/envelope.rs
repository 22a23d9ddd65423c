//! Uplink wire format
//!
//! Every frame on the uplink is a JSON object discriminated by `type`:
//! - `{"type":"hello", ...}` capability announcement (both directions)
//! - `{"type":"mcp","payload":<worker message>}` a forwarded MCP message
//! - `{"type":"heartbeat"}` liveness
//!
//! Payloads are kept as raw JSON so the worker's bytes cross the bridge untouched.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Envelope discriminator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Handshake / capability announcement
    Hello,
    /// MCP payload
    Mcp,
    /// Liveness ping
    Heartbeat,
    /// Anything the relay sends that we do not understand
    #[serde(other)]
    Unknown,
}

/// A single uplink frame
///
/// Extra fields on inbound frames (e.g. the relay's hello details) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl Envelope {
    /// Wrap a worker message as an `mcp` envelope
    pub fn mcp(payload: Box<RawValue>) -> Self {
        Self {
            kind: EnvelopeKind::Mcp,
            payload: Some(payload),
        }
    }

    /// Payload-less heartbeat
    pub fn heartbeat() -> Self {
        Self {
            kind: EnvelopeKind::Heartbeat,
            payload: None,
        }
    }

    /// Serialize to the text frame sent on the wire
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an inbound text frame
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Raw payload text, if any
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }
}

/// Identity block sent inside the hello announcement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcp-relay-bridge".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            description: Some("MCP relay bridge".into()),
        }
    }
}

/// First frame sent after the uplink opens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub version: u32,
    pub features: serde_json::Value,
    pub transport: String,
    pub client_info: ClientInfo,
}

impl Hello {
    /// Protocol version announced in the hello frame
    pub const VERSION: u32 = 1;

    pub fn new(features: serde_json::Value, client_info: ClientInfo) -> Self {
        Self {
            kind: EnvelopeKind::Hello,
            version: Self::VERSION,
            features,
            transport: "websocket".into(),
            client_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mcp_payload_bytes_preserved() {
        // Odd spacing and key order must survive both boundaries
        let worker_line = r#"{"result":{"b":1,  "a":[1.50,2]},"jsonrpc":"2.0","id":7}"#;
        let raw = RawValue::from_string(worker_line.to_string()).unwrap();

        let text = Envelope::mcp(raw).to_text().unwrap();
        assert_eq!(text, format!(r#"{{"type":"mcp","payload":{}}}"#, worker_line));

        let decoded = Envelope::from_text(&text).unwrap();
        assert_eq!(decoded.kind, EnvelopeKind::Mcp);
        assert_eq!(decoded.payload_str(), Some(worker_line));
    }

    #[test]
    fn test_relay_hello_with_extra_fields() {
        let json = r#"{"type":"hello","version":1,"transport":"websocket","session_id":"abc"}"#;
        let env = Envelope::from_text(json).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Hello);
        assert!(env.payload.is_none());
    }

    #[test]
    fn test_unknown_kind() {
        let env = Envelope::from_text(r#"{"type":"audio","payload":"x"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Unknown);
    }

    #[test]
    fn test_missing_type_is_error() {
        assert!(Envelope::from_text(r#"{"payload":{}}"#).is_err());
        assert!(Envelope::from_text("not json").is_err());
    }

    #[test]
    fn test_hello_format() {
        let hello = Hello::new(
            serde_json::json!({"mcp": true}),
            ClientInfo {
                name: "bridge".into(),
                version: "1.0.0".into(),
                description: None,
            },
        );
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "hello",
                "version": 1,
                "features": {"mcp": true},
                "transport": "websocket",
                "clientInfo": {"name": "bridge", "version": "1.0.0"}
            })
        );
    }

    #[test]
    fn test_heartbeat_has_no_payload() {
        assert_eq!(Envelope::heartbeat().to_text().unwrap(), r#"{"type":"heartbeat"}"#);
    }
}
