//! Bridge configuration file
//!
//! The file holds a `mcpServers` map describing how to launch the worker, an
//! uplink section (`xiaozhi` is accepted as an alias of `uplink`) and a
//! `bridge` section for the local observer surface. Unknown keys are ignored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::event;

/// Endpoint value shipped in the sample config; never a real relay
pub const PLACEHOLDER_TOKEN: &str = "YOUR_XIAOZHI_TOKEN_HERE";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Worker launch specs keyed by server name
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, WorkerSpec>,
    #[serde(alias = "xiaozhi")]
    pub uplink: UplinkSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// How to launch the worker process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Tool names the worker advertises
    #[serde(default)]
    pub tools: Vec<String>,
}

impl WorkerSpec {
    /// Spec for a bare command with arguments
    pub fn command(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }
}

/// Remote relay connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UplinkSettings {
    pub endpoint: String,
    pub reconnect: ReconnectSettings,
    /// Feature flags announced in the hello frame
    pub features: serde_json::Value,
    pub connect_timeout_ms: u64,
    /// Optional cap on the outbound queue (oldest dropped first)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued: Option<usize>,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            reconnect: ReconnectSettings::default(),
            features: serde_json::json!({ "mcp": true }),
            connect_timeout_ms: 10_000,
            max_queued: None,
        }
    }
}

impl UplinkSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconnect behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectSettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            backoff_ms: 1000,
        }
    }
}

/// Local bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeSettings {
    /// Which `mcpServers` entry to launch; optional when there is only one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub host: String,
    pub port: u16,
    /// Pause between spawning the worker and the initialize handshake
    pub settle_ms: u64,
    pub handshake_timeout_ms: u64,
    pub heartbeat_secs: u64,
    /// Per-subscriber frame buffer
    pub subscriber_buffer: usize,
    pub status_interval_secs: u64,
    pub call_timeout_ms: u64,
    /// Tool queried to refresh the broadcast snapshot
    pub state_tool: Option<String>,
    /// Tools whose success is broadcast, mapped to the event type observers see
    pub event_types: BTreeMap<String, String>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            server: None,
            host: "localhost".into(),
            port: 3000,
            settle_ms: 2000,
            handshake_timeout_ms: 10_000,
            heartbeat_secs: 30,
            subscriber_buffer: 64,
            status_interval_secs: 30,
            call_timeout_ms: 30_000,
            state_tool: Some("get_game_state".into()),
            event_types: [
                ("start_game", event::GAME_STARTED),
                ("add_idiom", event::IDIOM_ADDED),
                ("auto_play", event::AUTO_PLAY),
                ("reset_game", event::GAME_RESET),
                ("get_hints", event::HINTS_PROVIDED),
            ]
            .into_iter()
            .map(|(tool, event_type)| (tool.to_string(), event_type.to_string()))
            .collect(),
        }
    }
}

impl BridgeSettings {
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl RelayConfig {
    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate config text
    pub fn from_json(text: &str) -> Result<Self> {
        let config: RelayConfig = serde_json::from_str(text)
            .map_err(|e| RelayError::ConfigError(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let endpoint = self.uplink.endpoint.trim();
        if endpoint.is_empty() {
            return Err(RelayError::ConfigError("uplink endpoint is empty".into()));
        }
        if endpoint.contains(PLACEHOLDER_TOKEN) {
            return Err(RelayError::ConfigError(
                "uplink endpoint still contains the sample token placeholder".into(),
            ));
        }
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(RelayError::ConfigError(format!(
                "uplink endpoint must be a ws:// or wss:// URL: {}",
                endpoint
            )));
        }
        if endpoint.starts_with("wss://") && !cfg!(feature = "tls") {
            return Err(RelayError::ConfigError(format!(
                "uplink endpoint {} needs TLS, but this build has no TLS support (enable the `tls` feature)",
                endpoint
            )));
        }
        let (name, spec) = self.worker()?;
        if spec.command.trim().is_empty() {
            return Err(RelayError::ConfigError(format!(
                "mcpServers.{} has no command",
                name
            )));
        }
        Ok(())
    }

    /// The worker entry to launch
    pub fn worker(&self) -> Result<(&str, &WorkerSpec)> {
        match &self.bridge.server {
            Some(name) => self
                .servers
                .get_key_value(name)
                .map(|(k, v)| (k.as_str(), v))
                .ok_or_else(|| {
                    RelayError::ConfigError(format!("mcpServers has no entry named {}", name))
                }),
            None => {
                let mut entries = self.servers.iter();
                match (entries.next(), entries.next()) {
                    (Some((name, spec)), None) => Ok((name.as_str(), spec)),
                    (None, _) => Err(RelayError::ConfigError("mcpServers is empty".into())),
                    (Some(_), Some(_)) => Err(RelayError::ConfigError(
                        "several mcpServers configured; set bridge.server".into(),
                    )),
                }
            }
        }
    }
}
