//! Bridge lifecycle
//!
//! The supervisor builds every component once (worker channel, broadcast hub,
//! state service, request table) and wires them together on `start()`:
//!
//! 1. start the hub heartbeat
//! 2. spawn the worker and wait for it to settle
//! 3. `initialize` / `notifications/initialized` handshake
//! 4. spawn the uplink connector, the two translator pumps and a notice monitor
//!
//! A failure anywhere rolls back what was started. `stop()` tears everything
//! down again and is a no-op when already stopped.

use crate::pending::PendingRequests;
use crate::tools::{ToolSettings, WorkerToolService};
use crate::translator::{
    UplinkSink, WorkerSink, forward_uplink_input, forward_worker_output, worker_to_uplink,
};
use mcp_relay_broadcast::{BroadcastHub, HubConfig, SnapshotCell};
use mcp_relay_core::jsonrpc::{InitializeParams, MessageProbe, PROTOCOL_VERSION, Response};
use mcp_relay_core::{
    BridgeSettings, BridgeStatus, ClientInfo, Envelope, Notification, RawValue, RelayConfig,
    RelayError, Request, RequestId, RequestIds, Result, SupervisorState,
};
use mcp_relay_uplink::{UplinkChannels, UplinkConfig, UplinkConnector, UplinkNotice};
use mcp_relay_worker::WorkerChannel;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker stdout lines buffered ahead of the pump
const WORKER_BUFFER: usize = 256;

/// How often the handshake checks that the worker is still alive
const LIVENESS_CHECK: Duration = Duration::from_millis(100);

/// Tasks spawned for one running period
struct RunningTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns and sequences every bridge component
pub struct BridgeSupervisor {
    worker_name: String,
    settings: BridgeSettings,
    uplink_config: UplinkConfig,
    client_info: ClientInfo,
    state: AtomicU8,
    /// Serializes start / stop / restart
    lifecycle: tokio::sync::Mutex<()>,

    worker: Arc<WorkerChannel>,
    worker_tx: Mutex<Option<mpsc::Sender<Box<RawValue>>>>,
    uplink: RwLock<Option<Arc<UplinkConnector>>>,
    exhausted: Arc<AtomicBool>,
    tasks: Mutex<Option<RunningTasks>>,

    hub: Arc<BroadcastHub>,
    tools: Arc<WorkerToolService>,
    pending: Arc<PendingRequests>,
    ids: Arc<RequestIds>,
}

impl BridgeSupervisor {
    /// Build all components from a validated config
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let (worker_name, spec) = config.worker()?;
        let client_info = ClientInfo {
            description: config.name.clone().or(ClientInfo::default().description),
            ..ClientInfo::default()
        };

        let worker = Arc::new(WorkerChannel::new(spec.clone()));
        let snapshot = Arc::new(SnapshotCell::new(serde_json::json!({})));
        let hub = Arc::new(BroadcastHub::new(
            HubConfig::from_settings(&config.bridge),
            snapshot.clone(),
        ));
        let pending = Arc::new(PendingRequests::new());
        let ids = Arc::new(RequestIds::new());
        let tools = Arc::new(WorkerToolService::new(
            worker.clone(),
            pending.clone(),
            ids.clone(),
            snapshot,
            Arc::new(hub.publisher()),
            ToolSettings::from_config(&config.bridge, spec),
        ));

        Ok(Self {
            worker_name: worker_name.to_string(),
            settings: config.bridge.clone(),
            uplink_config: UplinkConfig::from_settings(&config.uplink, client_info.clone()),
            client_info,
            state: AtomicU8::new(SupervisorState::Stopped.as_u8()),
            lifecycle: tokio::sync::Mutex::new(()),
            worker,
            worker_tx: Mutex::new(None),
            uplink: RwLock::new(None),
            exhausted: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(None),
            hub,
            tools,
            pending,
            ids,
        })
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Name of the `mcpServers` entry being run
    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn tools(&self) -> &Arc<WorkerToolService> {
        &self.tools
    }

    /// Bring the bridge up; on failure nothing is left running
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != SupervisorState::Stopped {
            return Err(RelayError::InvalidState(format!(
                "cannot start while {:?}",
                state
            )));
        }

        self.set_state(SupervisorState::Starting);
        self.exhausted.store(false, Ordering::SeqCst);
        info!(worker = %self.worker_name, endpoint = %self.uplink_config.endpoint, "Starting bridge");

        match self.bring_up().await {
            Ok(()) => {
                self.set_state(SupervisorState::Running);
                info!("Bridge running");
                Ok(())
            }
            Err(e) => {
                error!("Bridge startup failed: {}", e);
                self.tear_down().await;
                self.set_state(SupervisorState::Stopped);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<()> {
        self.hub.start();

        let (worker_tx, mut worker_rx) = mpsc::channel(WORKER_BUFFER);
        self.worker.start(worker_tx.clone()).await?;
        *self.worker_tx.lock() = Some(worker_tx);

        tokio::time::sleep(self.settings.settle_interval()).await;
        let early = self.handshake_direct(&mut worker_rx).await?;

        let (uplink, channels) = UplinkConnector::spawn(self.uplink_config.clone());
        let uplink = Arc::new(uplink);
        *self.uplink.write() = Some(uplink.clone());

        // Worker output that arrived during the handshake goes out first
        for message in early {
            if let Some(message) = self.pending.offer(message) {
                if let Err(e) = uplink.send(worker_to_uplink(message)) {
                    error!("Failed to forward worker message to uplink: {}", e);
                }
            }
        }

        *self.tasks.lock() = Some(self.spawn_tasks(uplink, channels, worker_rx));
        Ok(())
    }

    fn spawn_tasks(
        &self,
        uplink: Arc<UplinkConnector>,
        channels: UplinkChannels,
        worker_rx: mpsc::Receiver<Box<RawValue>>,
    ) -> RunningTasks {
        let cancel = CancellationToken::new();
        let UplinkChannels { inbound, notices } = channels;
        let uplink_sink: Arc<dyn UplinkSink> = uplink;
        let worker_sink: Arc<dyn WorkerSink> = self.worker.clone();

        let mut handles = vec![
            tokio::spawn(forward_worker_output(
                worker_rx,
                uplink_sink,
                self.pending.clone(),
                cancel.clone(),
            )),
            tokio::spawn(forward_uplink_input(inbound, worker_sink, cancel.clone())),
            tokio::spawn(monitor_notices(
                notices,
                self.exhausted.clone(),
                cancel.clone(),
            )),
        ];

        if self.settings.state_tool.is_some() {
            let tools = self.tools.clone();
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    state = tools.refresh_snapshot() => debug!(?state, "Initial state loaded"),
                }
            }));
        }

        RunningTasks { cancel, handles }
    }

    /// Shut everything down; no-op when already stopped
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == SupervisorState::Stopped {
            return;
        }
        self.set_state(SupervisorState::Stopping);
        info!("Stopping bridge");
        self.tear_down().await;
        self.set_state(SupervisorState::Stopped);
        info!("Bridge stopped");
    }

    /// Release whatever is running; safe on a partially started bridge
    async fn tear_down(&self) {
        let uplink = self.uplink.read().clone();
        if let Some(uplink) = uplink {
            uplink.shutdown().await;
        }

        let tasks = self.tasks.lock().take();
        let failed = self.pending.fail_all();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for handle in tasks.handles {
                if let Err(e) = handle.await {
                    warn!("Bridge task ended abnormally: {}", e);
                }
            }
        }
        if failed > 0 {
            debug!(failed, "Abandoned pending worker requests");
        }

        self.worker.stop().await;
        self.worker_tx.lock().take();
        self.uplink.write().take();
        self.hub.shutdown().await;
    }

    /// Operational snapshot; never waits on I/O
    pub fn get_status(&self) -> BridgeStatus {
        let uplink = self.uplink.read().clone();
        let (connected, reconnect_attempts, queued_messages) = match uplink {
            Some(uplink) => (
                uplink.is_connected(),
                uplink.reconnect_attempts(),
                uplink.queued(),
            ),
            None => (false, 0, 0),
        };
        BridgeStatus {
            connected,
            worker_running: self.worker.is_running(),
            reconnect_attempts,
            queued_messages,
        }
    }

    /// Queue an envelope for the relay
    pub fn send_uplink(&self, envelope: Envelope) -> Result<()> {
        let uplink = self.uplink.read().clone();
        match uplink {
            Some(uplink) => uplink.send(envelope),
            None => Err(RelayError::InvalidState("bridge is not running".into())),
        }
    }

    /// True once the uplink has given up reconnecting
    pub fn uplink_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Replace the worker process and repeat the handshake
    pub async fn restart_worker(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != SupervisorState::Running {
            return Err(RelayError::InvalidState("bridge is not running".into()));
        }
        let worker_tx = self
            .worker_tx
            .lock()
            .clone()
            .ok_or_else(|| RelayError::InvalidState("worker channel missing".into()))?;

        warn!(worker = %self.worker_name, "Restarting worker process");
        self.worker.restart(worker_tx).await?;
        tokio::time::sleep(self.settings.settle_interval()).await;
        self.handshake_pending().await
    }

    fn initialize_request(&self) -> Result<(RequestId, Request)> {
        let id = RequestIds::wire_id(self.ids.allocate());
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Default::default(),
            client_info: self.client_info.clone(),
        };
        let request = Request::new(id.clone(), "initialize", serde_json::to_value(params)?);
        Ok((id, request))
    }

    /// Handshake before the pumps run: read the worker channel directly and
    /// keep anything that is not the initialize response
    async fn handshake_direct(
        &self,
        worker_rx: &mut mpsc::Receiver<Box<RawValue>>,
    ) -> Result<Vec<Box<RawValue>>> {
        let (id, request) = self.initialize_request()?;
        self.worker.send_message(&request).await?;
        debug!(%id, "Sent initialize");

        let deadline = self.settings.handshake_timeout();
        let mut early = Vec::new();
        let answer = tokio::time::timeout(deadline, async {
            let mut liveness = tokio::time::interval(LIVENESS_CHECK);
            loop {
                tokio::select! {
                    biased;
                    message = worker_rx.recv() => match message {
                        Some(message) if answers(&message, &id) => return Some(message),
                        Some(message) => early.push(message),
                        None => return None,
                    },
                    _ = liveness.tick() => {
                        if !self.worker.is_running() {
                            return None;
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| RelayError::HandshakeTimeout(deadline))?
        .ok_or_else(|| RelayError::StartupFailed("worker exited during initialize".into()))?;

        self.finish_handshake(&answer).await?;
        Ok(early)
    }

    /// Handshake while the pumps run: the response arrives through the pending table
    async fn handshake_pending(&self) -> Result<()> {
        let (id, request) = self.initialize_request()?;
        let (_guard, waiter) = self.pending.register_guarded(id);
        self.worker.send_message(&request).await?;

        let deadline = self.settings.handshake_timeout();
        let answer = match tokio::time::timeout(deadline, waiter).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => {
                return Err(RelayError::StartupFailed(
                    "bridge stopped during initialize".into(),
                ));
            }
            Err(_) => return Err(RelayError::HandshakeTimeout(deadline)),
        };
        self.finish_handshake(&answer).await
    }

    async fn finish_handshake(&self, answer: &RawValue) -> Result<()> {
        let response: Response = serde_json::from_str(answer.get())?;
        if let Some(error) = response.error {
            return Err(RelayError::ProtocolError(format!(
                "initialize rejected ({}): {}",
                error.code, error.message
            )));
        }
        let server = response
            .result
            .as_ref()
            .and_then(|r| r.get("serverInfo"))
            .cloned()
            .unwrap_or_default();
        info!(server = %server, "Worker initialized");

        self.worker.send_message(&Notification::initialized()).await
    }
}

fn answers(message: &RawValue, id: &RequestId) -> bool {
    serde_json::from_str::<MessageProbe>(message.get())
        .ok()
        .and_then(|probe| probe.response_id().cloned())
        .is_some_and(|rid| &rid == id)
}

async fn monitor_notices(
    mut notices: mpsc::UnboundedReceiver<UplinkNotice>,
    exhausted: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let notice = tokio::select! {
            _ = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(notice) => notice,
                None => break,
            },
        };
        match notice {
            UplinkNotice::Connected => info!("Uplink up"),
            UplinkNotice::Disconnected => warn!("Uplink down"),
            UplinkNotice::Exhausted { attempts } => {
                error!(
                    attempts,
                    "Uplink unreachable, reconnecting stopped; worker and subscribers stay up"
                );
                exhausted.store(true, Ordering::SeqCst);
            }
        }
    }
}
