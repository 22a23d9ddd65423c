//! Reconnecting WebSocket connector
//!
//! A single task owns the socket and the outbound queue. Callers hand it
//! envelopes through an unbounded command channel, so `send` never blocks:
//! while connected the task writes immediately, otherwise the envelope waits
//! in the queue until the next successful connect flushes it in order.

use crate::policy::ReconnectPolicy;
use crate::queue::OutboundQueue;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use mcp_relay_core::{
    ClientInfo, ConnectionState, Envelope, Hello, RelayError, Result, UplinkSettings,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Inbound envelopes buffered between the socket and the consumer
const INBOUND_BUFFER: usize = 256;

/// Connector settings
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub endpoint: String,
    pub policy: ReconnectPolicy,
    pub connect_timeout: Duration,
    /// Sent as the first frame of every connection
    pub hello: Hello,
    pub max_queued: Option<usize>,
}

impl UplinkConfig {
    pub fn from_settings(settings: &UplinkSettings, client_info: ClientInfo) -> Self {
        Self {
            endpoint: settings.endpoint.trim().to_string(),
            policy: ReconnectPolicy::from_settings(&settings.reconnect),
            connect_timeout: settings.connect_timeout(),
            hello: Hello::new(settings.features.clone(), client_info),
            max_queued: settings.max_queued,
        }
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkNotice {
    Connected,
    Disconnected,
    /// Reconnect budget spent; no further attempts will be made
    Exhausted { attempts: u32 },
}

/// Receiving ends handed back by [`UplinkConnector::spawn`]
pub struct UplinkChannels {
    pub inbound: mpsc::Receiver<Envelope>,
    pub notices: mpsc::UnboundedReceiver<UplinkNotice>,
}

/// Point-in-time view of the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UplinkStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub queued: usize,
    pub exhausted: bool,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    attempts: AtomicU32,
    queued: AtomicUsize,
    exhausted: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn delivered(&self) {
        // Never wraps: every decrement pairs with an earlier increment in `send`
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Handle to the uplink connector task
pub struct UplinkConnector {
    commands: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UplinkConnector {
    /// Start the connector task; the first connect attempt begins immediately
    pub fn spawn(config: UplinkConfig) -> (Self, UplinkChannels) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
            attempts: AtomicU32::new(0),
            queued: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let task = ConnectorTask {
            queue: OutboundQueue::new(config.max_queued),
            config,
            shared: shared.clone(),
            commands: command_rx,
            inbound: inbound_tx,
            notices: notice_tx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run());

        let connector = Self {
            commands: command_tx,
            shared,
            cancel,
            task: Mutex::new(Some(handle)),
        };
        let channels = UplinkChannels {
            inbound: inbound_rx,
            notices: notice_rx,
        };
        (connector, channels)
    }

    /// Hand an envelope to the connector without waiting
    ///
    /// Delivered now if connected, otherwise queued for the next connection.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RelayError::UplinkClosed);
        }
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        if self.commands.send(envelope).is_err() {
            self.shared.delivered();
            return Err(RelayError::UplinkClosed);
        }
        Ok(())
    }

    /// Stop reconnecting, close the socket and wait for the task to end
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Uplink task ended abnormally: {}", e);
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Attempts made since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Envelopes accepted by `send` but not yet written
    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> UplinkStatus {
        UplinkStatus {
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            queued: self.queued(),
            exhausted: self.is_exhausted(),
        }
    }
}

impl Drop for UplinkConnector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct ConnectorTask {
    config: UplinkConfig,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Envelope>,
    inbound: mpsc::Sender<Envelope>,
    notices: mpsc::UnboundedSender<UplinkNotice>,
    queue: OutboundQueue,
    cancel: CancellationToken,
}

impl ConnectorTask {
    async fn run(mut self) {
        loop {
            self.shared.set_state(ConnectionState::Connecting);
            info!(endpoint = %self.config.endpoint, "Connecting to uplink");

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(ws) => {
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    self.shared.set_state(ConnectionState::Connected);
                    info!("Uplink connected");
                    self.notify(UplinkNotice::Connected);

                    match self.session(ws).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => warn!("Uplink connection lost: {}", reason),
                    }
                }
                Err(e) => warn!("Uplink connect failed: {}", e),
            }

            self.shared.set_state(ConnectionState::Disconnected);
            self.notify(UplinkNotice::Disconnected);

            if !self.wait_for_retry().await {
                break;
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
        if !self.queue.is_empty() {
            warn!(
                discarded = self.queue.len(),
                "Uplink shut down with undelivered messages"
            );
        }
        debug!("Uplink task exiting");
    }

    /// Open the socket and announce ourselves
    async fn connect(&self) -> Result<WsStream> {
        let (mut ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.endpoint.as_str()),
        )
        .await
        .map_err(|_| {
            RelayError::IpcError(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            ))
        })?
        .map_err(|e| RelayError::IpcError(e.to_string()))?;

        let hello = serde_json::to_string(&self.config.hello)?;
        debug!("[Bridge→Uplink] {}", hello);
        ws.send(Message::text(hello))
            .await
            .map_err(|e| RelayError::IpcError(format!("hello failed: {}", e)))?;
        Ok(ws)
    }

    /// Serve one connection until it drops or we are cancelled
    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        while let Some(envelope) = self.queue.pop_front() {
            if let Err(e) = write_envelope(&mut sink, &envelope).await {
                self.requeue(envelope);
                return SessionEnd::Lost(e);
            }
            self.shared.delivered();
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }

                command = self.commands.recv() => {
                    let Some(envelope) = command else {
                        let _ = sink.close().await;
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = write_envelope(&mut sink, &envelope).await {
                        self.requeue(envelope);
                        return SessionEnd::Lost(e);
                    }
                    self.shared.delivered();
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()).await,
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.dispatch(text).await,
                        Err(_) => warn!(len = data.len(), "Discarding non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by relay: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".into()),
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        debug!("[Uplink→Bridge] {}", preview(text));
        match Envelope::from_text(text) {
            Ok(envelope) => {
                if self.inbound.send(envelope).await.is_err() {
                    debug!("Inbound receiver dropped, discarding envelope");
                }
            }
            Err(e) => warn!(frame = %preview(text), "Discarding malformed envelope: {}", e),
        }
    }

    /// Sleep until the next attempt, queueing sends meanwhile
    ///
    /// Returns `false` when the task should exit.
    async fn wait_for_retry(&mut self) -> bool {
        let attempts = self.shared.attempts.load(Ordering::SeqCst);
        let Some((attempt, delay)) = self.config.policy.next_attempt(attempts) else {
            if self.config.policy.enabled {
                error!(attempts, "Uplink reconnect attempts exhausted, giving up");
                self.shared.exhausted.store(true, Ordering::SeqCst);
                self.notify(UplinkNotice::Exhausted { attempts });
            } else {
                info!("Uplink reconnect disabled");
            }
            self.idle().await;
            return false;
        };

        self.shared.attempts.store(attempt, Ordering::SeqCst);
        info!(
            attempt,
            max = self.config.policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling uplink reconnect"
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(envelope) => self.enqueue(envelope),
                    None => return false,
                },
            }
        }
    }

    /// Keep accepting sends into the queue until shutdown
    async fn idle(&mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                command = self.commands.recv() => match command {
                    Some(envelope) => self.enqueue(envelope),
                    None => return,
                },
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.push(envelope) {
            self.evicted(&evicted);
        }
        debug!(queued = self.queue.len(), "Uplink down, message queued");
    }

    /// Put back an envelope whose write failed, ahead of everything queued
    fn requeue(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.queue.push_front(envelope) {
            self.evicted(&evicted);
        }
    }

    fn evicted(&self, envelope: &Envelope) {
        self.shared.delivered();
        warn!(
            kind = ?envelope.kind,
            dropped_total = self.queue.dropped(),
            "Outbound queue full, dropped oldest message"
        );
    }

    fn notify(&self, notice: UplinkNotice) {
        let _ = self.notices.send(notice);
    }
}

async fn write_envelope(
    sink: &mut WsSink,
    envelope: &Envelope,
) -> std::result::Result<(), String> {
    let text = envelope.to_text().map_err(|e| e.to_string())?;
    debug!("[Bridge→Uplink] {}", preview(&text));
    sink.send(Message::text(text)).await.map_err(|e| e.to_string())
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::{EnvelopeKind, RawValue};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(endpoint: String, policy: ReconnectPolicy) -> UplinkConfig {
        UplinkConfig {
            endpoint,
            policy,
            connect_timeout: Duration::from_secs(2),
            hello: Hello::new(serde_json::json!({"mcp": true}), ClientInfo::default()),
            max_queued: None,
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            base_delay: Duration::from_millis(20),
            multiplier: 1.0,
            max_attempts,
        }
    }

    fn mcp(text: &str) -> Envelope {
        Envelope::mcp(RawValue::from_string(text.to_string()).unwrap())
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (tcp, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
                Message::Text(text) => return text.as_str().to_string(),
                _ => continue,
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_hello_is_first_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/mcp", listener.local_addr().unwrap());
        let (connector, mut channels) = UplinkConnector::spawn(config(endpoint, fast_policy(3)));

        let mut ws = accept(&listener).await;
        let hello: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["version"], 1);
        assert_eq!(hello["transport"], "websocket");
        assert_eq!(hello["features"]["mcp"], true);
        assert_eq!(hello["clientInfo"]["name"], "mcp-relay-bridge");

        let notice = timeout(WAIT, channels.notices.recv()).await.unwrap();
        assert_eq!(notice, Some(UplinkNotice::Connected));
        assert!(connector.is_connected());
        connector.shutdown().await;
        assert_eq!(connector.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_round_trip_and_malformed_inbound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (connector, mut channels) = UplinkConnector::spawn(config(endpoint, fast_policy(3)));

        let mut ws = accept(&listener).await;
        next_text(&mut ws).await;

        connector
            .send(mcp(r#"{"jsonrpc":"2.0","id":7,"result":{"b":1,"a":0.10}}"#))
            .unwrap();
        assert_eq!(
            next_text(&mut ws).await,
            r#"{"type":"mcp","payload":{"jsonrpc":"2.0","id":7,"result":{"b":1,"a":0.10}}}"#
        );

        ws.send(Message::text("not json".to_string())).await.unwrap();
        ws.send(Message::text(r#"{"payload":{}}"#.to_string()))
            .await
            .unwrap();
        ws.send(Message::text(
            r#"{"type":"mcp","payload":{"id":1,"method":"tools/list"}}"#.to_string(),
        ))
            .await
            .unwrap();

        let envelope = timeout(WAIT, channels.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Mcp);
        assert_eq!(envelope.payload_str(), Some(r#"{"id":1,"method":"tools/list"}"#));
        wait_until(|| connector.queued() == 0).await;

        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_while_unreachable_then_flush_in_order() {
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };
        let (connector, _channels) =
            UplinkConnector::spawn(config(format!("ws://{}", addr), fast_policy(1000)));

        for n in 1..=3 {
            connector.send(mcp(&format!(r#"{{"n":{}}}"#, n))).unwrap();
        }
        assert_eq!(connector.queued(), 3);
        wait_until(|| connector.reconnect_attempts() > 0).await;
        assert!(!connector.is_connected());

        let listener = TcpListener::bind(addr).await.unwrap();
        let mut ws = accept(&listener).await;
        let hello = next_text(&mut ws).await;
        assert!(hello.contains(r#""type":"hello""#));
        for n in 1..=3 {
            assert_eq!(
                next_text(&mut ws).await,
                format!(r#"{{"type":"mcp","payload":{{"n":{}}}}}"#, n)
            );
        }

        wait_until(|| connector.queued() == 0).await;
        assert_eq!(connector.reconnect_attempts(), 0);
        connector.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_queueing() {
        let addr = {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            probe.local_addr().unwrap()
        };
        let (connector, mut channels) =
            UplinkConnector::spawn(config(format!("ws://{}", addr), fast_policy(2)));

        let exhausted = timeout(WAIT, async {
            loop {
                match channels.notices.recv().await {
                    Some(UplinkNotice::Exhausted { attempts }) => return attempts,
                    Some(_) => continue,
                    None => panic!("notice channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(exhausted, 2);
        assert!(connector.is_exhausted());

        tokio_test::assert_ok!(connector.send(mcp("{}")));
        wait_until(|| connector.queued() == 1).await;
        assert_eq!(connector.status().state, ConnectionState::Disconnected);

        connector.shutdown().await;
        let err = connector.send(mcp("{}")).unwrap_err();
        assert!(matches!(err, RelayError::UplinkClosed));
    }

    #[tokio::test]
    async fn test_reconnect_after_relay_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (connector, mut channels) = UplinkConnector::spawn(config(endpoint, fast_policy(5)));

        let mut first = accept(&listener).await;
        next_text(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        assert!(next_text(&mut second).await.contains("hello"));

        let mut seen = Vec::new();
        while seen.len() < 3 {
            seen.push(timeout(WAIT, channels.notices.recv()).await.unwrap().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                UplinkNotice::Connected,
                UplinkNotice::Disconnected,
                UplinkNotice::Connected
            ]
        );
        connector.shutdown().await;
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn test_secure_endpoint_reaches_tls_handshake() {
        use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("wss://{}/mcp/?token=x", listener.local_addr().unwrap());
        let relay = tokio::spawn(async move {
            // Not a TLS server; the handshake fails after the TCP accept
            let (tcp, _) = listener.accept().await.unwrap();
            drop(tcp);
        });

        let err = timeout(WAIT, connect_async(endpoint.as_str()))
            .await
            .unwrap()
            .unwrap_err();
        assert!(
            !matches!(err, WsError::Url(UrlError::TlsFeatureNotEnabled)),
            "wss:// unsupported: {:?}",
            err
        );
        relay.await.unwrap();
    }
}
