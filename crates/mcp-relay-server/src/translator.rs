//! Worker ⇄ uplink message translation
//!
//! Worker lines travel up wrapped exactly once in an `mcp` envelope; relay
//! envelopes travel down unwrapped. Payload bytes are never re-encoded.

use crate::pending::PendingRequests;
use async_trait::async_trait;
use mcp_relay_core::{Envelope, EnvelopeKind, RawValue, Result};
use mcp_relay_uplink::UplinkConnector;
use mcp_relay_worker::WorkerChannel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with an envelope from the relay
#[derive(Debug)]
pub enum Route {
    /// Relay hello; handled locally
    Acknowledge,
    /// Payload for the worker
    Forward(Box<RawValue>),
    /// Nothing to deliver
    Discard(&'static str),
}

/// Wrap a worker message for the uplink
pub fn worker_to_uplink(message: Box<RawValue>) -> Envelope {
    Envelope::mcp(message)
}

/// Decide where a relay envelope goes
pub fn uplink_to_worker(envelope: Envelope) -> Route {
    match envelope.kind {
        EnvelopeKind::Hello => Route::Acknowledge,
        EnvelopeKind::Mcp => match envelope.payload {
            Some(payload) => Route::Forward(payload),
            None => Route::Discard("mcp envelope without payload"),
        },
        EnvelopeKind::Heartbeat => Route::Discard("heartbeat"),
        EnvelopeKind::Unknown => Route::Discard("unknown envelope type"),
    }
}

/// Where translated worker output goes
pub trait UplinkSink: Send + Sync + 'static {
    fn send_envelope(&self, envelope: Envelope) -> Result<()>;
}

/// Where translated relay input goes
#[async_trait]
pub trait WorkerSink: Send + Sync + 'static {
    async fn send_raw(&self, message: &RawValue) -> Result<()>;
}

impl UplinkSink for UplinkConnector {
    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope)
    }
}

#[async_trait]
impl WorkerSink for WorkerChannel {
    async fn send_raw(&self, message: &RawValue) -> Result<()> {
        self.send(message).await
    }
}

/// Pump worker output to the uplink in receipt order
///
/// Responses to bridge-originated requests are handed to `pending` instead.
pub async fn forward_worker_output(
    mut worker_rx: mpsc::Receiver<Box<RawValue>>,
    uplink: Arc<dyn UplinkSink>,
    pending: Arc<PendingRequests>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = worker_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let Some(message) = pending.offer(message) else {
            continue;
        };
        if let Err(e) = uplink.send_envelope(worker_to_uplink(message)) {
            error!("Failed to forward worker message to uplink: {}", e);
        }
    }
    debug!("Worker output pump stopped");
}

/// Pump relay envelopes to the worker in receipt order
pub async fn forward_uplink_input(
    mut uplink_rx: mpsc::Receiver<Envelope>,
    worker: Arc<dyn WorkerSink>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = uplink_rx.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
        };

        match uplink_to_worker(envelope) {
            Route::Acknowledge => info!("Relay hello received"),
            Route::Forward(payload) => {
                if let Err(e) = worker.send_raw(&payload).await {
                    error!("Failed to forward relay message to worker: {}", e);
                }
            }
            Route::Discard("heartbeat") => debug!("Relay heartbeat"),
            Route::Discard(reason) => warn!("Discarding relay envelope: {}", reason),
        }
    }
    debug!("Uplink input pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_relay_core::{RelayError, RequestId};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingUplink(Mutex<Vec<String>>);

    impl UplinkSink for RecordingUplink {
        fn send_envelope(&self, envelope: Envelope) -> Result<()> {
            self.0.lock().push(envelope.to_text()?);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingWorker {
        lines: Mutex<Vec<String>>,
        down: bool,
    }

    #[async_trait]
    impl WorkerSink for RecordingWorker {
        async fn send_raw(&self, message: &RawValue) -> Result<()> {
            if self.down {
                return Err(RelayError::ProcessNotRunning);
            }
            self.lines.lock().push(message.get().to_string());
            Ok(())
        }
    }

    fn raw(text: &str) -> Box<RawValue> {
        RawValue::from_string(text.to_string()).unwrap()
    }

    #[test]
    fn test_wraps_exactly_once() {
        let envelope = worker_to_uplink(raw(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert_eq!(
            envelope.to_text().unwrap(),
            r#"{"type":"mcp","payload":{"jsonrpc":"2.0","id":1,"result":{}}}"#
        );
    }

    #[test]
    fn test_routes() {
        let hello = Envelope::from_text(r#"{"type":"hello","version":1}"#).unwrap();
        assert!(matches!(uplink_to_worker(hello), Route::Acknowledge));

        let mcp = Envelope::from_text(r#"{"type":"mcp","payload":{"id":3, "method":"ping"}}"#)
            .unwrap();
        match uplink_to_worker(mcp) {
            Route::Forward(payload) => assert_eq!(payload.get(), r#"{"id":3, "method":"ping"}"#),
            other => panic!("unexpected route {:?}", other),
        }

        let empty = Envelope::from_text(r#"{"type":"mcp"}"#).unwrap();
        assert!(matches!(uplink_to_worker(empty), Route::Discard(_)));
        let odd = Envelope::from_text(r#"{"type":"bogus","payload":1}"#).unwrap();
        assert!(matches!(uplink_to_worker(odd), Route::Discard(_)));
    }

    #[tokio::test]
    async fn test_worker_pump_preserves_order() {
        let (tx, rx) = mpsc::channel(16);
        let uplink = Arc::new(RecordingUplink::default());
        let pending = Arc::new(PendingRequests::new());
        let handle = tokio::spawn(forward_worker_output(
            rx,
            uplink.clone(),
            pending,
            CancellationToken::new(),
        ));

        for n in 0..5 {
            tx.send(raw(&format!(r#"{{"seq":{}}}"#, n))).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let sent = uplink.0.lock().clone();
        let expected: Vec<_> = (0..5)
            .map(|n| format!(r#"{{"type":"mcp","payload":{{"seq":{}}}}}"#, n))
            .collect();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn test_worker_pump_diverts_pending_responses() {
        let (tx, rx) = mpsc::channel(16);
        let uplink = Arc::new(RecordingUplink::default());
        let pending = Arc::new(PendingRequests::new());
        let waiter = pending.register(RequestId::String("bridge-1".into()));
        let handle = tokio::spawn(forward_worker_output(
            rx,
            uplink.clone(),
            pending,
            CancellationToken::new(),
        ));

        tx.send(raw(r#"{"jsonrpc":"2.0","id":"bridge-1","result":{"ok":true}}"#))
            .await
            .unwrap();
        tx.send(raw(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            waiter.await.unwrap().get(),
            r#"{"jsonrpc":"2.0","id":"bridge-1","result":{"ok":true}}"#
        );
        assert_eq!(uplink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_uplink_pump_unwraps_in_order() {
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(RecordingWorker::default());
        let handle = tokio::spawn(forward_uplink_input(
            rx,
            worker.clone(),
            CancellationToken::new(),
        ));

        tx.send(Envelope::from_text(r#"{"type":"hello"}"#).unwrap())
            .await
            .unwrap();
        for n in 0..3 {
            tx.send(Envelope::mcp(raw(&format!(r#"{{"id":{},"method":"tools/list"}}"#, n))))
                .await
                .unwrap();
        }
        tx.send(Envelope::heartbeat()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let lines = worker.lines.lock().clone();
        assert_eq!(
            lines,
            vec![
                r#"{"id":0,"method":"tools/list"}"#,
                r#"{"id":1,"method":"tools/list"}"#,
                r#"{"id":2,"method":"tools/list"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_down_is_not_fatal() {
        let (tx, rx) = mpsc::channel(16);
        let worker = Arc::new(RecordingWorker {
            down: true,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_uplink_input(rx, worker, cancel.clone()));

        tx.send(Envelope::mcp(raw("{}"))).await.unwrap();
        tx.send(Envelope::mcp(raw("{}"))).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }
}
