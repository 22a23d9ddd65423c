//! Worker process channel
//!
//! Owns the spawned worker and speaks newline-delimited JSON over its stdio.
//! Each stdout line that parses as JSON is forwarded (unmodified) on the
//! inbound channel; anything else is logged and dropped. The channel never
//! restarts the worker on its own.

use mcp_relay_core::config::WorkerSpec;
use mcp_relay_core::{RawValue, RelayError, Result};
use serde::Serialize;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Channel to a locally spawned worker process
pub struct WorkerChannel {
    spec: WorkerSpec,
    /// Write half; `None` when the process is not running
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Option<WorkerTasks>>,
}

/// Background tasks of one worker process lifetime
struct WorkerTasks {
    kill_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl WorkerTasks {
    async fn join(self) {
        let _ = self.kill_tx.send(());
        let _ = self.monitor.await;
        // Readers end at EOF; abort in case a grandchild still holds the pipes
        self.reader.abort();
        self.stderr.abort();
        let _ = self.reader.await;
        let _ = self.stderr.await;
    }
}

impl WorkerChannel {
    /// Create a channel for the given launch spec (not started yet)
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            stdin: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(None),
        }
    }

    /// Whether the worker process is alive
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the worker and start forwarding its stdout lines to `inbound`
    pub async fn start(&self, inbound: mpsc::Sender<Box<RawValue>>) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if self.is_running() {
            return Err(RelayError::WorkerAlreadyRunning);
        }
        // Reap tasks left behind by a process that exited on its own
        if let Some(previous) = tasks.take() {
            previous.join().await;
        }

        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        info!(command = %self.spec.command, args = ?self.spec.args, "Starting worker process");
        let mut child = command
            .spawn()
            .map_err(|e| RelayError::SpawnFailed(format!("{}: {}", self.spec.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::IpcError("No stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::IpcError("No stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RelayError::IpcError("No stderr".into()))?;

        *self.stdin.lock().await = Some(stdin);
        self.running.store(true, Ordering::SeqCst);
        debug!(pid = ?child.id(), "Worker process spawned");

        let (kill_tx, kill_rx) = oneshot::channel();
        let reader = tokio::spawn(read_stdout(stdout, inbound));
        let stderr = tokio::spawn(log_stderr(stderr));
        let monitor = tokio::spawn(monitor_exit(
            child,
            kill_rx,
            self.running.clone(),
            self.stdin.clone(),
        ));

        *tasks = Some(WorkerTasks {
            kill_tx,
            monitor,
            reader,
            stderr,
        });
        Ok(())
    }

    /// Kill the worker (if running) and wait for its tasks to finish
    pub async fn stop(&self) {
        let tasks = self.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            info!("Stopping worker process");
            tasks.join().await;
        }
        self.running.store(false, Ordering::SeqCst);
        self.stdin.lock().await.take();
    }

    /// Explicit restart: stop the current process and spawn a new one
    pub async fn restart(&self, inbound: mpsc::Sender<Box<RawValue>>) -> Result<()> {
        self.stop().await;
        self.start(inbound).await
    }

    /// Write a raw JSON message as one line
    pub async fn send(&self, message: &RawValue) -> Result<()> {
        self.write_line(message.get()).await
    }

    /// Serialize and write a typed message as one line
    pub async fn send_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.write_line(&json).await
    }

    async fn write_line(&self, json: &str) -> Result<()> {
        if !self.is_running() {
            return Err(RelayError::ProcessNotRunning);
        }

        // Raw newlines in JSON text are insignificant whitespace, but they would split the frame
        let line = if json.contains(['\n', '\r']) {
            std::borrow::Cow::Owned(json.replace(['\n', '\r'], " "))
        } else {
            std::borrow::Cow::Borrowed(json)
        };

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(RelayError::ProcessNotRunning)?;

        debug!("[Bridge→Worker] {}", preview(&line));
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| RelayError::IpcError(format!("Write failed: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| RelayError::IpcError(format!("Write newline failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| RelayError::IpcError(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}

/// Parse one stdout line into a raw JSON message
///
/// Returns `None` for blank lines and for lines that are not valid UTF-8 JSON.
pub fn parse_line(bytes: &[u8]) -> Option<Box<RawValue>> {
    let line = match std::str::from_utf8(bytes) {
        Ok(line) => line.trim(),
        Err(e) => {
            warn!("Dropping non UTF-8 worker line: {}", e);
            return None;
        }
    };
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Box<RawValue>>(line) {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!(line = %preview(line), "Dropping malformed worker line: {}", e);
            None
        }
    }
}

async fn read_stdout(stdout: ChildStdout, inbound: mpsc::Sender<Box<RawValue>>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Worker stdout closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read worker stdout: {}", e);
                break;
            }
        }

        let Some(message) = parse_line(&buf) else {
            continue;
        };
        debug!("[Worker→Bridge] {}", preview(message.get()));
        if inbound.send(message).await.is_err() {
            debug!("Inbound channel closed, worker reader exiting");
            break;
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(target: "worker", "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!("Worker stderr unreadable: {}", e);
                break;
            }
        }
    }
}

async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    running: Arc<AtomicBool>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill worker process: {}", e);
            }
            child.wait().await
        }
    };

    running.store(false, Ordering::SeqCst);
    stdin.lock().await.take();

    match status {
        Ok(status) => info!(code = ?status.code(), "Worker process exited"),
        Err(e) => warn!("Failed to reap worker process: {}", e),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh(script: &str) -> WorkerSpec {
        WorkerSpec::command("sh", &["-c", script])
    }

    async fn recv(rx: &mut mpsc::Receiver<Box<RawValue>>) -> String {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for worker output")
            .expect("worker channel closed")
            .get()
            .to_string()
    }

    async fn wait_stopped(channel: &WorkerChannel) {
        for _ in 0..100 {
            if !channel.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker still running");
    }

    #[tokio::test]
    async fn test_echo_preserves_bytes() {
        let channel = WorkerChannel::new(WorkerSpec::command("cat", &[]));
        let (tx, mut rx) = mpsc::channel(8);
        channel.start(tx).await.unwrap();
        assert!(channel.is_running());

        let message = r#"{"jsonrpc":"2.0", "id":1,"result":{"z":1,"a":2.50}}"#;
        let raw = RawValue::from_string(message.to_string()).unwrap();
        channel.send(&raw).await.unwrap();
        assert_eq!(recv(&mut rx).await, message);

        channel.stop().await;
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_malformed_and_blank_lines_dropped() {
        let channel = WorkerChannel::new(sh(
            r#"echo 'not json'; echo; echo '{"broken":'; echo '{"ok":true}'; sleep 5"#,
        ));
        let (tx, mut rx) = mpsc::channel(8);
        channel.start(tx).await.unwrap();

        assert_eq!(recv(&mut rx).await, r#"{"ok":true}"#);
        assert!(channel.is_running());
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let channel = WorkerChannel::new(WorkerSpec::command("cat", &[]));
        let raw = RawValue::from_string("{}".to_string()).unwrap();
        let err = channel.send(&raw).await.unwrap_err();
        assert!(matches!(err, RelayError::ProcessNotRunning));
    }

    #[tokio::test]
    async fn test_exit_marks_not_running() {
        let channel = WorkerChannel::new(sh("exit 3"));
        let (tx, _rx) = mpsc::channel(8);
        channel.start(tx).await.unwrap();
        wait_stopped(&channel).await;

        let raw = RawValue::from_string("{}".to_string()).unwrap();
        tokio_test::assert_err!(channel.send(&raw).await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let channel = WorkerChannel::new(WorkerSpec::command("/nonexistent/worker-binary", &[]));
        let (tx, _rx) = mpsc::channel(8);
        let err = channel.start(tx).await.unwrap_err();
        assert!(matches!(err, RelayError::SpawnFailed(_)));
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let channel = WorkerChannel::new(WorkerSpec::command("cat", &[]));
        let (tx, _rx) = mpsc::channel(8);
        channel.start(tx.clone()).await.unwrap();
        let err = channel.start(tx).await.unwrap_err();
        assert!(matches!(err, RelayError::WorkerAlreadyRunning));
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_restart_after_exit() {
        let channel = WorkerChannel::new(sh(r#"read line; echo "$line"; exit 0"#));
        let (tx, mut rx) = mpsc::channel(8);
        channel.start(tx.clone()).await.unwrap();
        channel
            .send_message(&serde_json::json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, r#"{"n":1}"#);
        wait_stopped(&channel).await;

        channel.restart(tx).await.unwrap();
        assert!(channel.is_running());
        channel
            .send_message(&serde_json::json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, r#"{"n":2}"#);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_multiline_payload_sent_as_one_line() {
        let channel = WorkerChannel::new(WorkerSpec::command("cat", &[]));
        let (tx, mut rx) = mpsc::channel(8);
        channel.start(tx).await.unwrap();

        let pretty = "{\n  \"method\": \"tools/list\"\n}";
        let raw = RawValue::from_string(pretty.to_string()).unwrap();
        channel.send(&raw).await.unwrap();
        assert_eq!(recv(&mut rx).await, "{   \"method\": \"tools/list\" }");
        channel.stop().await;
    }

    #[test]
    fn test_parse_line_trims() {
        let raw = parse_line(b"  {\"a\":1}\r\n").unwrap();
        assert_eq!(raw.get(), r#"{"a":1}"#);
        assert!(parse_line(b"\n").is_none());
        assert!(parse_line(&[0xff, 0xfe, b'\n']).is_none());
    }
}
