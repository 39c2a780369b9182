//! Background terminals
//!
//! Long-running shell commands started by tool execution are tracked here,
//! outside the prompt loop: `prompt` never awaits them unless the backend's
//! own event stream does. Each terminal is a small state machine
//! (`started → aborted | exited | killed | timed_out`); while started it
//! holds the live child and the output captured so far, after a terminal
//! transition only the buffered output remains.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Started,
    Aborted,
    Exited { code: Option<i32> },
    Killed,
    TimedOut,
}

impl TerminalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TerminalStatus::Started)
    }
}

#[derive(Debug)]
struct TerminalState {
    status: TerminalStatus,
    /// Captured stdout+stderr; once the status is terminal this is the
    /// final buffered output.
    output: String,
}

enum TerminalSignal {
    Kill,
    Abort,
}

/// Handle to one background terminal.
pub struct TerminalHandle {
    pub id: String,
    state: Arc<Mutex<TerminalState>>,
    signal: Mutex<Option<oneshot::Sender<TerminalSignal>>>,
}

impl TerminalHandle {
    pub fn status(&self) -> TerminalStatus {
        self.state.lock().unwrap().status
    }

    /// Output captured so far (or the final buffer after exit).
    pub fn pending_output(&self) -> String {
        self.state.lock().unwrap().output.clone()
    }

    /// Request termination. Idempotent: signalling an already-finished
    /// terminal does nothing.
    pub fn kill(&self) {
        self.send_signal(TerminalSignal::Kill);
    }

    /// Like `kill`, but records the transition as caller-driven abandonment.
    pub fn abort(&self) {
        self.send_signal(TerminalSignal::Abort);
    }

    fn send_signal(&self, signal: TerminalSignal) {
        if let Some(tx) = self.signal.lock().unwrap().take() {
            let _ = tx.send(signal);
        }
    }
}

/// Registry of background terminals, keyed by generated id.
#[derive(Default)]
pub struct BackgroundTerminals {
    terminals: Mutex<HashMap<String, Arc<TerminalHandle>>>,
}

impl BackgroundTerminals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `command` under `sh -c` in `cwd`. The optional timeout is
    /// tracked by a watchdog independent of any prompt loop.
    pub fn start(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<Arc<TerminalHandle>, BridgeError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(BridgeError::SpawnFailed)?;

        let id = Uuid::new_v4().to_string();
        let state = Arc::new(Mutex::new(TerminalState {
            status: TerminalStatus::Started,
            output: String::new(),
        }));
        let (signal_tx, mut signal_rx) = oneshot::channel::<TerminalSignal>();

        // Capture tasks drain the pipes so the child never blocks on a full
        // pipe buffer.
        if let Some(stdout) = child.stdout.take() {
            spawn_capture(stdout, Arc::clone(&state));
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_capture(stderr, Arc::clone(&state));
        }

        let driver_state = Arc::clone(&state);
        let driver_id = id.clone();
        tokio::spawn(async move {
            let timeout_sleep = async {
                match timeout {
                    Some(t) => tokio::time::sleep(t).await,
                    // Never fires without a timeout.
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(timeout_sleep);

            let next_status = tokio::select! {
                result = child.wait() => match result {
                    Ok(status) => TerminalStatus::Exited { code: status.code() },
                    Err(e) => {
                        warn!("Terminal {} wait error: {}", driver_id, e);
                        TerminalStatus::Exited { code: None }
                    }
                },
                signal = &mut signal_rx => {
                    let status = match signal {
                        Ok(TerminalSignal::Abort) => TerminalStatus::Aborted,
                        // Explicit kill, or every handle dropped.
                        _ => TerminalStatus::Killed,
                    };
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    status
                }
                _ = &mut timeout_sleep => {
                    debug!("Terminal {} timed out", driver_id);
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    TerminalStatus::TimedOut
                }
            };

            driver_state.lock().unwrap().status = next_status;
        });

        let handle = Arc::new(TerminalHandle {
            id: id.clone(),
            state,
            signal: Mutex::new(Some(signal_tx)),
        });
        self.terminals
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<TerminalHandle>> {
        self.terminals.lock().unwrap().get(id).cloned()
    }

    /// Forget a terminal, killing it first if still running.
    pub fn release(&self, id: &str) {
        if let Some(handle) = self.terminals.lock().unwrap().remove(id) {
            if !handle.status().is_terminal() {
                handle.kill();
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.terminals
            .lock()
            .unwrap()
            .values()
            .filter(|h| !h.status().is_terminal())
            .count()
    }
}

fn spawn_capture<R>(mut reader: R, state: Arc<Mutex<TerminalState>>)
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                    state.lock().unwrap().output.push_str(&chunk);
                }
            }
        }
    });
}
