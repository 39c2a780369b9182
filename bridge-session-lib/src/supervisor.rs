//! Process supervision for subprocess-backed sessions
//!
//! Spawns the backend CLI with piped stdio and a sanitized environment,
//! reports lifecycle through callbacks, and tears processes down in the
//! stream-first order the CLI expects (close pipes, then signal).

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::error::BridgeError;

/// Environment variables with these prefixes belong to the host process and
/// are stripped so the child cannot misinterpret them as its own runtime
/// signals.
const STRIPPED_ENV_PREFIXES: &[&str] = &["ACP_BRIDGE_"];

/// Reported to the spawn callback once the child is running.
#[derive(Debug, Clone)]
pub struct SpawnInfo {
    pub pid: u32,
    /// The full command line, for diagnostics.
    pub command: String,
}

pub type SpawnCallback = Box<dyn Fn(&SpawnInfo) + Send + Sync>;
pub type ExitCallback = Box<dyn Fn(u32, Option<i32>) + Send + Sync>;

/// Spawns and tears down backend CLI processes.
#[derive(Default)]
pub struct ProcessSupervisor {
    on_spawn: Option<SpawnCallback>,
    on_exit: Option<ExitCallback>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spawn_callback(mut self, callback: SpawnCallback) -> Self {
        self.on_spawn = Some(callback);
        self
    }

    pub fn with_exit_callback(mut self, callback: ExitCallback) -> Self {
        self.on_exit = Some(callback);
        self
    }

    /// Log the resolved path and version of the backend binary.
    pub fn log_binary_info(binary: &Path) {
        if let Ok(full_path) = which::which(binary) {
            info!("Backend binary: {}", full_path.display());
        } else {
            warn!(
                "Could not resolve full path for '{}' — using PATH lookup",
                binary.display()
            );
        }

        match std::process::Command::new(binary).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("Backend version: {}", version.trim());
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("--version probe failed: {}", stderr.trim());
            }
            Err(e) => {
                warn!("Failed to run --version probe: {}", e);
            }
        }
    }

    /// Launch the backend CLI: sanitized environment, all three stdio
    /// streams piped, spawn callback with `{pid, command}`.
    pub fn spawn(
        &self,
        binary: &Path,
        args: &[String],
        cwd: &Path,
        extra_env: &[(String, String)],
    ) -> Result<SupervisedProcess, BridgeError> {
        let mut cmd = Command::new(binary);
        cmd.args(args);
        cmd.current_dir(cwd);

        cmd.env_clear();
        cmd.envs(sanitized_env(std::env::vars()));
        cmd.envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let command_line = std::iter::once(binary.to_string_lossy().to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        info!("Spawning backend: {}", command_line);

        let child = cmd.spawn().map_err(BridgeError::SpawnFailed)?;
        let pid = child.id().unwrap_or(0);

        let info = SpawnInfo {
            pid,
            command: command_line,
        };
        if let Some(ref on_spawn) = self.on_spawn {
            on_spawn(&info);
        }

        Ok(SupervisedProcess {
            pid,
            command: info.command,
            child: Some(child),
        })
    }

    /// Report a child exit, whether requested or spontaneous.
    pub fn notify_exit(&self, pid: u32, code: Option<i32>) {
        info!("Backend process exited: pid={}, code={:?}", pid, code);
        if let Some(ref on_exit) = self.on_exit {
            on_exit(pid, code);
        }
    }
}

/// Drop host-process-specific variables from an environment snapshot.
pub fn sanitized_env(
    vars: impl Iterator<Item = (String, String)>,
) -> impl Iterator<Item = (String, String)> {
    vars.filter(|(key, _)| {
        !STRIPPED_ENV_PREFIXES
            .iter()
            .any(|prefix| key.starts_with(prefix))
    })
}

/// A spawned backend process. The child handle can be taken exactly once
/// (to hand to an SDK client that owns the stdio protocol); `kill` is a
/// no-op afterwards and on repeated calls.
pub struct SupervisedProcess {
    pub pid: u32,
    pub command: String,
    child: Option<Child>,
}

impl SupervisedProcess {
    /// Hand ownership of the child to a protocol client.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    /// Check for a spontaneous exit without blocking.
    pub fn try_wait(&mut self) -> Option<Option<i32>> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                warn!("Error checking process {}: {}", self.pid, e);
                Some(None)
            }
        }
    }

    /// Tear the process down: close all three stdio streams first so the
    /// child sees EOF, then send the termination signal. Idempotent.
    pub async fn kill(&mut self) -> Option<i32> {
        let Some(mut child) = self.child.take() else {
            return None;
        };

        drop(child.stdin.take());
        drop(child.stdout.take());
        drop(child.stderr.take());

        if let Err(e) = child.kill().await {
            warn!("Failed to kill process {}: {}", self.pid, e);
        }
        match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to reap process {}: {}", self.pid, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn sanitized_env_strips_host_prefixes() {
        let vars = vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("ACP_BRIDGE_SOCKET".to_string(), "/tmp/x".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("ACP_BRIDGE_SESSION".to_string(), "s-1".to_string()),
        ];

        let kept: Vec<_> = sanitized_env(vars.into_iter()).map(|(k, _)| k).collect();
        assert_eq!(kept, vec!["PATH", "HOME"]);
    }

    #[tokio::test]
    async fn spawn_reports_pid_and_kill_is_idempotent() {
        let seen_pid = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&seen_pid);
        let supervisor = ProcessSupervisor::new().with_spawn_callback(Box::new(move |info| {
            seen.store(info.pid, Ordering::SeqCst);
        }));

        let mut process = supervisor
            .spawn(
                Path::new("sleep"),
                &["30".to_string()],
                Path::new("/tmp"),
                &[],
            )
            .expect("sleep should spawn");

        assert_eq!(seen_pid.load(Ordering::SeqCst), process.pid);
        assert!(process.pid > 0);

        process.kill().await;
        // Second kill finds nothing to do.
        assert_eq!(process.kill().await, None);
    }

    #[tokio::test]
    async fn take_child_disarms_kill() {
        let supervisor = ProcessSupervisor::new();
        let mut process = supervisor
            .spawn(Path::new("true"), &[], Path::new("/tmp"), &[])
            .expect("true should spawn");

        let child = process.take_child();
        assert!(child.is_some());
        assert!(process.take_child().is_none());
        assert_eq!(process.kill().await, None);

        // Reap the child ourselves so the test leaves nothing behind.
        let _ = child.unwrap().wait().await;
    }
}
