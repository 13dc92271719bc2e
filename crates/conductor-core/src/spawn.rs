//! Agent process spawning and supervision.
//!
//! One [`AgentProcess`] wraps one agent subprocess with piped stdio. The
//! stdin/stdout pair is handed to the protocol layer; stderr is drained into
//! the wire log. A watcher task observes exit so the orchestrator can react
//! to a peer dying mid-session, and teardown is a two-phase escalation:
//! graceful signal first, forced kill once the grace window lapses.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};

use crate::error::AgentError;
use crate::logging::{log_line, LogHandle};

/// How often the exit watcher and stop loop poll the child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for spawning an agent process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Set the working directory.
    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Terminal status of an agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// A supervised agent subprocess.
#[derive(Debug)]
pub struct AgentProcess {
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    stdio: Option<(ChildStdin, ChildStdout)>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl AgentProcess {
    /// Spawn the process and start the stderr drain and exit watcher tasks.
    pub fn spawn(config: SpawnConfig, wire_log: LogHandle) -> Result<Self, AgentError> {
        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::SpawnFailed(format!("{}: {}", config.program, e)))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("failed to capture stderr".to_string()))?;

        // Drain stderr into the wire log so peer diagnostics are not lost.
        let stderr_log = Arc::clone(&wire_log);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("agent stderr: {}", line);
                log_line(&stderr_log, "STDERR", &line);
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let child_arc = Arc::new(Mutex::new(Some(child)));

        let watcher = Arc::clone(&child_arc);
        tokio::spawn(async move {
            loop {
                {
                    let mut guard = watcher.lock().await;
                    match guard.as_mut() {
                        None => break,
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                let _ = exit_tx.send(Some(ProcessExit {
                                    code: status.code(),
                                }));
                                guard.take();
                                break;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                log::warn!("agent exit watch failed: {}", err);
                                guard.take();
                                break;
                            }
                        },
                    }
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });

        Ok(Self {
            child: child_arc,
            pid,
            stdio: Some((stdin, stdout)),
            exit_rx,
        })
    }

    /// Take the stdio pair for the protocol layer. Returns `None` after the
    /// first call.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        self.stdio.take()
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Await process exit. Returns `None` if the exit status could not be
    /// observed (e.g. the watcher lost the race with a kill).
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = rx.borrow().clone() {
                return Some(exit);
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Watch channel carrying the exit status once the process dies.
    pub fn exit_status(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Two-phase stop: graceful terminate, then force kill after `grace`.
    pub async fn stop(&self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if self.is_running().await {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                let deadline = tokio::time::Instant::now() + grace;
                while tokio::time::Instant::now() < deadline {
                    if !self.is_running().await {
                        return;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                log::warn!("agent process {} ignored SIGTERM, killing", pid);
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.kill().await;
    }

    /// Force kill the process immediately.
    pub async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::null_log;

    #[test]
    fn spawn_config_builder() {
        let config = SpawnConfig::new("claude-agent", vec!["--stdio".to_string()])
            .current_dir("/tmp")
            .env("RUST_LOG", "debug");

        assert_eq!(config.program, "claude-agent");
        assert_eq!(config.args, vec!["--stdio"]);
        assert_eq!(config.cwd, Some("/tmp".to_string()));
        assert_eq!(config.env, vec![("RUST_LOG".to_string(), "debug".to_string())]);
    }

    #[tokio::test]
    async fn spawn_nonexistent_binary_fails() {
        let config = SpawnConfig::new("definitely-not-a-real-binary-xyz", vec![]);
        let err = AgentProcess::spawn(config, null_log()).unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn exit_watcher_observes_natural_exit() {
        let config = SpawnConfig::new("true", vec![]);
        let process = AgentProcess::spawn(config, null_log()).unwrap();

        let exit = process.wait_for_exit().await.unwrap();
        assert_eq!(exit.code, Some(0));
        assert!(!process.is_running().await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stdio_carries_process_output() {
        use tokio::io::AsyncBufReadExt;

        let config = SpawnConfig::new("echo", vec!["hello".to_string()]);
        let mut process = AgentProcess::spawn(config, null_log()).unwrap();

        let (_stdin, stdout) = process.take_stdio().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("hello"));

        assert!(process.take_stdio().is_none());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn kill_terminates_long_running_process() {
        // cat with a piped stdin blocks until killed.
        let config = SpawnConfig::new("cat", vec![]);
        let process = AgentProcess::spawn(config, null_log()).unwrap();
        assert!(process.is_running().await);

        process.kill().await;
        assert!(!process.is_running().await);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn stop_escalates_within_grace_window() {
        let config = SpawnConfig::new("cat", vec![]);
        let process = AgentProcess::spawn(config, null_log()).unwrap();

        // cat exits on SIGTERM, so the graceful phase is enough.
        process.stop(Duration::from_secs(2)).await;
        assert!(!process.is_running().await);
    }
}
