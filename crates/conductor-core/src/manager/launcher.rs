//! Launching agent peers.
//!
//! The lifecycle manager does not care how a peer comes to life, only that it
//! ends up with a process handle and a connection. [`ProcessLauncher`] is the
//! production implementation: it spawns the provider's registered command and
//! wires a [`ProtocolClient`] over the child's stdio. Tests substitute their
//! own launcher to drive the manager with a scripted connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::logging::open_wire_log;
use crate::protocol::client::ProtocolClient;
use crate::protocol::host::{AgentConnection, AgentHost};
use crate::spawn::{AgentProcess, SpawnConfig};

/// Everything a launcher needs to bring one peer up.
pub struct LaunchSpec {
    pub agent_id: String,
    pub provider: String,
    pub cwd: String,
    /// Callback surface handed to the protocol layer.
    pub host: Arc<dyn AgentHost>,
}

/// A freshly launched peer: the supervised process plus its connection.
pub struct LaunchedAgent {
    pub process: AgentProcess,
    pub connection: Arc<dyn AgentConnection>,
}

impl std::fmt::Debug for LaunchedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchedAgent")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedAgent, AgentError>;
}

/// Spawns one subprocess per agent from a provider → command registry.
pub struct ProcessLauncher {
    commands: HashMap<String, SpawnConfig>,
    log_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
            log_dir: None,
        }
    }

    /// Register the command line used to start a provider's agent binary.
    pub fn with_command(
        mut self,
        provider: impl Into<String>,
        program: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        self.commands
            .insert(provider.into(), SpawnConfig::new(program, args));
        self
    }

    /// Enable per-agent wire logs under the given directory.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchedAgent, AgentError> {
        let template = self.commands.get(&spec.provider).ok_or_else(|| {
            AgentError::SpawnFailed(format!(
                "no command registered for provider {}",
                spec.provider
            ))
        })?;

        let wire_log = open_wire_log(self.log_dir.as_deref(), &spec.agent_id);
        let config = template.clone().current_dir(spec.cwd.clone());

        log::info!(
            "launching {} agent {} in {}",
            spec.provider,
            spec.agent_id,
            spec.cwd
        );
        let mut process = AgentProcess::spawn(config, Arc::clone(&wire_log))?;
        let (stdin, stdout) = process
            .take_stdio()
            .ok_or_else(|| AgentError::SpawnFailed("stdio already taken".to_string()))?;

        let connection = ProtocolClient::new(stdout, stdin, spec.host, wire_log);
        Ok(LaunchedAgent {
            process,
            connection: Arc::new(connection),
        })
    }
}
