//! Agent lifecycle management.
//!
//! [`AgentManager`] owns every managed agent: it creates and resumes them,
//! drives lazy initialization (spawn, handshake, session create/load), runs
//! prompt turns, brokers permission requests, applies mode changes, and tears
//! agents down. All state transitions for one agent are serialized behind its
//! state lock; concurrent initializers collapse onto a single in-flight
//! future so no agent ever gets two subprocesses.

mod launcher;
mod state;

pub use launcher::{AgentLauncher, LaunchSpec, LaunchedAgent, ProcessLauncher};
pub use state::{AgentRuntime, AgentSnapshot, AgentState, InitFuture, ManagedAgent};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

use crate::bus::Subscription;
use crate::error::AgentError;
use crate::events::{
    AgentEvent, AgentStatus, AgentUpdate, PermissionResolution, StopReason, TimelineEvent,
    TodoItem,
};
use crate::permissions::{PermissionBroker, DEFAULT_PERMISSION_TIMEOUT};
use crate::persistence::{AgentOptions, AgentRecord, AgentStore};
use crate::protocol::host::{AgentConnection, AgentHost};
use crate::protocol::types::{
    PermissionOutcome, PermissionRequest, PlanEntry, ReadTextFileParams, SessionNotification,
    SessionUpdate, WriteTextFileParams,
};

/// Grace window between the terminate signal and a forced kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long a killed agent's record stays queryable so in-flight
/// notifications still land.
const REMOVE_DELAY: Duration = Duration::from_millis(500);

/// Tunables for the manager. Defaults match production behavior; tests
/// shrink the delays.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub kill_grace: Duration,
    pub remove_delay: Duration,
    pub permission_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            kill_grace: KILL_GRACE,
            remove_delay: REMOVE_DELAY,
            permission_timeout: DEFAULT_PERMISSION_TIMEOUT,
        }
    }
}

/// Options for one prompt turn.
#[derive(Debug, Clone, Default)]
pub struct SendPromptOptions {
    /// Bound the synchronous wait; the turn keeps running past it.
    pub max_wait_ms: Option<u64>,
    /// Mode to apply before the prompt is issued.
    pub session_mode: Option<String>,
    /// Client-supplied id for the synthesized user message.
    pub client_message_id: Option<String>,
}

/// What `send_prompt` observed within its wait window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub did_complete: bool,
    pub stop_reason: Option<StopReason>,
}

/// The lifecycle manager. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct AgentManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    agents: RwLock<HashMap<String, Arc<ManagedAgent>>>,
    store: Arc<dyn AgentStore>,
    launcher: Arc<dyn AgentLauncher>,
    broker: PermissionBroker,
    config: ManagerConfig,
}

impl AgentManager {
    pub fn new(store: Arc<dyn AgentStore>, launcher: Arc<dyn AgentLauncher>) -> Self {
        Self::with_config(store, launcher, ManagerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn AgentStore>,
        launcher: Arc<dyn AgentLauncher>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                agents: RwLock::new(HashMap::new()),
                store,
                launcher,
                broker: PermissionBroker::with_timeout(config.permission_timeout),
                config,
            }),
        }
    }

    /// Register a new agent. The working directory is validated before
    /// anything is spawned; an initial prompt, if given, drives the first
    /// turn in the background.
    pub async fn create_agent(
        &self,
        cwd: &str,
        options: AgentOptions,
        initial_prompt: Option<String>,
    ) -> Result<String, AgentError> {
        validate_directory(cwd)?;

        let id = Uuid::new_v4().to_string();
        let title = initial_prompt
            .as_deref()
            .map(derive_title)
            .unwrap_or_else(|| format!("{} agent", options.provider));

        let agent = Arc::new(ManagedAgent::new(
            id.clone(),
            cwd.to_string(),
            options.clone(),
            title.clone(),
            Utc::now(),
            options.session_id.clone(),
        ));
        self.inner
            .agents
            .write()
            .await
            .insert(id.clone(), Arc::clone(&agent));

        let record = AgentRecord {
            id: id.clone(),
            title,
            session_id: options.session_id.clone(),
            options,
            created_at: agent.created_at,
            cwd: cwd.to_string(),
        };
        if let Err(err) = self.inner.store.upsert(&record) {
            log::warn!("failed to persist agent {}: {}", id, err);
        }

        agent.publish(AgentEvent::StateChanged {
            status: AgentStatus::Uninitialized,
        });

        if let Some(prompt) = initial_prompt {
            let inner = Arc::clone(&self.inner);
            let agent_id = id.clone();
            tokio::spawn(async move {
                if let Err(err) = ManagerInner::send_prompt(
                    &inner,
                    &agent_id,
                    &prompt,
                    SendPromptOptions::default(),
                )
                .await
                {
                    log::warn!("initial prompt for agent {} failed: {}", agent_id, err);
                }
            });
        }

        Ok(id)
    }

    /// Re-register an agent from its persisted record. Initialization later
    /// loads the persisted session instead of creating a fresh one.
    pub async fn resume_agent(&self, record: AgentRecord) -> Result<String, AgentError> {
        let mut agents = self.inner.agents.write().await;
        if agents.contains_key(&record.id) {
            return Ok(record.id);
        }

        let persisted_session = record
            .options
            .session_id
            .clone()
            .or_else(|| record.session_id.clone());
        let agent = Arc::new(ManagedAgent::new(
            record.id.clone(),
            record.cwd.clone(),
            record.options.clone(),
            record.title.clone(),
            record.created_at,
            persisted_session,
        ));
        agents.insert(record.id.clone(), Arc::clone(&agent));
        drop(agents);

        agent.publish(AgentEvent::StateChanged {
            status: AgentStatus::Uninitialized,
        });
        Ok(record.id)
    }

    /// Resume every record in the store. Returns the resumed agent ids.
    pub async fn resume_persisted(&self) -> Result<Vec<String>, AgentError> {
        let records = self.inner.store.load_all()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.resume_agent(record).await?);
        }
        Ok(ids)
    }

    /// Idempotent, concurrency-safe bootstrap: the first caller starts the
    /// work, every caller observes the same outcome.
    pub async fn ensure_initialized(&self, id: &str) -> Result<(), AgentError> {
        ManagerInner::ensure_initialized(&self.inner, id).await
    }

    /// Run one prompt turn. Cancels any turn still processing first, so at
    /// most one turn is ever active per agent.
    pub async fn send_prompt(
        &self,
        id: &str,
        text: &str,
        opts: SendPromptOptions,
    ) -> Result<PromptOutcome, AgentError> {
        ManagerInner::send_prompt(&self.inner, id, text, opts).await
    }

    /// Interrupt the in-flight turn. Logged no-op when nothing is processing.
    pub async fn cancel_agent(&self, id: &str) -> Result<(), AgentError> {
        let agent = self.inner.get(id).await?;
        let state = agent.state.lock().await;
        if let AgentState::Processing { runtime, .. } = &*state {
            let connection = Arc::clone(&runtime.connection);
            let session_id = runtime.session_id.clone();
            drop(state);
            if let Err(err) = connection.cancel(&session_id).await {
                log::warn!("cancel RPC failed for agent {}: {}", id, err);
            }
        } else {
            log::info!("cancel requested for agent {} but no turn is processing", id);
        }
        Ok(())
    }

    /// Tear an agent down: notify, forget the persisted record, terminate the
    /// process (gracefully, then forcefully), and drop the in-memory record
    /// after a short delay.
    pub async fn kill_agent(&self, id: &str) -> Result<(), AgentError> {
        ManagerInner::kill_agent(&self.inner, id).await
    }

    /// Switch the session mode. Validated against the peer-advertised set;
    /// queued when initialization has not happened yet.
    pub async fn set_session_mode(&self, id: &str, mode_id: &str) -> Result<(), AgentError> {
        let agent = self.inner.get(id).await?;
        let mut state = agent.state.lock().await;
        match &mut *state {
            AgentState::Ready { runtime }
            | AgentState::Processing { runtime, .. }
            | AgentState::Completed { runtime, .. } => {
                validate_mode(runtime, mode_id)?;
                let connection = Arc::clone(&runtime.connection);
                let session_id = runtime.session_id.clone();
                connection.set_session_mode(&session_id, mode_id).await?;
                runtime.current_mode_id = Some(mode_id.to_string());
                Ok(())
            }
            AgentState::Uninitialized { .. } | AgentState::Initializing { .. } => {
                *agent.queued_mode.lock().unwrap() = Some(mode_id.to_string());
                Ok(())
            }
            other => Err(AgentError::Unavailable {
                status: other.status(),
                reason: "agent has no active session".to_string(),
            }),
        }
    }

    /// Park a peer permission request and await its resolution. Resolves with
    /// the selected option, or `Cancelled` once the timeout fires.
    pub async fn handle_permission_request(
        &self,
        agent_id: &str,
        request: PermissionRequest,
    ) -> PermissionOutcome {
        ManagerInner::handle_permission_request(&self.inner, agent_id, request).await
    }

    /// Resolve a pending permission request with the option a client picked.
    pub async fn respond_to_permission(
        &self,
        agent_id: &str,
        request_id: &str,
        option_id: &str,
    ) -> Result<(), AgentError> {
        let agent = self.inner.get(agent_id).await?;
        if !self
            .inner
            .broker
            .pending_for(agent_id)
            .iter()
            .any(|id| id.as_str() == request_id)
        {
            return Err(AgentError::PermissionNotFound(request_id.to_string()));
        }
        self.inner.broker.respond(request_id, option_id)?;
        agent.publish(AgentEvent::PermissionResolved {
            request_id: request_id.to_string(),
            resolution: PermissionResolution::Selected {
                option_id: option_id.to_string(),
            },
        });
        Ok(())
    }

    pub async fn list_agents(&self) -> Vec<AgentSnapshot> {
        let agents: Vec<Arc<ManagedAgent>> =
            self.inner.agents.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(agents.len());
        for agent in agents {
            snapshots.push(self.inner.snapshot(&agent).await);
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshots
    }

    pub async fn agent_status(&self, id: &str) -> Result<AgentSnapshot, AgentError> {
        let agent = self.inner.get(id).await?;
        Ok(self.inner.snapshot(&agent).await)
    }

    /// The agent's full update history, for bulk hydration.
    pub async fn agent_updates(&self, id: &str) -> Result<Vec<AgentUpdate>, AgentError> {
        let agent = self.inner.get(id).await?;
        Ok(agent.bus.history())
    }

    /// Subscribe to an agent's update stream. Dropping the returned
    /// subscription unsubscribes.
    pub async fn subscribe(&self, id: &str) -> Result<Subscription, AgentError> {
        let agent = self.inner.get(id).await?;
        Ok(agent.bus.subscribe())
    }
}

impl ManagerInner {
    async fn get(&self, id: &str) -> Result<Arc<ManagedAgent>, AgentError> {
        self.agents
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::AgentNotFound(id.to_string()))
    }

    async fn snapshot(&self, agent: &Arc<ManagedAgent>) -> AgentSnapshot {
        let state = agent.state.lock().await;
        let (current_mode_id, available_modes) = match state.runtime() {
            Some(runtime) => (
                runtime.current_mode_id.clone(),
                runtime.available_modes.clone(),
            ),
            None => (None, Vec::new()),
        };
        AgentSnapshot {
            id: agent.id.clone(),
            provider: agent.options.provider.clone(),
            cwd: agent.cwd.clone(),
            status: state.status(),
            current_mode_id,
            available_modes,
            pending_permissions: self.broker.pending_for(&agent.id),
            last_error: state.last_error().map(str::to_string),
            title: agent.title.lock().unwrap().clone(),
            created_at: agent.created_at,
        }
    }

    async fn ensure_initialized(inner: &Arc<Self>, id: &str) -> Result<(), AgentError> {
        let agent = inner.get(id).await?;

        let in_flight = {
            let mut state = agent.state.lock().await;
            match &*state {
                AgentState::Ready { .. }
                | AgentState::Processing { .. }
                | AgentState::Completed { .. } => return Ok(()),
                AgentState::Failed { last_error, .. } => {
                    return Err(AgentError::Unavailable {
                        status: AgentStatus::Failed,
                        reason: last_error.clone(),
                    })
                }
                AgentState::Killed => {
                    return Err(AgentError::Unavailable {
                        status: AgentStatus::Killed,
                        reason: "agent was killed".to_string(),
                    })
                }
                AgentState::Initializing { in_flight, .. } => in_flight.clone(),
                AgentState::Uninitialized {
                    persisted_session_id,
                } => {
                    let persisted = persisted_session_id.clone();
                    let (done_tx, done_rx) = oneshot::channel::<Result<(), String>>();
                    let shared: InitFuture = async move {
                        match done_rx.await {
                            Ok(result) => result,
                            Err(_) => Err("initialization task aborted".to_string()),
                        }
                    }
                    .boxed()
                    .shared();

                    *state = AgentState::Initializing {
                        started_at: Utc::now(),
                        in_flight: shared.clone(),
                    };
                    drop(state);
                    agent.publish(AgentEvent::StateChanged {
                        status: AgentStatus::Initializing,
                    });

                    let task_inner = Arc::clone(inner);
                    let task_agent = Arc::clone(&agent);
                    tokio::spawn(async move {
                        Self::run_init(&task_inner, &task_agent, persisted, done_tx).await;
                    });
                    shared
                }
            }
        };

        in_flight.await.map_err(|reason| AgentError::Unavailable {
            status: AgentStatus::Failed,
            reason,
        })
    }

    /// The initialization task body: bootstrap the peer, publish the outcome,
    /// and wake everyone awaiting the shared future.
    async fn run_init(
        inner: &Arc<Self>,
        agent: &Arc<ManagedAgent>,
        persisted_session_id: Option<String>,
        done_tx: oneshot::Sender<Result<(), String>>,
    ) {
        match Self::bootstrap(inner, agent, persisted_session_id).await {
            Ok(mut runtime) => {
                // A mode queued before initialization applies now.
                let queued = agent.queued_mode.lock().unwrap().take();
                if let Some(mode_id) = queued {
                    match runtime
                        .connection
                        .set_session_mode(&runtime.session_id, &mode_id)
                        .await
                    {
                        Ok(()) => runtime.current_mode_id = Some(mode_id),
                        Err(err) => log::warn!(
                            "queued mode {} failed for agent {}: {}",
                            mode_id,
                            agent.id,
                            err
                        ),
                    }
                }

                let session_id = runtime.session_id.clone();
                let record = AgentRecord {
                    id: agent.id.clone(),
                    title: agent.title.lock().unwrap().clone(),
                    session_id: Some(session_id.clone()),
                    options: AgentOptions {
                        provider: agent.options.provider.clone(),
                        session_id: Some(session_id.clone()),
                    },
                    created_at: agent.created_at,
                    cwd: agent.cwd.clone(),
                };
                if let Err(err) = inner.store.upsert(&record) {
                    log::warn!("failed to persist session for agent {}: {}", agent.id, err);
                }

                let exit_rx = runtime.process.exit_status();
                {
                    let mut state = agent.state.lock().await;
                    if !matches!(&*state, AgentState::Initializing { .. }) {
                        // Killed while we were booting: tear down quietly.
                        drop(state);
                        runtime.process.kill().await;
                        let _ = done_tx
                            .send(Err("agent was killed during initialization".to_string()));
                        return;
                    }
                    *state = AgentState::Ready { runtime };
                }
                agent.publish(AgentEvent::ThreadStarted { session_id });
                agent.publish(AgentEvent::StateChanged {
                    status: AgentStatus::Ready,
                });
                Self::watch_exit(Arc::clone(agent), exit_rx);
                let _ = done_tx.send(Ok(()));
            }
            Err(err) => {
                let reason = err.to_string();
                log::warn!("initialization failed for agent {}: {}", agent.id, reason);
                {
                    let mut state = agent.state.lock().await;
                    if matches!(&*state, AgentState::Initializing { .. }) {
                        *state = AgentState::Failed {
                            last_error: reason.clone(),
                            runtime: None,
                        };
                    }
                }
                agent.publish(AgentEvent::StateChanged {
                    status: AgentStatus::Failed,
                });
                let _ = done_tx.send(Err(reason));
            }
        }
    }

    /// Spawn, handshake, and create or load the session. A failure after the
    /// spawn terminates the partial process.
    async fn bootstrap(
        inner: &Arc<Self>,
        agent: &Arc<ManagedAgent>,
        persisted_session_id: Option<String>,
    ) -> Result<AgentRuntime, AgentError> {
        let host: Arc<dyn AgentHost> = Arc::new(ManagerHost {
            inner: Arc::downgrade(inner),
            agent_id: agent.id.clone(),
        });
        let LaunchedAgent {
            process,
            connection,
        } = inner
            .launcher
            .launch(LaunchSpec {
                agent_id: agent.id.clone(),
                provider: agent.options.provider.clone(),
                cwd: agent.cwd.clone(),
                host,
            })
            .await?;

        let setup = async {
            connection
                .initialize()
                .await
                .map_err(|e| AgentError::HandshakeFailed(e.to_string()))?;

            match &persisted_session_id {
                Some(session_id) => {
                    let loaded = connection
                        .load_session(session_id, &agent.cwd)
                        .await
                        .map_err(|e| AgentError::SessionLoadFailed {
                            session_id: session_id.clone(),
                            reason: e.to_string(),
                        })?;
                    Ok::<_, AgentError>((session_id.clone(), loaded.modes))
                }
                None => {
                    let created = connection
                        .new_session(&agent.cwd)
                        .await
                        .map_err(|e| AgentError::HandshakeFailed(e.to_string()))?;
                    Ok((created.session_id, created.modes))
                }
            }
        };

        match setup.await {
            Ok((session_id, modes)) => {
                let (current_mode_id, available_modes) = match modes {
                    Some(state) => (Some(state.current_mode_id), state.available_modes),
                    None => (None, Vec::new()),
                };
                Ok(AgentRuntime {
                    process,
                    connection,
                    session_id,
                    current_mode_id,
                    available_modes,
                })
            }
            Err(err) => {
                process.kill().await;
                Err(err)
            }
        }
    }

    /// React to the subprocess dying while the agent is not already down.
    fn watch_exit(
        agent: Arc<ManagedAgent>,
        mut exit_rx: tokio::sync::watch::Receiver<Option<crate::spawn::ProcessExit>>,
    ) {
        tokio::spawn(async move {
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    // Watcher gone without an exit report: the kill path
                    // already owns this teardown.
                    return;
                }
            }
            let exit = exit_rx.borrow().clone();
            let description = match exit.and_then(|e| e.code) {
                Some(code) => format!("agent process exited with code {}", code),
                None => "agent process exited".to_string(),
            };

            let mut state = agent.state.lock().await;
            if matches!(&*state, AgentState::Killed | AgentState::Failed { .. }) {
                return;
            }
            let was_processing = matches!(&*state, AgentState::Processing { .. });
            let old = std::mem::replace(&mut *state, AgentState::Killed);
            *state = AgentState::Failed {
                last_error: description.clone(),
                runtime: old.into_runtime(),
            };
            drop(state);

            log::warn!("agent {}: {}", agent.id, description);
            if was_processing {
                agent.publish(AgentEvent::TurnFailed {
                    error: description.clone(),
                });
            }
            agent.publish(AgentEvent::StateChanged {
                status: AgentStatus::Failed,
            });
        });
    }

    async fn send_prompt(
        inner: &Arc<Self>,
        id: &str,
        text: &str,
        opts: SendPromptOptions,
    ) -> Result<PromptOutcome, AgentError> {
        Self::ensure_initialized(inner, id).await?;
        let agent = inner.get(id).await?;

        let done_rx = {
            let mut state = agent.state.lock().await;

            // At most one active turn: whatever is still processing gets
            // canceled first, and a cancel failure does not stop the new
            // prompt.
            let cancel_target = match &*state {
                AgentState::Processing { runtime, .. } => Some((
                    Arc::clone(&runtime.connection),
                    runtime.session_id.clone(),
                )),
                _ => None,
            };
            if let Some((connection, session_id)) = cancel_target {
                if let Err(err) = connection.cancel(&session_id).await {
                    log::warn!("cancel before new prompt failed for agent {}: {}", id, err);
                }
                agent.publish(AgentEvent::TurnCanceled {
                    reason: "superseded by a new prompt".to_string(),
                });
                let old = std::mem::replace(&mut *state, AgentState::Killed);
                if let Some(runtime) = old.into_runtime() {
                    *state = AgentState::Ready { runtime };
                }
            }

            let runtime = match &mut *state {
                AgentState::Ready { runtime } | AgentState::Completed { runtime, .. } => runtime,
                other => {
                    return Err(AgentError::Unavailable {
                        status: other.status(),
                        reason: "agent has no active session".to_string(),
                    })
                }
            };

            // Fresh turn: chunk ids start over.
            agent.enricher.lock().unwrap().reset();

            if let Some(mode_id) = &opts.session_mode {
                validate_mode(runtime, mode_id)?;
                let connection = Arc::clone(&runtime.connection);
                let session_id = runtime.session_id.clone();
                connection.set_session_mode(&session_id, mode_id).await?;
                runtime.current_mode_id = Some(mode_id.clone());
            }

            let connection = Arc::clone(&runtime.connection);
            let session_id = runtime.session_id.clone();

            // The user message lands in history before the peer echoes
            // anything back.
            let message_id = opts
                .client_message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            agent.publish(AgentEvent::TimelineItem {
                item: TimelineEvent::UserMessage {
                    id: Some(message_id),
                    text: text.to_string(),
                },
            });

            let turn = agent.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let old = std::mem::replace(&mut *state, AgentState::Killed);
            match old.into_runtime() {
                Some(runtime) => *state = AgentState::Processing { runtime, turn },
                None => {
                    return Err(AgentError::Unavailable {
                        status: AgentStatus::Killed,
                        reason: "agent lost its session".to_string(),
                    })
                }
            }
            drop(state);

            agent.publish(AgentEvent::TurnStarted);
            agent.publish(AgentEvent::StateChanged {
                status: AgentStatus::Processing,
            });

            let (done_tx, done_rx) = oneshot::channel();
            let task_agent = Arc::clone(&agent);
            let prompt_text = text.to_string();
            tokio::spawn(async move {
                let outcome =
                    Self::run_turn(task_agent, connection, session_id, prompt_text, turn).await;
                let _ = done_tx.send(outcome);
            });
            done_rx
        };

        // Bounded wait races the turn against the timer; the losing branch
        // keeps running and still lands on the bus.
        let outcome = match opts.max_wait_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), done_rx).await {
                Ok(Ok(outcome)) => outcome,
                _ => PromptOutcome {
                    did_complete: false,
                    stop_reason: None,
                },
            },
            None => done_rx.await.unwrap_or(PromptOutcome {
                did_complete: false,
                stop_reason: None,
            }),
        };
        Ok(outcome)
    }

    /// Await the prompt RPC and map its stop reason onto the state machine.
    /// A turn that was superseded while waiting leaves the state alone.
    async fn run_turn(
        agent: Arc<ManagedAgent>,
        connection: Arc<dyn AgentConnection>,
        session_id: String,
        text: String,
        turn: u64,
    ) -> PromptOutcome {
        let result = connection.prompt(&session_id, &text).await;

        let mut state = agent.state.lock().await;
        let is_current =
            matches!(&*state, AgentState::Processing { turn: active, .. } if *active == turn);
        if !is_current {
            log::debug!("agent {} turn {} superseded, discarding outcome", agent.id, turn);
            return match result {
                Ok(response) => PromptOutcome {
                    did_complete: true,
                    stop_reason: Some(response.stop_reason),
                },
                Err(_) => PromptOutcome {
                    did_complete: false,
                    stop_reason: None,
                },
            };
        }

        match result {
            Ok(response) => {
                let stop_reason = response.stop_reason;
                match stop_reason {
                    StopReason::Cancelled => {
                        let old = std::mem::replace(&mut *state, AgentState::Killed);
                        if let Some(runtime) = old.into_runtime() {
                            *state = AgentState::Ready { runtime };
                        }
                        drop(state);
                        agent.publish(AgentEvent::TurnCanceled {
                            reason: "cancelled".to_string(),
                        });
                        agent.publish(AgentEvent::StateChanged {
                            status: AgentStatus::Ready,
                        });
                    }
                    StopReason::Refusal => {
                        let reason = "agent refused the request".to_string();
                        let old = std::mem::replace(&mut *state, AgentState::Killed);
                        *state = AgentState::Failed {
                            last_error: reason.clone(),
                            runtime: old.into_runtime(),
                        };
                        drop(state);
                        agent.publish(AgentEvent::TurnFailed { error: reason });
                        agent.publish(AgentEvent::StateChanged {
                            status: AgentStatus::Failed,
                        });
                    }
                    // Every other reason ends the turn, possibly truncated.
                    _ => {
                        let old = std::mem::replace(&mut *state, AgentState::Killed);
                        if let Some(runtime) = old.into_runtime() {
                            *state = AgentState::Completed {
                                runtime,
                                stop_reason,
                            };
                        }
                        drop(state);
                        agent.publish(AgentEvent::TurnCompleted {
                            usage: response.usage,
                        });
                        agent.publish(AgentEvent::StateChanged {
                            status: AgentStatus::Completed,
                        });
                    }
                }
                PromptOutcome {
                    did_complete: true,
                    stop_reason: Some(stop_reason),
                }
            }
            Err(err) => {
                let reason = err.to_string();
                let old = std::mem::replace(&mut *state, AgentState::Killed);
                *state = AgentState::Failed {
                    last_error: reason.clone(),
                    runtime: old.into_runtime(),
                };
                drop(state);
                agent.publish(AgentEvent::TurnFailed { error: reason });
                agent.publish(AgentEvent::StateChanged {
                    status: AgentStatus::Failed,
                });
                PromptOutcome {
                    did_complete: true,
                    stop_reason: None,
                }
            }
        }
    }

    async fn kill_agent(inner: &Arc<Self>, id: &str) -> Result<(), AgentError> {
        let agent = inner.get(id).await?;

        let runtime = {
            let mut state = agent.state.lock().await;
            let was_processing = matches!(&*state, AgentState::Processing { .. });
            let old = std::mem::replace(&mut *state, AgentState::Killed);
            drop(state);
            if was_processing {
                agent.publish(AgentEvent::TurnCanceled {
                    reason: "agent killed".to_string(),
                });
            }
            old.into_runtime()
        };

        // Subscribers hear about the kill while the record still resolves.
        agent.publish(AgentEvent::StateChanged {
            status: AgentStatus::Killed,
        });

        // Unblock the peer side of anything still waiting on a decision.
        for request_id in inner.broker.pending_for(&agent.id) {
            if let Some(pending) = inner.broker.take(&request_id) {
                pending.resolve(PermissionOutcome::Cancelled);
                agent.publish(AgentEvent::PermissionResolved {
                    request_id,
                    resolution: PermissionResolution::Cancelled,
                });
            }
        }

        if let Err(err) = inner.store.remove(&agent.id) {
            log::warn!("failed to remove persisted agent {}: {}", agent.id, err);
        }

        if let Some(runtime) = runtime {
            let grace = inner.config.kill_grace;
            tokio::spawn(async move {
                runtime.process.stop(grace).await;
            });
        }

        let task_inner = Arc::clone(inner);
        let agent_id = agent.id.clone();
        let delay = inner.config.remove_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_inner.agents.write().await.remove(&agent_id);
        });

        Ok(())
    }

    async fn handle_permission_request(
        inner: &Arc<Self>,
        agent_id: &str,
        request: PermissionRequest,
    ) -> PermissionOutcome {
        let agent = match inner.get(agent_id).await {
            Ok(agent) => agent,
            Err(_) => return PermissionOutcome::Cancelled,
        };

        let (request_id, receiver) = inner.broker.register(agent_id, request.clone());
        agent.publish(AgentEvent::PermissionRequested {
            request_id: request_id.clone(),
            request,
        });

        // Auto-reject if nobody answers within the window.
        let timer_inner = Arc::clone(inner);
        let timer_agent = Arc::clone(&agent);
        let timer_id = request_id.clone();
        let timeout = inner.broker.timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(pending) = timer_inner.broker.take(&timer_id) {
                log::warn!("permission request {} timed out", timer_id);
                pending.resolve(PermissionOutcome::Cancelled);
                timer_agent.publish(AgentEvent::PermissionResolved {
                    request_id: timer_id,
                    resolution: PermissionResolution::TimedOut,
                });
            }
        });

        receiver.await.unwrap_or(PermissionOutcome::Cancelled)
    }

    /// Enrich and publish one streamed session update.
    async fn handle_session_update(
        inner: &Arc<Self>,
        agent_id: &str,
        notification: SessionNotification,
    ) {
        let agent = match inner.get(agent_id).await {
            Ok(agent) => agent,
            Err(_) => {
                log::debug!("session update for unknown agent {}", agent_id);
                return;
            }
        };

        let item = match notification.update {
            SessionUpdate::UserMessageChunk { content } => {
                agent.enricher.lock().unwrap().reset();
                Some(TimelineEvent::UserMessage {
                    id: None,
                    text: content.as_text().to_string(),
                })
            }
            SessionUpdate::AgentMessageChunk { content } => {
                let id = agent.enricher.lock().unwrap().message_id();
                Some(TimelineEvent::AssistantChunk {
                    id,
                    text: content.as_text().to_string(),
                })
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                let id = agent.enricher.lock().unwrap().thought_id();
                Some(TimelineEvent::ThoughtChunk {
                    id,
                    text: content.as_text().to_string(),
                })
            }
            SessionUpdate::ToolCall {
                tool_call_id,
                title,
                kind,
                status,
                raw_input,
                raw_output,
                server,
            } => {
                // A tool call starting is a turn boundary for chunk ids.
                agent.enricher.lock().unwrap().reset();
                Some(TimelineEvent::ToolCall {
                    call_id: tool_call_id,
                    name: Some(title),
                    status,
                    input: raw_input,
                    output: raw_output,
                    error: None,
                    tool_kind: kind,
                    server,
                })
            }
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                title,
                kind,
                status,
                raw_input,
                raw_output,
                error,
                server,
            } => Some(TimelineEvent::ToolCall {
                call_id: Some(tool_call_id),
                name: title,
                status,
                input: raw_input,
                output: raw_output,
                error,
                tool_kind: kind,
                server,
            }),
            SessionUpdate::Plan { entries } => Some(TimelineEvent::TodoUpdate {
                items: entries.into_iter().map(plan_entry_to_todo).collect(),
            }),
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                // Detached from the notification path: the state lock may be
                // held by an operation that is itself awaiting the peer, and
                // this runs on the connection's read loop.
                let task_agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    let mut state = task_agent.state.lock().await;
                    if let Some(runtime) = state.runtime_mut() {
                        runtime.current_mode_id = Some(current_mode_id);
                    }
                });
                None
            }
            SessionUpdate::Unknown => {
                log::debug!("ignoring unknown session update for agent {}", agent_id);
                None
            }
        };

        if let Some(item) = item {
            agent.publish(AgentEvent::TimelineItem { item });
        }
    }
}

/// Per-agent callback surface handed to the protocol layer. Holds the
/// manager weakly: a dying manager turns callbacks into no-ops instead of
/// keeping it alive through the connection.
struct ManagerHost {
    inner: Weak<ManagerInner>,
    agent_id: String,
}

#[async_trait]
impl AgentHost for ManagerHost {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome {
        match self.inner.upgrade() {
            Some(inner) => {
                ManagerInner::handle_permission_request(&inner, &self.agent_id, request).await
            }
            None => PermissionOutcome::Cancelled,
        }
    }

    async fn read_text_file(&self, params: ReadTextFileParams) -> Result<String, String> {
        let content = tokio::fs::read_to_string(&params.path)
            .await
            .map_err(|e| format!("{}: {}", params.path, e))?;
        Ok(slice_lines(&content, params.line, params.limit))
    }

    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<(), String> {
        if let Some(parent) = Path::new(&params.path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("{}: {}", params.path, e))?;
        }
        tokio::fs::write(&params.path, &params.content)
            .await
            .map_err(|e| format!("{}: {}", params.path, e))
    }

    async fn session_update(&self, notification: SessionNotification) {
        if let Some(inner) = self.inner.upgrade() {
            ManagerInner::handle_session_update(&inner, &self.agent_id, notification).await;
        }
    }
}

/// Pre-spawn check that the working directory is readable and traversable.
fn validate_directory(path: &str) -> Result<(), AgentError> {
    let unavailable = |reason: String| AgentError::DirectoryUnavailable {
        path: path.to_string(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| unavailable(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(unavailable("not a directory".to_string()));
    }

    #[cfg(unix)]
    {
        let c_path = std::ffi::CString::new(path)
            .map_err(|_| unavailable("path contains a NUL byte".to_string()))?;
        if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::X_OK) } != 0 {
            return Err(unavailable("not readable and traversable".to_string()));
        }
    }
    #[cfg(not(unix))]
    {
        std::fs::read_dir(path).map_err(|e| unavailable(e.to_string()))?;
    }

    Ok(())
}

fn validate_mode(runtime: &AgentRuntime, mode_id: &str) -> Result<(), AgentError> {
    if runtime.available_modes.is_empty()
        || runtime.available_modes.iter().any(|mode| mode.id == mode_id)
    {
        Ok(())
    } else {
        Err(AgentError::ModeUnavailable {
            mode_id: mode_id.to_string(),
            available: runtime
                .available_modes
                .iter()
                .map(|mode| mode.id.clone())
                .collect(),
        })
    }
}

fn derive_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or("").trim();
    let title: String = first_line.chars().take(64).collect();
    if title.is_empty() {
        "Untitled agent".to_string()
    } else {
        title
    }
}

fn plan_entry_to_todo(entry: PlanEntry) -> TodoItem {
    let completed = entry.status.as_deref() == Some("completed");
    TodoItem {
        text: entry.content,
        completed,
    }
}

fn slice_lines(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_string();
    }
    let start = line.map(|l| l.saturating_sub(1) as usize).unwrap_or(0);
    let selected: Vec<&str> = match limit {
        Some(limit) => content.lines().skip(start).take(limit as usize).collect(),
        None => content.lines().skip(start).collect(),
    };
    selected.join("\n")
}
