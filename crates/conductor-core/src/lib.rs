//! # conductor-core
//!
//! Core logic for Conductor, an orchestrator for long-lived AI coding-agent
//! subprocesses. This crate is framework-agnostic and can sit behind any
//! transport (desktop IPC, WebSocket, REST):
//!
//! - **Orchestration**: spawn agents, run the peer protocol handshake, drive
//!   prompt turns, broker permission requests, persist and resume sessions,
//!   and tear agents down ([`manager::AgentManager`]).
//! - **Timeline reduction**: fold the resulting event stream into rendered,
//!   replayable UI state ([`timeline::Timeline`]).
//!
//! ## Key concepts
//!
//! - **Agent**: one supervised subprocess plus its protocol session
//! - **Turn**: one prompt-to-completion cycle; at most one is active per agent
//! - **Hydration**: rebuilding timeline state from a replayed event batch

pub mod bus;
pub mod enrich;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod permissions;
pub mod persistence;
pub mod protocol;
pub mod spawn;
pub mod timeline;

// Re-export commonly used types
pub use error::AgentError;
pub use events::{AgentEvent, AgentStatus, AgentUpdate, StopReason};
pub use manager::{
    AgentManager, AgentSnapshot, ManagerConfig, ProcessLauncher, PromptOutcome, SendPromptOptions,
};
pub use persistence::{AgentOptions, AgentRecord, AgentStore, JsonAgentStore};
pub use timeline::{StreamItem, Timeline};
