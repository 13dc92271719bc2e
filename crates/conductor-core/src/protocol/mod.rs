//! Peer protocol: JSON-RPC 2.0 over the agent subprocess's stdio.
//!
//! `types` defines the wire payloads, `client` drives the connection, and
//! `host` holds the trait seams toward the orchestrator. Business concepts
//! (agent ids, lifecycle state) stay out of this layer; the host callbacks
//! carry them.

pub mod client;
pub mod host;
pub mod types;

pub use client::ProtocolClient;
pub use host::{AgentConnection, AgentHost};
