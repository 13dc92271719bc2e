//! Persisted agent records.
//!
//! Agents survive process restarts through a small external store: a stub
//! record is written on creation, the session handle is filled in once the
//! peer reports one, and the record is removed when the agent is killed. The
//! bundled [`JsonAgentStore`] keeps a single `agents.json` index with atomic
//! tmp-then-rename writes; [`MemoryAgentStore`] backs tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const INDEX_FILE: &str = "agents.json";

/// Provider selection plus an optional persisted session handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOptions {
    pub provider: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AgentOptions {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            session_id: None,
        }
    }
}

/// One persisted agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub options: AgentOptions,
    pub created_at: DateTime<Utc>,
    pub cwd: String,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// External store of agent records.
pub trait AgentStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<AgentRecord>, StoreError>;

    fn load(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.load_all()?.into_iter().find(|r| r.id == id))
    }

    fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError>;

    fn remove(&self, id: &str) -> Result<(), StoreError>;
}

/// Index of all persisted agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AgentIndex {
    agents: Vec<AgentRecord>,
}

/// JSON-file store keeping one `agents.json` index under a data directory.
pub struct JsonAgentStore {
    dir: PathBuf,
}

impl JsonAgentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn load_index(&self) -> Result<AgentIndex, StoreError> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(AgentIndex::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save_index(&self, index: &AgentIndex) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.dir.join(INDEX_FILE);
        let temp_path = self.dir.join(format!("{}.tmp", INDEX_FILE));

        let json = serde_json::to_string_pretty(index)?;
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl AgentStore for JsonAgentStore {
    fn load_all(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.load_index()?.agents)
    }

    fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError> {
        let mut index = self.load_index()?;
        index.agents.retain(|r| r.id != record.id);
        index.agents.push(record.clone());
        self.save_index(&index)
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        let mut index = self.load_index()?;
        index.agents.retain(|r| r.id != id);
        self.save_index(&index)
    }
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryAgentStore {
    records: std::sync::Mutex<HashMap<String, AgentRecord>>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentStore for MemoryAgentStore {
    fn load_all(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let mut records: Vec<AgentRecord> =
            self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn upsert(&self, record: &AgentRecord) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(id: &str) -> AgentRecord {
        AgentRecord {
            id: id.to_string(),
            title: "Fix the flaky test".to_string(),
            session_id: Some("sess-9".to_string()),
            options: AgentOptions {
                provider: "claude".to_string(),
                session_id: Some("sess-9".to_string()),
            },
            created_at: Utc::now(),
            cwd: "/home/user/project".to_string(),
        }
    }

    mod json_store {
        use super::*;

        #[test]
        fn load_from_empty_dir_returns_no_records() {
            let dir = tempdir().unwrap();
            let store = JsonAgentStore::new(dir.path());
            assert!(store.load_all().unwrap().is_empty());
        }

        #[test]
        fn upsert_then_load_round_trips() {
            let dir = tempdir().unwrap();
            let store = JsonAgentStore::new(dir.path());

            store.upsert(&record("agent-1")).unwrap();
            let loaded = store.load("agent-1").unwrap().unwrap();

            assert_eq!(loaded.options.provider, "claude");
            assert_eq!(loaded.session_id.as_deref(), Some("sess-9"));
        }

        #[test]
        fn upsert_replaces_existing_record() {
            let dir = tempdir().unwrap();
            let store = JsonAgentStore::new(dir.path());

            store.upsert(&record("agent-1")).unwrap();
            let mut updated = record("agent-1");
            updated.title = "Renamed".to_string();
            store.upsert(&updated).unwrap();

            let all = store.load_all().unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].title, "Renamed");
        }

        #[test]
        fn remove_deletes_record() {
            let dir = tempdir().unwrap();
            let store = JsonAgentStore::new(dir.path());

            store.upsert(&record("agent-1")).unwrap();
            store.upsert(&record("agent-2")).unwrap();
            store.remove("agent-1").unwrap();

            let all = store.load_all().unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].id, "agent-2");
        }

        #[test]
        fn record_serializes_with_camel_case_keys() {
            let json = serde_json::to_value(record("agent-1")).unwrap();
            assert!(json.get("createdAt").is_some());
            assert!(json.get("sessionId").is_some());
            assert!(json["options"].get("sessionId").is_some());
        }
    }

    mod memory_store {
        use super::*;

        #[test]
        fn upsert_and_remove() {
            let store = MemoryAgentStore::new();
            store.upsert(&record("agent-1")).unwrap();
            assert!(store.load("agent-1").unwrap().is_some());

            store.remove("agent-1").unwrap();
            assert!(store.load("agent-1").unwrap().is_none());
        }
    }
}
