//! Per-agent wire logging.
//!
//! Every agent process can get an append-only log of the raw protocol traffic
//! (`SEND`/`RECV`) and stderr chatter, one file per agent. Logging is opt-in:
//! with no log directory configured the handle is a no-op.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::Utc;

/// Thread-safe handle to an append-only log file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Open (or create) a log file at `{log_dir}/{agent_id}.log` and return a shared handle.
///
/// Returns an empty handle when `log_dir` is `None` or the file cannot be opened.
pub fn open_wire_log(log_dir: Option<&Path>, agent_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", agent_id)))
            .ok()
    });
    Arc::new(Mutex::new(file))
}

/// Write a timestamped line to the log file (if present).
pub fn log_line(handle: &LogHandle, channel: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            let _ = writeln!(file, "[{}] {}: {}", ts, channel, data);
            let _ = file.flush();
        }
    }
}

/// A handle that discards everything. Useful when no log directory is set.
pub fn null_log() -> LogHandle {
    Arc::new(Mutex::new(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn open_wire_log_creates_file() {
        let dir = tempdir().unwrap();
        let handle = open_wire_log(Some(dir.path()), "agent-1");
        assert!(handle.lock().unwrap().is_some());
        assert!(dir.path().join("agent-1.log").exists());
    }

    #[test]
    fn open_wire_log_none_dir() {
        let handle = open_wire_log(None, "agent-1");
        assert!(handle.lock().unwrap().is_none());
    }

    #[test]
    fn log_line_writes_timestamped_entry() {
        let dir = tempdir().unwrap();
        let handle = open_wire_log(Some(dir.path()), "agent-1");

        log_line(&handle, "SEND", r#"{"jsonrpc":"2.0"}"#);

        let mut contents = String::new();
        File::open(dir.path().join("agent-1.log"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();

        assert!(contents.contains(r#"SEND: {"jsonrpc":"2.0"}"#));
        assert!(contents.contains('Z'));
    }

    #[test]
    fn log_line_handles_empty_handle() {
        let handle = null_log();
        // Should not panic.
        log_line(&handle, "RECV", "data");
    }
}
