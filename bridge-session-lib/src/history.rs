//! Persistence bridge
//!
//! Append-only notification logging behind a small store trait. The durable
//! store itself is an external collaborator; this module only guarantees the
//! read/append contract: replaying a loaded log reproduces the identical
//! ordered notification sequence that was emitted live.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::SessionNotification;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// One appended notification with its per-log sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonically increasing within one log, assigned at append time.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub notification: SessionNotification,
}

/// Durable append/read contract.
pub trait HistoryStore: Send + Sync {
    fn append(&self, log_ref: &str, record: &LogRecord) -> Result<(), BridgeError>;

    /// Load all records for a log in append order. An unknown log loads as
    /// empty, not as an error.
    fn load(&self, log_ref: &str) -> Result<Vec<LogRecord>, BridgeError>;
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryHistoryStore {
    logs: Mutex<HashMap<String, Vec<LogRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, log_ref: &str, record: &LogRecord) -> Result<(), BridgeError> {
        self.logs
            .lock()
            .unwrap()
            .entry(log_ref.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load(&self, log_ref: &str) -> Result<Vec<LogRecord>, BridgeError> {
        Ok(self
            .logs
            .lock()
            .unwrap()
            .get(log_ref)
            .cloned()
            .unwrap_or_default())
    }
}

/// JSONL-file-backed store: one file per log, one record per line.
pub struct FileHistoryStore {
    root: PathBuf,
}

impl FileHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| BridgeError::Storage(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root })
    }

    /// Default location under the platform config directory.
    pub fn default_root() -> Result<PathBuf, BridgeError> {
        let dirs = directories::ProjectDirs::from("com", "acp-bridge", "acp-bridge")
            .ok_or_else(|| BridgeError::Storage("cannot determine config directory".to_string()))?;
        Ok(dirs.config_dir().join("history"))
    }

    fn log_path(&self, log_ref: &str) -> PathBuf {
        // Session ids are opaque client strings; keep the filename safe.
        let safe: String = log_ref
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{}.jsonl", safe))
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, log_ref: &str, record: &LogRecord) -> Result<(), BridgeError> {
        let path = self.log_path(log_ref);
        let line = serde_json::to_string(record)?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BridgeError::Storage(format!("open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| BridgeError::Storage(format!("append {}: {}", path.display(), e)))?;
        Ok(())
    }

    fn load(&self, log_ref: &str) -> Result<Vec<LogRecord>, BridgeError> {
        let path = self.log_path(log_ref);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| BridgeError::Storage(format!("read {}: {}", path.display(), e)))?;

        let mut records = Vec::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn final line is expected after a crash mid-append;
                    // anything before it is still replayable.
                    warn!(
                        "Skipping corrupt record {} in {}: {}",
                        n + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(records)
    }
}

struct RegisteredLog {
    log_ref: String,
    next_seq: u64,
}

/// Routes per-session appends into the configured store.
///
/// Sessions opt in via [`register`](Self::register); appends for
/// unregistered sessions are silently skipped so ephemeral sessions cost
/// nothing.
pub struct PersistenceBridge {
    store: std::sync::Arc<dyn HistoryStore>,
    sessions: Mutex<HashMap<String, RegisteredLog>>,
}

impl PersistenceBridge {
    pub fn new(store: std::sync::Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Opt a session into durable logging. `log_ref` defaults to the session
    /// id; registering an existing log continues its sequence instead of
    /// restarting it, so resumed sessions keep appending where they left off.
    pub fn register(&self, session_id: &str, log_ref: Option<String>) -> Result<(), BridgeError> {
        let log_ref = log_ref.unwrap_or_else(|| session_id.to_string());
        let next_seq = self
            .store
            .load(&log_ref)?
            .last()
            .map(|r| r.seq + 1)
            .unwrap_or(0);

        debug!(
            "Registered session {} -> log {} (next_seq={})",
            session_id, log_ref, next_seq
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), RegisteredLog { log_ref, next_seq });
        Ok(())
    }

    pub fn is_registered(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    /// Append one notification. Returns the assigned sequence number, or
    /// `None` when the session is not registered.
    pub fn append(
        &self,
        session_id: &str,
        notification: &SessionNotification,
    ) -> Result<Option<u64>, BridgeError> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(log) = sessions.get_mut(session_id) else {
            return Ok(None);
        };

        let record = LogRecord {
            seq: log.next_seq,
            timestamp: Utc::now(),
            notification: notification.clone(),
        };
        self.store.append(&log.log_ref, &record)?;
        log.next_seq += 1;
        Ok(Some(record.seq))
    }

    /// Load a log's notifications in their original emission order.
    pub fn load_history(&self, log_ref: &str) -> Result<Vec<SessionNotification>, BridgeError> {
        let mut records = self.store.load(log_ref)?;
        records.sort_by_key(|r| r.seq);

        for pair in records.windows(2) {
            if pair[1].seq != pair[0].seq + 1 {
                warn!(
                    "History log {} has a sequence gap: {} -> {}",
                    log_ref, pair[0].seq, pair[1].seq
                );
            }
        }

        Ok(records.into_iter().map(|r| r.notification).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ContentBlock, SessionUpdate};
    use std::sync::Arc;

    fn note(session: &str, text: &str) -> SessionNotification {
        SessionNotification {
            session_id: session.to_string(),
            update: SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(text),
            },
        }
    }

    #[test]
    fn append_assigns_monotonic_seqs() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryHistoryStore::new()));
        bridge.register("s-1", None).unwrap();

        assert_eq!(bridge.append("s-1", &note("s-1", "a")).unwrap(), Some(0));
        assert_eq!(bridge.append("s-1", &note("s-1", "b")).unwrap(), Some(1));
        assert_eq!(bridge.append("s-1", &note("s-1", "c")).unwrap(), Some(2));
    }

    #[test]
    fn unregistered_session_is_skipped() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryHistoryStore::new()));
        assert_eq!(bridge.append("ghost", &note("ghost", "x")).unwrap(), None);
    }

    #[test]
    fn load_reproduces_emission_order() {
        let bridge = PersistenceBridge::new(Arc::new(MemoryHistoryStore::new()));
        bridge.register("s-1", None).unwrap();

        let notes: Vec<_> = (0..5).map(|i| note("s-1", &format!("chunk {}", i))).collect();
        for n in &notes {
            bridge.append("s-1", n).unwrap();
        }

        let loaded = bridge.load_history("s-1").unwrap();
        assert_eq!(loaded, notes);
    }

    #[test]
    fn reregistration_continues_sequence() {
        let store = Arc::new(MemoryHistoryStore::new());

        let bridge = PersistenceBridge::new(store.clone());
        bridge.register("s-1", None).unwrap();
        bridge.append("s-1", &note("s-1", "before restart")).unwrap();

        // A fresh bridge over the same store, as after a process restart.
        let bridge = PersistenceBridge::new(store);
        bridge.register("s-1", None).unwrap();
        assert_eq!(
            bridge.append("s-1", &note("s-1", "after restart")).unwrap(),
            Some(1)
        );
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path()).unwrap();

        let records: Vec<_> = (0..3)
            .map(|seq| LogRecord {
                seq,
                timestamp: Utc::now(),
                notification: note("s-1", &format!("n{}", seq)),
            })
            .collect();
        for r in &records {
            store.append("s-1", r).unwrap();
        }

        let loaded = store.load("s-1").unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].seq, 2);
        assert_eq!(loaded[2].notification, records[2].notification);
    }

    #[test]
    fn file_store_skips_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path()).unwrap();

        store
            .append(
                "s-1",
                &LogRecord {
                    seq: 0,
                    timestamp: Utc::now(),
                    notification: note("s-1", "good"),
                },
            )
            .unwrap();

        // Simulate a crash mid-append.
        let path = dir.path().join("s-1.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(b"{\"seq\":1,\"notification\":{\"sess").unwrap();

        let loaded = store.load("s-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].seq, 0);
    }

    #[test]
    fn file_store_unknown_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path()).unwrap();
        assert!(store.load("never-seen").unwrap().is_empty());
    }
}
