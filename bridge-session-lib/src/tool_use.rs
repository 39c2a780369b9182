//! Tool-use correlation cache
//!
//! Backends report tool execution in two halves: a tool-use event naming the
//! tool and its input, and a later tool-result event carrying only the tool
//! call id. The cache resolves the second half back to the first. Entries are
//! written before the corresponding `tool_call` notification is emitted, so a
//! fast-arriving result can never race past its declaration.

use std::collections::HashMap;

/// How the backend declared a tool use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolUseKind {
    ToolUse,
    ServerToolUse,
    McpToolUse,
}

/// One observed tool-use declaration.
#[derive(Debug, Clone)]
pub struct ToolUseEntry {
    pub kind: ToolUseKind,
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Session-scoped cache of observed tool uses, keyed by the backend-assigned
/// tool call id. Never shared across sessions.
#[derive(Debug, Default)]
pub struct ToolUseCache {
    entries: HashMap<String, ToolUseEntry>,
}

impl ToolUseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tool-use declaration. A duplicate id overwrites the previous
    /// entry; the backend reassigning an id mid-session is its own bug, and
    /// the newest declaration is the one results will refer to.
    pub fn insert(&mut self, entry: ToolUseEntry) {
        if let Some(previous) = self.entries.insert(entry.id.clone(), entry) {
            tracing::warn!("Tool use id {} redeclared by backend", previous.id);
        }
    }

    /// Look up the declaration for a result. Entries are consulted, not
    /// consumed: a backend may stream several updates for one tool call.
    pub fn get(&self, id: &str) -> Option<&ToolUseEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all entries, e.g. when a cancelled turn's residue is discarded.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, name: &str) -> ToolUseEntry {
        ToolUseEntry {
            kind: ToolUseKind::ToolUse,
            id: id.to_string(),
            name: name.to_string(),
            input: serde_json::json!({}),
        }
    }

    #[test]
    fn insert_then_get() {
        let mut cache = ToolUseCache::new();
        cache.insert(entry("t1", "Bash"));

        let found = cache.get("t1").expect("entry should exist");
        assert_eq!(found.name, "Bash");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_is_not_consuming() {
        let mut cache = ToolUseCache::new();
        cache.insert(entry("t1", "Read"));

        assert!(cache.get("t1").is_some());
        assert!(cache.get("t1").is_some());
    }

    #[test]
    fn unknown_id_is_none() {
        let cache = ToolUseCache::new();
        assert!(cache.get("nope").is_none());
        assert!(!cache.contains("nope"));
    }

    #[test]
    fn redeclared_id_uses_newest() {
        let mut cache = ToolUseCache::new();
        cache.insert(entry("t1", "Bash"));
        cache.insert(entry("t1", "Read"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("t1").unwrap().name, "Read");
    }
}
