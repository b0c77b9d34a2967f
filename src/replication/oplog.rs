//! Operation Log
//!
//! Ordered, term-tagged log of client operations. The primary appends to
//! it; secondaries receive entries in strict position order and apply them
//! idempotently.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::topology::Term;

/// Position of an entry in the log; 1-based, 0 means "nothing"
pub type LogPosition = u64;

/// A client operation on a document collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert a document (canonical JSON)
    Insert { collection: String, document: String },
    /// Update documents matching `filter` with `update` (both JSON)
    Update {
        collection: String,
        filter: String,
        update: String,
    },
    /// Delete documents matching `filter` (JSON)
    Delete { collection: String, filter: String },
    /// No-op marker, written by a new primary at the start of its term
    Noop { message: String },
}

impl Operation {
    /// Collection touched by the operation
    pub fn collection(&self) -> Option<&str> {
        match self {
            Operation::Insert { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. } => Some(collection),
            Operation::Noop { .. } => None,
        }
    }

    /// Operation type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Noop { .. } => "noop",
        }
    }
}

/// A log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEntry {
    /// Position in the log
    pub position: LogPosition,
    /// Term of the primary that wrote it
    pub term: Term,
    /// When the primary accepted it
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// The operation
    pub operation: Operation,
}

/// Result of offering a replicated entry to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Entry appended at the end of the log
    Appended,
    /// Entry was already present, nothing changed
    Duplicate,
    /// A conflicting suffix from an older term was discarded first
    Replaced { truncated: usize },
}

/// In-memory operation log
#[derive(Debug, Default)]
pub struct OpLog {
    entries: Vec<OpEntry>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of the last entry (0 when empty)
    pub fn last_position(&self) -> LogPosition {
        self.entries.last().map(|e| e.position).unwrap_or(0)
    }

    /// Term of the last entry (0 when empty)
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a new operation as the primary
    pub fn append(&mut self, term: Term, operation: Operation) -> LogPosition {
        let position = self.last_position() + 1;
        self.entries.push(OpEntry {
            position,
            term,
            timestamp: chrono::Utc::now(),
            operation,
        });
        position
    }

    /// Get the entry at `position`
    pub fn get(&self, position: LogPosition) -> Option<&OpEntry> {
        if position == 0 {
            return None;
        }
        self.entries.get((position - 1) as usize)
    }

    /// Term of the entry at `position`; position 0 has term 0
    pub fn term_at(&self, position: LogPosition) -> Option<Term> {
        if position == 0 {
            return Some(0);
        }
        self.get(position).map(|e| e.term)
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: LogPosition, max: usize) -> Vec<OpEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].iter().take(max).cloned().collect()
    }

    /// Whether the log holds `position` written in `term`
    pub fn matches(&self, position: LogPosition, term: Term) -> bool {
        self.term_at(position) == Some(term)
    }

    /// Accept an entry shipped by the primary.
    ///
    /// Entries must arrive in position order. An entry already present with
    /// the same term is skipped; one present with a different term replaces
    /// the local suffix from that position on.
    pub fn append_replicated(&mut self, entry: OpEntry) -> Result<AppendOutcome> {
        let last = self.last_position();

        if entry.position == 0 || entry.position > last + 1 {
            return Err(Error::LogGap {
                expected: last + 1,
                received: entry.position,
            });
        }

        if entry.position == last + 1 {
            self.entries.push(entry);
            return Ok(AppendOutcome::Appended);
        }

        if self.matches(entry.position, entry.term) {
            return Ok(AppendOutcome::Duplicate);
        }

        let truncated = self.truncate_from(entry.position);
        self.entries.push(entry);
        Ok(AppendOutcome::Replaced { truncated })
    }

    /// Drop every entry at or after `position`; returns how many were dropped
    pub fn truncate_from(&mut self, position: LogPosition) -> usize {
        let keep = position.max(1) as usize - 1;
        if keep >= self.entries.len() {
            return 0;
        }
        let dropped = self.entries.len() - keep;
        self.entries.truncate(keep);
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(n: u32) -> Operation {
        Operation::Insert {
            collection: "users".into(),
            document: format!(r#"{{"_id":{}}}"#, n),
        }
    }

    fn entry(position: LogPosition, term: Term) -> OpEntry {
        OpEntry {
            position,
            term,
            timestamp: chrono::Utc::now(),
            operation: insert(position as u32),
        }
    }

    #[test]
    fn test_append_and_read() {
        let mut log = OpLog::new();
        assert_eq!(log.last_position(), 0);
        assert_eq!(log.term_at(0), Some(0));

        assert_eq!(log.append(1, insert(1)), 1);
        assert_eq!(log.append(1, insert(2)), 2);
        assert_eq!(log.append(2, insert(3)), 3);

        assert_eq!(log.last_position(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.get(2).unwrap().term, 1);
        assert!(log.get(4).is_none());

        let batch = log.entries_from(2, 10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].position, 2);
        assert!(log.entries_from(4, 10).is_empty());
        assert_eq!(log.entries_from(1, 1).len(), 1);
    }

    #[test]
    fn test_replicated_idempotent() {
        let mut log = OpLog::new();
        assert_eq!(log.append_replicated(entry(1, 1)).unwrap(), AppendOutcome::Appended);
        assert_eq!(log.append_replicated(entry(2, 1)).unwrap(), AppendOutcome::Appended);
        assert_eq!(log.append_replicated(entry(1, 1)).unwrap(), AppendOutcome::Duplicate);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_replicated_rejects_gap() {
        let mut log = OpLog::new();
        log.append_replicated(entry(1, 1)).unwrap();
        let err = log.append_replicated(entry(3, 1)).unwrap_err();
        assert!(matches!(err, Error::LogGap { expected: 2, received: 3 }));
    }

    #[test]
    fn test_replicated_replaces_old_term_suffix() {
        let mut log = OpLog::new();
        log.append_replicated(entry(1, 1)).unwrap();
        log.append_replicated(entry(2, 1)).unwrap();
        log.append_replicated(entry(3, 1)).unwrap();

        let outcome = log.append_replicated(entry(2, 2)).unwrap();
        assert_eq!(outcome, AppendOutcome::Replaced { truncated: 2 });
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.last_term(), 2);
    }

    #[test]
    fn test_operation_json_shape() {
        let json = serde_json::to_string(&insert(7)).unwrap();
        assert!(json.starts_with(r#"{"insert":"#));
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.collection(), Some("users"));
        assert_eq!(back.type_name(), "insert");
    }
}
