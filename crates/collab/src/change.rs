/// Edit operations exchanged between collaborators
/// Changes are immutable once created and appended to a bounded log
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{ChangeId, UserId};

/// Number of recent changes kept for conflict scanning. Older entries are
/// the audit subsystem's concern, not this core's.
pub const CHANGE_LOG_CAP: usize = 100;

/// A (line, column) coordinate in a file buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Kinds of edits a collaborator can submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Insert,
    Delete,
    Replace,
    Format,
    Move,
    CursorMove,
    SelectionChange,
}

impl ChangeType {
    /// Whether this kind of change splices the file buffer.
    /// Format/Move are logged only; cursor and selection moves are
    /// presence updates.
    pub fn mutates_buffer(&self) -> bool {
        matches!(self, Self::Insert | Self::Delete | Self::Replace)
    }
}

/// An edit submitted by a collaborator. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: ChangeId,
    pub user_id: UserId,
    pub file_path: String,

    #[serde(rename = "changeType")]
    pub kind: ChangeType,

    pub position: Position,

    pub content: String,

    #[serde(default)]
    pub old_content: String,

    /// Sender-supplied wall clock. Conflict windows and writer-wins
    /// strategies compare these directly; clock skew is a documented gap.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: chrono::DateTime<chrono::Utc>,

    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Change {
    pub fn new(
        user_id: UserId,
        file_path: impl Into<String>,
        kind: ChangeType,
        position: Position,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            user_id,
            file_path: file_path.into(),
            kind,
            position,
            content: content.into(),
            old_content: String::new(),
            timestamp: chrono::Utc::now(),
            version: 0,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_old_content(mut self, old_content: impl Into<String>) -> Self {
        self.old_content = old_content.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Per-session append-only change log, capped to the most recent
/// [`CHANGE_LOG_CAP`] entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeLog {
    entries: VecDeque<Change>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a change, dropping the oldest entry once the cap is reached.
    pub fn push(&mut self, change: Change) {
        if self.entries.len() == CHANGE_LOG_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(change);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&Change> {
        self.entries.back()
    }
}
