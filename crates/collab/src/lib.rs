/// Real-time collaborative editing core
/// Sessions, change application, conflict detection and resolution
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod change;
pub use change::*;

mod presence;
pub use presence::*;

mod session;
pub use session::*;

mod engine;
pub use engine::*;

mod conflict;
pub use conflict::*;

mod transform;
pub use transform::*;

mod protocol;
pub use protocol::*;

mod events;
pub use events::*;

mod analytics;
pub use analytics::*;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file not open in session: {0}")]
    FileNotFound(String),

    #[error("edit could not be applied: {0}")]
    EditFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("external service failure: {0}")]
    ExternalService(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// User identifier. Wraps a string rather than a UUID: user ids arrive
/// from the outside world, and resolver output is authored by the
/// reserved principals `system` and `ai_assistant`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Author of automatically resolved changes.
    pub fn system() -> Self {
        Self("system".to_string())
    }

    /// Author of AI-assisted resolutions.
    pub fn ai_assistant() -> Self {
        Self("ai_assistant".to_string())
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session identifier for a collaborative editing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique change identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeId(pub uuid::Uuid);

impl ChangeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique conflict identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-level connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}
