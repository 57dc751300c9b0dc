/// Domain events drained by the transport layer
/// A bounded channel replaces ambient handler lists: publishing never
/// blocks the loop, and ordering is preserved per session.
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{Change, Conflict, ConflictId, SessionId, User, UserId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionCreated {
        session_id: SessionId,
    },
    UserJoined {
        session_id: SessionId,
        user: User,
    },
    UserLeft {
        session_id: SessionId,
        user_id: UserId,
    },
    ChangeApplied {
        session_id: SessionId,
        change: Change,
    },
    ConflictDetected {
        session_id: SessionId,
        conflict: Conflict,
    },
    ConflictResolved {
        session_id: SessionId,
        conflict_id: ConflictId,
        resolution: Change,
    },
    FileOpened {
        session_id: SessionId,
        file_path: String,
    },
    FileClosed {
        session_id: SessionId,
        file_path: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::SessionCreated { session_id }
            | SessionEvent::UserJoined { session_id, .. }
            | SessionEvent::UserLeft { session_id, .. }
            | SessionEvent::ChangeApplied { session_id, .. }
            | SessionEvent::ConflictDetected { session_id, .. }
            | SessionEvent::ConflictResolved { session_id, .. }
            | SessionEvent::FileOpened { session_id, .. }
            | SessionEvent::FileClosed { session_id, .. } => *session_id,
        }
    }
}

/// Bounded publisher handle for domain events.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus and the receiver the transport layer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Publish without blocking. A full (or closed) channel drops the
    /// event with a warning; fan-out is best-effort.
    pub fn publish(&self, event: SessionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("dropping session event: {e}");
        }
    }
}

/// External audit subsystem, consumed as a log-event sink.
pub trait AuditSink: Send + Sync {
    fn log_event(&self, event: &SessionEvent);
}

/// Default sink: structured log lines under the `audit` target.
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn log_event(&self, event: &SessionEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!(target: "audit", session = %event.session_id().0, "{json}"),
            Err(e) => warn!(target: "audit", "unserializable event: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_drain() {
        let (bus, mut rx) = EventBus::channel(8);
        let session_id = SessionId::new();

        bus.publish(SessionEvent::SessionCreated { session_id });
        bus.publish(SessionEvent::FileOpened {
            session_id,
            file_path: "main.rs".to_string(),
        });

        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::SessionCreated { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(SessionEvent::FileOpened { .. })
        ));
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let (bus, mut rx) = EventBus::channel(1);
        let session_id = SessionId::new();

        bus.publish(SessionEvent::SessionCreated { session_id });
        // Second publish overflows the bounded channel and is dropped
        bus.publish(SessionEvent::SessionCreated { session_id });

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
