/// Operator-facing session statistics
use std::collections::HashMap;

use serde::Serialize;

use crate::{CollaborationSession, UserStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnalytics {
    /// Changes in the tracked window (the log is bounded)
    pub total_changes: usize,
    pub active_users: usize,
    pub user_change_counts: HashMap<String, usize>,
    pub conflict_count: usize,
    pub resolved_conflict_count: usize,
    pub conflict_resolution_rate: f64,
    pub session_duration_secs: i64,
}

impl CollaborationSession {
    pub fn analytics(&self) -> SessionAnalytics {
        let mut user_change_counts: HashMap<String, usize> = HashMap::new();
        for change in self.changes.iter() {
            *user_change_counts
                .entry(change.user_id.0.clone())
                .or_default() += 1;
        }

        let conflict_count = self.conflicts.len();
        let resolved_conflict_count = self.conflicts.iter().filter(|c| c.resolved).count();
        let conflict_resolution_rate = if conflict_count == 0 {
            0.0
        } else {
            resolved_conflict_count as f64 / conflict_count as f64
        };

        SessionAnalytics {
            total_changes: self.changes.len(),
            active_users: self
                .participants
                .values()
                .filter(|u| u.status == UserStatus::Active)
                .count(),
            user_change_counts,
            conflict_count,
            resolved_conflict_count,
            conflict_resolution_rate,
            session_duration_secs: (chrono::Utc::now() - self.created_at).num_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        Change, ChangeType, EventBus, Position, Role, SessionRegistry, SessionSettings, User,
        UserId,
    };

    #[tokio::test]
    async fn test_analytics_counts() {
        let (events, _rx) = EventBus::channel(256);
        let mut registry = SessionRegistry::new();
        let owner = User::new(UserId::new("u1"), "Alice", Role::Owner);
        let session_id =
            registry.create_session("s", "", owner, SessionSettings::default(), &events);
        registry
            .open_file(session_id, &UserId::new("u1"), "main.rs", "abc", &events)
            .unwrap();

        let detector = crate::ConflictDetector::new();
        let resolver = crate::ConflictResolver::new();
        for i in 0..3 {
            let change = Change::new(
                UserId::new("u1"),
                "main.rs",
                ChangeType::Insert,
                Position::new(0, i),
                "x",
            );
            assert!(
                registry
                    .apply_change(session_id, change, &detector, &resolver, &events)
                    .await
            );
        }

        let analytics = registry.get_session(session_id).unwrap().analytics();
        assert_eq!(analytics.total_changes, 3);
        assert_eq!(analytics.active_users, 1);
        assert_eq!(analytics.user_change_counts["u1"], 3);
        assert_eq!(analytics.conflict_count, 0);
        assert_eq!(analytics.conflict_resolution_rate, 0.0);
    }
}
