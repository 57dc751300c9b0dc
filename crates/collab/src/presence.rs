/// Participants and presence tracking
/// Shows who is in a session, what they may do and where they are working
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{Position, UserId};

/// Role of a participant within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Maintainer,
    Developer,
    Reviewer,
    Viewer,
    Guest,
}

impl Role {
    /// Permission set granted when a user enters a session with this role.
    pub fn default_permissions(&self) -> HashSet<String> {
        let perms: &[&str] = match self {
            Role::Owner | Role::Maintainer => &["read", "write", "admin"],
            Role::Developer => &["read", "write"],
            Role::Reviewer | Role::Viewer | Role::Guest => &["read"],
        };
        perms.iter().map(|p| p.to_string()).collect()
    }
}

/// Presence status of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Idle,
    Away,
}

/// A selected region of a file buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: Position,
    pub end: Position,
}

/// A participant of a collaboration session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,

    #[serde(default)]
    pub contact: String,

    pub role: Role,
    pub permissions: HashSet<String>,

    #[serde(default)]
    pub cursor: Option<Position>,

    #[serde(default)]
    pub selection: Option<Selection>,

    pub status: UserStatus,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

impl User {
    pub fn new(id: UserId, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            contact: String::new(),
            role,
            permissions: role.default_permissions(),
            cursor: None,
            selection: None,
            status: UserStatus::Active,
            last_seen: chrono::Utc::now(),
        }
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = contact.into();
        self
    }

    pub fn can_read(&self) -> bool {
        self.permissions.contains("read")
    }

    pub fn can_write(&self) -> bool {
        self.permissions.contains("write")
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains("admin")
    }

    /// Refresh activity and flip an idle user back to active.
    pub fn touch(&mut self) {
        self.last_seen = chrono::Utc::now();
        if self.status == UserStatus::Idle {
            self.status = UserStatus::Active;
        }
    }

    /// Whether the user has been inactive longer than `threshold`.
    pub fn idle_longer_than(&self, threshold: chrono::Duration) -> bool {
        chrono::Utc::now() - self.last_seen > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_permissions() {
        assert!(Role::Owner.default_permissions().contains("admin"));
        assert!(Role::Developer.default_permissions().contains("write"));
        assert!(!Role::Developer.default_permissions().contains("admin"));
        assert!(!Role::Viewer.default_permissions().contains("write"));
    }

    #[test]
    fn test_touch_reactivates_idle_user() {
        let mut user = User::new(UserId::new("bob"), "Bob", Role::Developer);
        user.status = UserStatus::Idle;
        user.touch();
        assert_eq!(user.status, UserStatus::Active);
    }

    #[test]
    fn test_idle_detection() {
        let mut user = User::new(UserId::new("bob"), "Bob", Role::Developer);
        assert!(!user.idle_longer_than(chrono::Duration::minutes(30)));

        user.last_seen = chrono::Utc::now() - chrono::Duration::minutes(45);
        assert!(user.idle_longer_than(chrono::Duration::minutes(30)));
    }
}
