/// Collaboration sessions and the participant registry
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ChangeLog, CollabError, Conflict, EventBus, Position, ResolutionStrategy, Result, Role,
    Selection, SessionEvent, SessionId, User, UserId, UserStatus,
};

/// Per-session behavior knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub auto_resolve_conflicts: bool,
    pub resolution_strategy: ResolutionStrategy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_resolve_conflicts: true,
            resolution_strategy: ResolutionStrategy::LastWriterWins,
        }
    }
}

/// Shared editing context: participants, open files and history for one
/// collaborative group. Owned exclusively by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationSession {
    pub id: SessionId,
    pub name: String,
    pub description: String,
    pub owner_id: UserId,
    pub participants: HashMap<UserId, User>,
    pub files: HashMap<String, String>,
    pub changes: ChangeLog,
    pub conflicts: Vec<Conflict>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: chrono::DateTime<chrono::Utc>,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: chrono::DateTime<chrono::Utc>,

    pub settings: SessionSettings,
}

impl CollaborationSession {
    fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        owner: User,
        settings: SessionSettings,
    ) -> Self {
        let now = chrono::Utc::now();
        let owner_id = owner.id.clone();
        let mut participants = HashMap::new();
        participants.insert(owner_id.clone(), owner);

        Self {
            id: SessionId::new(),
            name: name.into(),
            description: description.into(),
            owner_id,
            participants,
            files: HashMap::new(),
            changes: ChangeLog::new(),
            conflicts: Vec::new(),
            created_at: now,
            last_activity: now,
            settings,
        }
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&User> {
        self.participants.get(user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now();
    }
}

/// Owns every session in the process and the user -> session mapping.
#[derive(Default)]
pub struct SessionRegistry {
    pub(crate) sessions: HashMap<SessionId, CollaborationSession>,
    pub(crate) user_sessions: HashMap<UserId, SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session. The owner is inserted with the full permission
    /// set regardless of the role it arrived with. The caller ensures the
    /// owner is not already in a session.
    pub fn create_session(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        owner: User,
        settings: SessionSettings,
        events: &EventBus,
    ) -> SessionId {
        let session_id = SessionId::new();
        self.insert_session(session_id, name, description, owner, settings, events);
        session_id
    }

    /// Create a session under a caller-chosen id. The transport uses this
    /// when the handshake names a session that does not exist yet.
    pub fn create_session_with_id(
        &mut self,
        session_id: SessionId,
        name: impl Into<String>,
        description: impl Into<String>,
        owner: User,
        settings: SessionSettings,
        events: &EventBus,
    ) -> Result<()> {
        if self.sessions.contains_key(&session_id) {
            return Err(CollabError::InvalidOp(format!(
                "session {} already exists",
                session_id.0
            )));
        }
        if let Some(existing) = self.user_sessions.get(&owner.id) {
            if self.sessions.contains_key(existing) {
                return Err(CollabError::InvalidOp(format!(
                    "user {} already in session {}",
                    owner.id, existing.0
                )));
            }
        }

        self.insert_session(session_id, name, description, owner, settings, events);
        Ok(())
    }

    fn insert_session(
        &mut self,
        session_id: SessionId,
        name: impl Into<String>,
        description: impl Into<String>,
        mut owner: User,
        settings: SessionSettings,
        events: &EventBus,
    ) {
        owner.role = Role::Owner;
        owner.permissions = Role::Owner.default_permissions();
        let owner_id = owner.id.clone();

        let mut session = CollaborationSession::new(name, description, owner, settings);
        session.id = session_id;

        self.user_sessions.insert(owner_id, session_id);
        self.sessions.insert(session_id, session);

        info!(session = %session_id.0, "created session");
        events.publish(SessionEvent::SessionCreated { session_id });
    }

    /// Add a user to an existing session. Fails when the session is
    /// unknown or the user is already present.
    pub fn join_session(
        &mut self,
        session_id: SessionId,
        user: User,
        events: &EventBus,
    ) -> Result<()> {
        // One session per user. A live mapping to another session blocks
        // the join; a mapping left behind by a removed session does not.
        if let Some(existing) = self.user_sessions.get(&user.id) {
            if *existing != session_id && self.sessions.contains_key(existing) {
                return Err(CollabError::InvalidOp(format!(
                    "user {} already in session {}",
                    user.id, existing.0
                )));
            }
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;

        if session.participants.contains_key(&user.id) {
            return Err(CollabError::InvalidOp(format!(
                "user {} already in session",
                user.id
            )));
        }

        self.user_sessions.insert(user.id.clone(), session_id);
        session.participants.insert(user.id.clone(), user.clone());
        session.touch();

        info!(session = %session_id.0, user = %user.id, "user joined");
        events.publish(SessionEvent::UserJoined {
            session_id,
            user,
        });
        Ok(())
    }

    /// Remove a user from its session. The session itself is dropped once
    /// its participant map empties. Returns false when the user is in no
    /// session.
    pub fn leave_session(&mut self, user_id: &UserId, events: &EventBus) -> bool {
        let Some(session_id) = self.user_sessions.remove(user_id) else {
            return false;
        };
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };

        if session.participants.remove(user_id).is_none() {
            return false;
        }
        session.touch();

        info!(session = %session_id.0, user = %user_id, "user left");
        events.publish(SessionEvent::UserLeft {
            session_id,
            user_id: user_id.clone(),
        });

        if session.is_empty() {
            self.sessions.remove(&session_id);
            info!(session = %session_id.0, "session empty, removed");
        }
        true
    }

    pub fn get_session(&self, session_id: SessionId) -> Option<&CollaborationSession> {
        self.sessions.get(&session_id)
    }

    pub fn get_session_mut(&mut self, session_id: SessionId) -> Option<&mut CollaborationSession> {
        self.sessions.get_mut(&session_id)
    }

    /// Session currently holding this user, if any.
    pub fn user_session(&self, user_id: &UserId) -> Option<SessionId> {
        self.user_sessions.get(user_id).copied()
    }

    /// All sessions in which the user participates.
    pub fn get_user_sessions(&self, user_id: &UserId) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.participants.contains_key(user_id))
            .map(|s| s.id)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a file buffer in the session. Requires write permission.
    pub fn open_file(
        &mut self,
        session_id: SessionId,
        user_id: &UserId,
        file_path: impl Into<String>,
        content: impl Into<String>,
        events: &EventBus,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;
        let user = session
            .participants
            .get(user_id)
            .ok_or_else(|| CollabError::UserNotFound(user_id.0.clone()))?;
        if !user.can_write() {
            return Err(CollabError::PermissionDenied(user_id.0.clone()));
        }

        let file_path = file_path.into();
        session.files.insert(file_path.clone(), content.into());
        session.touch();
        events.publish(SessionEvent::FileOpened {
            session_id,
            file_path,
        });
        Ok(())
    }

    /// Drop a file buffer from the session. Requires write permission.
    pub fn close_file(
        &mut self,
        session_id: SessionId,
        user_id: &UserId,
        file_path: &str,
        events: &EventBus,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;
        let user = session
            .participants
            .get(user_id)
            .ok_or_else(|| CollabError::UserNotFound(user_id.0.clone()))?;
        if !user.can_write() {
            return Err(CollabError::PermissionDenied(user_id.0.clone()));
        }

        if session.files.remove(file_path).is_none() {
            return Err(CollabError::FileNotFound(file_path.to_string()));
        }
        session.touch();
        events.publish(SessionEvent::FileClosed {
            session_id,
            file_path: file_path.to_string(),
        });
        Ok(())
    }

    /// Replace the session settings. Requires admin.
    pub fn update_settings(
        &mut self,
        session_id: SessionId,
        user_id: &UserId,
        settings: SessionSettings,
    ) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;
        let user = session
            .participants
            .get(user_id)
            .ok_or_else(|| CollabError::UserNotFound(user_id.0.clone()))?;
        if !user.is_admin() {
            return Err(CollabError::PermissionDenied(user_id.0.clone()));
        }

        session.settings = settings;
        session.touch();
        info!(session = %session_id.0, user = %user_id, "settings updated");
        Ok(())
    }

    /// Presence: move a user's cursor and refresh activity.
    pub fn update_cursor(&mut self, session_id: SessionId, user_id: &UserId, cursor: Position) {
        if let Some(user) = self.participant_mut(session_id, user_id) {
            user.cursor = Some(cursor);
            user.touch();
        }
    }

    /// Presence: change a user's selection and refresh activity.
    pub fn update_selection(
        &mut self,
        session_id: SessionId,
        user_id: &UserId,
        selection: Selection,
    ) {
        if let Some(user) = self.participant_mut(session_id, user_id) {
            user.selection = Some(selection);
            user.touch();
        }
    }

    /// Presence: explicit status update (active/idle/away).
    pub fn update_status(&mut self, session_id: SessionId, user_id: &UserId, status: UserStatus) {
        if let Some(user) = self.participant_mut(session_id, user_id) {
            user.status = status;
            user.last_seen = chrono::Utc::now();
        }
    }

    /// Refresh a user's activity clock without changing anything else.
    pub fn touch_user(&mut self, session_id: SessionId, user_id: &UserId) {
        if let Some(user) = self.participant_mut(session_id, user_id) {
            user.touch();
        }
    }

    /// Sweep helper: drop participants idle beyond the threshold and mark
    /// the not-yet-expired ones idle. Returns the users that were removed.
    pub fn expire_idle_participants(
        &mut self,
        idle_after: chrono::Duration,
        events: &EventBus,
    ) -> Vec<UserId> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut() {
            for user in session.participants.values_mut() {
                if user.idle_longer_than(idle_after) {
                    expired.push(user.id.clone());
                } else if user.status == UserStatus::Active
                    && user.idle_longer_than(idle_after / 2)
                {
                    user.status = UserStatus::Idle;
                }
            }
        }
        for user_id in &expired {
            self.leave_session(user_id, events);
        }
        expired
    }

    fn participant_mut(&mut self, session_id: SessionId, user_id: &UserId) -> Option<&mut User> {
        self.sessions
            .get_mut(&session_id)?
            .participants
            .get_mut(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (EventBus, tokio::sync::mpsc::Receiver<SessionEvent>) {
        EventBus::channel(64)
    }

    fn owner() -> User {
        User::new(UserId::new("u1"), "Alice", Role::Owner)
    }

    #[test]
    fn test_create_session_grants_owner_full_permissions() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();

        // A downgraded role is overridden on creation
        let user = User::new(UserId::new("u1"), "Alice", Role::Viewer);
        let session_id = registry.create_session("s", "", user, SessionSettings::default(), &events);

        let session = registry.get_session(session_id).unwrap();
        assert_eq!(session.participants.len(), 1);
        let stored = session.participant(&UserId::new("u1")).unwrap();
        assert_eq!(stored.role, Role::Owner);
        assert!(stored.can_read() && stored.can_write() && stored.is_admin());
        assert_eq!(session.owner_id, UserId::new("u1"));
        assert_eq!(registry.user_session(&UserId::new("u1")), Some(session_id));
        assert_eq!(registry.get_user_sessions(&UserId::new("u1")), vec![session_id]);
    }

    #[test]
    fn test_join_second_session_rejected() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let first = registry.create_session("a", "", owner(), SessionSettings::default(), &events);
        let second = registry.create_session(
            "b",
            "",
            User::new(UserId::new("u9"), "Niko", Role::Owner),
            SessionSettings::default(),
            &events,
        );

        let bob = User::new(UserId::new("u2"), "Bob", Role::Developer);
        registry.join_session(first, bob.clone(), &events).unwrap();
        assert!(matches!(
            registry.join_session(second, bob.clone(), &events),
            Err(CollabError::InvalidOp(_))
        ));

        // Creating a session under a fresh id is blocked the same way
        assert!(registry
            .create_session_with_id(
                SessionId::new(),
                "c",
                "",
                bob.clone(),
                SessionSettings::default(),
                &events,
            )
            .is_err());

        // Leaving the first session frees the user to join the second
        assert!(registry.leave_session(&UserId::new("u2"), &events));
        registry.join_session(second, bob, &events).unwrap();
        assert_eq!(registry.user_session(&UserId::new("u2")), Some(second));
        assert!(registry
            .get_session(first)
            .unwrap()
            .participants
            .contains_key(&UserId::new("u1")));
    }

    #[test]
    fn test_update_settings_requires_admin() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let session_id =
            registry.create_session("s", "", owner(), SessionSettings::default(), &events);
        let bob = User::new(UserId::new("u2"), "Bob", Role::Developer);
        registry.join_session(session_id, bob, &events).unwrap();

        let settings = SessionSettings {
            auto_resolve_conflicts: false,
            resolution_strategy: ResolutionStrategy::Merge,
        };
        let result = registry.update_settings(session_id, &UserId::new("u2"), settings);
        assert!(matches!(result, Err(CollabError::PermissionDenied(_))));

        registry
            .update_settings(session_id, &UserId::new("u1"), settings)
            .unwrap();
        let session = registry.get_session(session_id).unwrap();
        assert!(!session.settings.auto_resolve_conflicts);
    }

    #[test]
    fn test_join_unknown_session_fails() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();

        let user = User::new(UserId::new("u2"), "Bob", Role::Developer);
        let result = registry.join_session(SessionId::new(), user, &events);
        assert!(matches!(result, Err(CollabError::SessionNotFound(_))));
    }

    #[test]
    fn test_join_twice_fails() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let session_id =
            registry.create_session("s", "", owner(), SessionSettings::default(), &events);

        let bob = User::new(UserId::new("u2"), "Bob", Role::Developer);
        registry
            .join_session(session_id, bob.clone(), &events)
            .unwrap();
        assert!(registry.join_session(session_id, bob, &events).is_err());
    }

    #[test]
    fn test_leave_removes_empty_session() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let session_id =
            registry.create_session("s", "", owner(), SessionSettings::default(), &events);

        assert!(registry.leave_session(&UserId::new("u1"), &events));
        assert!(registry.get_session(session_id).is_none());
        assert_eq!(registry.session_count(), 0);

        // Leaving again is a no-op
        assert!(!registry.leave_session(&UserId::new("u1"), &events));
    }

    #[test]
    fn test_open_file_requires_write() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let session_id =
            registry.create_session("s", "", owner(), SessionSettings::default(), &events);

        let viewer = User::new(UserId::new("u3"), "Eve", Role::Viewer);
        registry.join_session(session_id, viewer, &events).unwrap();

        let result = registry.open_file(session_id, &UserId::new("u3"), "main.rs", "", &events);
        assert!(matches!(result, Err(CollabError::PermissionDenied(_))));

        registry
            .open_file(session_id, &UserId::new("u1"), "main.rs", "fn main() {}", &events)
            .unwrap();
        assert!(registry
            .get_session(session_id)
            .unwrap()
            .files
            .contains_key("main.rs"));
    }

    #[test]
    fn test_expire_idle_participants() {
        let (events, _rx) = bus();
        let mut registry = SessionRegistry::new();
        let session_id =
            registry.create_session("s", "", owner(), SessionSettings::default(), &events);

        let mut bob = User::new(UserId::new("u2"), "Bob", Role::Developer);
        bob.last_seen = chrono::Utc::now() - chrono::Duration::minutes(45);
        registry.join_session(session_id, bob, &events).unwrap();

        let expired = registry.expire_idle_participants(chrono::Duration::minutes(30), &events);
        assert_eq!(expired, vec![UserId::new("u2")]);

        let session = registry.get_session(session_id).unwrap();
        assert!(!session.participants.contains_key(&UserId::new("u2")));
        assert!(session.participants.contains_key(&UserId::new("u1")));
    }
}
