/// Connection registry and fan-out
/// Three maps under one lock: connection -> handle, session -> connections,
/// user -> connections. Every mutation keeps them consistent.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use collab::{
    AiReviewer, AuditSink, AuthRequest, Change, CollabError, ConflictDetector, ConflictResolver,
    ConnectionId, Envelope, EventBus, MessageType, Position, Role, Selection, SessionAnalytics,
    SessionEvent, SessionId, SessionRegistry, SessionSettings, User, UserId, UserStatus,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::config::ServerConfig;

pub type Tx = mpsc::UnboundedSender<Message>;

/// One live socket. The sender half feeds the connection's writer task.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub connected_at: DateTime<Utc>,

    /// Last successful ping send; liveness is tracked on send, a pong
    /// only shows up in debug logs.
    pub last_ping: DateTime<Utc>,

    pub tx: Tx,
}

#[derive(Default)]
struct HubState {
    registry: SessionRegistry,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    session_connections: HashMap<SessionId, HashSet<ConnectionId>>,
    user_connections: HashMap<UserId, HashSet<ConnectionId>>,
}

impl HubState {
    fn register(&mut self, user_id: UserId, session_id: SessionId, tx: Tx) -> ConnectionId {
        let id = ConnectionId::new();
        let now = Utc::now();
        self.connections.insert(
            id,
            ConnectionHandle {
                id,
                user_id: user_id.clone(),
                session_id,
                connected_at: now,
                last_ping: now,
                tx,
            },
        );
        self.session_connections.entry(session_id).or_default().insert(id);
        self.user_connections.entry(user_id).or_default().insert(id);
        id
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub total_connections: usize,
    pub active_sessions: usize,
    pub connected_users: usize,
    pub uptime: u64,
}

pub struct CollaborationHub {
    state: RwLock<HubState>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    events: EventBus,
    authenticator: Arc<dyn Authenticator>,
    audit: Arc<dyn AuditSink>,
    pub config: ServerConfig,
    started_at: Instant,
}

impl CollaborationHub {
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        audit: Arc<dyn AuditSink>,
        ai: Option<Arc<dyn AiReviewer>>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = EventBus::channel(config.event_capacity);
        let mut resolver = ConflictResolver::new().with_ai_timeout(config.ai_timeout());
        if let Some(ai) = ai {
            resolver = resolver.with_ai(ai);
        }

        let hub = Arc::new(Self {
            state: RwLock::new(HubState::default()),
            detector: ConflictDetector::new(),
            resolver,
            events,
            authenticator,
            audit,
            config,
            started_at: Instant::now(),
        });
        (hub, rx)
    }

    pub async fn authenticate(&self, credentials: &AuthRequest) -> bool {
        self.authenticator.authenticate(credentials).await
    }

    /// Admit an authenticated user: get-or-create the named session, add
    /// the user as a participant and register the connection. Returns the
    /// connection id and the snapshot envelopes owed to the new socket.
    pub async fn attach(
        &self,
        credentials: &AuthRequest,
        tx: Tx,
    ) -> collab::Result<(ConnectionId, Vec<Envelope>)> {
        let session_id = credentials.session_id;
        let user_id = credentials.user_id.clone();
        let display_name = credentials
            .display_name
            .clone()
            .unwrap_or_else(|| user_id.0.clone());

        let mut state = self.state.write().await;
        let is_participant = state
            .registry
            .get_session(session_id)
            .map(|s| s.participant(&user_id).is_some());
        match is_participant {
            None => {
                // First participant owns a fresh session under this id
                let owner = User::new(user_id.clone(), display_name, Role::Owner);
                state.registry.create_session_with_id(
                    session_id,
                    format!("session-{}", &session_id.0.to_string()[..8]),
                    "",
                    owner,
                    SessionSettings::default(),
                    &self.events,
                )?;
            }
            Some(false) => {
                let user = User::new(user_id.clone(), display_name, Role::Developer);
                state.registry.join_session(session_id, user, &self.events)?;
            }
            Some(true) => {
                // Reconnect of a user already in the session
                state.registry.touch_user(session_id, &user_id);
            }
        }

        let connection_id = state.register(user_id.clone(), session_id, tx);

        let session = state
            .registry
            .get_session(session_id)
            .ok_or_else(|| CollabError::SessionNotFound(session_id.0.to_string()))?;
        let mut snapshot = vec![Envelope::new(
            MessageType::SessionCreated,
            session_id,
            user_id.clone(),
            serde_json::to_value(session)
                .map_err(|e| CollabError::MalformedEnvelope(e.to_string()))?,
        )];
        for (file_path, content) in &session.files {
            snapshot.push(Envelope::new(
                MessageType::FileOpened,
                session_id,
                user_id.clone(),
                json!({ "filePath": file_path, "content": content }),
            ));
        }

        info!(
            connection = %connection_id.0,
            user = %user_id,
            session = %session_id.0,
            "connection attached"
        );
        Ok((connection_id, snapshot))
    }

    /// Register a socket without touching session membership.
    pub async fn register_connection(
        &self,
        user_id: UserId,
        session_id: SessionId,
        tx: Tx,
    ) -> ConnectionId {
        self.state.write().await.register(user_id, session_id, tx)
    }

    /// Tear a connection down: drop it from all three maps and remove the
    /// user from its session. Idempotent; a second call is a no-op.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(handle) = state.connections.remove(&connection_id) else {
            return;
        };

        if let Some(set) = state.session_connections.get_mut(&handle.session_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                state.session_connections.remove(&handle.session_id);
            }
        }
        if let Some(set) = state.user_connections.get_mut(&handle.user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                state.user_connections.remove(&handle.user_id);
            }
        }

        // The user may hold other sockets; only the last one going away
        // removes them from the session.
        if !state.user_connections.contains_key(&handle.user_id) {
            state.registry.leave_session(&handle.user_id, &self.events);
        }
        info!(connection = %connection_id.0, user = %handle.user_id, "connection closed");
    }

    /// Fan a message out to every connection in the session, optionally
    /// skipping the originating connection.
    pub async fn broadcast_to_session(
        &self,
        session_id: SessionId,
        envelope: &Envelope,
        exclude: Option<ConnectionId>,
    ) {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("unserializable broadcast: {e}");
                return;
            }
        };

        let state = self.state.read().await;
        let Some(connections) = state.session_connections.get(&session_id) else {
            return;
        };
        for connection_id in connections {
            if Some(*connection_id) == exclude {
                continue;
            }
            if let Some(handle) = state.connections.get(connection_id) {
                if handle.tx.send(Message::Text(json.clone())).is_err() {
                    debug!(connection = %connection_id.0, "send to closed connection");
                }
            }
        }
    }

    /// Fan out to the session, skipping every connection of one user.
    async fn broadcast_except_user(
        &self,
        session_id: SessionId,
        envelope: &Envelope,
        exclude_user: &UserId,
    ) {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("unserializable broadcast: {e}");
                return;
            }
        };

        let state = self.state.read().await;
        let Some(connections) = state.session_connections.get(&session_id) else {
            return;
        };
        for connection_id in connections {
            if let Some(handle) = state.connections.get(connection_id) {
                if &handle.user_id == exclude_user {
                    continue;
                }
                if handle.tx.send(Message::Text(json.clone())).is_err() {
                    debug!(connection = %connection_id.0, "send to closed connection");
                }
            }
        }
    }

    /// Deliver a message to a single connection.
    pub async fn send_to(&self, connection_id: ConnectionId, envelope: &Envelope) {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("unserializable message: {e}");
                return;
            }
        };
        let state = self.state.read().await;
        if let Some(handle) = state.connections.get(&connection_id) {
            if handle.tx.send(Message::Text(json)).is_err() {
                debug!(connection = %connection_id.0, "send to closed connection");
            }
        }
    }

    /// Run a change through conflict detection, resolution and the edit
    /// engine. Returns the change that was actually recorded. Detection
    /// and commit each take the state lock briefly; the resolver (and
    /// with it any AI reviewer call) runs between the two with no lock
    /// held, so one conflicted edit cannot stall other sessions.
    pub async fn apply_change(&self, session_id: SessionId, change: Change) -> Option<Change> {
        let staged = {
            let state = self.state.read().await;
            state
                .registry
                .stage_change(session_id, change, &self.detector, &self.events)
        };
        let mut staged = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!(session = %session_id.0, "change rejected: {e}");
                return None;
            }
        };

        if staged.has_conflicts() {
            staged.resolve(&self.resolver).await;
        }

        let mut state = self.state.write().await;
        match state.registry.commit_change(session_id, staged, &self.events) {
            Ok(applied) => Some(applied),
            Err(e) => {
                warn!(session = %session_id.0, "change rejected: {e}");
                None
            }
        }
    }

    pub async fn open_file(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        file_path: &str,
        content: &str,
    ) -> collab::Result<()> {
        self.state
            .write()
            .await
            .registry
            .open_file(session_id, user_id, file_path, content, &self.events)
    }

    pub async fn close_file(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        file_path: &str,
    ) -> collab::Result<()> {
        self.state
            .write()
            .await
            .registry
            .close_file(session_id, user_id, file_path, &self.events)
    }

    pub async fn update_cursor(&self, session_id: SessionId, user_id: &UserId, cursor: Position) {
        self.state
            .write()
            .await
            .registry
            .update_cursor(session_id, user_id, cursor);
    }

    pub async fn update_selection(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        selection: Selection,
    ) {
        self.state
            .write()
            .await
            .registry
            .update_selection(session_id, user_id, selection);
    }

    pub async fn update_status(&self, session_id: SessionId, user_id: &UserId, status: UserStatus) {
        self.state
            .write()
            .await
            .registry
            .update_status(session_id, user_id, status);
    }

    pub async fn update_settings(
        &self,
        session_id: SessionId,
        user_id: &UserId,
        settings: SessionSettings,
    ) -> collab::Result<()> {
        self.state
            .write()
            .await
            .registry
            .update_settings(session_id, user_id, settings)
    }

    pub async fn touch_user(&self, session_id: SessionId, user_id: &UserId) {
        self.state.write().await.registry.touch_user(session_id, user_id);
    }

    pub async fn server_stats(&self) -> ServerStats {
        let state = self.state.read().await;
        ServerStats {
            total_connections: state.connections.len(),
            active_sessions: state.registry.session_count(),
            connected_users: state.user_connections.len(),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn session_analytics(&self, session_id: SessionId) -> Option<SessionAnalytics> {
        let state = self.state.read().await;
        state.registry.get_session(session_id).map(|s| s.analytics())
    }

    /// Periodic liveness probe. A successful send refreshes `last_ping`;
    /// a failed send means the writer task is gone and the connection is
    /// torn down.
    pub async fn ping_sweep(&self) {
        let mut dead = Vec::new();
        {
            let mut state = self.state.write().await;
            for handle in state.connections.values_mut() {
                let ping = Envelope::new(
                    MessageType::Ping,
                    handle.session_id,
                    handle.user_id.clone(),
                    json!({}),
                );
                let json = match ping.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("unserializable ping: {e}");
                        continue;
                    }
                };
                if handle.tx.send(Message::Text(json)).is_ok() {
                    handle.last_ping = Utc::now();
                } else {
                    dead.push(handle.id);
                }
            }
        }
        for connection_id in dead {
            self.disconnect(connection_id).await;
        }
    }

    /// Periodic garbage collection: connections whose pings stopped
    /// landing, then participants idle past the threshold. Empty sessions
    /// fall out of the registry as their last participant leaves.
    pub async fn cleanup_sweep(&self) {
        let threshold = self.config.dead_connection_after();
        let now = Utc::now();

        let dead: Vec<ConnectionId> = {
            let state = self.state.read().await;
            state
                .connections
                .values()
                .filter(|h| now - h.last_ping > threshold)
                .map(|h| h.id)
                .collect()
        };
        for connection_id in dead {
            debug!(connection = %connection_id.0, "reaping dead connection");
            self.disconnect(connection_id).await;
        }

        {
            let mut state = self.state.write().await;
            let expired = state
                .registry
                .expire_idle_participants(self.config.idle_participant_after(), &self.events);
            if !expired.is_empty() {
                info!(count = expired.len(), "expired idle participants");
            }
        }

        let stats = self.server_stats().await;
        info!(
            connections = stats.total_connections,
            sessions = stats.active_sessions,
            users = stats.connected_users,
            uptime = stats.uptime,
            "cleanup sweep done"
        );
    }

    /// Drain domain events: every event is audited, session-scoped ones
    /// are fanned out to the session.
    pub async fn run_event_drain(self: Arc<Self>, mut rx: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            self.audit.log_event(&event);
            self.fan_out(&event).await;
        }
    }

    async fn fan_out(&self, event: &SessionEvent) {
        let session_id = event.session_id();
        match event {
            // Audit only. Edits are re-broadcast by the message handler
            // with the sender excluded, session creation has no audience
            // yet.
            SessionEvent::SessionCreated { .. } | SessionEvent::ChangeApplied { .. } => {}

            SessionEvent::UserJoined { user, .. } => {
                let envelope = match serde_json::to_value(user) {
                    Ok(data) => {
                        Envelope::new(MessageType::UserJoined, session_id, user.id.clone(), data)
                    }
                    Err(e) => {
                        error!("unserializable user: {e}");
                        return;
                    }
                };
                self.broadcast_except_user(session_id, &envelope, &user.id).await;
            }

            SessionEvent::UserLeft { user_id, .. } => {
                let envelope = Envelope::new(
                    MessageType::UserLeft,
                    session_id,
                    user_id.clone(),
                    json!({ "userId": user_id }),
                );
                self.broadcast_except_user(session_id, &envelope, user_id).await;
            }

            SessionEvent::ConflictDetected { conflict, .. } => {
                let envelope = match serde_json::to_value(conflict) {
                    Ok(data) => Envelope::new(
                        MessageType::ConflictDetected,
                        session_id,
                        UserId::system(),
                        data,
                    ),
                    Err(e) => {
                        error!("unserializable conflict: {e}");
                        return;
                    }
                };
                self.broadcast_to_session(session_id, &envelope, None).await;
            }

            SessionEvent::ConflictResolved {
                conflict_id,
                resolution,
                ..
            } => {
                let envelope = Envelope::new(
                    MessageType::ConflictResolved,
                    session_id,
                    UserId::system(),
                    json!({ "conflictId": conflict_id, "resolution": resolution }),
                );
                self.broadcast_to_session(session_id, &envelope, None).await;
            }

            SessionEvent::FileOpened { file_path, .. } => {
                let content = {
                    let state = self.state.read().await;
                    state
                        .registry
                        .get_session(session_id)
                        .and_then(|s| s.files.get(file_path).cloned())
                };
                let Some(content) = content else { return };
                let envelope = Envelope::new(
                    MessageType::FileOpened,
                    session_id,
                    UserId::system(),
                    json!({ "filePath": file_path, "content": content }),
                );
                self.broadcast_to_session(session_id, &envelope, None).await;
            }

            SessionEvent::FileClosed { file_path, .. } => {
                let envelope = Envelope::new(
                    MessageType::FileClosed,
                    session_id,
                    UserId::system(),
                    json!({ "filePath": file_path }),
                );
                self.broadcast_to_session(session_id, &envelope, None).await;
            }
        }
    }
}
