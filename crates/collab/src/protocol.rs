/// Wire protocol: envelopes and payloads exchanged over the socket
/// One JSON object per message; header fields are camelCase, type tags
/// snake_case, timestamps epoch milliseconds.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{CollabError, MessageId, Position, Result, Selection, SessionId, UserId, UserStatus};

/// Closed set of wire message types. Adding one is a compile-time-checked
/// change: every dispatcher matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    UserJoined,
    UserLeft,
    ChangeApplied,
    CursorUpdated,
    SelectionUpdated,
    ConflictDetected,
    ConflictResolved,
    FileOpened,
    FileClosed,
    TypingStarted,
    TypingStopped,
    PresenceUpdate,
    SessionCreated,
    SessionUpdated,
    Error,
    // Liveness frames share the envelope shape
    Ping,
    Pong,
}

/// The only unit exchanged over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: MessageId,

    #[serde(rename = "type")]
    pub kind: MessageType,

    pub session_id: SessionId,
    pub user_id: UserId,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: chrono::DateTime<chrono::Utc>,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(
        kind: MessageType,
        session_id: SessionId,
        user_id: UserId,
        data: serde_json::Value,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            kind,
            session_id,
            user_id,
            timestamp: chrono::Utc::now(),
            data,
        }
    }

    /// Error envelope addressed to one connection.
    pub fn error(session_id: SessionId, user_id: UserId, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            session_id,
            user_id,
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Decode the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| CollabError::MalformedEnvelope(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CollabError::MalformedEnvelope(e.to_string()))
    }
}

/// First client frame: a bare credentials object, not an envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,

    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub file_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub file_path: String,
    pub position: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPayload {
    pub file_path: String,
    pub selection: Selection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub file_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub status: UserStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Change, ChangeType};

    #[test]
    fn test_envelope_wire_shape() {
        let session_id = SessionId::new();
        let change = Change::new(
            UserId::new("alice"),
            "main.rs",
            ChangeType::Insert,
            Position::new(0, 0),
            "x",
        );
        let envelope = Envelope::new(
            MessageType::ChangeApplied,
            session_id,
            UserId::new("alice"),
            serde_json::to_value(&change).unwrap(),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "change_applied");
        assert_eq!(value["userId"], "alice");
        assert!(value["messageId"].is_string());
        assert!(value["sessionId"].is_string());
        assert!(value["timestamp"].is_i64());
        assert_eq!(value["data"]["changeType"], "insert");
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope::new(
            MessageType::Ping,
            SessionId::new(),
            UserId::new("alice"),
            serde_json::Value::Null,
        );
        let json = envelope.to_json().unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageType::Ping);
        assert_eq!(back.message_id, envelope.message_id);
    }

    #[test]
    fn test_auth_request_parsing() {
        let session_id = SessionId::new();
        let json = format!(
            r#"{{"userId":"alice","sessionId":"{}","token":"secret","displayName":"Alice"}}"#,
            session_id.0
        );
        let auth: AuthRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(auth.user_id, UserId::new("alice"));
        assert_eq!(auth.session_id, session_id);
        assert_eq!(auth.token, "secret");

        // Missing fields are an authentication failure at the transport
        let bad: std::result::Result<AuthRequest, _> =
            serde_json::from_str(r#"{"userId":"alice"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let envelope = Envelope::new(
            MessageType::CursorUpdated,
            SessionId::new(),
            UserId::new("alice"),
            serde_json::json!({ "nonsense": true }),
        );
        assert!(envelope.decode::<CursorPayload>().is_err());
    }
}
