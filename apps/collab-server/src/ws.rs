/// Per-connection lifecycle: handshake, dispatch loop, teardown
use std::net::SocketAddr;
use std::sync::Arc;

use collab::{
    Change, CollabError, ConnectionId, CursorPayload, Envelope, FilePayload, MessageType,
    PresencePayload, SelectionPayload, SessionId, SessionSettings, TypingPayload, UserId,
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, warn};

use crate::hub::CollaborationHub;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closing,
    Closed,
}

fn advance(state: &mut ConnectionState, next: ConnectionState, addr: SocketAddr) {
    debug!(%addr, from = ?state, to = ?next, "connection state");
    *state = next;
}

pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<CollaborationHub>) {
    let mut state = ConnectionState::Connecting;

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%addr, "websocket handshake failed: {e}");
            return;
        }
    };
    advance(&mut state, ConnectionState::Authenticating, addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: the hub only ever touches the channel, never the socket
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    // The first frame must be a bare credentials object
    let credentials = match read_credentials(&mut ws_receiver).await {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!(%addr, "handshake rejected: {e}");
            reject(&tx, format!("handshake rejected: {e}"));
            advance(&mut state, ConnectionState::Closed, addr);
            return;
        }
    };

    if !hub.authenticate(&credentials).await {
        warn!(%addr, user = %credentials.user_id, "authentication failed");
        reject(&tx, "authentication failed");
        advance(&mut state, ConnectionState::Closed, addr);
        return;
    }

    let (connection_id, snapshot) = match hub.attach(&credentials, tx.clone()).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(%addr, user = %credentials.user_id, "attach failed: {e}");
            reject(&tx, format!("attach failed: {e}"));
            advance(&mut state, ConnectionState::Closed, addr);
            return;
        }
    };
    advance(&mut state, ConnectionState::Active, addr);

    // Session snapshot first, then one file_opened per open buffer
    for envelope in snapshot {
        match envelope.to_json() {
            Ok(json) => {
                let _ = tx.send(Message::Text(json));
            }
            Err(e) => error!("unserializable snapshot envelope: {e}"),
        }
    }

    let session_id = credentials.session_id;
    let user_id = credentials.user_id.clone();

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => {
                    if let Err(e) =
                        dispatch(&hub, connection_id, session_id, &user_id, envelope).await
                    {
                        warn!(user = %user_id, "message rejected: {e}");
                        hub.send_to(
                            connection_id,
                            &Envelope::error(session_id, user_id.clone(), e.to_string()),
                        )
                        .await;
                    }
                }
                // Malformed envelopes are logged; the connection survives
                Err(e) => warn!(user = %user_id, "malformed envelope: {e}"),
            },
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => {
                debug!(user = %user_id, "pong frame");
            }
            Ok(Message::Close(_)) => {
                advance(&mut state, ConnectionState::Closing, addr);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(user = %user_id, "socket error: {e}");
                advance(&mut state, ConnectionState::Closing, addr);
                break;
            }
        }
    }

    hub.disconnect(connection_id).await;
    advance(&mut state, ConnectionState::Closed, addr);
    writer.abort();
}

async fn read_credentials(
    receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
) -> collab::Result<collab::AuthRequest> {
    let Some(message) = receiver.next().await else {
        return Err(CollabError::AuthenticationFailed(
            "connection ended before handshake".to_string(),
        ));
    };
    let message =
        message.map_err(|e| CollabError::AuthenticationFailed(format!("socket error: {e}")))?;
    match message {
        Message::Text(text) => serde_json::from_str(&text)
            .map_err(|e| CollabError::AuthenticationFailed(format!("invalid credentials: {e}"))),
        Message::Close(_) => Err(CollabError::AuthenticationFailed(
            "closed before handshake".to_string(),
        )),
        _ => Err(CollabError::AuthenticationFailed(
            "non-text handshake frame".to_string(),
        )),
    }
}

/// Pre-attach failure: the peer has no session context yet.
fn reject(tx: &mpsc::UnboundedSender<Message>, message: impl Into<String>) {
    let envelope = Envelope::error(
        SessionId(uuid::Uuid::nil()),
        UserId::system(),
        message.into(),
    );
    if let Ok(json) = envelope.to_json() {
        let _ = tx.send(Message::Text(json));
    }
    let _ = tx.send(Message::Close(None));
}

async fn dispatch(
    hub: &CollaborationHub,
    connection_id: ConnectionId,
    session_id: SessionId,
    user_id: &UserId,
    envelope: Envelope,
) -> collab::Result<()> {
    match envelope.kind {
        MessageType::ChangeApplied => {
            let change: Change = envelope.decode()?;
            match hub.apply_change(session_id, change).await {
                Some(applied) => {
                    let data = serde_json::to_value(&applied)
                        .map_err(|e| CollabError::MalformedEnvelope(e.to_string()))?;
                    let out = Envelope::new(
                        MessageType::ChangeApplied,
                        session_id,
                        applied.user_id.clone(),
                        data,
                    );
                    hub.broadcast_to_session(session_id, &out, Some(connection_id))
                        .await;
                }
                None => {
                    hub.send_to(
                        connection_id,
                        &Envelope::error(session_id, user_id.clone(), "change rejected"),
                    )
                    .await;
                }
            }
        }

        MessageType::CursorUpdated => {
            let payload: CursorPayload = envelope.decode()?;
            hub.update_cursor(session_id, user_id, payload.position).await;
            hub.broadcast_to_session(session_id, &envelope, Some(connection_id))
                .await;
        }

        MessageType::SelectionUpdated => {
            let payload: SelectionPayload = envelope.decode()?;
            hub.update_selection(session_id, user_id, payload.selection)
                .await;
            hub.broadcast_to_session(session_id, &envelope, Some(connection_id))
                .await;
        }

        MessageType::TypingStarted | MessageType::TypingStopped => {
            let _payload: TypingPayload = envelope.decode()?;
            hub.touch_user(session_id, user_id).await;
            hub.broadcast_to_session(session_id, &envelope, Some(connection_id))
                .await;
        }

        MessageType::PresenceUpdate => {
            let payload: PresencePayload = envelope.decode()?;
            hub.update_status(session_id, user_id, payload.status).await;
            hub.broadcast_to_session(session_id, &envelope, Some(connection_id))
                .await;
        }

        MessageType::SessionUpdated => {
            let settings: SessionSettings = envelope.decode()?;
            hub.update_settings(session_id, user_id, settings).await?;
            hub.broadcast_to_session(session_id, &envelope, Some(connection_id))
                .await;
        }

        // Registry ops publish events; the drain task handles fan-out
        MessageType::FileOpened => {
            let payload: FilePayload = envelope.decode()?;
            hub.open_file(session_id, user_id, &payload.file_path, &payload.content)
                .await?;
        }
        MessageType::FileClosed => {
            let payload: FilePayload = envelope.decode()?;
            hub.close_file(session_id, user_id, &payload.file_path).await?;
        }

        MessageType::Ping => {
            hub.send_to(
                connection_id,
                &Envelope::new(MessageType::Pong, session_id, user_id.clone(), json!({})),
            )
            .await;
        }
        // Liveness is tracked on send success; a pong is informational
        MessageType::Pong => {
            debug!(user = %user_id, "pong envelope");
        }

        other => {
            warn!(kind = ?other, user = %user_id, "unexpected client message type");
        }
    }
    Ok(())
}
