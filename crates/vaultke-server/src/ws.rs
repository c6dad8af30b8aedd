//! WebSocket endpoint: one reader and one writer task per connection.
//!
//! The reader parses client frames and talks to the hub and the archive;
//! the writer drains the connection's bounded send channel onto the
//! socket. Closing the send channel (eviction, shutdown) or the socket
//! (client gone) terminates both.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vaultke_crypto::CryptoError;
use vaultke_shared::constants::META_SECURITY_LEVEL;
use vaultke_shared::{ClientFrame, MessageKind, RoomType, SecurityLevel, SendMessage, ServerFrame};
use vaultke_store::{Database, NewMessage};

use crate::api::{self, AppState};
use crate::auth;
use crate::error::ServerError;
use crate::hub::ConnId;

#[derive(Deserialize)]
pub(crate) struct WsParams {
    token: String,
}

/// Upgrade handler. Browser WebSocket clients cannot set headers, so the
/// bearer token rides a query parameter and is verified before upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let user_id = auth::verify_token(&state.config.auth_secret, &params.token)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel(state.config.send_queue_capacity);

    let conn_id = state.hub.register(&user_id, frame_tx.clone()).await;
    info!(conn = conn_id, user = %user_id, "Connection opened");

    // The greeting rides the same queue as every other frame, so it is
    // always delivered first.
    let _ = frame_tx
        .send(ServerFrame::Connected {
            user_id: user_id.clone(),
        })
        .await;

    let mut writer = tokio::spawn(write_frames(frame_rx, ws_tx));

    let reader_finished = tokio::select! {
        // Writer exits first only when the send channel was closed by
        // eviction or shutdown.
        _ = &mut writer => false,
        _ = read_frames(&state, conn_id, &user_id, &mut ws_rx, &frame_tx) => true,
    };

    state.hub.unregister(conn_id).await;
    drop(frame_tx);
    if reader_finished {
        let _ = writer.await;
    }

    info!(conn = conn_id, user = %user_id, "Connection closed");
}

async fn write_frames(
    mut frame_rx: mpsc::Receiver<ServerFrame>,
    mut ws_tx: SplitSink<WebSocket, Message>,
) {
    while let Some(frame) = frame_rx.recv().await {
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if ws_tx.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn read_frames(
    state: &AppState,
    conn_id: ConnId,
    user_id: &str,
    ws_rx: &mut SplitStream<WebSocket>,
    frame_tx: &mpsc::Sender<ServerFrame>,
) {
    let mut malformed = 0u32;

    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => {
                    if let Err(err) = handle_frame(state, conn_id, user_id, frame, frame_tx).await {
                        if err.kind() == "INVALID_ENVELOPE" {
                            malformed += 1;
                        }
                        let _ = frame_tx
                            .send(ServerFrame::Error {
                                message: format!("{}: {err}", err.kind()),
                            })
                            .await;
                        if malformed >= state.config.malformed_frame_limit {
                            warn!(conn = conn_id, "Too many invalid frames, closing");
                            break;
                        }
                    }
                }
                Err(err) => {
                    malformed += 1;
                    let _ = frame_tx
                        .send(ServerFrame::Error {
                            message: format!("INVALID_ENVELOPE: {err}"),
                        })
                        .await;
                    if malformed >= state.config.malformed_frame_limit {
                        warn!(conn = conn_id, "Too many malformed frames, closing");
                        break;
                    }
                }
            },
            Message::Binary(_) => {
                malformed += 1;
                if malformed >= state.config.malformed_frame_limit {
                    break;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

async fn handle_frame(
    state: &AppState,
    conn_id: ConnId,
    user_id: &str,
    frame: ClientFrame,
    frame_tx: &mpsc::Sender<ServerFrame>,
) -> Result<(), ServerError> {
    match frame {
        ClientFrame::Ping => {
            let _ = frame_tx.send(ServerFrame::Pong).await;
        }
        ClientFrame::JoinRoom { room_id } => {
            {
                let db = state.db.lock().await;
                api::require_member(&db, &room_id, user_id)?;
            }
            state.hub.join_room(conn_id, &room_id).await;
            debug!(conn = conn_id, room = %room_id, "Joined room");
        }
        ClientFrame::LeaveRoom { room_id } => {
            state.hub.leave_room(conn_id, &room_id).await;
        }
        ClientFrame::SendMessage { data } => {
            if !state.submit_limiter.check(user_id.to_string()).await {
                return Err(ServerError::RateLimited);
            }
            let (room_id, message) = submit_message(state, user_id, data).await?;
            state
                .hub
                .broadcast(
                    &room_id,
                    ServerFrame::NewMessage {
                        room_id: room_id.clone(),
                        data: message,
                    },
                )
                .await;
        }
    }
    Ok(())
}

/// Validate, encrypt if needed, and archive one submission. Returns the
/// room and the stored record for fan-out.
///
/// Plaintext submissions are encrypted according to the room type:
/// pairwise for private rooms, room key otherwise. System notices with no
/// explicit security level are archived verbatim. Pre-built envelopes must
/// be keyed for the room they are submitted to; they are relayed opaquely.
pub(crate) async fn submit_message(
    state: &AppState,
    sender_id: &str,
    data: SendMessage,
) -> Result<(String, Value), ServerError> {
    let mut db = state.db.lock().await;

    if !db.is_active_member(&data.room_id, sender_id)? {
        return Err(ServerError::Forbidden);
    }

    let new_message = if let Some(envelope) = data.envelope {
        envelope.validate().map_err(CryptoError::from)?;
        if envelope.sender_id != sender_id {
            return Err(ServerError::Forbidden);
        }
        if envelope.security_level == SecurityLevel::GroupEncrypted
            && envelope.session_id != data.room_id
        {
            return Err(ServerError::Invalid(
                "group envelope is keyed to a different room".into(),
            ));
        }
        if envelope.security_level == SecurityLevel::MilitaryGrade {
            let room = db.get_room(&data.room_id)?;
            if room.room_type == RoomType::Private
                && envelope.recipient_id != private_counterpart(&db, &room.id, sender_id)?
            {
                return Err(ServerError::Invalid(
                    "pairwise envelope is not addressed to the other member".into(),
                ));
            }
        }
        NewMessage {
            room_id: data.room_id.clone(),
            sender_id: sender_id.to_string(),
            kind: data.kind,
            content: envelope.to_json().map_err(CryptoError::from)?,
            metadata: Some(metadata_with_level(data.metadata, envelope.security_level)),
            file_url: data.file_url,
            reply_to_id: data.reply_to_id,
        }
    } else if let Some(content) = data.content {
        if data.kind == MessageKind::System && data.security_level.is_none() {
            NewMessage {
                room_id: data.room_id.clone(),
                sender_id: sender_id.to_string(),
                kind: data.kind,
                content,
                metadata: data.metadata.map(Value::Object),
                file_url: data.file_url,
                reply_to_id: data.reply_to_id,
            }
        } else {
            let room = db.get_room(&data.room_id)?;
            let (envelope, level) = if room.room_type == RoomType::Private {
                let recipient = private_counterpart(&db, &room.id, sender_id)?;
                let envelope = state.service.encrypt_direct(
                    &mut db,
                    sender_id,
                    &recipient,
                    &content,
                    data.metadata,
                )?;
                (envelope, SecurityLevel::MilitaryGrade)
            } else {
                let envelope =
                    state
                        .service
                        .encrypt_group(sender_id, &room.id, &content, data.metadata)?;
                (envelope, SecurityLevel::GroupEncrypted)
            };

            if let Some(requested) = data.security_level {
                if requested != level {
                    return Err(ServerError::Invalid(
                        "security level does not match the room type".into(),
                    ));
                }
            }

            NewMessage {
                room_id: data.room_id.clone(),
                sender_id: sender_id.to_string(),
                kind: data.kind,
                content: envelope.to_json().map_err(CryptoError::from)?,
                metadata: Some(metadata_with_level(None, level)),
                file_url: data.file_url,
                reply_to_id: data.reply_to_id,
            }
        }
    } else {
        return Err(ServerError::Invalid(
            "send_message requires content or an envelope".into(),
        ));
    };

    let stored = db.append_message(&new_message)?;
    Ok((stored.room_id.clone(), api::message_json(&stored)))
}

fn private_counterpart(db: &Database, room_id: &str, sender_id: &str) -> Result<String, ServerError> {
    let members = db.room_members(room_id)?;
    members
        .into_iter()
        .find(|m| m.user_id != sender_id)
        .map(|m| m.user_id)
        .ok_or_else(|| ServerError::Internal("private room has no counterpart member".into()))
}

fn metadata_with_level(metadata: Option<Map<String, Value>>, level: SecurityLevel) -> Value {
    let mut map = metadata.unwrap_or_default();
    map.insert(
        META_SECURITY_LEVEL.to_string(),
        Value::String(level.as_str().to_string()),
    );
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    use vaultke_shared::Envelope;

    use crate::config::ServerConfig;
    use crate::hub::Hub;
    use crate::service::tests::{open_db, register};

    async fn test_state() -> (tempfile::TempDir, AppState) {
        let (dir, db) = open_db();
        let (hub, _handle) = Hub::spawn();
        (dir, AppState::new(ServerConfig::default(), db, hub))
    }

    fn stored_envelope(message: &Value) -> Envelope {
        serde_json::from_str(message["content"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_private_room_submissions_use_the_pairwise_cipher() {
        let (_dir, state) = test_state().await;
        {
            let mut db = state.db.lock().await;
            register(&mut db, "alice", 5);
            register(&mut db, "bob", 5);
            db.create_private_room("alice", "bob").unwrap();
        }
        let room_id = {
            let db = state.db.lock().await;
            db.rooms_for_user("alice").unwrap()[0].room.id.clone()
        };

        let (_, message) = submit_message(
            &state,
            "alice",
            SendMessage::text(room_id, "tukutane kesho saa tatu"),
        )
        .await
        .unwrap();

        let envelope = stored_envelope(&message);
        assert_eq!(envelope.security_level, SecurityLevel::MilitaryGrade);
        assert_eq!(envelope.recipient_id, "bob");
        assert_eq!(message["needsDecryption"], serde_json::json!(true));

        let mut db = state.db.lock().await;
        let decrypted = state.service.decrypt_direct(&mut db, &envelope).unwrap();
        assert_eq!(decrypted.content, "tukutane kesho saa tatu");
    }

    #[tokio::test]
    async fn test_group_room_submissions_use_the_room_key() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Chama, Some("chama-7"), &[
                "bob".to_string(),
            ])
            .unwrap()
        };

        let (room_id, message) =
            submit_message(&state, "alice", SendMessage::text(room.id.clone(), "tumeanza"))
                .await
                .unwrap();
        assert_eq!(room_id, room.id);

        let envelope = stored_envelope(&message);
        assert_eq!(envelope.security_level, SecurityLevel::GroupEncrypted);
        assert_eq!(envelope.session_id, room.id);

        let decrypted = state.service.decrypt_group(&envelope).unwrap();
        assert_eq!(decrypted.content, "tumeanza");
    }

    #[tokio::test]
    async fn test_prebuilt_envelopes_are_relayed_opaquely() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Group, None, &["bob".to_string()])
                .unwrap()
        };

        let envelope = state
            .service
            .encrypt_group("alice", &room.id, "ripoti ya fedha", None)
            .unwrap();

        let mut data = SendMessage::text(room.id.clone(), "");
        data.content = None;
        data.envelope = Some(envelope.clone());
        let (_, message) = submit_message(&state, "alice", data).await.unwrap();

        assert_eq!(stored_envelope(&message), envelope);
    }

    #[tokio::test]
    async fn test_submissions_are_member_gated() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Group, None, &[])
                .unwrap()
        };

        let err = submit_message(&state, "charlie", SendMessage::text(room.id, "nipo hapa"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_envelope_sender_must_match_the_connection() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Group, None, &["bob".to_string()])
                .unwrap()
        };

        let envelope = state
            .service
            .encrypt_group("mallory", &room.id, "spoofed", None)
            .unwrap();
        let mut data = SendMessage::text(room.id, "");
        data.content = None;
        data.envelope = Some(envelope);

        let err = submit_message(&state, "alice", data).await.unwrap_err();
        assert_eq!(err.kind(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_pairwise_envelope_must_target_the_counterpart() {
        let (_dir, state) = test_state().await;
        {
            let mut db = state.db.lock().await;
            register(&mut db, "alice", 5);
            register(&mut db, "bob", 5);
            register(&mut db, "carol", 5);
            db.create_private_room("alice", "bob").unwrap();
        }
        let room_id = {
            let db = state.db.lock().await;
            db.rooms_for_user("alice").unwrap()[0].room.id.clone()
        };

        // An envelope for a third party never enters the pair's archive.
        let envelope = {
            let mut db = state.db.lock().await;
            state
                .service
                .encrypt_direct(&mut db, "alice", "carol", "siri ya carol", None)
                .unwrap()
        };
        let mut data = SendMessage::text(room_id.clone(), "");
        data.content = None;
        data.envelope = Some(envelope);
        let err = submit_message(&state, "alice", data).await.unwrap_err();
        assert_eq!(err.kind(), "INVALID_ENVELOPE");

        // One addressed to the counterpart is relayed as submitted.
        let envelope = {
            let mut db = state.db.lock().await;
            state
                .service
                .encrypt_direct(&mut db, "alice", "bob", "siri ya bob", None)
                .unwrap()
        };
        let mut data = SendMessage::text(room_id, "");
        data.content = None;
        data.envelope = Some(envelope.clone());
        let (_, message) = submit_message(&state, "alice", data).await.unwrap();
        assert_eq!(stored_envelope(&message), envelope);
    }

    #[tokio::test]
    async fn test_group_envelope_must_target_its_room() {
        let (_dir, state) = test_state().await;
        let (room_a, room_b) = {
            let mut db = state.db.lock().await;
            let a = db
                .create_group_room("alice", "Chama A", RoomType::Chama, None, &[])
                .unwrap();
            let b = db
                .create_group_room("alice", "Chama B", RoomType::Chama, None, &[])
                .unwrap();
            (a, b)
        };

        let envelope = state
            .service
            .encrypt_group("alice", &room_b.id, "wrong room", None)
            .unwrap();
        let mut data = SendMessage::text(room_a.id, "");
        data.content = None;
        data.envelope = Some(envelope);

        let err = submit_message(&state, "alice", data).await.unwrap_err();
        assert_eq!(err.kind(), "INVALID_ENVELOPE");
    }

    #[tokio::test]
    async fn test_empty_submission_is_invalid() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Group, None, &[])
                .unwrap()
        };

        let mut data = SendMessage::text(room.id, "");
        data.content = None;
        let err = submit_message(&state, "alice", data).await.unwrap_err();
        assert_eq!(err.kind(), "INVALID_ENVELOPE");
    }

    #[tokio::test]
    async fn test_system_notices_are_archived_verbatim() {
        let (_dir, state) = test_state().await;
        let room = {
            let mut db = state.db.lock().await;
            db.create_group_room("alice", "Harambee", RoomType::Group, None, &[])
                .unwrap()
        };

        let mut data = SendMessage::text(room.id, "bob joined the chama");
        data.kind = MessageKind::System;
        let (_, message) = submit_message(&state, "alice", data).await.unwrap();

        assert_eq!(message["content"], serde_json::json!("bob joined the chama"));
        assert_eq!(message["needsDecryption"], serde_json::json!(false));
    }
}
