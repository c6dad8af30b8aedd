//! The message archive.
//!
//! Messages are append-only; edits rewrite content in place and deletes
//! are logical flags so that room history keeps its shape. Appending
//! also maintains the room's last-message preview, which must never
//! leak ciphertext-bearing content into the room list.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use vaultke_shared::constants::ENCRYPTED_PREVIEW;
use vaultke_shared::MessageKind;

use crate::database::{bad_column, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{metadata_security_level, NewMessage, StoredMessage};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, type, content, metadata, file_url, \
                               is_edited, is_deleted, reply_to_id, created_at, updated_at";

impl Database {
    /// Append a message and refresh the room preview. Encrypted messages
    /// get a fixed placeholder preview instead of their content.
    pub fn append_message(&mut self, msg: &NewMessage) -> Result<StoredMessage> {
        let now = Utc::now();
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            room_id: msg.room_id.clone(),
            sender_id: msg.sender_id.clone(),
            kind: msg.kind,
            content: msg.content.clone(),
            metadata: msg.metadata.clone(),
            file_url: msg.file_url.clone(),
            is_edited: false,
            is_deleted: false,
            reply_to_id: msg.reply_to_id.clone(),
            created_at: now,
            updated_at: now,
        };

        let preview = if metadata_security_level(msg.metadata.as_ref()).is_some() {
            ENCRYPTED_PREVIEW
        } else {
            msg.content.as_str()
        };

        let tx = self.conn_mut().transaction()?;

        let room_live: i64 = tx.query_row(
            "SELECT COUNT(*) FROM rooms WHERE id = ?1 AND is_active = 1",
            params![msg.room_id],
            |row| row.get(0),
        )?;
        if room_live == 0 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "INSERT INTO messages
             (id, room_id, sender_id, type, content, metadata, file_url,
              is_edited, is_deleted, reply_to_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?9, ?9)",
            params![
                stored.id,
                stored.room_id,
                stored.sender_id,
                stored.kind.as_str(),
                stored.content,
                stored.metadata.as_ref().map(|m| m.to_string()),
                stored.file_url,
                stored.reply_to_id,
                now.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE rooms SET last_message = ?2, last_message_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![stored.room_id, preview, now.to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(stored)
    }

    /// Room history, newest first. Deleted messages are filtered out.
    pub fn messages_for_room(
        &self,
        room_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        self.get_room(room_id)?;
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE room_id = ?1 AND is_deleted = 0
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let messages = stmt
            .query_map(params![room_id, limit, offset], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    pub fn get_message(&self, message_id: &str) -> Result<StoredMessage> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE id = ?1 AND is_deleted = 0"
                ),
                params![message_id],
                row_to_message,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// Rewrite a message's content. Only the original sender may edit.
    pub fn edit_message(
        &mut self,
        message_id: &str,
        editor: &str,
        new_content: &str,
    ) -> Result<StoredMessage> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let sender = live_sender(&tx, message_id)?;
        if sender != editor {
            return Err(StoreError::Forbidden);
        }
        tx.execute(
            "UPDATE messages SET content = ?2, is_edited = 1, updated_at = ?3
             WHERE id = ?1",
            params![message_id, new_content, now.to_rfc3339()],
        )?;

        tx.commit()?;
        self.get_message(message_id)
    }

    /// Flag a message as deleted. Only the original sender may delete.
    pub fn delete_message(&mut self, message_id: &str, actor: &str) -> Result<()> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let sender = live_sender(&tx, message_id)?;
        if sender != actor {
            return Err(StoreError::Forbidden);
        }
        tx.execute(
            "UPDATE messages SET is_deleted = 1, updated_at = ?2 WHERE id = ?1",
            params![message_id, now.to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Flag every message in a room as deleted and reset the preview.
    pub fn clear_room(&mut self, room_id: &str) -> Result<usize> {
        let now = Utc::now();
        let tx = self.conn_mut().transaction()?;

        let cleared = tx.execute(
            "UPDATE messages SET is_deleted = 1, updated_at = ?2
             WHERE room_id = ?1 AND is_deleted = 0",
            params![room_id, now.to_rfc3339()],
        )?;
        tx.execute(
            "UPDATE rooms SET last_message = NULL, last_message_at = NULL, updated_at = ?2
             WHERE id = ?1",
            params![room_id, now.to_rfc3339()],
        )?;

        tx.commit()?;
        tracing::info!(room = room_id, cleared, "cleared room history");
        Ok(cleared)
    }
}

fn live_sender(tx: &rusqlite::Transaction<'_>, message_id: &str) -> Result<String> {
    let row: Option<(String, bool)> = tx
        .query_row(
            "SELECT sender_id, is_deleted FROM messages WHERE id = ?1",
            params![message_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((sender, false)) => Ok(sender),
        _ => Err(StoreError::NotFound),
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let kind: String = row.get(3)?;
    let metadata: Option<String> = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: MessageKind::parse(&kind).ok_or_else(|| bad_column(3, "unknown message kind"))?,
        content: row.get(4)?,
        metadata: metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
            })?,
        file_url: row.get(6)?,
        is_edited: row.get(7)?,
        is_deleted: row.get(8)?,
        reply_to_id: row.get(9)?,
        created_at: parse_timestamp(10, row.get(10)?)?,
        updated_at: parse_timestamp(11, row.get(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vaultke_shared::RoomType;

    use crate::keys::tests::open_test_db;

    fn text_message(room_id: &str, sender: &str, content: &str) -> NewMessage {
        NewMessage {
            room_id: room_id.to_owned(),
            sender_id: sender.to_owned(),
            kind: MessageKind::Text,
            content: content.to_owned(),
            metadata: None,
            file_url: None,
            reply_to_id: None,
        }
    }

    #[test]
    fn test_append_updates_plaintext_preview() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();

        db.append_message(&text_message(&room.id, "alice", "hello")).unwrap();

        let room = db.get_room(&room.id).unwrap();
        assert_eq!(room.last_message.as_deref(), Some("hello"));
        assert!(room.last_message_at.is_some());
    }

    #[test]
    fn test_encrypted_append_gets_placeholder_preview() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();

        let mut msg = text_message(&room.id, "alice", "{\"ciphertext\":\"...\"}");
        msg.metadata = Some(json!({ "securityLevel": "MILITARY_GRADE" }));
        let stored = db.append_message(&msg).unwrap();

        assert!(stored.needs_decryption());
        let room = db.get_room(&room.id).unwrap();
        assert_eq!(room.last_message.as_deref(), Some(ENCRYPTED_PREVIEW));
    }

    #[test]
    fn test_append_to_unknown_room() {
        let (_dir, mut db) = open_test_db();
        assert!(matches!(
            db.append_message(&text_message("no-such-room", "alice", "hi")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_history_order_and_paging() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();

        let first = db.append_message(&text_message(&room.id, "alice", "one")).unwrap();
        db.append_message(&text_message(&room.id, "bob", "two")).unwrap();
        db.append_message(&text_message(&room.id, "alice", "three")).unwrap();

        let page = db.messages_for_room(&room.id, 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "three");
        assert_eq!(page[1].content, "two");

        let rest = db.messages_for_room(&room.id, 2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, first.id);

        assert!(matches!(
            db.messages_for_room("no-such-room", 10, 0),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_edit_is_sender_only() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();
        let msg = db.append_message(&text_message(&room.id, "alice", "typo")).unwrap();

        assert!(matches!(
            db.edit_message(&msg.id, "bob", "hijacked"),
            Err(StoreError::Forbidden)
        ));

        let edited = db.edit_message(&msg.id, "alice", "fixed").unwrap();
        assert_eq!(edited.content, "fixed");
        assert!(edited.is_edited);

        assert!(matches!(
            db.edit_message("no-such-message", "alice", "x"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_delete_is_logical_and_sender_only() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();
        let msg = db.append_message(&text_message(&room.id, "alice", "oops")).unwrap();

        assert!(matches!(
            db.delete_message(&msg.id, "bob"),
            Err(StoreError::Forbidden)
        ));
        db.delete_message(&msg.id, "alice").unwrap();

        assert!(db.messages_for_room(&room.id, 10, 0).unwrap().is_empty());
        assert!(matches!(db.get_message(&msg.id), Err(StoreError::NotFound)));
        // Deleting again behaves like a missing message.
        assert!(matches!(
            db.delete_message(&msg.id, "alice"),
            Err(StoreError::NotFound)
        ));

        let flagged: bool = db
            .conn()
            .query_row(
                "SELECT is_deleted FROM messages WHERE id = ?1",
                params![msg.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(flagged);
    }

    #[test]
    fn test_clear_room_resets_preview() {
        let (_dir, mut db) = open_test_db();
        let room = db.create_private_room("alice", "bob").unwrap();
        db.append_message(&text_message(&room.id, "alice", "one")).unwrap();
        db.append_message(&text_message(&room.id, "bob", "two")).unwrap();

        assert_eq!(db.clear_room(&room.id).unwrap(), 2);
        assert!(db.messages_for_room(&room.id, 10, 0).unwrap().is_empty());

        let room = db.get_room(&room.id).unwrap();
        assert!(room.last_message.is_none());
        assert!(room.last_message_at.is_none());

        assert_eq!(db.clear_room(&room.id).unwrap(), 0);
    }

    #[test]
    fn test_unread_counts_follow_read_cursor() {
        let (_dir, mut db) = open_test_db();
        let room = db
            .create_group_room("alice", "g", RoomType::Group, None, &["bob".into()])
            .unwrap();

        db.append_message(&text_message(&room.id, "alice", "one")).unwrap();
        db.append_message(&text_message(&room.id, "alice", "two")).unwrap();

        // Bob sees two unread; Alice none of her own.
        let bob_rooms = db.rooms_for_user("bob").unwrap();
        assert_eq!(bob_rooms.len(), 1);
        assert_eq!(bob_rooms[0].unread_count, 2);
        assert_eq!(db.rooms_for_user("alice").unwrap()[0].unread_count, 0);

        db.set_last_read(&room.id, "bob").unwrap();
        assert_eq!(db.rooms_for_user("bob").unwrap()[0].unread_count, 0);

        db.append_message(&text_message(&room.id, "alice", "three")).unwrap();
        assert_eq!(db.rooms_for_user("bob").unwrap()[0].unread_count, 1);
    }
}
