//! Rooms and memberships.
//!
//! Membership is the authorization boundary for the whole messaging
//! path: the relay refuses subscriptions and submissions for rooms the
//! user is not an active member of, and the REST surface refuses
//! history reads the same way.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use vaultke_shared::{RoomRole, RoomType};

use crate::database::{bad_column, parse_timestamp, parse_timestamp_opt, Database};
use crate::error::{Result, StoreError};
use crate::models::{Room, RoomMember, RoomSummary};

const ROOM_COLUMNS: &str = "id, type, name, chama_id, created_by, is_active, \
                            last_message, last_message_at, created_at, updated_at";

const MEMBER_COLUMNS: &str = "id, room_id, user_id, role, is_active, joined_at, last_read_at, muted";

impl Database {
    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Fetch or create the private room between two users. At most one
    /// active private room exists per pair; calling this again returns
    /// the same room.
    pub fn create_private_room(&mut self, user_a: &str, user_b: &str) -> Result<Room> {
        if user_a == user_b {
            return Err(StoreError::Conflict(
                "a private room needs two distinct users".into(),
            ));
        }

        let existing: Option<String> = self
            .conn()
            .query_row(
                "SELECT r.id FROM rooms r
                 JOIN room_members m1 ON m1.room_id = r.id
                      AND m1.user_id = ?1 AND m1.is_active = 1
                 JOIN room_members m2 ON m2.room_id = r.id
                      AND m2.user_id = ?2 AND m2.is_active = 1
                 WHERE r.type = 'private' AND r.is_active = 1
                 LIMIT 1",
                params![user_a, user_b],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return self.get_room(&id);
        }

        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4().to_string(),
            room_type: RoomType::Private,
            name: None,
            chama_id: None,
            created_by: user_a.to_owned(),
            is_active: true,
            last_message: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.conn_mut().transaction()?;
        insert_room(&tx, &room)?;
        insert_member(&tx, &room.id, user_a, RoomRole::Member, now)?;
        insert_member(&tx, &room.id, user_b, RoomRole::Member, now)?;
        tx.commit()?;

        tracing::info!(room = %room.id, "created private room");
        Ok(room)
    }

    /// Create a group-style room. The creator becomes `owner`; everyone
    /// in `member_ids` joins as `member`.
    pub fn create_group_room(
        &mut self,
        creator: &str,
        name: &str,
        room_type: RoomType,
        chama_id: Option<&str>,
        member_ids: &[String],
    ) -> Result<Room> {
        if !room_type.is_group() {
            return Err(StoreError::Conflict(
                "private rooms are created pairwise".into(),
            ));
        }

        let now = Utc::now();
        let room = Room {
            id: Uuid::new_v4().to_string(),
            room_type,
            name: Some(name.to_owned()),
            chama_id: chama_id.map(str::to_owned),
            created_by: creator.to_owned(),
            is_active: true,
            last_message: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.conn_mut().transaction()?;
        insert_room(&tx, &room)?;
        insert_member(&tx, &room.id, creator, RoomRole::Owner, now)?;
        for member in member_ids {
            if member == creator {
                continue;
            }
            insert_member(&tx, &room.id, member, RoomRole::Member, now)?;
        }
        tx.commit()?;

        tracing::info!(room = %room.id, kind = %room.room_type.as_str(), "created group room");
        Ok(room)
    }

    /// Add a user to a group room. Only an active owner may do this, and
    /// private rooms never change membership.
    pub fn add_member(&mut self, room_id: &str, acting_user: &str, user_id: &str) -> Result<RoomMember> {
        let room = self.get_room(room_id)?;
        if !room.room_type.is_group() {
            return Err(StoreError::Forbidden);
        }
        match self.member_row(room_id, acting_user)? {
            Some(actor) if actor.is_active && actor.role == RoomRole::Owner => {}
            _ => return Err(StoreError::Forbidden),
        }

        let now = Utc::now();
        self.conn().execute(
            "INSERT INTO room_members (id, room_id, user_id, role, is_active, joined_at, muted)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, 0)
             ON CONFLICT(room_id, user_id) DO UPDATE SET is_active = 1",
            params![
                Uuid::new_v4().to_string(),
                room_id,
                user_id,
                RoomRole::Member.as_str(),
                now.to_rfc3339(),
            ],
        )?;

        self.member_row(room_id, user_id)?.ok_or(StoreError::NotFound)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn get_room(&self, room_id: &str) -> Result<Room> {
        self.conn()
            .query_row(
                &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1 AND is_active = 1"),
                params![room_id],
                row_to_room,
            )
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    /// The membership gate used by the relay and the REST surface.
    pub fn is_active_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM room_members
             WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![room_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Active members of a room, oldest join first.
    pub fn room_members(&self, room_id: &str) -> Result<Vec<RoomMember>> {
        self.get_room(room_id)?;
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM room_members
             WHERE room_id = ?1 AND is_active = 1
             ORDER BY joined_at ASC"
        ))?;
        let members = stmt
            .query_map(params![room_id], row_to_member)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(members)
    }

    /// Every room the user is an active member of, most recently active
    /// first, with the per-user unread count.
    pub fn rooms_for_user(&self, user_id: &str) -> Result<Vec<RoomSummary>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ROOM_COLUMNS_PREFIXED}, m.role, m.muted, m.last_read_at,
                    (SELECT COUNT(*) FROM messages msg
                     WHERE msg.room_id = r.id
                       AND msg.is_deleted = 0
                       AND msg.sender_id != ?1
                       AND (m.last_read_at IS NULL OR msg.created_at > m.last_read_at))
             FROM rooms r
             JOIN room_members m ON m.room_id = r.id
             WHERE m.user_id = ?1 AND m.is_active = 1 AND r.is_active = 1
             ORDER BY COALESCE(r.last_message_at, r.created_at) DESC"
        ))?;
        let summaries = stmt
            .query_map(params![user_id], |row| {
                Ok(RoomSummary {
                    room: row_to_room(row)?,
                    role: parse_role(10, row.get(10)?)?,
                    muted: row.get(11)?,
                    last_read_at: parse_timestamp_opt(12, row.get(12)?)?,
                    unread_count: row.get(13)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    // ------------------------------------------------------------------
    // Per-member settings
    // ------------------------------------------------------------------

    /// Move the user's read cursor to now.
    pub fn set_last_read(&self, room_id: &str, user_id: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE room_members SET last_read_at = ?3
             WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![room_id, user_id, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_muted(&self, room_id: &str, user_id: &str, muted: bool) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE room_members SET muted = ?3
             WHERE room_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![room_id, user_id, muted],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn member_row(&self, room_id: &str, user_id: &str) -> Result<Option<RoomMember>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MEMBER_COLUMNS} FROM room_members
                     WHERE room_id = ?1 AND user_id = ?2"
                ),
                params![room_id, user_id],
                row_to_member,
            )
            .optional()?)
    }
}

const ROOM_COLUMNS_PREFIXED: &str =
    "r.id, r.type, r.name, r.chama_id, r.created_by, r.is_active, \
     r.last_message, r.last_message_at, r.created_at, r.updated_at";

fn insert_room(tx: &rusqlite::Transaction<'_>, room: &Room) -> Result<()> {
    tx.execute(
        "INSERT INTO rooms
         (id, type, name, chama_id, created_by, is_active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
        params![
            room.id,
            room.room_type.as_str(),
            room.name,
            room.chama_id,
            room.created_by,
            room.created_at.to_rfc3339(),
            room.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_member(
    tx: &rusqlite::Transaction<'_>,
    room_id: &str,
    user_id: &str,
    role: RoomRole,
    joined_at: chrono::DateTime<Utc>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO room_members (id, room_id, user_id, role, is_active, joined_at, muted)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, 0)",
        params![
            Uuid::new_v4().to_string(),
            room_id,
            user_id,
            role.as_str(),
            joined_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_room(row: &Row<'_>) -> rusqlite::Result<Room> {
    let kind: String = row.get(1)?;
    Ok(Room {
        id: row.get(0)?,
        room_type: RoomType::parse(&kind).ok_or_else(|| bad_column(1, "unknown room type"))?,
        name: row.get(2)?,
        chama_id: row.get(3)?,
        created_by: row.get(4)?,
        is_active: row.get(5)?,
        last_message: row.get(6)?,
        last_message_at: parse_timestamp_opt(7, row.get(7)?)?,
        created_at: parse_timestamp(8, row.get(8)?)?,
        updated_at: parse_timestamp(9, row.get(9)?)?,
    })
}

fn row_to_member(row: &Row<'_>) -> rusqlite::Result<RoomMember> {
    Ok(RoomMember {
        id: row.get(0)?,
        room_id: row.get(1)?,
        user_id: row.get(2)?,
        role: parse_role(3, row.get(3)?)?,
        is_active: row.get(4)?,
        joined_at: parse_timestamp(5, row.get(5)?)?,
        last_read_at: parse_timestamp_opt(6, row.get(6)?)?,
        muted: row.get(7)?,
    })
}

fn parse_role(idx: usize, value: String) -> rusqlite::Result<RoomRole> {
    RoomRole::parse(&value).ok_or_else(|| bad_column(idx, "unknown room role"))
}
