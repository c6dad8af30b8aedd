//! v001 -- Initial schema creation.
//!
//! Creates the key directory (`devices`, `identity_keys`,
//! `signed_pre_keys`, `one_time_pre_keys`), the session store
//! (`sessions`) and the archive (`rooms`, `room_members`, `messages`).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Devices
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    id                TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    user_id           TEXT NOT NULL,
    device_id         TEXT NOT NULL,
    registration_id   INTEGER NOT NULL,
    signed_pre_key_id INTEGER,
    is_active         INTEGER NOT NULL DEFAULT 1, -- boolean 0/1
    created_at        TEXT NOT NULL,              -- ISO-8601 / RFC-3339
    updated_at        TEXT NOT NULL
);

-- One live registration per (user, device); retired rows stay for audit.
CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_live
    ON devices(user_id, device_id) WHERE is_active = 1;
CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);

-- ----------------------------------------------------------------
-- Identity keys (one per live device; replaced on re-registration)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identity_keys (
    user_id     TEXT NOT NULL,
    device_id   TEXT NOT NULL,
    public_key  TEXT NOT NULL,                    -- base64
    private_key TEXT NOT NULL,                    -- base64
    created_at  TEXT NOT NULL,

    PRIMARY KEY (user_id, device_id)
);

-- ----------------------------------------------------------------
-- Signed pre-keys (rotation replaces the row)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS signed_pre_keys (
    user_id           TEXT NOT NULL,
    device_id         TEXT NOT NULL,
    signed_pre_key_id INTEGER NOT NULL,
    public_key        TEXT NOT NULL,              -- base64
    private_key       TEXT NOT NULL,              -- base64
    signature         TEXT NOT NULL,              -- base64
    created_at        TEXT NOT NULL,

    PRIMARY KEY (user_id, device_id)
);

-- ----------------------------------------------------------------
-- One-time pre-keys (deleted when handed out in a bundle)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS one_time_pre_keys (
    user_id     TEXT NOT NULL,
    device_id   TEXT NOT NULL,
    pre_key_id  INTEGER NOT NULL,
    public_key  TEXT NOT NULL,                    -- base64
    private_key TEXT NOT NULL,                    -- base64
    created_at  TEXT NOT NULL,

    PRIMARY KEY (user_id, device_id, pre_key_id)
);

-- ----------------------------------------------------------------
-- Pairwise sessions, one row per unordered user pair
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY NOT NULL,    -- 64-hex session ID
    user_a_id       TEXT NOT NULL,                -- lexicographically lower
    user_b_id       TEXT NOT NULL,
    shared_secret   TEXT NOT NULL,                -- base64 root key
    sending_chain   TEXT NOT NULL,                -- base64 send cursor
    receiving_chain TEXT NOT NULL,                -- base64 receive cursor
    message_number  INTEGER NOT NULL DEFAULT 0,   -- send counter
    received_number INTEGER NOT NULL DEFAULT 0,   -- receive counter
    created_at      TEXT NOT NULL,
    last_used       TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_pair
    ON sessions(user_a_id, user_b_id);

-- ----------------------------------------------------------------
-- Rooms
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rooms (
    id              TEXT PRIMARY KEY NOT NULL,    -- UUID v4
    type            TEXT NOT NULL,                -- private|chama|group|support
    name            TEXT,
    chama_id        TEXT,
    created_by      TEXT NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1,
    last_message    TEXT,                         -- preview text
    last_message_at TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rooms_chama ON rooms(chama_id);

-- ----------------------------------------------------------------
-- Room membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS room_members (
    id           TEXT PRIMARY KEY NOT NULL,       -- UUID v4
    room_id      TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    role         TEXT NOT NULL DEFAULT 'member',  -- owner|member
    is_active    INTEGER NOT NULL DEFAULT 1,
    joined_at    TEXT NOT NULL,
    last_read_at TEXT,
    muted        INTEGER NOT NULL DEFAULT 0,

    UNIQUE (room_id, user_id),
    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_room_members_user ON room_members(user_id);

-- ----------------------------------------------------------------
-- Messages (append-only; deletion is a logical flag)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id          TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    room_id     TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    type        TEXT NOT NULL DEFAULT 'text',     -- text|image|file|location|system
    content     TEXT NOT NULL,                    -- plaintext or envelope JSON
    metadata    TEXT,                             -- JSON blob
    file_url    TEXT,
    is_edited   INTEGER NOT NULL DEFAULT 0,
    is_deleted  INTEGER NOT NULL DEFAULT 0,
    reply_to_id TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,

    FOREIGN KEY (room_id) REFERENCES rooms(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_room_ts
    ON messages(room_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
