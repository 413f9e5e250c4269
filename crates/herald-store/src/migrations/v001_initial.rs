//! v001 -- Initial schema creation.
//!
//! Creates the seven application tables. The full-text index and its triggers
//! are not part of the migration: they are probed separately at open so a
//! SQLite build without FTS5 still works (search degrades to substring scan).

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    address       TEXT PRIMARY KEY NOT NULL,   -- base-form protocol address
    kind          TEXT NOT NULL DEFAULT 'unknown',
    name          TEXT NOT NULL DEFAULT '',
    last_activity INTEGER NOT NULL DEFAULT 0   -- unix seconds, max ts observed
);

-- ----------------------------------------------------------------
-- Contacts (refresh-driven) and local overlays (user-managed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    address       TEXT PRIMARY KEY NOT NULL,
    phone         TEXT NOT NULL DEFAULT '',
    push_name     TEXT NOT NULL DEFAULT '',
    full_name     TEXT NOT NULL DEFAULT '',
    first_name    TEXT NOT NULL DEFAULT '',
    business_name TEXT NOT NULL DEFAULT '',
    updated_at    TEXT NOT NULL                -- RFC-3339
);

CREATE TABLE IF NOT EXISTS contact_aliases (
    address    TEXT PRIMARY KEY NOT NULL,
    alias      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contact_tags (
    address    TEXT NOT NULL,
    tag        TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (address, tag)
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    address    TEXT PRIMARY KEY NOT NULL,
    name       TEXT NOT NULL DEFAULT '',
    owner      TEXT NOT NULL DEFAULT '',
    created_at TEXT,                           -- RFC-3339, may be unknown
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_address TEXT NOT NULL,
    user_address  TEXT NOT NULL,
    role          TEXT NOT NULL DEFAULT 'member',
    updated_at    TEXT NOT NULL,

    PRIMARY KEY (group_address, user_address),
    FOREIGN KEY (group_address) REFERENCES groups(address) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_address     TEXT NOT NULL,
    message_id       TEXT NOT NULL,            -- protocol-assigned
    sender           TEXT NOT NULL DEFAULT '', -- empty when from_me
    chat_name        TEXT NOT NULL DEFAULT '', -- denormalised for search
    sender_name      TEXT NOT NULL DEFAULT '', -- denormalised for search
    ts               INTEGER NOT NULL,         -- unix seconds
    from_me          INTEGER NOT NULL DEFAULT 0,
    text             TEXT NOT NULL DEFAULT '',
    media_kind       TEXT NOT NULL DEFAULT '',
    media_caption    TEXT NOT NULL DEFAULT '',
    filename         TEXT NOT NULL DEFAULT '',
    mime_type        TEXT NOT NULL DEFAULT '',
    direct_path      TEXT NOT NULL DEFAULT '',
    media_key        BLOB NOT NULL DEFAULT X'',
    plaintext_sha256 BLOB NOT NULL DEFAULT X'',
    encrypted_sha256 BLOB NOT NULL DEFAULT X'',
    byte_length      INTEGER NOT NULL DEFAULT 0,
    local_path       TEXT NOT NULL DEFAULT '',
    downloaded_at    TEXT,                     -- RFC-3339, null until downloaded

    UNIQUE (chat_address, message_id),
    FOREIGN KEY (chat_address) REFERENCES chats(address) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_address, ts);
CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
