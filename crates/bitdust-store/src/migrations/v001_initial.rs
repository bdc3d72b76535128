//! v001 -- Initial schema creation.
//!
//! Creates the three core tables: `keys`, `history` and `conversations`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Keys
--
-- local_key_id is the compact foreign key referenced by the message
-- tables. public_key is unique: renaming a key after an identity
-- rotation updates key_id in place and nothing else moves.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS keys (
    local_key_id INTEGER PRIMARY KEY AUTOINCREMENT,
    key_id       TEXT NOT NULL UNIQUE,        -- alias$nickname@host_port
    public_key   TEXT NOT NULL UNIQUE         -- hex-encoded Ed25519 pubkey
);

CREATE INDEX IF NOT EXISTS idx_keys_public_key ON keys(public_key);

-- ----------------------------------------------------------------
-- History
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS history (
    id                      TEXT PRIMARY KEY NOT NULL,
    conversation_id         TEXT NOT NULL,
    sender_local_key_id     INTEGER NOT NULL,
    recipient_local_key_id  INTEGER NOT NULL,
    direction               TEXT NOT NULL,    -- 'in' / 'out'
    message_type            TEXT NOT NULL,    -- private/group/personal
    payload                 BLOB NOT NULL,    -- decrypted JSON bytes
    created_at              TEXT NOT NULL,    -- ISO-8601 / RFC-3339

    FOREIGN KEY (sender_local_key_id)    REFERENCES keys(local_key_id),
    FOREIGN KEY (recipient_local_key_id) REFERENCES keys(local_key_id)
);

CREATE INDEX IF NOT EXISTS idx_history_conversation
    ON history(conversation_id, created_at ASC);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    conversation_id  TEXT PRIMARY KEY NOT NULL,
    message_type     TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    last_updated_at  TEXT NOT NULL,
    last_message_id  TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated
    ON conversations(last_updated_at DESC);
"#;

/// Apply the initial schema.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
