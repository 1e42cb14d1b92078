//! Database schema migrations.
//!
//! Applies the initial schema: users, conversations, messages,
//! interactions, and the schema_migrations tracking table.

use rusqlite::Connection;
use tracing::info;

use civicline_core::CivicError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), CivicError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| CivicError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| CivicError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    Ok(())
}

/// Version 1: Initial schema.
///
/// Timestamps are fixed-width RFC 3339 strings with nanoseconds, so they
/// round-trip exactly and sort lexically.
fn apply_v1(conn: &Connection) -> Result<(), CivicError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT PRIMARY KEY NOT NULL,
            contact_handle      TEXT NOT NULL UNIQUE,
            preferred_language  TEXT,
            accessibility       TEXT NOT NULL DEFAULT '{}',
            fallback_channels   TEXT NOT NULL DEFAULT '[]',
            profile             TEXT NOT NULL DEFAULT '{}',
            created_at          TEXT    NOT NULL,
            last_active_at      TEXT    NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY NOT NULL,
            user_id             TEXT NOT NULL,
            channel             TEXT NOT NULL,
            state               TEXT NOT NULL
                                CHECK (state IN ('created', 'active', 'idle', 'ended')),
            language            TEXT NOT NULL,
            context             TEXT NOT NULL,
            created_at          TEXT    NOT NULL,
            last_activity_at    TEXT    NOT NULL,
            ended_at            TEXT   ,
            end_reason          TEXT,
            version             INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        );

        -- At most one open conversation per (user, channel).
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open
            ON conversations (user_id, channel)
            WHERE state != 'ended';

        CREATE INDEX IF NOT EXISTS idx_conversations_state
            ON conversations (state, last_activity_at);

        CREATE TABLE IF NOT EXISTS messages (
            id                  TEXT PRIMARY KEY NOT NULL,
            conversation_id     TEXT NOT NULL,
            seq                 INTEGER NOT NULL,
            sender              TEXT NOT NULL CHECK (sender IN ('user', 'system')),
            kind                TEXT NOT NULL,
            content             TEXT NOT NULL DEFAULT '',
            language            TEXT NOT NULL,
            created_at          TEXT    NOT NULL,
            delivery            TEXT,
            UNIQUE (conversation_id, seq),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS interactions (
            id                  TEXT PRIMARY KEY NOT NULL,
            user_id             TEXT,
            action              TEXT NOT NULL,
            resource_id         TEXT,
            metadata            TEXT NOT NULL DEFAULT '{}',
            created_at          TEXT    NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_interactions_user
            ON interactions (user_id, created_at)
            WHERE user_id IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_interactions_action
            ON interactions (action, created_at);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| CivicError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
