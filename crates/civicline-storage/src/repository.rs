//! SQLite-backed [`ConversationStore`].
//!
//! Conversation saves run inside one transaction under the connection
//! mutex: the stored row and messages are loaded, checked against the new
//! version, and only the appended messages are inserted.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use civicline_core::store::check_save;
use civicline_core::{
    ChannelKind, CivicError, Conversation, ConversationState, ConversationStore, Interaction,
    LanguageCode, Message, Result, User,
};

use crate::db::Database;

pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open the database file at `path`, applying migrations.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::new(path)?)))
    }
}

// =============================================================================
// Column codecs
// =============================================================================

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> CivicError + '_ {
    move |e| match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            CivicError::Conflict(format!("{}: {}", context, e))
        }
        _ => CivicError::Storage(format!("{}: {}", context, e)),
    }
}

fn to_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn from_stamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| CivicError::Serialization(format!("invalid timestamp {}: {}", raw, e)))
}

/// Serde name of a unit enum variant, e.g. `Sender::User` -> `"user"`.
fn to_label<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(CivicError::Serialization(format!("expected a label, got {}", other))),
    }
}

fn from_label<T: DeserializeOwned>(label: String) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(label))?)
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| CivicError::Serialization(format!("invalid id {}: {}", raw, e)))
}

// =============================================================================
// Row mapping
// =============================================================================

struct UserRow {
    id: String,
    contact_handle: String,
    preferred_language: Option<String>,
    accessibility: String,
    fallback_channels: String,
    profile: String,
    created_at: String,
    last_active_at: String,
}

impl UserRow {
    const COLUMNS: &'static str = "id, contact_handle, preferred_language, accessibility, \
        fallback_channels, profile, created_at, last_active_at";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contact_handle: row.get(1)?,
            preferred_language: row.get(2)?,
            accessibility: row.get(3)?,
            fallback_channels: row.get(4)?,
            profile: row.get(5)?,
            created_at: row.get(6)?,
            last_active_at: row.get(7)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_uuid(&self.id)?,
            contact_handle: self.contact_handle,
            preferred_language: self.preferred_language.map(|c| LanguageCode::new(&c)),
            accessibility: serde_json::from_str(&self.accessibility)?,
            fallback_channels: serde_json::from_str(&self.fallback_channels)?,
            profile: serde_json::from_str(&self.profile)?,
            created_at: from_stamp(self.created_at)?,
            last_active_at: from_stamp(self.last_active_at)?,
        })
    }
}

struct ConversationRow {
    id: String,
    user_id: String,
    channel: String,
    state: String,
    language: String,
    context: String,
    created_at: String,
    last_activity_at: String,
    ended_at: Option<String>,
    end_reason: Option<String>,
    version: i64,
}

impl ConversationRow {
    const COLUMNS: &'static str = "id, user_id, channel, state, language, context, created_at, \
        last_activity_at, ended_at, end_reason, version";

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            channel: row.get(2)?,
            state: row.get(3)?,
            language: row.get(4)?,
            context: row.get(5)?,
            created_at: row.get(6)?,
            last_activity_at: row.get(7)?,
            ended_at: row.get(8)?,
            end_reason: row.get(9)?,
            version: row.get(10)?,
        })
    }

    fn into_conversation(self, messages: Vec<Message>) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            channel: self
                .channel
                .parse()
                .map_err(CivicError::Serialization)?,
            state: self
                .state
                .parse()
                .map_err(CivicError::Serialization)?,
            language: serde_json::from_str(&self.language)?,
            messages,
            context: serde_json::from_str(&self.context)?,
            created_at: from_stamp(self.created_at)?,
            last_activity_at: from_stamp(self.last_activity_at)?,
            ended_at: self.ended_at.map(from_stamp).transpose()?,
            end_reason: self.end_reason.map(from_label).transpose()?,
            version: self.version as u64,
        })
    }
}

struct MessageRow {
    id: String,
    conversation_id: String,
    sender: String,
    kind: String,
    content: String,
    language: String,
    created_at: String,
    delivery: Option<String>,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            language: row.get(5)?,
            created_at: row.get(6)?,
            delivery: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_uuid(&self.id)?,
            conversation_id: parse_uuid(&self.conversation_id)?,
            sender: from_label(self.sender)?,
            kind: from_label(self.kind)?,
            content: self.content,
            language: LanguageCode::new(&self.language),
            created_at: from_stamp(self.created_at)?,
            delivery: self.delivery.map(|d| serde_json::from_str(&d)).transpose()?,
        })
    }
}

// =============================================================================
// Queries on a held connection
// =============================================================================

fn load_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, conversation_id, sender, kind, content, language, created_at, delivery
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )
        .map_err(storage_err("Failed to prepare message query"))?;
    let rows = stmt
        .query_map([conversation_id], MessageRow::read)
        .map_err(storage_err("Failed to load messages"))?;
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(storage_err("Failed to read message"))?.into_message()?);
    }
    Ok(messages)
}

fn load_conversation_where(conn: &Connection, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Conversation>> {
    let sql = format!("SELECT {} FROM conversations WHERE {}", ConversationRow::COLUMNS, clause);
    let mut stmt = conn.prepare(&sql).map_err(storage_err("Failed to prepare conversation query"))?;
    let rows = stmt
        .query_map(params, ConversationRow::read)
        .map_err(storage_err("Failed to load conversations"))?;
    let mut header_rows = Vec::new();
    for row in rows {
        header_rows.push(row.map_err(storage_err("Failed to read conversation"))?);
    }
    header_rows
        .into_iter()
        .map(|row| {
            let messages = load_messages(conn, &row.id)?;
            row.into_conversation(messages)
        })
        .collect()
}

fn insert_messages(conn: &Connection, conversation_id: Uuid, messages: &[Message], first_seq: usize) -> Result<()> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO messages (id, conversation_id, seq, sender, kind, content, language, created_at, delivery)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .map_err(storage_err("Failed to prepare message insert"))?;
    for (offset, message) in messages.iter().enumerate() {
        let delivery = message.delivery.as_ref().map(serde_json::to_string).transpose()?;
        stmt.execute(rusqlite::params![
            message.id.to_string(),
            conversation_id.to_string(),
            (first_seq + offset) as i64,
            to_label(&message.sender)?,
            to_label(&message.kind)?,
            message.content,
            message.language.as_str(),
            to_stamp(message.created_at),
            delivery,
        ])
        .map_err(storage_err("Failed to insert message"))?;
    }
    Ok(())
}

fn conversation_params(conversation: &Conversation) -> Result<(String, String, Option<String>)> {
    Ok((
        serde_json::to_string(&conversation.language)?,
        serde_json::to_string(&conversation.context)?,
        conversation.end_reason.as_ref().map(to_label).transpose()?,
    ))
}

impl ConversationStore for SqliteStore {
    fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS);
            conn.query_row(&sql, [id.to_string()], UserRow::read)
                .optional()
                .map_err(storage_err("Failed to load user"))?
                .map(UserRow::into_user)
                .transpose()
        })
    }

    fn find_user_by_contact(&self, contact_handle: &str) -> Result<Option<User>> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE contact_handle = ?1", UserRow::COLUMNS);
            conn.query_row(&sql, [contact_handle], UserRow::read)
                .optional()
                .map_err(storage_err("Failed to find user"))?
                .map(UserRow::into_user)
                .transpose()
        })
    }

    fn upsert_user(&self, user: &User) -> Result<()> {
        let accessibility = serde_json::to_string(&user.accessibility)?;
        let fallback_channels = serde_json::to_string(&user.fallback_channels)?;
        let profile = serde_json::to_string(&user.profile)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, contact_handle, preferred_language, accessibility,
                                    fallback_channels, profile, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    contact_handle = excluded.contact_handle,
                    preferred_language = excluded.preferred_language,
                    accessibility = excluded.accessibility,
                    fallback_channels = excluded.fallback_channels,
                    profile = excluded.profile,
                    last_active_at = excluded.last_active_at",
                rusqlite::params![
                    user.id.to_string(),
                    user.contact_handle,
                    user.preferred_language.as_ref().map(|c| c.as_str().to_string()),
                    accessibility,
                    fallback_channels,
                    profile,
                    to_stamp(user.created_at),
                    to_stamp(user.last_active_at),
                ],
            )
            .map_err(storage_err("Failed to save user"))?;
            Ok(())
        })
    }

    fn delete_user(&self, id: Uuid) -> Result<bool> {
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(storage_err("Failed to begin transaction"))?;
            let key = id.to_string();
            tx.execute("UPDATE interactions SET user_id = NULL WHERE user_id = ?1", [&key])
                .map_err(storage_err("Failed to unlink interactions"))?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id IN
                    (SELECT id FROM conversations WHERE user_id = ?1)",
                [&key],
            )
            .map_err(storage_err("Failed to delete messages"))?;
            tx.execute("DELETE FROM conversations WHERE user_id = ?1", [&key])
                .map_err(storage_err("Failed to delete conversations"))?;
            let removed = tx
                .execute("DELETE FROM users WHERE id = ?1", [&key])
                .map_err(storage_err("Failed to delete user"))?;
            tx.commit().map_err(storage_err("Failed to commit user delete"))?;
            Ok(removed > 0)
        })
    }

    fn find_open_conversation(&self, user_id: Uuid, channel: ChannelKind) -> Result<Option<Conversation>> {
        self.db.with_conn(|conn| {
            let mut found = load_conversation_where(
                conn,
                "user_id = ?1 AND channel = ?2 AND state != 'ended'",
                [user_id.to_string(), channel.as_str().to_string()],
            )?;
            Ok(found.pop())
        })
    }

    fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.db.with_conn(|conn| {
            let mut found = load_conversation_where(conn, "id = ?1", [id.to_string()])?;
            Ok(found.pop())
        })
    }

    fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let (language, context, end_reason) = conversation_params(conversation)?;
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(storage_err("Failed to begin transaction"))?;
            tx.execute(
                "INSERT INTO conversations (id, user_id, channel, state, language, context,
                                            created_at, last_activity_at, ended_at, end_reason, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    conversation.id.to_string(),
                    conversation.user_id.to_string(),
                    conversation.channel.as_str(),
                    conversation.state.as_str(),
                    language,
                    context,
                    to_stamp(conversation.created_at),
                    to_stamp(conversation.last_activity_at),
                    conversation.ended_at.map(to_stamp),
                    end_reason,
                    conversation.version as i64,
                ],
            )
            .map_err(storage_err("Failed to insert conversation"))?;
            insert_messages(&tx, conversation.id, &conversation.messages, 0)?;
            tx.commit().map_err(storage_err("Failed to commit conversation"))?;
            Ok(())
        })
    }

    fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let (language, context, end_reason) = conversation_params(conversation)?;
        self.db.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(storage_err("Failed to begin transaction"))?;
            let stored = load_conversation_where(&tx, "id = ?1", [conversation.id.to_string()])?
                .pop()
                .ok_or_else(|| CivicError::NotFound(format!("conversation {}", conversation.id)))?;
            check_save(&stored, conversation)?;

            let updated = tx
                .execute(
                    "UPDATE conversations SET
                        state = ?1, language = ?2, context = ?3, last_activity_at = ?4,
                        ended_at = ?5, end_reason = ?6, version = ?7
                     WHERE id = ?8 AND version = ?9",
                    rusqlite::params![
                        conversation.state.as_str(),
                        language,
                        context,
                        to_stamp(conversation.last_activity_at),
                        conversation.ended_at.map(to_stamp),
                        end_reason,
                        conversation.version as i64,
                        conversation.id.to_string(),
                        stored.version as i64,
                    ],
                )
                .map_err(storage_err("Failed to update conversation"))?;
            if updated != 1 {
                return Err(CivicError::StaleWrite {
                    id: conversation.id,
                    expected: stored.version,
                    found: stored.version,
                });
            }
            let known = stored.messages.len();
            insert_messages(&tx, conversation.id, &conversation.messages[known..], known)?;
            tx.commit().map_err(storage_err("Failed to commit conversation"))?;
            Ok(())
        })
    }

    fn list_open_conversations(&self) -> Result<Vec<Conversation>> {
        self.db.with_conn(|conn| {
            load_conversation_where(
                conn,
                "state != ?1 ORDER BY last_activity_at ASC",
                [ConversationState::Ended.as_str()],
            )
        })
    }

    fn record_interaction(&self, interaction: &Interaction) -> Result<()> {
        let metadata = serde_json::to_string(&interaction.metadata)?;
        let action = to_label(&interaction.action)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO interactions (id, user_id, action, resource_id, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    interaction.id.to_string(),
                    interaction.user_id.map(|u| u.to_string()),
                    action,
                    interaction.resource_id,
                    metadata,
                    to_stamp(interaction.created_at),
                ],
            )
            .map_err(storage_err("Failed to record interaction"))?;
            Ok(())
        })
    }

    fn interactions_for_user(&self, user_id: Uuid) -> Result<Vec<Interaction>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, action, resource_id, metadata, created_at
                     FROM interactions WHERE user_id = ?1 ORDER BY created_at ASC",
                )
                .map_err(storage_err("Failed to prepare interaction query"))?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(storage_err("Failed to load interactions"))?;

            let mut interactions = Vec::new();
            for row in rows {
                let (id, user, action, resource_id, metadata, created_at) =
                    row.map_err(storage_err("Failed to read interaction"))?;
                interactions.push(Interaction {
                    id: parse_uuid(&id)?,
                    user_id: user.as_deref().map(parse_uuid).transpose()?,
                    action: from_label(action)?,
                    resource_id,
                    metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata)?,
                    created_at: from_stamp(created_at)?,
                });
            }
            Ok(interactions)
        })
    }
}
