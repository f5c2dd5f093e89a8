use super::{
    Conversation, ConversationMode, ConversationStatus, ConversationStore, Direction, Feedback,
    FeedbackKind, Message, NewFeedback, NewMessage,
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::task::spawn_blocking;
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    phone TEXT NOT NULL UNIQUE,
    contact_name TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    mode TEXT NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    last_message_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    direction TEXT NOT NULL,
    content TEXT NOT NULL,
    provider_message_id TEXT,
    processed_by_ai INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, created_at, seq);

CREATE TABLE IF NOT EXISTS feedback (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    message_id TEXT NOT NULL REFERENCES messages(id),
    kind TEXT NOT NULL,
    comment TEXT,
    correction TEXT,
    staff_id TEXT,
    created_at TEXT NOT NULL
);
"#;

const CONVERSATION_COLUMNS: &str = "id, phone, contact_name, status, mode, message_count, \
     last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, direction, content, provider_message_id, processed_by_ai, created_at";
const FEEDBACK_COLUMNS: &str =
    "id, conversation_id, message_id, kind, comment, correction, staff_id, created_at";

/// SQLite-backed store. One connection behind a mutex; queries run on the
/// blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("initialize sqlite schema")?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;
            func(&guard)
        })
        .await
        .context("sqlite task panicked")?
    }
}

fn ts(value: DateTime<Utc>) -> String {
    // Fixed-width so lexical order matches time order.
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid(value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_text_enum<T>(value: &str, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unexpected value {value:?}").into(),
        )
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let last_message_at: Option<String> = row.get(6)?;
    Ok(Conversation {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        phone: row.get(1)?,
        contact_name: row.get(2)?,
        status: parse_text_enum(&row.get::<_, String>(3)?, ConversationStatus::parse)?,
        mode: parse_text_enum(&row.get::<_, String>(4)?, ConversationMode::parse)?,
        message_count: row.get::<_, i64>(5)?.max(0) as u64,
        last_message_at: last_message_at.as_deref().map(parse_ts).transpose()?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
        updated_at: parse_ts(&row.get::<_, String>(8)?)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        conversation_id: parse_uuid(&row.get::<_, String>(1)?)?,
        direction: parse_text_enum(&row.get::<_, String>(2)?, Direction::parse)?,
        content: row.get(3)?,
        provider_message_id: row.get(4)?,
        processed_by_ai: row.get::<_, i64>(5)? != 0,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn feedback_from_row(row: &Row<'_>) -> rusqlite::Result<Feedback> {
    Ok(Feedback {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        conversation_id: parse_uuid(&row.get::<_, String>(1)?)?,
        message_id: parse_uuid(&row.get::<_, String>(2)?)?,
        kind: parse_text_enum(&row.get::<_, String>(3)?, FeedbackKind::parse)?,
        comment: row.get(4)?,
        correction: row.get(5)?,
        staff_id: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            conversation_from_row,
        )
        .optional()?)
}

fn load_conversation_by_phone(conn: &Connection, phone: &str) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE phone = ?1"),
            params![phone],
            conversation_from_row,
        )
        .optional()?)
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn upsert_conversation(&self, phone: &str, contact_name: &str) -> Result<Conversation> {
        let phone = phone.to_string();
        let contact_name = contact_name.to_string();
        self.with_conn(move |conn| {
            let now = ts(Utc::now());
            conn.execute(
                "INSERT INTO conversations (id, phone, contact_name, status, mode, message_count, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6) \
                 ON CONFLICT(phone) DO UPDATE SET \
                 contact_name = CASE WHEN excluded.contact_name <> '' \
                     AND excluded.contact_name <> conversations.contact_name \
                     THEN excluded.contact_name ELSE conversations.contact_name END, \
                 updated_at = CASE WHEN excluded.contact_name <> '' \
                     AND excluded.contact_name <> conversations.contact_name \
                     THEN excluded.updated_at ELSE conversations.updated_at END",
                params![
                    Uuid::new_v4().to_string(),
                    phone,
                    contact_name,
                    ConversationStatus::Active.as_str(),
                    ConversationMode::Bot.as_str(),
                    now,
                ],
            )
            .context("upsert conversation")?;
            load_conversation_by_phone(conn, &phone)?
                .ok_or_else(|| anyhow!("conversation for {phone} vanished after upsert"))
        })
        .await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| load_conversation(conn, &id.to_string()))
            .await
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<Conversation>> {
        let phone = phone.to_string();
        self.with_conn(move |conn| load_conversation_by_phone(conn, &phone))
            .await
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations \
                 ORDER BY COALESCE(last_message_at, created_at) DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], conversation_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn set_mode(&self, id: Uuid, mode: ConversationMode) -> Result<Option<Conversation>> {
        self.with_conn(move |conn| {
            let id = id.to_string();
            let changed = conn.execute(
                "UPDATE conversations SET mode = ?1, updated_at = ?2 WHERE id = ?3",
                params![mode.as_str(), ts(Utc::now()), id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            load_conversation(conn, &id)
        })
        .await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let conv_id = message.conversation_id.to_string();
            let last: Option<Option<String>> = tx
                .query_row(
                    "SELECT last_message_at FROM conversations WHERE id = ?1",
                    params![conv_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(last) = last else {
                return Err(anyhow!("unknown conversation {conv_id}"));
            };

            let now = Utc::now();
            let created_at = match last.as_deref().map(parse_ts).transpose()? {
                Some(last) => last.max(now),
                None => now,
            };

            let stored = Message {
                id: Uuid::new_v4(),
                conversation_id: message.conversation_id,
                direction: message.direction,
                content: message.content,
                provider_message_id: message.provider_message_id,
                processed_by_ai: message.processed_by_ai,
                created_at,
            };
            let created = ts(created_at);
            tx.execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    stored.id.to_string(),
                    conv_id,
                    stored.direction.as_str(),
                    stored.content,
                    stored.provider_message_id,
                    stored.processed_by_ai as i64,
                    created,
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET message_count = message_count + 1, \
                 last_message_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![created, conv_id],
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                    params![id.to_string()],
                    message_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn recent_messages(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 \
                 ORDER BY created_at DESC, seq DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), limit],
                message_from_row,
            )?;
            let mut out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            out.reverse();
            Ok(out)
        })
        .await
    }

    async fn insert_feedback(&self, feedback: NewFeedback) -> Result<Feedback> {
        self.with_conn(move |conn| {
            let stored = Feedback {
                id: Uuid::new_v4(),
                conversation_id: feedback.conversation_id,
                message_id: feedback.message_id,
                kind: feedback.kind,
                comment: feedback.comment,
                correction: feedback.correction,
                staff_id: feedback.staff_id,
                created_at: Utc::now(),
            };
            conn.execute(
                &format!(
                    "INSERT INTO feedback ({FEEDBACK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    stored.id.to_string(),
                    stored.conversation_id.to_string(),
                    stored.message_id.to_string(),
                    stored.kind.as_str(),
                    stored.comment,
                    stored.correction,
                    stored.staff_id,
                    ts(stored.created_at),
                ],
            )
            .context("insert feedback")?;
            Ok(stored)
        })
        .await
    }

    async fn list_feedback(&self) -> Result<Vec<Feedback>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {FEEDBACK_COLUMNS} FROM feedback ORDER BY created_at DESC, seq DESC"
            ))?;
            let rows = stmt.query_map([], feedback_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}
