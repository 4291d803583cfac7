//! SQLite implementation of the conversation store.
//!
//! Timestamps are stored as milliseconds since the Unix epoch so ordering is a
//! plain integer comparison.

use super::{ConversationStore, StoreError, UserDirectory};
use crate::model::{
    Conversation, ConversationId, Message, MessageId, ParticipantPair, ReadEntry, UserId,
    UserSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        avatar TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        user_low TEXT NOT NULL,
        user_high TEXT NOT NULL,
        last_message TEXT,
        last_message_sender TEXT,
        last_message_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (user_low, user_high)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS conversations_user_high ON conversations (user_high)",
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations (id),
        sender_id TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS messages_by_conversation ON messages (conversation_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS message_reads (
        message_id TEXT NOT NULL REFERENCES messages (id),
        reader_id TEXT NOT NULL,
        read_at INTEGER NOT NULL,
        PRIMARY KEY (message_id, reader_id)
    )
    "#,
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CONVERSATION_COLUMNS: &str = "id, user_low, user_high, last_message, last_message_sender, \
     last_message_at, created_at, updated_at";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn unavailable(context: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Unavailable(format!("{context}: {e}"))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn parse_id<T: FromStr>(raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad identifier: {raw}")))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// `sqlite::memory:` databases are per-connection, so use a pool of one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be opened.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(unavailable("Invalid database url"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(unavailable("Failed to open database"))?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, "SQLite store ready");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(unavailable("Failed to apply schema"))?;
        }
        Ok(())
    }

    /// Mirror a user record from the identity subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the write fails.
    pub async fn put_user(&self, user: &UserSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, avatar) VALUES (?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE SET name = excluded.name, avatar = excluded.avatar
            "#,
        )
        .bind(user.id.as_str())
        .bind(&user.name)
        .bind(user.avatar.as_deref())
        .execute(&self.pool)
        .await
        .map_err(unavailable("Failed to upsert user"))?;
        Ok(())
    }

    fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, StoreError> {
        let id: String = row.try_get("id").map_err(unavailable("id"))?;
        let low: String = row.try_get("user_low").map_err(unavailable("user_low"))?;
        let high: String = row.try_get("user_high").map_err(unavailable("user_high"))?;
        let participants = ParticipantPair::new(low.into(), high.into())
            .ok_or_else(|| StoreError::Corrupt(format!("conversation {id} has one participant")))?;

        let last_message_at: Option<i64> = row
            .try_get("last_message_at")
            .map_err(unavailable("last_message_at"))?;
        let last_message_sender: Option<String> = row
            .try_get("last_message_sender")
            .map_err(unavailable("last_message_sender"))?;

        Ok(Conversation {
            id: parse_id(&id)?,
            participants,
            last_message: row
                .try_get("last_message")
                .map_err(unavailable("last_message"))?,
            last_message_sender: last_message_sender.map(UserId::from),
            last_message_at: last_message_at.map(timestamp).transpose()?,
            created_at: timestamp(row.try_get("created_at").map_err(unavailable("created_at"))?)?,
            updated_at: timestamp(row.try_get("updated_at").map_err(unavailable("updated_at"))?)?,
        })
    }

    fn message_from_row(row: &SqliteRow) -> Result<Message, StoreError> {
        let id: String = row.try_get("id").map_err(unavailable("id"))?;
        let conversation_id: String = row
            .try_get("conversation_id")
            .map_err(unavailable("conversation_id"))?;
        let sender_id: String = row.try_get("sender_id").map_err(unavailable("sender_id"))?;

        Ok(Message {
            id: parse_id(&id)?,
            conversation_id: parse_id(&conversation_id)?,
            sender_id: sender_id.into(),
            text: row.try_get("text").map_err(unavailable("text"))?,
            read_by: Vec::new(),
            created_at: timestamp(row.try_get("created_at").map_err(unavailable("created_at"))?)?,
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_or_create_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<(Conversation, bool), StoreError> {
        let now = Utc::now().timestamp_millis();

        // The unique (user_low, user_high) index arbitrates concurrent creators.
        let inserted = sqlx::query(
            r#"
            INSERT INTO conversations (id, user_low, user_high, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT (user_low, user_high) DO NOTHING
            "#,
        )
        .bind(ConversationId::generate().to_string())
        .bind(pair.low().as_str())
        .bind(pair.high().as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable("Failed to insert conversation"))?
        .rows_affected()
            == 1;

        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE user_low = ?1 AND user_high = ?2"
        ))
        .bind(pair.low().as_str())
        .bind(pair.high().as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(unavailable("Failed to load conversation"))?;

        let conversation = Self::conversation_from_row(&row)?;
        if inserted {
            debug!(conversation = %conversation.id, "Created conversation");
        }
        Ok((conversation, inserted))
    }

    async fn conversation(&self, id: ConversationId) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("Failed to load conversation"))?;

        row.as_ref().map(Self::conversation_from_row).transpose()
    }

    async fn conversations_for(&self, user: &UserId) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE user_low = ?1 OR user_high = ?1 \
             ORDER BY updated_at DESC, rowid DESC"
        ))
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("Failed to list conversations"))?;

        rows.iter().map(Self::conversation_from_row).collect()
    }

    async fn append_message(
        &self,
        conversation: ConversationId,
        sender: &UserId,
        text: &str,
    ) -> Result<(Message, Conversation), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(unavailable("Failed to start transaction"))?;

        // The summary write comes first so the transaction takes SQLite's write
        // lock up front; a read-then-write upgrade fails with SQLITE_BUSY
        // instead of waiting on the busy timeout.
        let row = sqlx::query(&format!(
            r#"
            UPDATE conversations SET
                last_message = ?2,
                last_message_sender = ?3,
                last_message_at = MAX(?4, COALESCE(last_message_at, ?4)),
                updated_at = MAX(?4, COALESCE(last_message_at, ?4))
            WHERE id = ?1
            RETURNING {CONVERSATION_COLUMNS}
            "#
        ))
        .bind(conversation.to_string())
        .bind(text)
        .bind(sender.as_str())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable("Failed to update conversation summary"))?
        .ok_or(StoreError::ConversationNotFound(conversation))?;
        let created_at: i64 = row
            .try_get("last_message_at")
            .map_err(unavailable("last_message_at"))?;
        let updated = Self::conversation_from_row(&row)?;

        let message = Message {
            id: MessageId::generate(),
            conversation_id: conversation,
            sender_id: sender.clone(),
            text: text.to_string(),
            read_by: Vec::new(),
            created_at: timestamp(created_at)?,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, text, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(message.id.to_string())
        .bind(conversation.to_string())
        .bind(sender.as_str())
        .bind(text)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable("Failed to insert message"))?;

        tx.commit()
            .await
            .map_err(unavailable("Failed to commit transaction"))?;

        Ok((message, updated))
    }

    async fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, text, created_at
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("Failed to list messages"))?;

        let mut messages = rows
            .iter()
            .map(Self::message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let reads = sqlx::query(
            r#"
            SELECT r.message_id, r.reader_id, r.read_at
            FROM message_reads r
            JOIN messages m ON m.id = r.message_id
            WHERE m.conversation_id = ?1
            ORDER BY r.read_at ASC, r.rowid ASC
            "#,
        )
        .bind(conversation.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("Failed to list read entries"))?;

        let mut by_message: HashMap<MessageId, Vec<ReadEntry>> = HashMap::new();
        for row in &reads {
            let message_id: String = row.try_get("message_id").map_err(unavailable("message_id"))?;
            let reader_id: String = row.try_get("reader_id").map_err(unavailable("reader_id"))?;
            let read_at: i64 = row.try_get("read_at").map_err(unavailable("read_at"))?;
            by_message
                .entry(parse_id(&message_id)?)
                .or_default()
                .push(ReadEntry {
                    user_id: reader_id.into(),
                    read_at: timestamp(read_at)?,
                });
        }
        for message in &mut messages {
            if let Some(entries) = by_message.remove(&message.id) {
                message.read_by = entries;
            }
        }

        Ok(messages)
    }

    async fn mark_read(
        &self,
        conversation: ConversationId,
        reader: &UserId,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        // The (message_id, reader_id) key turns concurrent calls into no-ops.
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO message_reads (message_id, reader_id, read_at)
            SELECT id, ?2, ?3 FROM messages WHERE conversation_id = ?1
            "#,
        )
        .bind(conversation.to_string())
        .bind(reader.as_str())
        .bind(at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable("Failed to mark messages read"))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn user(&self, id: &UserId) -> Result<Option<UserSummary>, StoreError> {
        let row = sqlx::query("SELECT id, name, avatar FROM users WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("Failed to load user"))?;

        row.map(|row| user_from_row(&row)).transpose()
    }

    async fn users(&self) -> Result<Vec<UserSummary>, StoreError> {
        let rows = sqlx::query("SELECT id, name, avatar FROM users ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable("Failed to list users"))?;

        rows.iter().map(user_from_row).collect()
    }
}

fn user_from_row(row: &SqliteRow) -> Result<UserSummary, StoreError> {
    let id: String = row.try_get("id").map_err(unavailable("id"))?;
    Ok(UserSummary {
        id: id.into(),
        name: row.try_get("name").map_err(unavailable("name"))?,
        avatar: row.try_get("avatar").map_err(unavailable("avatar"))?,
    })
}
