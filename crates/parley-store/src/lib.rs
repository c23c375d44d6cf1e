//! # parley-store
//!
//! SQLite implementations of the Parley identity store and conversation log.
//!
//! One [`SqliteStore`] backs both traits. The schema is created on connect:
//!
//! ```text
//! identities(username PK, credential_hash?, is_online, transport_handle_id?)
//! messages(id PK, sender, recipient, body, timestamp)
//! ```

use async_trait::async_trait;
use parley_core::store::{now_millis, ConversationLog, IdentityStore, NewMessage};
use parley_core::{ConnectionId, Identity, Message, StoreError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS identities (
        username TEXT PRIMARY KEY NOT NULL,
        credential_hash TEXT,
        is_online INTEGER NOT NULL DEFAULT 0,
        transport_handle_id TEXT
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sender TEXT NOT NULL,
        recipient TEXT NOT NULL,
        body TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_pair ON messages (sender, recipient, timestamp)",
];

#[derive(Debug, FromRow)]
struct IdentityRow {
    username: String,
    credential_hash: Option<String>,
    is_online: bool,
    transport_handle_id: Option<String>,
}

impl From<IdentityRow> for Identity {
    fn from(row: IdentityRow) -> Self {
        Identity {
            username: row.username,
            credential_hash: row.credential_hash,
            is_online: row.is_online,
            transport_handle_id: row.transport_handle_id.map(ConnectionId::from),
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    sender: String,
    recipient: String,
    body: String,
    timestamp: i64,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id as u64,
            from: row.sender,
            to: row.recipient,
            message: row.body,
            timestamp: row.timestamp as u64,
        }
    }
}

/// Identity store and conversation log over one SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `url`, creating the file and schema if needed.
    ///
    /// In-memory URLs are pinned to a single long-lived connection, since
    /// every SQLite connection would otherwise see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database cannot be opened.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::backend)?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StoreError::backend)?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, in_memory, "SQLite store ready");
        Ok(store)
    }

    /// Create tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a schema statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(StoreError::backend)?;
        }
        debug!("Schema up to date");
        Ok(())
    }

    /// Reset every identity to offline.
    ///
    /// A process that crashed never ran its disconnect cleanup; calling this
    /// at startup clears the stale flags it left behind. Only correct when
    /// this process is the database's sole writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn reset_presence(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE identities SET is_online = 0, transport_handle_id = NULL WHERE is_online = 1",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "Cleared stale online flags");
        }
        Ok(reset)
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    async fn find(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let row: Option<IdentityRow> = sqlx::query_as(
            "SELECT username, credential_hash, is_online, transport_handle_id
             FROM identities WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(row.map(Identity::from))
    }

    async fn create(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<Identity, StoreError> {
        let result = sqlx::query(
            "INSERT INTO identities (username, credential_hash, is_online) VALUES (?, ?, 0)",
        )
        .bind(username)
        .bind(credential_hash)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Identity::new(username, Some(credential_hash.to_string()))),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Conflict(username.to_string()))
            }
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    async fn set_credential_if_absent(
        &self,
        username: &str,
        credential_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE identities SET credential_hash = ?
             WHERE username = ? AND credential_hash IS NULL",
        )
        .bind(credential_hash)
        .bind(username)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_online(&self, username: &str, handle: &ConnectionId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO identities (username, credential_hash, is_online, transport_handle_id)
             VALUES (?, NULL, 1, ?)
             ON CONFLICT(username) DO UPDATE
             SET is_online = 1, transport_handle_id = excluded.transport_handle_id",
        )
        .bind(username)
        .bind(handle.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;
        Ok(())
    }

    async fn mark_offline(
        &self,
        username: &str,
        handle: &ConnectionId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE identities SET is_online = 0, transport_handle_id = NULL
             WHERE username = ? AND transport_handle_id = ?",
        )
        .bind(username)
        .bind(handle.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn append(&self, message: NewMessage) -> Result<Message, StoreError> {
        // Clamp to the newest stored timestamp so history order never
        // contradicts insertion order.
        let (id, timestamp): (i64, i64) = sqlx::query_as(
            "INSERT INTO messages (sender, recipient, body, timestamp)
             VALUES (?, ?, ?, MAX(?, COALESCE((SELECT MAX(timestamp) FROM messages), 0)))
             RETURNING id, timestamp",
        )
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.message)
        .bind(now_millis() as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(Message {
            id: id as u64,
            from: message.from,
            to: message.to,
            message: message.message,
            timestamp: timestamp as u64,
        })
    }

    async fn history(&self, user1: &str, user2: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, sender, recipient, body, timestamp FROM messages
             WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?)
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(user1)
        .bind(user2)
        .bind(user2)
        .bind(user1)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows.into_iter().map(Message::from).collect())
    }
}
