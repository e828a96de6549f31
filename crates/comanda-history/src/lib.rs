//! Conversation history persistence for Comanda.
//!
//! Tracks, per customer, when the gateway last exchanged messages with them.
//! The onboarding logic uses this to decide whether a customer should be
//! (re-)sent the menu before their order is relayed.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use comanda_core::error::ComandaError;

/// SQLite-backed store of customer conversations.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

/// One recorded conversation row.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub user_id: String,
    pub conversation_id: String,
    pub updated_at: DateTime<Utc>,
}

impl HistoryStore {
    /// Open (or create) the history database at the given path.
    pub async fn new(db_path: &str) -> Result<Self, ComandaError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| ComandaError::History(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| ComandaError::History(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, ComandaError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ComandaError::History(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ComandaError::History(e.to_string()))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), ComandaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, conversation_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ComandaError::History(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversations_user
             ON conversations(user_id, updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ComandaError::History(e.to_string()))?;
        Ok(())
    }

    /// Most recent interaction timestamp for a customer, if any.
    pub async fn last_interaction(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, ComandaError> {
        let row = sqlx::query(
            "SELECT updated_at FROM conversations
             WHERE user_id = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ComandaError::History(e.to_string()))?;

        match row {
            Some(row) => {
                let raw: String = row.get("updated_at");
                let ts = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| ComandaError::History(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc);
                Ok(Some(ts))
            }
            None => Ok(None),
        }
    }

    /// Record a completed exchange, stamping the conversation with `now`.
    pub async fn record_exchange(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), ComandaError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations (user_id, conversation_id, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT(user_id, conversation_id)
             DO UPDATE SET updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(conversation_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| ComandaError::History(e.to_string()))?;
        Ok(())
    }

    /// All conversations for a customer, newest first.
    pub async fn conversations_for(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationRecord>, ComandaError> {
        let rows = sqlx::query(
            "SELECT user_id, conversation_id, updated_at FROM conversations
             WHERE user_id = ? ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ComandaError::History(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let raw: String = row.get("updated_at");
                let updated_at = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| ComandaError::History(format!("bad timestamp: {e}")))?
                    .with_timezone(&Utc);
                Ok(ConversationRecord {
                    user_id: row.get("user_id"),
                    conversation_id: row.get("conversation_id"),
                    updated_at,
                })
            })
            .collect()
    }
}
