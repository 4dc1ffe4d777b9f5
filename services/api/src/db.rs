//! Data Access Layer
//!
//! Postgres implementation of the bridge's `ChatStore`. Queries are checked at
//! runtime so the crate builds without a live database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use oriel_core::store::{ChatSessionRecord, ChatStore, HistoryEntry, PendingTurn};
use oriel_core::token::ResumptionToken;
use sqlx::PgPool;

use crate::models::{ChatRow, ChatSessionRow, MessageRole, MessageType, PendingTurnRow};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for Db {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSessionRecord>> {
        let row = sqlx::query_as::<_, ChatSessionRow>(
            r#"
            SELECT id, child_id, title, resumption_token, resumption_token_expiration
            FROM chat_sessions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load chat session '{id}'"))?;
        Ok(row.map(Into::into))
    }

    async fn update_resumption_token(
        &self,
        id: &str,
        token: Option<ResumptionToken>,
    ) -> Result<()> {
        let (handle, expires_at) = match token {
            Some(token) => (Some(token.handle), Some(token.expires_at)),
            None => (None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE chat_sessions
            SET resumption_token = $2, resumption_token_expiration = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(handle)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to update resumption token of '{id}'"))?;
        if result.rows_affected() == 0 {
            anyhow::bail!("chat session '{}' not found", id);
        }
        Ok(())
    }

    /// Writes the user row and the model row of one turn in a single transaction.
    async fn save_turn(
        &self,
        user_text: &str,
        model_text: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (role, content) in [(MessageRole::User, user_text), (MessageRole::Model, model_text)] {
            sqlx::query(
                r#"
                INSERT INTO chats (chat_session_id, role, content, type)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(session_id)
            .bind(role)
            .bind(content)
            .bind(MessageType::Voice)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert {role} message"))?;
        }

        if let Some(id) = session_id {
            sqlx::query("UPDATE chat_sessions SET updated_at = NOW() WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, ChatRow>(
            r#"
            SELECT id, chat_session_id, role, content, type, timestamp
            FROM chats
            WHERE chat_session_id = $1
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load history of '{session_id}'"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stash_pending_turn(&self, id: &str, pending: PendingTurn) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chat_sessions
            SET pending_user_text = $2, pending_model_text = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(pending.user_text)
        .bind(pending.model_text)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to stash pending turn of '{id}'"))?;
        Ok(())
    }

    async fn take_pending_turn(&self, id: &str) -> Result<Option<PendingTurn>> {
        let row = sqlx::query_as::<_, PendingTurnRow>(
            r#"
            WITH old AS (
                SELECT id, pending_user_text, pending_model_text
                FROM chat_sessions
                WHERE id = $1
                FOR UPDATE
            )
            UPDATE chat_sessions s
            SET pending_user_text = NULL, pending_model_text = NULL
            FROM old
            WHERE s.id = old.id
            RETURNING old.pending_user_text, old.pending_model_text
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to take pending turn of '{id}'"))?;
        Ok(row.and_then(PendingTurnRow::into_pending))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
