//! Durable Storage Contract
//!
//! The bridge never talks to a database directly. Everything it needs from
//! durable storage goes through the `ChatStore` trait: session ownership
//! lookups, resumption-token persistence, turn persistence and history.
//!
//! `InMemoryChatStore` is a process-local implementation used by tests and
//! for running the gateway without a database.

use crate::token::ResumptionToken;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Who authored a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::User => write!(f, "user"),
            ChatRole::Model => write!(f, "model"),
        }
    }
}

/// The durable view of a chat session, as far as the bridge cares.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSessionRecord {
    pub id: String,
    /// The owning child. Tokens stored on this record may only be used by
    /// connections presenting the same identity.
    pub child_id: String,
    pub title: Option<String>,
    pub resumption_token: Option<ResumptionToken>,
}

/// One persisted message of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Transcript text that was in flight when a connection went away.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTurn {
    pub user_text: String,
    pub model_text: String,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Looks up a chat session by its external identifier.
    async fn get_session(&self, id: &str) -> Result<Option<ChatSessionRecord>>;

    /// Stores (or clears, with `None`) the resumption token of a session.
    async fn update_resumption_token(&self, id: &str, token: Option<ResumptionToken>)
    -> Result<()>;

    /// Persists one completed voice turn.
    async fn save_turn(&self, user_text: &str, model_text: &str, session_id: Option<&str>)
    -> Result<()>;

    /// Returns the conversation of a session in chronological order.
    async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Parks transcript text that could not be persisted as a turn yet.
    async fn stash_pending_turn(&self, id: &str, pending: PendingTurn) -> Result<()>;

    /// Removes and returns any parked transcript text for a session.
    async fn take_pending_turn(&self, id: &str) -> Result<Option<PendingTurn>>;

    /// Liveness check for `/health`.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct StoredSession {
    record: Option<ChatSessionRecord>,
    history: Vec<HistoryEntry>,
    pending: Option<PendingTurn>,
}

/// A `ChatStore` that keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryChatStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
    /// Turns saved without a session id.
    orphan_turns: Mutex<Vec<(String, String)>>,
    fail_writes: AtomicBool,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chat session owned by `child_id`.
    pub async fn insert_session(&self, id: &str, child_id: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.entry(id.to_string()).or_default().record = Some(ChatSessionRecord {
            id: id.to_string(),
            child_id: child_id.to_string(),
            title: None,
            resumption_token: None,
        });
    }

    /// Makes every subsequent write fail until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn turn_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.history.len() / 2)
            .unwrap_or(0)
    }

    pub async fn orphan_turns(&self) -> Vec<(String, String)> {
        self.orphan_turns.lock().await.clone()
    }

    pub async fn stored_token(&self, id: &str) -> Option<ResumptionToken> {
        self.sessions
            .lock()
            .await
            .get(id)
            .and_then(|s| s.record.as_ref())
            .and_then(|r| r.resumption_token.clone())
    }

    pub async fn peek_pending_turn(&self, id: &str) -> Option<PendingTurn> {
        self.sessions
            .lock()
            .await
            .get(id)
            .and_then(|s| s.pending.clone())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("storage is unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_session(&self, id: &str) -> Result<Option<ChatSessionRecord>> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(id)
            .and_then(|s| s.record.clone()))
    }

    async fn update_resumption_token(
        &self,
        id: &str,
        token: Option<ResumptionToken>,
    ) -> Result<()> {
        self.check_writable()?;
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(id)
            .and_then(|s| s.record.as_mut())
            .ok_or_else(|| anyhow!("chat session '{}' not found", id))?;
        record.resumption_token = token;
        Ok(())
    }

    async fn save_turn(
        &self,
        user_text: &str,
        model_text: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let Some(id) = session_id else {
            self.orphan_turns
                .lock()
                .await
                .push((user_text.to_string(), model_text.to_string()));
            return Ok(());
        };
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(id.to_string()).or_default();
        session.history.push(HistoryEntry {
            role: ChatRole::User,
            content: user_text.to_string(),
            timestamp: now,
        });
        session.history.push(HistoryEntry {
            role: ChatRole::Model,
            content: model_text.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    async fn get_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default())
    }

    async fn stash_pending_turn(&self, id: &str, pending: PendingTurn) -> Result<()> {
        self.check_writable()?;
        self.sessions
            .lock()
            .await
            .entry(id.to_string())
            .or_default()
            .pending = Some(pending);
        Ok(())
    }

    async fn take_pending_turn(&self, id: &str) -> Result<Option<PendingTurn>> {
        Ok(self
            .sessions
            .lock()
            .await
            .get_mut(id)
            .and_then(|s| s.pending.take()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
