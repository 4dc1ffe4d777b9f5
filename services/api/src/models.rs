//! Database Models
//!
//! Row types mapped with `sqlx` and their conversions into the storage-neutral
//! records the voice bridge works with.

use chrono::{DateTime, Utc};
use oriel_core::store::{ChatRole, ChatSessionRecord, HistoryEntry, PendingTurn};
use oriel_core::token::ResumptionToken;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[sqlx(type_name = "message_role", rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Model,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Model => write!(f, "model"),
        }
    }
}

impl From<MessageRole> for ChatRole {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::User => ChatRole::User,
            MessageRole::Model => ChatRole::Model,
        }
    }
}

#[derive(sqlx::Type, Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[sqlx(type_name = "message_type", rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Voice,
}

#[derive(FromRow, Debug, Clone)]
pub struct ChatSessionRow {
    pub id: String,
    pub child_id: String,
    pub title: Option<String>,
    pub resumption_token: Option<String>,
    pub resumption_token_expiration: Option<DateTime<Utc>>,
}

impl From<ChatSessionRow> for ChatSessionRecord {
    fn from(row: ChatSessionRow) -> Self {
        // A half-written pair is treated as no token at all.
        let resumption_token = match (row.resumption_token, row.resumption_token_expiration) {
            (Some(handle), Some(expires_at)) if !handle.is_empty() => Some(ResumptionToken {
                handle,
                expires_at,
            }),
            _ => None,
        };
        Self {
            id: row.id,
            child_id: row.child_id,
            title: row.title,
            resumption_token,
        }
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct ChatRow {
    pub id: i64,
    pub chat_session_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    #[sqlx(rename = "type")]
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

impl From<ChatRow> for HistoryEntry {
    fn from(row: ChatRow) -> Self {
        Self {
            role: row.role.into(),
            content: row.content,
            timestamp: row.timestamp,
        }
    }
}

#[derive(FromRow, Debug, Clone, Default)]
pub struct PendingTurnRow {
    pub pending_user_text: Option<String>,
    pub pending_model_text: Option<String>,
}

impl PendingTurnRow {
    /// `None` when nothing was parked.
    pub fn into_pending(self) -> Option<PendingTurn> {
        let pending = PendingTurn {
            user_text: self.pending_user_text.unwrap_or_default(),
            model_text: self.pending_model_text.unwrap_or_default(),
        };
        if pending.user_text.is_empty() && pending.model_text.is_empty() {
            None
        } else {
            Some(pending)
        }
    }
}
