//! Resumption Token Lifecycle
//!
//! The upstream service periodically hands out opaque resumption handles.
//! This module decides whether a handle may still be used and keeps the
//! in-memory and durable copies in step.

use crate::error::BridgeError;
use crate::store::{ChatSessionRecord, ChatStore};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A resumption handle together with its expiry.
///
/// Handle and expiry only ever exist as a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumptionToken {
    pub handle: String,
    pub expires_at: DateTime<Utc>,
}

impl ResumptionToken {
    pub fn issue(handle: impl Into<String>, now: DateTime<Utc>, ttl: TimeDelta) -> Self {
        Self {
            handle: handle.into(),
            expires_at: now + ttl,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        is_valid(Some(&self.handle), Some(self.expires_at), now)
    }
}

/// Strict validity check. A missing handle or a missing expiry is never valid.
pub fn is_valid(handle: Option<&str>, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match (handle, expires_at) {
        (Some(handle), Some(expires_at)) if !handle.is_empty() => now < expires_at,
        _ => false,
    }
}

/// Owns the resumability contract for chat sessions.
#[derive(Clone)]
pub struct TokenManager {
    store: Arc<dyn ChatStore>,
    ttl: TimeDelta,
}

impl TokenManager {
    pub fn new(store: Arc<dyn ChatStore>, ttl: TimeDelta) -> Self {
        Self { store, ttl }
    }

    /// Records a freshly issued handle in `slot` and in durable storage.
    ///
    /// A durable write failure is logged; the in-memory copy stays authoritative
    /// for this process.
    pub async fn on_token_issued(
        &self,
        slot: &mut Option<ResumptionToken>,
        chat_session_id: Option<&str>,
        handle: String,
    ) -> ResumptionToken {
        let token = ResumptionToken::issue(handle, Utc::now(), self.ttl);
        *slot = Some(token.clone());
        debug!(expires_at = %token.expires_at, "Stored new resumption token");
        if let Some(id) = chat_session_id {
            self.persist(id, Some(token.clone())).await;
        }
        token
    }

    /// Loads the chat session and checks that `child_id` owns it.
    pub async fn verify_owner(
        &self,
        chat_session_id: &str,
        child_id: &str,
    ) -> Result<ChatSessionRecord, BridgeError> {
        let record = self
            .store
            .get_session(chat_session_id)
            .await?
            .ok_or_else(|| BridgeError::SessionNotFound(chat_session_id.to_string()))?;
        if record.child_id != child_id {
            warn!(chat_session_id, "Resumption requested by a child that does not own the session");
            return Err(BridgeError::OwnershipMismatch(chat_session_id.to_string()));
        }
        Ok(record)
    }

    /// Returns the durable token of an already verified record if it is still
    /// usable. An expired token is cleared from storage.
    pub async fn resume_from_record(&self, record: &ChatSessionRecord) -> Option<ResumptionToken> {
        let token = record.resumption_token.as_ref()?;
        if token.is_valid_at(Utc::now()) {
            info!(chat_session_id = %record.id, expires_at = %token.expires_at, "Found resumable upstream session");
            Some(token.clone())
        } else {
            info!(chat_session_id = %record.id, "Stored resumption token has expired");
            self.persist(&record.id, None).await;
            None
        }
    }

    /// Ownership check plus durable lookup in one step.
    pub async fn try_resume(
        &self,
        chat_session_id: &str,
        child_id: &str,
    ) -> Result<Option<ResumptionToken>, BridgeError> {
        let record = self.verify_owner(chat_session_id, child_id).await?;
        Ok(self.resume_from_record(&record).await)
    }

    /// Clears the token from memory and from durable storage.
    pub async fn invalidate(&self, slot: &mut Option<ResumptionToken>, chat_session_id: Option<&str>) {
        *slot = None;
        if let Some(id) = chat_session_id {
            self.persist(id, None).await;
        }
    }

    pub async fn persist(&self, chat_session_id: &str, token: Option<ResumptionToken>) {
        if let Err(e) = self
            .store
            .update_resumption_token(chat_session_id, token)
            .await
        {
            warn!(chat_session_id, error = ?e, "Failed to persist resumption token");
        }
    }
}
