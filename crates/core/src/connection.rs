//! Connection Session Store
//!
//! `ConnectionState` is the mutable state of one client connection. It is
//! owned by that connection's bridge task and never shared. What other parts
//! of the process may look at (health checks, diagnostics) is published as a
//! `ConnectionSnapshot` into the `ConnectionRegistry`.

use crate::error::BridgeError;
use crate::live::LiveSession;
use crate::reconnect::SessionPhase;
use crate::token::ResumptionToken;
use crate::turn::{Debounce, TurnAssembler};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Audio statistics are logged once per this many chunks.
pub const AUDIO_LOG_INTERVAL: u64 = 20;

pub struct ConnectionState {
    pub connection_id: Uuid,
    pub chat_session_id: Option<String>,
    pub child_id: Option<String>,
    /// Replaced, never mutated, on reconnect.
    pub upstream_session: Option<Box<dyn LiveSession>>,
    pub turns: TurnAssembler,
    pub debounce: Debounce,
    pub resumption_token: Option<ResumptionToken>,
    pub reconnect_attempts: u32,
    /// True from the close that started a reconnect until the new session is stored.
    pub reconnecting: bool,
    pub intentional_stop: bool,
    pub phase: SessionPhase,
    /// Whether the client has already seen `opened` for this logical session.
    pub opened_notified: bool,
    pub audio_chunks: u64,
    pub audio_bytes: u64,
    pub connected_at: DateTime<Utc>,
}

impl ConnectionState {
    pub fn new(connection_id: Uuid, turn_debounce: Duration) -> Self {
        Self {
            connection_id,
            chat_session_id: None,
            child_id: None,
            upstream_session: None,
            turns: TurnAssembler::new(),
            debounce: Debounce::new(turn_debounce),
            resumption_token: None,
            reconnect_attempts: 0,
            reconnecting: false,
            intentional_stop: false,
            phase: SessionPhase::Idle,
            opened_notified: false,
            audio_chunks: 0,
            audio_bytes: 0,
            connected_at: Utc::now(),
        }
    }

    /// Binds the external identities. They are set once; asking for different
    /// ones later is an error, asking for the same ones again is fine.
    pub fn bind_identity(&mut self, chat_session_id: Option<&str>, child_id: &str) -> Result<(), BridgeError> {
        if let Some(bound) = &self.child_id {
            if bound != child_id {
                return Err(BridgeError::SessionRebind(
                    self.chat_session_id.clone().unwrap_or_default(),
                ));
            }
        }
        match (&self.chat_session_id, chat_session_id) {
            (Some(bound), Some(requested)) if bound != requested => {
                return Err(BridgeError::SessionRebind(bound.clone()));
            }
            (None, Some(requested)) if self.child_id.is_some() => {
                // An anonymous session cannot be attached to a chat afterwards.
                return Err(BridgeError::SessionRebind(requested.to_string()));
            }
            _ => {}
        }
        if self.chat_session_id.is_none() {
            self.chat_session_id = chat_session_id.map(str::to_string);
        }
        self.child_id = Some(child_id.to_string());
        Ok(())
    }

    /// Counts one forwarded audio chunk. Returns true when the running totals
    /// are due for logging.
    pub fn record_audio(&mut self, encoded: &str) -> bool {
        self.audio_chunks += 1;
        self.audio_bytes += (encoded.len() as u64 * 3) / 4;
        self.audio_chunks % AUDIO_LOG_INTERVAL == 0
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: self.connection_id,
            chat_session_id: self.chat_session_id.clone(),
            child_id: self.child_id.clone(),
            phase: self.phase,
            reconnect_attempts: self.reconnect_attempts,
            has_resumption_token: self.resumption_token.is_some(),
            connected_at: self.connected_at,
        }
    }
}

/// Read-only view of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connection_id: Uuid,
    pub chat_session_id: Option<String>,
    pub child_id: Option<String>,
    pub phase: SessionPhase,
    pub reconnect_attempts: u32,
    pub has_resumption_token: bool,
    pub connected_at: DateTime<Utc>,
}

/// All live connections of this process, keyed by connection id.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionSnapshot>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry of `snapshot.connection_id`.
    pub async fn upsert(&self, snapshot: ConnectionSnapshot) {
        self.connections
            .write()
            .await
            .insert(snapshot.connection_id, snapshot);
    }

    pub async fn remove(&self, connection_id: &Uuid) -> Option<ConnectionSnapshot> {
        self.connections.write().await.remove(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
