//! Defines the message protocol between a voice client and the bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens (or resumes) the upstream live session.
    #[serde(rename_all = "camelCase")]
    Start {
        /// A handle from an earlier `resumption_token` push.
        resumption_handle: Option<String>,
        chat_session_id: Option<String>,
        #[serde(default)]
        child_id: String,
        config: Option<StartOptions>,
    },
    /// One base64-encoded PCM16 (16 kHz) chunk.
    AudioChunk { data: String },
    /// Direct text input. Live sessions do not accept it.
    Text {
        #[serde(default)]
        text: String,
        end: Option<bool>,
    },
    /// Intentionally ends the session.
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct StartOptions {
    /// Prebuilt voice name for spoken replies.
    pub voice: Option<String>,
}

/// Response to a single client message.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needs_new_session: Option<bool>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            needs_new_session: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            needs_new_session: None,
        }
    }

    /// The client has to send `start` again before anything else works.
    pub fn needs_new_session(message: impl Into<String>) -> Self {
        Self {
            needs_new_session: Some(true),
            ..Self::error(message)
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEvent {
    Opened,
    Closed,
    Error,
}

/// Unsolicited messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerPush {
    #[serde(rename_all = "camelCase")]
    Event {
        event: ConnectionEvent,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        needs_new_session: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// A raw upstream message, forwarded untouched.
    Server { message: serde_json::Value },
    ResumptionToken {
        token: String,
        expiration: DateTime<Utc>,
    },
    /// The upstream announced it will close soon.
    #[serde(rename = "goaway", rename_all = "camelCase")]
    GoAway {
        time_left: Option<String>,
        will_reconnect: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    GenerationComplete,
}

impl ServerPush {
    pub fn opened() -> Self {
        ServerPush::Event {
            event: ConnectionEvent::Opened,
            reason: None,
            needs_new_session: None,
            message: None,
        }
    }

    pub fn closed(reason: Option<String>, needs_new_session: bool) -> Self {
        ServerPush::Event {
            event: ConnectionEvent::Closed,
            reason,
            needs_new_session: needs_new_session.then_some(true),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerPush::Event {
            event: ConnectionEvent::Error,
            reason: None,
            needs_new_session: None,
            message: Some(message.into()),
        }
    }
}

/// Anything the bridge writes to the client socket.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Outbound {
    Reply(Reply),
    Push(ServerPush),
}

impl From<Reply> for Outbound {
    fn from(reply: Reply) -> Self {
        Outbound::Reply(reply)
    }
}

impl From<ServerPush> for Outbound {
    fn from(push: ServerPush) -> Self {
        Outbound::Push(push)
    }
}
