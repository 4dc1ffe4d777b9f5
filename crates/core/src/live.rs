//! Upstream Live Session Abstraction
//!
//! A `LiveProvider` opens streaming sessions against a generative voice
//! service. Each opened session comes with an ordered channel of
//! `UpstreamEvent`s standing in for the provider's open/message/error/close
//! callbacks.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Events emitted by one upstream session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// The session finished its handshake.
    Opened,
    /// A raw server message.
    Message(serde_json::Value),
    Error(String),
    /// The session is gone. No further events follow.
    Closed { reason: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

/// Session-resumption block of the setup. An empty block (no handle) enables
/// resumption for a fresh session; a handle resumes an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionResumption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Everything needed to open an upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub response_modalities: Vec<ResponseModality>,
    pub input_audio_transcription: bool,
    pub output_audio_transcription: bool,
    pub context_window_compression: bool,
    pub system_instruction: Option<String>,
    /// Prebuilt voice name for spoken replies.
    pub voice: Option<String>,
    pub session_resumption: SessionResumption,
}

impl LiveConfig {
    /// Audio replies, transcription both ways, sliding-window compression.
    pub fn voice_chat(system_instruction: Option<String>) -> Self {
        Self {
            response_modalities: vec![ResponseModality::Audio],
            input_audio_transcription: true,
            output_audio_transcription: true,
            context_window_compression: true,
            system_instruction,
            voice: None,
            session_resumption: SessionResumption::default(),
        }
    }

    pub fn with_resumption_handle(mut self, handle: Option<String>) -> Self {
        self.session_resumption = SessionResumption { handle };
        self
    }

    pub fn with_voice(mut self, voice: Option<String>) -> Self {
        self.voice = voice;
        self
    }

    pub fn is_resuming(&self) -> bool {
        self.session_resumption.handle.is_some()
    }
}

/// A handle to one open upstream session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Sends one base64-encoded PCM16 (16 kHz) chunk.
    async fn send_audio(&self, chunk: &str) -> Result<()>;

    /// Sends out-of-band text context.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// Closes the session. Errors are logged by the implementation.
    async fn close(&self);
}

/// An open session together with its event stream.
pub struct LiveConnection {
    pub session: Box<dyn LiveSession>,
    pub events: mpsc::Receiver<UpstreamEvent>,
}

#[async_trait]
pub trait LiveProvider: Send + Sync {
    async fn open_session(&self, model: &str, config: &LiveConfig) -> Result<LiveConnection>;
}
