//! Handles the real-time WebSocket connection to Google Gemini Live.

use crate::types::{BidiGenerateContentRealtimeInput, BidiGenerateContentSetup, Blob, ClientMessage};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use oriel_core::live::{LiveConfig, LiveConnection, LiveProvider, LiveSession, UpstreamEvent};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const AUDIO_MIME_TYPE: &str = "audio/pcm;rate=16000";

const EVENT_BUFFER: usize = 256;

type GeminiStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens Gemini Live sessions.
#[derive(Clone)]
pub struct GeminiLiveProvider {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

#[async_trait]
impl LiveProvider for GeminiLiveProvider {
    async fn open_session(&self, model: &str, config: &LiveConfig) -> Result<LiveConnection> {
        let (ws_stream, _) = connect_async(self.url())
            .await
            .context("Failed to connect to Gemini Live")?;
        debug!("Connected to Gemini Live WebSocket.");
        let (mut sink, mut stream) = ws_stream.split();

        let setup = ClientMessage::Setup(BidiGenerateContentSetup::from_config(model, config));
        sink.send(WsMessage::Text(serde_json::to_string(&setup)?.into()))
            .await
            .context("Failed to send Gemini setup")?;

        wait_for_setup_complete(&mut stream).await?;
        info!(resuming = config.is_resuming(), "Gemini session setup is complete.");

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        events_tx
            .send(UpstreamEvent::Opened)
            .await
            .map_err(|_| anyhow!("event receiver dropped during setup"))?;
        let reader = tokio::spawn(read_events(stream, events_tx).in_current_span());

        Ok(LiveConnection {
            session: Box::new(GeminiLiveSession {
                sink: Mutex::new(sink),
                reader,
            }),
            events: events_rx,
        })
    }
}

async fn wait_for_setup_complete(stream: &mut SplitStream<GeminiStream>) -> Result<()> {
    while let Some(frame) = stream.next().await {
        let value = match frame.context("Error reading from Gemini during setup")? {
            WsMessage::Text(text) => serde_json::from_str::<serde_json::Value>(text.as_str()),
            WsMessage::Binary(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes),
            WsMessage::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                bail!("Gemini closed the connection during setup: {reason}");
            }
            _ => continue,
        };
        match value {
            Ok(value) if value.get("setupComplete").is_some() => return Ok(()),
            Ok(value) => warn!(message = %value, "Unexpected message during Gemini setup"),
            Err(e) => error!(error = %e, "Failed to parse Gemini message during setup"),
        }
    }
    bail!("Gemini connection ended before setup completed")
}

/// Turns server frames into events until the socket closes or the receiver
/// goes away. Always ends with `Closed` if anyone is still listening.
async fn read_events(mut stream: SplitStream<GeminiStream>, events: mpsc::Sender<UpstreamEvent>) {
    while let Some(frame) = stream.next().await {
        let event = match frame {
            Ok(WsMessage::Text(text)) => parse_frame(text.as_str().as_bytes()),
            Ok(WsMessage::Binary(bytes)) => parse_frame(&bytes),
            Ok(WsMessage::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                info!(reason = ?reason, "Gemini WebSocket closed by server.");
                let _ = events.send(UpstreamEvent::Closed { reason }).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("Error reading from Gemini WebSocket: {}", e);
                let _ = events.send(UpstreamEvent::Error(e.to_string())).await;
                let _ = events
                    .send(UpstreamEvent::Closed {
                        reason: Some(e.to_string()),
                    })
                    .await;
                return;
            }
        };
        if events.send(event).await.is_err() {
            debug!("Gemini event receiver dropped; stopping reader.");
            return;
        }
    }
    let _ = events.send(UpstreamEvent::Closed { reason: None }).await;
}

fn parse_frame(bytes: &[u8]) -> UpstreamEvent {
    match serde_json::from_slice(bytes) {
        Ok(value) => UpstreamEvent::Message(value),
        Err(e) => UpstreamEvent::Error(format!("Unparseable Gemini frame: {e}")),
    }
}

/// One open Gemini Live session.
pub struct GeminiLiveSession {
    sink: Mutex<SplitSink<GeminiStream, WsMessage>>,
    reader: JoinHandle<()>,
}

impl GeminiLiveSession {
    async fn send_json(&self, message: &ClientMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(payload.into()))
            .await
            .context("Failed to write to Gemini Live")
    }
}

#[async_trait]
impl LiveSession for GeminiLiveSession {
    async fn send_audio(&self, chunk: &str) -> Result<()> {
        self.send_json(&ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Some(Blob {
                mime_type: AUDIO_MIME_TYPE.to_string(),
                data: chunk.to_string(),
            }),
            ..Default::default()
        }))
        .await
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_json(&ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
            text: Some(text.to_string()),
            ..Default::default()
        }))
        .await
    }

    async fn close(&self) {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "Error closing Gemini WebSocket");
        }
    }
}

impl Drop for GeminiLiveSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_carries_the_api_key() {
        let provider = GeminiLiveProvider::new("secret").with_endpoint("wss://example.test/live");
        assert_eq!(provider.url(), "wss://example.test/live?key=secret");
    }

    #[test]
    fn test_frames_become_messages_or_errors() {
        let event = parse_frame(br#"{"setupComplete":{}}"#);
        assert_eq!(
            event,
            UpstreamEvent::Message(serde_json::json!({ "setupComplete": {} }))
        );
        assert!(matches!(parse_frame(b"not json"), UpstreamEvent::Error(_)));
    }
}
