//! Scriptable in-process upstream used by the unit tests.

use crate::live::{LiveConfig, LiveConnection, LiveProvider, LiveSession, UpstreamEvent};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What one fake session saw.
#[derive(Debug, Default)]
pub struct SessionLog {
    pub audio: Vec<String>,
    pub texts: Vec<String>,
    pub closed: bool,
    pub fail_audio: bool,
}

/// Test-side handle to a session the fake provider opened.
#[derive(Clone)]
pub struct FakeSessionHandle {
    pub events: mpsc::Sender<UpstreamEvent>,
    pub log: Arc<Mutex<SessionLog>>,
}

impl FakeSessionHandle {
    pub async fn emit(&self, event: UpstreamEvent) {
        self.events.send(event).await.unwrap();
    }

    pub async fn emit_json(&self, message: serde_json::Value) {
        self.emit(UpstreamEvent::Message(message)).await;
    }

    pub fn audio(&self) -> Vec<String> {
        self.log.lock().unwrap().audio.clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.log.lock().unwrap().texts.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().unwrap().closed
    }

    pub fn fail_audio(&self) {
        self.log.lock().unwrap().fail_audio = true;
    }
}

struct FakeSession {
    handle: FakeSessionHandle,
}

#[async_trait]
impl LiveSession for FakeSession {
    async fn send_audio(&self, chunk: &str) -> Result<()> {
        let mut log = self.handle.log.lock().unwrap();
        if log.fail_audio || log.closed {
            bail!("socket closed");
        }
        log.audio.push(chunk.to_string());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.handle.log.lock().unwrap().texts.push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.handle.log.lock().unwrap().closed = true;
        let _ = self.handle.events.try_send(UpstreamEvent::Closed {
            reason: Some("closed by client".into()),
        });
    }
}

#[derive(Default)]
struct ProviderState {
    failures_left: u32,
    opens: Vec<LiveConfig>,
    sessions: Vec<FakeSessionHandle>,
}

/// Opens fake sessions that announce themselves with `Opened` right away.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().unwrap().failures_left = count;
    }

    /// Configs of every open attempt, failed ones included.
    pub fn opens(&self) -> Vec<LiveConfig> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn session(&self, index: usize) -> FakeSessionHandle {
        self.state.lock().unwrap().sessions[index].clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }
}

#[async_trait]
impl LiveProvider for FakeProvider {
    async fn open_session(&self, _model: &str, config: &LiveConfig) -> Result<LiveConnection> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(config.clone());
        if state.failures_left > 0 {
            state.failures_left -= 1;
            bail!("upstream unavailable");
        }
        let (tx, rx) = mpsc::channel(64);
        tx.try_send(UpstreamEvent::Opened)?;
        let handle = FakeSessionHandle {
            events: tx,
            log: Arc::default(),
        };
        state.sessions.push(handle.clone());
        Ok(LiveConnection {
            session: Box::new(FakeSession { handle }),
            events: rx,
        })
    }
}
