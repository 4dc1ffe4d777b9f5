//! Live Session Bridge
//!
//! One `VoiceBridge` serves one client connection. It owns the connection's
//! state outright and is driven by a single loop that serializes the four
//! things that can touch that state: client frames, upstream events, the
//! turn debounce timer and completion of a reconnect episode.

use crate::connection::{ConnectionRegistry, ConnectionSnapshot, ConnectionState};
use crate::error::BridgeError;
use crate::live::{LiveConfig, LiveConnection, LiveProvider, LiveSession, UpstreamEvent};
use crate::live_message::LiveServerMessage;
use crate::prompt::PromptProvider;
use crate::protocol::{ClientMessage, Outbound, Reply, ServerPush};
use crate::reconnect::{
    CloseDecision, ReconnectOutcome, ReconnectPlan, SessionPhase, TerminateReason, decide_on_close,
    run_reconnect,
};
use crate::settings::BridgeSettings;
use crate::store::{ChatStore, HistoryEntry};
use crate::token::{ResumptionToken, TokenManager};
use crate::turn::wait_for;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

const RECONNECTING: &str = "reconnecting";

/// One frame received from the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// A JSON-encoded `ClientMessage`.
    Text(String),
    /// Raw PCM16 audio.
    Binary(Vec<u8>),
}

/// Collaborators shared by every connection.
#[derive(Clone)]
pub struct BridgeDeps {
    pub provider: Arc<dyn LiveProvider>,
    pub store: Arc<dyn ChatStore>,
    pub prompts: Arc<dyn PromptProvider>,
    pub registry: ConnectionRegistry,
    pub settings: BridgeSettings,
}

pub struct VoiceBridge {
    deps: BridgeDeps,
    tokens: TokenManager,
    state: ConnectionState,
    /// Events of the current upstream session. Dropped as soon as that session
    /// closes so its tail can never reach a successor.
    events: Option<mpsc::Receiver<UpstreamEvent>>,
    reconnect: Option<JoinHandle<ReconnectOutcome>>,
    /// Setup of the current logical session, without a resumption handle.
    base_config: Option<LiveConfig>,
    published: Option<ConnectionSnapshot>,
    outbound: mpsc::Sender<Outbound>,
}

impl VoiceBridge {
    pub fn new(deps: BridgeDeps, outbound: mpsc::Sender<Outbound>) -> Self {
        let tokens = TokenManager::new(deps.store.clone(), deps.settings.token_ttl);
        let state = ConnectionState::new(Uuid::new_v4(), deps.settings.turn_debounce);
        Self {
            deps,
            tokens,
            state,
            events: None,
            reconnect: None,
            base_config: None,
            published: None,
            outbound,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.state.connection_id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Serves the connection until the client side of `inbound` goes away.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<ClientFrame>) {
        info!("Voice connection opened");
        self.publish().await;

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_client_frame(frame).await,
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_upstream(event).await,
                _ = wait_for(self.state.debounce.deadline()) => self.on_debounce_elapsed().await,
                result = join_reconnect(&mut self.reconnect) => self.finish_reconnect(result).await,
            }
            self.publish().await;
        }

        self.teardown().await;
    }

    async fn handle_client_frame(&mut self, frame: ClientFrame) {
        let reply = match frame {
            ClientFrame::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_message(message).await,
                Err(e) => {
                    warn!(error = %e, "Rejecting malformed client message");
                    Reply::error(format!("invalid message: {e}"))
                }
            },
            ClientFrame::Binary(bytes) => self.audio(BASE64.encode(bytes)).await,
        };
        self.send(reply).await;
    }

    async fn handle_message(&mut self, message: ClientMessage) -> Reply {
        match message {
            ClientMessage::Start {
                resumption_handle,
                chat_session_id,
                child_id,
                config,
            } => {
                let voice = config.and_then(|c| c.voice);
                match self
                    .start(resumption_handle, chat_session_id, &child_id, voice)
                    .await
                {
                    Ok(()) => Reply::ok(),
                    Err(e) => {
                        warn!(error = %e, "Start rejected");
                        Reply::error(e.to_string())
                    }
                }
            }
            ClientMessage::AudioChunk { data } => self.audio(data).await,
            ClientMessage::Text { .. } => Reply::error("text input not supported"),
            ClientMessage::Stop => self.stop().await,
            ClientMessage::Unknown => Reply::error("Unknown message type"),
        }
    }

    async fn start(
        &mut self,
        resumption_handle: Option<String>,
        chat_session_id: Option<String>,
        child_id: &str,
        voice: Option<String>,
    ) -> Result<(), BridgeError> {
        let idle = matches!(self.state.phase, SessionPhase::Idle | SessionPhase::Terminated);
        let abandoned = self.state.phase == SessionPhase::Active
            && self.state.upstream_session.is_none()
            && !self.state.reconnecting;
        if !(idle || abandoned) {
            return Err(BridgeError::InvalidPhase(self.state.phase));
        }
        let child_id = child_id.trim();
        if child_id.is_empty() {
            return Err(BridgeError::MissingIdentity);
        }

        let chat_session_id = chat_session_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| self.state.chat_session_id.clone());
        let durable = match chat_session_id.as_deref() {
            Some(id) => self.tokens.try_resume(id, child_id).await?,
            None => None,
        };
        self.state.bind_identity(chat_session_id.as_deref(), child_id)?;
        if let Some(id) = self.state.chat_session_id.as_deref() {
            Span::current().record("chat_session_id", id);
        }

        self.state.phase = SessionPhase::Starting;
        self.events = None;

        // A client-supplied handle wins over the durable one.
        let client_handle = resumption_handle.filter(|h| !h.trim().is_empty());
        let stored = if client_handle.is_some() { None } else { durable };
        let handle = client_handle.or_else(|| stored.as_ref().map(|t| t.handle.clone()));
        let mut resumed = handle.is_some();

        let base = LiveConfig::voice_chat(self.system_instruction().await).with_voice(voice);
        let connection = match self.open(&base, handle).await {
            Ok(connection) => connection,
            Err(e) if resumed => {
                warn!(error = %e, "Upstream rejected the resumption handle; starting fresh");
                if stored.is_some() {
                    self.tokens
                        .invalidate(
                            &mut self.state.resumption_token,
                            self.state.chat_session_id.as_deref(),
                        )
                        .await;
                }
                resumed = false;
                self.open(&base, None).await.map_err(|e| {
                    self.state.phase = SessionPhase::Idle;
                    BridgeError::Upstream(e)
                })?
            }
            Err(e) => {
                self.state.phase = SessionPhase::Idle;
                return Err(BridgeError::Upstream(e));
            }
        };

        // Only a durable token that was actually used survives the start. A
        // client handle is not trusted until upstream issues a new one.
        self.state.resumption_token = if resumed { stored } else { None };
        let LiveConnection { session, events } = connection;
        if !resumed {
            self.send_history(session.as_ref()).await;
        }
        self.seed_pending_turn().await;

        self.state.upstream_session = Some(session);
        self.events = Some(events);
        self.base_config = Some(base);
        self.state.reconnect_attempts = 0;
        self.state.reconnecting = false;
        self.state.intentional_stop = false;
        self.state.opened_notified = false;
        self.state.phase = SessionPhase::Active;
        info!(
            chat_session_id = ?self.state.chat_session_id,
            resumed,
            "Live session started"
        );
        Ok(())
    }

    async fn open(&self, base: &LiveConfig, handle: Option<String>) -> anyhow::Result<LiveConnection> {
        let config = base.clone().with_resumption_handle(handle);
        self.deps
            .provider
            .open_session(&self.deps.settings.model, &config)
            .await
    }

    async fn system_instruction(&self) -> Option<String> {
        let title = self.deps.settings.system_prompt_title.as_str();
        let prompt = self.deps.prompts.prompt_by_title(title).await;
        if prompt.is_none() {
            warn!(title, "System prompt not found; opening without one");
        }
        prompt
    }

    /// Gives a fresh upstream session the conversation so far.
    async fn send_history(&self, session: &dyn LiveSession) {
        let Some(id) = self.state.chat_session_id.as_deref() else {
            return;
        };
        match self.deps.store.get_history(id).await {
            Ok(history) if history.is_empty() => {}
            Ok(history) => match session.send_text(&history_block(&history)).await {
                Ok(()) => debug!(entries = history.len(), "Sent conversation history"),
                Err(e) => warn!(error = %e, "Failed to send conversation history"),
            },
            Err(e) => warn!(error = ?e, "Failed to load conversation history"),
        }
    }

    async fn seed_pending_turn(&mut self) {
        let Some(id) = self.state.chat_session_id.as_deref() else {
            return;
        };
        match self.deps.store.take_pending_turn(id).await {
            Ok(Some(pending)) => {
                debug!("Carrying forward unsaved transcript");
                self.state.turns.seed(pending);
            }
            Ok(None) => {}
            Err(e) => warn!(error = ?e, "Failed to load unsaved transcript"),
        }
    }

    async fn audio(&mut self, data: String) -> Reply {
        if self.state.record_audio(&data) {
            debug!(
                chunks = self.state.audio_chunks,
                bytes = self.state.audio_bytes,
                "Audio received"
            );
        }
        let Some(session) = self.state.upstream_session.as_ref() else {
            return if self.state.reconnecting {
                Reply::error(RECONNECTING)
            } else {
                Reply::needs_new_session("No active session. Send start first.")
            };
        };
        let sent = session.send_audio(&data).await;
        match sent {
            Ok(()) => Reply::ok(),
            Err(e) if self.state.reconnecting => {
                debug!(error = %e, "Dropping audio while reconnecting");
                Reply::error(RECONNECTING)
            }
            Err(e) => {
                warn!(error = %e, "Failed to forward audio; abandoning upstream session");
                self.abandon_upstream().await;
                Reply::needs_new_session(format!("Failed to send audio: {e}"))
            }
        }
    }

    /// Gives up on a session that can no longer carry audio. No reconnect.
    async fn abandon_upstream(&mut self) {
        self.events = None;
        self.state.debounce.cancel();
        self.flush().await;
        if let Some(session) = self.state.upstream_session.take() {
            session.close().await;
        }
        self.state.phase = SessionPhase::Terminated;
    }

    async fn stop(&mut self) -> Reply {
        // Must be set before the close event can be seen.
        self.state.intentional_stop = true;
        if let Some(task) = self.reconnect.take() {
            task.abort();
            info!("Cancelled reconnect in progress");
        }
        self.state.reconnecting = false;
        self.state.debounce.cancel();
        self.flush().await;
        self.stash_pending().await;
        if let Some(session) = self.state.upstream_session.take() {
            session.close().await;
        }
        self.state.phase = SessionPhase::Terminated;
        info!("Session stopped by client");
        Reply::ok()
    }

    async fn handle_upstream(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Opened => {
                if self.state.opened_notified {
                    debug!("Upstream reopened; client already notified");
                } else {
                    self.state.opened_notified = true;
                    self.send(ServerPush::opened()).await;
                }
            }
            UpstreamEvent::Message(raw) => self.handle_server_message(raw).await,
            UpstreamEvent::Error(message) => {
                warn!(error = %message, "Upstream session error");
                self.state.upstream_session = None;
                self.send(ServerPush::error(message)).await;
            }
            UpstreamEvent::Closed { reason } => self.handle_close(reason).await,
        }
    }

    async fn handle_server_message(&mut self, raw: serde_json::Value) {
        let Some(message) = LiveServerMessage::parse(&raw) else {
            self.send(ServerPush::Server { message: raw }).await;
            return;
        };

        if let Some(handle) = message.resumption_handle() {
            let token = self
                .tokens
                .on_token_issued(
                    &mut self.state.resumption_token,
                    self.state.chat_session_id.as_deref(),
                    handle.to_string(),
                )
                .await;
            self.send(ServerPush::ResumptionToken {
                token: token.handle,
                expiration: token.expires_at,
            })
            .await;
        }
        if let Some(go_away) = &message.go_away {
            self.go_away(go_away.time_left.clone()).await;
        }

        let now = Instant::now();
        if let Some(text) = message.input_text().filter(|t| !t.trim().is_empty()) {
            self.state.turns.on_user_fragment(text);
            self.state.debounce.touch(now);
        }
        if let Some(text) = message.output_text().filter(|t| !t.is_empty()) {
            self.state.turns.on_model_fragment(text);
            self.state.debounce.touch(now);
        }
        if message.is_turn_complete() {
            self.state.debounce.schedule(now);
        }
        if message.is_generation_complete() {
            self.flush().await;
            if self.state.turns.is_saved() {
                self.state.debounce.cancel();
            }
            self.send(ServerPush::GenerationComplete).await;
        }

        if !message.is_control_only() {
            self.send(ServerPush::Server { message: raw }).await;
        }
    }

    /// The upstream will close soon. Reconnection itself waits for the close.
    async fn go_away(&mut self, time_left: Option<String>) {
        info!(time_left = ?time_left, "Upstream is going away");
        self.flush().await;
        if let (Some(id), Some(token)) = (
            self.state.chat_session_id.as_deref(),
            self.state.resumption_token.clone(),
        ) {
            self.tokens.persist(id, Some(token)).await;
        }
        self.publish().await;
        let will_reconnect = matches!(
            decide_on_close(&self.state, self.deps.settings.max_reconnect_attempts, Utc::now()),
            CloseDecision::Reconnect { .. }
        );
        self.send(ServerPush::GoAway {
            time_left,
            will_reconnect,
            reason: None,
        })
        .await;
    }

    async fn handle_close(&mut self, reason: Option<String>) {
        self.events = None;
        self.state.upstream_session = None;
        // Whatever the old session said is settled before a new one can speak.
        self.state.debounce.cancel();
        self.flush().await;

        let max_attempts = self.deps.settings.max_reconnect_attempts;
        match decide_on_close(&self.state, max_attempts, Utc::now()) {
            CloseDecision::Ignore => debug!("Upstream closed while a reconnect is in flight"),
            CloseDecision::Reconnect { token } => self.begin_reconnect(token, reason),
            CloseDecision::Terminate(why) => self.terminate(why, reason).await,
        }
    }

    fn begin_reconnect(&mut self, token: ResumptionToken, reason: Option<String>) {
        info!(
            reason = ?reason,
            attempts = self.state.reconnect_attempts,
            "Upstream closed unexpectedly; resuming"
        );
        self.state.reconnecting = true;
        self.state.phase = SessionPhase::Reconnecting;

        let settings = &self.deps.settings;
        let plan = ReconnectPlan {
            model: settings.model.clone(),
            config: self
                .base_config
                .clone()
                .unwrap_or_else(|| LiveConfig::voice_chat(None)),
            token,
            attempts_made: self.state.reconnect_attempts,
            max_attempts: settings.max_reconnect_attempts,
            backoff: settings.reconnect_backoff,
        };
        let provider = self.deps.provider.clone();
        self.reconnect = Some(tokio::spawn(
            run_reconnect(provider, plan).in_current_span(),
        ));
    }

    async fn finish_reconnect(&mut self, result: Result<ReconnectOutcome, JoinError>) {
        self.reconnect = None;
        match result {
            Ok(ReconnectOutcome::Resumed { connection, attempts }) => {
                let LiveConnection { session, events } = connection;
                // Stored before `reconnecting` is cleared.
                self.state.upstream_session = Some(session);
                self.events = Some(events);
                self.state.reconnecting = false;
                self.state.reconnect_attempts = 0;
                self.state.phase = SessionPhase::Active;
                info!(attempts, "Upstream session resumed");
            }
            Ok(ReconnectOutcome::Exhausted { attempts, last_error }) => {
                self.state.reconnect_attempts = attempts;
                warn!(attempts, error = %last_error, "Giving up on resuming the upstream session");
                self.terminate(TerminateReason::AttemptsExhausted, Some(last_error))
                    .await;
            }
            Ok(ReconnectOutcome::TokenExpired { attempts }) => {
                self.state.reconnect_attempts = attempts;
                self.terminate(
                    TerminateReason::NoValidToken,
                    Some("resumption token expired".into()),
                )
                .await;
            }
            Err(e) if e.is_cancelled() => debug!("Reconnect task cancelled"),
            Err(e) => {
                error!(error = %e, "Reconnect task failed");
                self.terminate(TerminateReason::ReconnectFailed, Some(e.to_string()))
                    .await;
            }
        }
    }

    async fn terminate(&mut self, why: TerminateReason, reason: Option<String>) {
        self.state.reconnecting = false;
        self.state.phase = SessionPhase::Terminated;
        if why == TerminateReason::NoValidToken {
            self.tokens
                .invalidate(
                    &mut self.state.resumption_token,
                    self.state.chat_session_id.as_deref(),
                )
                .await;
        }
        if why.notifies_client() {
            info!(?why, "Upstream session ended; client needs a new session");
            self.send(ServerPush::closed(reason, true)).await;
        } else {
            debug!("Upstream closed after intentional stop");
        }
    }

    async fn on_debounce_elapsed(&mut self) {
        self.state.debounce.cancel();
        self.flush().await;
    }

    /// Persists the current turn if it is complete and not yet saved. A failed
    /// write leaves the accumulators as they are.
    async fn flush(&mut self) {
        let Some(turn) = self.state.turns.ready_turn() else {
            return;
        };
        let chat_session_id = self.state.chat_session_id.as_deref();
        match self
            .deps
            .store
            .save_turn(&turn.user_text, &turn.model_text, chat_session_id)
            .await
        {
            Ok(()) => {
                self.state.turns.mark_saved();
                info!(
                    user_chars = turn.user_text.len(),
                    model_chars = turn.model_text.len(),
                    "Saved voice turn"
                );
            }
            Err(e) => warn!(error = ?e, "Failed to save voice turn; keeping it for retry"),
        }
    }

    async fn stash_pending(&mut self) {
        let Some(pending) = self.state.turns.take_pending() else {
            return;
        };
        match self.state.chat_session_id.as_deref() {
            Some(id) => match self.deps.store.stash_pending_turn(id, pending).await {
                Ok(()) => debug!("Stashed unsaved transcript"),
                Err(e) => warn!(error = ?e, "Failed to stash unsaved transcript"),
            },
            None => info!("Discarding unsaved transcript of a session without a chat id"),
        }
    }

    /// Releases everything the connection holds. Token and unsaved transcript
    /// go to durable storage first.
    async fn teardown(&mut self) {
        self.state.debounce.cancel();
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
        self.flush().await;
        self.stash_pending().await;
        if let (Some(id), Some(token)) = (
            self.state.chat_session_id.as_deref(),
            self.state.resumption_token.clone(),
        ) {
            if token.is_valid_at(Utc::now()) {
                self.tokens.persist(id, Some(token)).await;
            }
        }
        self.events = None;
        if let Some(session) = self.state.upstream_session.take() {
            self.state.intentional_stop = true;
            session.close().await;
        }
        self.deps.registry.remove(&self.state.connection_id).await;
        info!(
            audio_chunks = self.state.audio_chunks,
            audio_bytes = self.state.audio_bytes,
            "Voice connection closed"
        );
    }

    async fn publish(&mut self) {
        let snapshot = self.state.snapshot();
        if self.published.as_ref() != Some(&snapshot) {
            self.deps.registry.upsert(snapshot.clone()).await;
            self.published = Some(snapshot);
        }
    }

    async fn send(&self, message: impl Into<Outbound>) {
        if self.outbound.send(message.into()).await.is_err() {
            debug!("Client writer is gone; dropping outbound message");
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<UpstreamEvent>>) -> UpstreamEvent {
    match events {
        Some(rx) => rx
            .recv()
            .await
            .unwrap_or(UpstreamEvent::Closed { reason: None }),
        None => std::future::pending().await,
    }
}

async fn join_reconnect(
    task: &mut Option<JoinHandle<ReconnectOutcome>>,
) -> Result<ReconnectOutcome, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn history_block(history: &[HistoryEntry]) -> String {
    let mut block = String::from("Conversation so far:\n");
    for entry in history {
        block.push_str(&format!("{}: {}\n", entry.role, entry.content));
    }
    block
}
