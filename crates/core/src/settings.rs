//! Tunables of the voice bridge.

use chrono::TimeDelta;
use std::time::Duration;

pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_TURN_DEBOUNCE: Duration = Duration::from_secs(2);
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Upper bound on `max_reconnect_attempts`.
pub const MAX_RECONNECT_ATTEMPTS_CAP: u32 = 3;
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(250);
pub const DEFAULT_SYSTEM_PROMPT_TITLE: &str = "voice_system";

#[derive(Clone, Debug)]
pub struct BridgeSettings {
    /// Upstream model identifier passed to `open_session`.
    pub model: String,
    /// Quiet period after turn-complete before the turn is persisted.
    pub turn_debounce: Duration,
    /// Wall-clock lifetime of a resumption token from the moment it is issued.
    pub token_ttl: TimeDelta,
    pub max_reconnect_attempts: u32,
    /// Base delay between reconnect attempts, doubled per attempt.
    pub reconnect_backoff: Duration,
    /// Title of the prompt used as the system instruction.
    pub system_prompt_title: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_LIVE_MODEL.to_string(),
            turn_debounce: DEFAULT_TURN_DEBOUNCE,
            token_ttl: TimeDelta::seconds(DEFAULT_TOKEN_TTL_SECS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            system_prompt_title: DEFAULT_SYSTEM_PROMPT_TITLE.to_string(),
        }
    }
}
