//! Reconnection Controller
//!
//! Decides what happens when an upstream session closes, and runs the
//! bounded retry loop that reopens it with a resumption handle.

use crate::connection::ConnectionState;
use crate::live::{LiveConfig, LiveConnection, LiveProvider};
use crate::token::ResumptionToken;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Backoff never grows past this, whatever the attempt count.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Lifecycle of one client connection's upstream side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    #[default]
    Idle,
    Starting,
    Active,
    Reconnecting,
    Terminated,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Starting => "starting",
            SessionPhase::Active => "active",
            SessionPhase::Reconnecting => "reconnecting",
            SessionPhase::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The client asked for it. Never reported back.
    IntentionalStop,
    NoValidToken,
    AttemptsExhausted,
    /// The reconnect task itself died.
    ReconnectFailed,
}

impl TerminateReason {
    pub fn notifies_client(self) -> bool {
        self != TerminateReason::IntentionalStop
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseDecision {
    Reconnect { token: ResumptionToken },
    Terminate(TerminateReason),
    /// A reconnect is already in flight.
    Ignore,
}

/// What to do about an upstream close, given the connection as it is now.
pub fn decide_on_close(state: &ConnectionState, max_attempts: u32, now: DateTime<Utc>) -> CloseDecision {
    if state.reconnecting {
        return CloseDecision::Ignore;
    }
    if state.intentional_stop {
        return CloseDecision::Terminate(TerminateReason::IntentionalStop);
    }
    let token = match &state.resumption_token {
        Some(token) if token.is_valid_at(now) => token.clone(),
        _ => return CloseDecision::Terminate(TerminateReason::NoValidToken),
    };
    if state.reconnect_attempts >= max_attempts {
        return CloseDecision::Terminate(TerminateReason::AttemptsExhausted);
    }
    CloseDecision::Reconnect { token }
}

/// Input of one reconnect episode.
#[derive(Debug, Clone)]
pub struct ReconnectPlan {
    pub model: String,
    /// Setup without a resumption handle; each attempt adds the token's.
    pub config: LiveConfig,
    pub token: ResumptionToken,
    /// Attempts already spent before this episode.
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
}

pub enum ReconnectOutcome {
    Resumed { connection: LiveConnection, attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
    TokenExpired { attempts: u32 },
}

impl fmt::Debug for ReconnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectOutcome::Resumed { attempts, .. } => {
                f.debug_struct("Resumed").field("attempts", attempts).finish()
            }
            ReconnectOutcome::Exhausted { attempts, last_error } => f
                .debug_struct("Exhausted")
                .field("attempts", attempts)
                .field("last_error", last_error)
                .finish(),
            ReconnectOutcome::TokenExpired { attempts } => {
                f.debug_struct("TokenExpired").field("attempts", attempts).finish()
            }
        }
    }
}

/// Exponential delay before retry number `retry` (1-based), with up to 50%
/// jitter.
pub fn backoff_with_jitter(base: Duration, retry: u32) -> Duration {
    let exp = base
        .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
        .min(MAX_BACKOFF);
    let half = u64::try_from(exp.as_millis() / 2).unwrap_or(0);
    let jitter = if half == 0 {
        0
    } else {
        rand::rng().random_range(0..=half)
    };
    exp + Duration::from_millis(jitter)
}

/// Reopens the upstream session with the plan's resumption handle until it
/// works, the token expires, or the attempt budget is spent.
pub async fn run_reconnect(provider: Arc<dyn LiveProvider>, plan: ReconnectPlan) -> ReconnectOutcome {
    let mut attempts = plan.attempts_made;
    let mut retries = 0;
    let mut last_error = String::from("attempt budget already spent");

    while attempts < plan.max_attempts {
        if !plan.token.is_valid_at(Utc::now()) {
            info!(attempts, "Resumption token expired while reconnecting");
            return ReconnectOutcome::TokenExpired { attempts };
        }
        if retries > 0 {
            let delay = backoff_with_jitter(plan.backoff, retries);
            info!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Retrying upstream resume after backoff");
            tokio::time::sleep(delay).await;
        }

        attempts += 1;
        retries += 1;
        let config = plan
            .config
            .clone()
            .with_resumption_handle(Some(plan.token.handle.clone()));
        match provider.open_session(&plan.model, &config).await {
            Ok(connection) => return ReconnectOutcome::Resumed { connection, attempts },
            Err(e) => {
                warn!(attempt = attempts, max = plan.max_attempts, error = %e, "Upstream resume attempt failed");
                last_error = e.to_string();
            }
        }
    }

    ReconnectOutcome::Exhausted { attempts, last_error }
}
