//! Turn Assembly
//!
//! Transcription arrives as a stream of fragments for each side of the
//! conversation. `TurnAssembler` folds them into one (user, model) pair and
//! decides when that pair is complete enough to persist. `Debounce` tracks
//! the single quiet-period timer that delays persistence until trailing
//! fragments have arrived.

use crate::store::PendingTurn;
use std::time::Duration;
use tokio::time::Instant;

/// A (user, model) exchange ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTurn {
    pub user_text: String,
    pub model_text: String,
}

/// How a user fragment was folded into the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMerge {
    /// The fragment opened a new turn.
    Started,
    /// The fragment was a longer transcript containing the current one.
    Replaced,
    /// The fragment was already contained in the accumulator.
    Ignored,
    /// The fragment was disjoint and appended.
    Appended,
}

#[derive(Debug, Default)]
pub struct TurnAssembler {
    user: String,
    model: String,
    saved: bool,
}

impl TurnAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts text carried over from an earlier connection in front of whatever
    /// is accumulated now.
    pub fn seed(&mut self, pending: PendingTurn) {
        self.saved = false;
        self.user = join_text(pending.user_text, std::mem::take(&mut self.user), " ");
        self.model = join_text(pending.model_text, std::mem::take(&mut self.model), "");
    }

    pub fn on_user_fragment(&mut self, text: &str) -> UserMerge {
        let text = text.trim();
        if text.is_empty() {
            return UserMerge::Ignored;
        }
        if self.saved {
            // Accumulators are empty once a turn is saved.
            self.saved = false;
            self.user = text.to_string();
            return UserMerge::Started;
        }
        if self.user.is_empty() {
            self.user = text.to_string();
            UserMerge::Started
        } else if text.len() > self.user.len() && text.contains(self.user.as_str()) {
            self.user = text.to_string();
            UserMerge::Replaced
        } else if self.user.contains(text) {
            UserMerge::Ignored
        } else {
            self.user.push(' ');
            self.user.push_str(text);
            UserMerge::Appended
        }
    }

    /// Model transcription is strictly incremental.
    pub fn on_model_fragment(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.saved = false;
        self.model.push_str(text);
    }

    /// The current pair, if both sides have something to say and it has not
    /// been persisted yet.
    pub fn ready_turn(&self) -> Option<CompletedTurn> {
        if self.saved {
            return None;
        }
        let user_text = self.user.trim();
        let model_text = self.model.trim();
        if user_text.is_empty() || model_text.is_empty() {
            return None;
        }
        Some(CompletedTurn {
            user_text: user_text.to_string(),
            model_text: model_text.to_string(),
        })
    }

    /// Call only after the turn returned by `ready_turn` was persisted.
    pub fn mark_saved(&mut self) {
        self.saved = true;
        self.user.clear();
        self.model.clear();
    }

    /// Drains whatever text has not been persisted and starts over.
    pub fn take_pending(&mut self) -> Option<PendingTurn> {
        let pending = if self.user.trim().is_empty() && self.model.trim().is_empty() {
            None
        } else {
            Some(PendingTurn {
                user_text: std::mem::take(&mut self.user),
                model_text: std::mem::take(&mut self.model),
            })
        };
        self.reset();
        pending
    }

    pub fn reset(&mut self) {
        self.user.clear();
        self.model.clear();
        self.saved = false;
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn user_text(&self) -> &str {
        &self.user
    }

    pub fn model_text(&self) -> &str {
        &self.model
    }
}

fn join_text(earlier: String, later: String, sep: &str) -> String {
    match (earlier.trim().is_empty(), later.trim().is_empty()) {
        (true, _) => later,
        (false, true) => earlier,
        (false, false) => format!("{earlier}{sep}{later}"),
    }
}

/// A single restartable quiet-period timer.
#[derive(Debug)]
pub struct Debounce {
    period: Duration,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            deadline: None,
        }
    }

    /// Arms the timer, replacing any pending deadline.
    pub fn schedule(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    /// Pushes a pending deadline back. Does nothing if no timer is armed.
    pub fn touch(&mut self, now: Instant) {
        if self.deadline.is_some() {
            self.schedule(now);
        }
    }

    /// Idempotent.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_fragments_follow_merge_precedence() {
        let mut turns = TurnAssembler::new();
        assert_eq!(turns.on_user_fragment("what is"), UserMerge::Started);
        assert_eq!(turns.on_user_fragment("what is a"), UserMerge::Replaced);
        assert_eq!(turns.on_user_fragment("is a"), UserMerge::Ignored);
        assert_eq!(turns.on_user_fragment("rainbow"), UserMerge::Appended);
        assert_eq!(turns.user_text(), "what is a rainbow");
    }

    #[test]
    fn test_corrected_transcript_replaces_the_partial_one() {
        let mut turns = TurnAssembler::new();
        turns.on_user_fragment("tell me");
        turns.on_user_fragment("tell me a story");
        turns.on_user_fragment("  tell me a story about dragons ");
        assert_eq!(turns.user_text(), "tell me a story about dragons");
    }

    #[test]
    fn test_blank_fragments_are_ignored() {
        let mut turns = TurnAssembler::new();
        assert_eq!(turns.on_user_fragment("   "), UserMerge::Ignored);
        turns.on_model_fragment("");
        assert_eq!(turns.user_text(), "");
        assert_eq!(turns.model_text(), "");
    }

    #[test]
    fn test_model_fragments_are_appended_verbatim() {
        let mut turns = TurnAssembler::new();
        turns.on_model_fragment("Hello");
        turns.on_model_fragment(" there");
        turns.on_model_fragment(", friend!");
        assert_eq!(turns.model_text(), "Hello there, friend!");
    }

    #[test]
    fn test_turn_is_ready_only_with_both_sides() {
        let mut turns = TurnAssembler::new();
        assert_eq!(turns.ready_turn(), None);
        turns.on_user_fragment("hi");
        assert_eq!(turns.ready_turn(), None);
        turns.on_model_fragment("  ");
        assert_eq!(turns.ready_turn(), None);
        turns.on_model_fragment("hello!");
        assert_eq!(
            turns.ready_turn(),
            Some(CompletedTurn {
                user_text: "hi".into(),
                model_text: "hello!".into()
            })
        );
    }

    #[test]
    fn test_saved_turn_is_not_ready_twice() {
        let mut turns = TurnAssembler::new();
        turns.on_user_fragment("hi");
        turns.on_model_fragment("hello");
        assert!(turns.ready_turn().is_some());
        turns.mark_saved();

        assert!(turns.is_saved());
        assert_eq!(turns.ready_turn(), None);
        assert_eq!(turns.user_text(), "");
        assert_eq!(turns.model_text(), "");
    }

    #[test]
    fn test_next_fragment_after_save_opens_a_new_turn() {
        let mut turns = TurnAssembler::new();
        turns.on_user_fragment("first question");
        turns.on_model_fragment("first answer");
        turns.mark_saved();

        assert_eq!(turns.on_user_fragment("first"), UserMerge::Started);
        assert!(!turns.is_saved());
        assert_eq!(turns.user_text(), "first");
    }

    #[test]
    fn test_user_only_turn_is_carried_forward() {
        let mut turns = TurnAssembler::new();
        turns.on_user_fragment("are you there");
        // Connection dropped before the model replied; nothing is ready.
        assert_eq!(turns.ready_turn(), None);

        turns.on_user_fragment("hello?");
        turns.on_model_fragment("Yes, I'm here!");
        let turn = turns.ready_turn().unwrap();
        assert_eq!(turn.user_text, "are you there hello?");
        assert_eq!(turn.model_text, "Yes, I'm here!");
    }

    #[test]
    fn test_take_pending_drains_and_resets() {
        let mut turns = TurnAssembler::new();
        assert_eq!(turns.take_pending(), None);

        turns.on_user_fragment("half a thought");
        let pending = turns.take_pending().unwrap();
        assert_eq!(pending.user_text, "half a thought");
        assert_eq!(pending.model_text, "");
        assert_eq!(turns.user_text(), "");

        let mut next = TurnAssembler::new();
        next.seed(pending);
        next.on_model_fragment("go on");
        assert_eq!(next.ready_turn().unwrap().user_text, "half a thought");
    }

    #[test]
    fn test_seed_goes_in_front_of_live_text() {
        let mut turns = TurnAssembler::new();
        turns.on_user_fragment("and then");
        turns.seed(PendingTurn {
            user_text: "once upon a time".into(),
            model_text: String::new(),
        });
        assert_eq!(turns.user_text(), "once upon a time and then");
        assert_eq!(turns.model_text(), "");
    }

    /// Whatever order fragments come in, no fragment text is lost: each one
    /// ends up contained in the accumulator.
    #[test]
    fn test_adversarial_orderings_never_lose_text() {
        let fragments = ["I like", "I like cats", "cats", "and dogs", "I", "like cats and dogs"];
        // Every rotation of the fragment list.
        for start in 0..fragments.len() {
            let mut turns = TurnAssembler::new();
            for i in 0..fragments.len() {
                turns.on_user_fragment(fragments[(start + i) % fragments.len()]);
            }
            for fragment in fragments {
                assert!(
                    turns.user_text().contains(fragment),
                    "rotation {start}: {:?} lost from {:?}",
                    fragment,
                    turns.user_text()
                );
            }
        }
    }

    #[test]
    fn test_debounce_fires_two_seconds_after_the_last_event() {
        let t0 = Instant::now();
        let ms = Duration::from_millis;
        let mut debounce = Debounce::new(Duration::from_secs(2));

        // Fragments before turn-complete do not arm the timer.
        debounce.touch(t0);
        debounce.touch(t0 + ms(500));
        debounce.touch(t0 + ms(1000));
        assert!(!debounce.is_pending());

        debounce.schedule(t0 + ms(1200));
        assert_eq!(debounce.deadline(), Some(t0 + ms(3200)));

        // A late fragment pushes it back.
        debounce.touch(t0 + ms(2000));
        assert_eq!(debounce.deadline(), Some(t0 + ms(4000)));
    }

    #[test]
    fn test_debounce_cancel_is_idempotent() {
        let mut debounce = Debounce::new(Duration::from_secs(2));
        debounce.cancel();
        debounce.schedule(Instant::now());
        debounce.cancel();
        debounce.cancel();
        assert!(!debounce.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_sleeps_until_the_deadline() {
        let start = Instant::now();
        wait_for(Some(start + Duration::from_millis(3200))).await;
        assert_eq!(start.elapsed(), Duration::from_millis(3200));
    }
}
