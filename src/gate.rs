//! Stalker-mode reply gate
//!
//! Decides whether the bot speaks in a given group turn. The gate is
//! probabilistic by trigger type, with two hard caps layered on top:
//! an hourly reply ceiling and a minimum message gap between replies.
//! Per-scope history is mutated only here, after a decision is final.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::config::StalkerModeConfig;
use crate::scope::{ScopeId, ScopeMap};
use crate::trigger::Trigger;

const HOUR_MS: u64 = 3_600_000;

/// Recent reply bookkeeping for one scope.
#[derive(Debug, Default)]
struct ReplyHistory {
    /// Timestamps (ms) of replies within the trailing hour.
    reply_times_ms: VecDeque<u64>,
    /// Messages observed since the last reply.
    messages_since_reply: u32,
    /// The gap cooldown only applies once a first reply exists.
    has_replied: bool,
}

impl ReplyHistory {
    fn purge(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(HOUR_MS);
        while let Some(&at) = self.reply_times_ms.front() {
            if at < cutoff {
                self.reply_times_ms.pop_front();
            } else {
                break;
            }
        }
    }

    fn record_reply(&mut self, now_ms: u64) {
        self.reply_times_ms.push_back(now_ms);
        self.messages_since_reply = 0;
        self.has_replied = true;
    }
}

/// Probabilistic, history-aware gate over group-chat participation.
pub struct ReplyGate {
    cfg: StalkerModeConfig,
    histories: ScopeMap<ReplyHistory>,
    clock: Arc<dyn Clock>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl ReplyGate {
    pub fn new(cfg: StalkerModeConfig) -> Self {
        Self::with_parts(
            cfg,
            Arc::new(MonotonicClock::new()),
            Box::new(StdRng::from_entropy()),
        )
    }

    /// Deterministic construction for tests: fixed seed, manual clock.
    pub fn with_parts(
        cfg: StalkerModeConfig,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            cfg,
            histories: ScopeMap::new(),
            clock,
            rng: Mutex::new(rng),
        }
    }

    pub fn seeded(cfg: StalkerModeConfig, seed: u64) -> Self {
        Self::with_parts(
            cfg,
            Arc::new(MonotonicClock::new()),
            Box::new(StdRng::seed_from_u64(seed)),
        )
    }

    /// Count a message toward the scope's gap counter without
    /// evaluating a reply. Used when an earlier stage already decided
    /// to stay silent.
    pub fn note_message(&self, scope: &ScopeId) {
        let entry = self.histories.entry(scope);
        let mut history = entry.lock();
        history.messages_since_reply = history.messages_since_reply.saturating_add(1);
    }

    /// Decide whether to reply to the current message.
    ///
    /// Exactly one of `note_message`/`should_reply` must be called per
    /// observed message; this method does its own bookkeeping. An
    /// affirmative decision is recorded immediately.
    ///
    /// `Mention` skips the message-gap cooldown — being addressed
    /// directly should almost always get an answer — but still counts
    /// against `max_replies_per_hour`, which caps total volume even
    /// under mention spam. This asymmetry is deliberate.
    pub fn should_reply(&self, scope: &ScopeId, trigger: Trigger) -> bool {
        let entry = self.histories.entry(scope);
        let mut history = entry.lock();
        let now = self.clock.now_ms();
        history.purge(now);

        let gap = history.messages_since_reply;
        history.messages_since_reply = history.messages_since_reply.saturating_add(1);

        if !self.cfg.enabled {
            // Legacy always-respond behavior.
            history.record_reply(now);
            return true;
        }

        if history.reply_times_ms.len() as u32 >= self.cfg.max_replies_per_hour {
            debug!(scope = %scope, "hourly reply cap reached");
            return false;
        }

        if trigger != Trigger::Mention
            && history.has_replied
            && gap < self.cfg.min_messages_between_replies
        {
            debug!(
                scope = %scope,
                gap,
                required = self.cfg.min_messages_between_replies,
                "message-gap cooldown active"
            );
            return false;
        }

        let probability = self.base_probability(trigger);
        let sample: f64 = self.rng.lock().gen();
        if sample < probability {
            history.record_reply(now);
            debug!(scope = %scope, trigger = trigger.as_str(), sample, "gate passed");
            true
        } else {
            false
        }
    }

    /// Replies recorded for the scope within the trailing hour.
    pub fn replies_in_last_hour(&self, scope: &ScopeId) -> usize {
        let entry = self.histories.entry(scope);
        let mut history = entry.lock();
        history.purge(self.clock.now_ms());
        history.reply_times_ms.len()
    }

    fn base_probability(&self, trigger: Trigger) -> f64 {
        match trigger {
            Trigger::Mention => self.cfg.mention_probability,
            Trigger::Keyword => self.cfg.keyword_probability,
            Trigger::Question => self.cfg.question_probability,
            Trigger::Ambient => self.cfg.default_probability,
        }
    }
}
