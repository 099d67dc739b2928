//! Token rate limiting
//!
//! Sliding-window token budget per conversation scope. A reservation
//! that would push the trailing window over the limit is denied without
//! touching the window; a denial is backpressure, not an error, and the
//! caller skips the reply silently.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, MonotonicClock};
use crate::scope::{ScopeId, ScopeMap};
use crate::tokenizer::format_tokens;

#[derive(Debug, Default)]
struct BudgetWindow {
    /// (timestamp ms, tokens) samples, oldest first.
    samples: VecDeque<(u64, u64)>,
}

impl BudgetWindow {
    fn purge(&mut self, now_ms: u64, window_ms: u64) {
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some(&(at, _)) = self.samples.front() {
            if at < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn total(&self) -> u64 {
        self.samples.iter().map(|&(_, n)| n).sum()
    }
}

/// Per-scope sliding-window limiter.
pub struct RateLimiter {
    windows: ScopeMap<BudgetWindow>,
    limit_tokens: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limit_tokens: u64, window_secs: u64) -> Self {
        Self::with_clock(limit_tokens, window_secs, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(limit_tokens: u64, window_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: ScopeMap::new(),
            limit_tokens,
            window_ms: window_secs * 1000,
            clock,
        }
    }

    /// Try to reserve `estimated_tokens` for `scope`.
    ///
    /// Returns false without mutating the window when the reservation
    /// would exceed the budget. The reserve-check-append sequence holds
    /// the scope's lock, so concurrent reservations in one scope cannot
    /// lose updates.
    pub fn reserve(&self, scope: &ScopeId, estimated_tokens: u64) -> bool {
        let entry = self.windows.entry(scope);
        let mut window = entry.lock();
        let now = self.clock.now_ms();

        window.purge(now, self.window_ms);
        let used = window.total();

        if used + estimated_tokens > self.limit_tokens {
            debug!(
                scope = %scope,
                used = %format_tokens(used),
                requested = %format_tokens(estimated_tokens),
                limit = %format_tokens(self.limit_tokens),
                "token reservation denied"
            );
            return false;
        }

        window.samples.push_back((now, estimated_tokens));
        true
    }

    /// Tokens currently counted in the scope's trailing window.
    pub fn window_usage(&self, scope: &ScopeId) -> u64 {
        let entry = self.windows.entry(scope);
        let mut window = entry.lock();
        window.purge(self.clock.now_ms(), self.window_ms);
        window.total()
    }
}
