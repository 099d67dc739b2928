//! Token estimation
//!
//! Approximate token counts for pre-flight budget reservations. The
//! rate limiter is a soft backpressure valve, not a billing meter, so a
//! character-based approximation is enough.

/// Character-based token counter.
///
/// English text averages ~4 characters per token; CJK text sits closer
/// to 1.5. Group chats here mix both, so the estimate adjusts by the
/// CJK share of the input.
pub struct TokenCounter {
    chars_per_token: f32,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            chars_per_token: 3.8,
        }
    }

    /// Approximate tokens in `text`. Accuracy around ±15%.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let total = text.chars().count();
        let cjk = text.chars().filter(|c| is_cjk(*c)).count();
        let latin = total - cjk;

        // CJK characters tokenize to roughly 1.5 chars/token.
        let tokens = (latin as f32 / self.chars_per_token) + (cjk as f32 / 1.5);
        tokens.ceil() as usize
    }

    /// Reservation estimate for one model call: prompt plus the
    /// configured completion ceiling.
    pub fn estimate_request(&self, prompt: &str, max_completion_tokens: u32) -> u64 {
        self.count(prompt) as u64 + max_completion_tokens as u64
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'      // CJK unified
        | '\u{3400}'..='\u{4DBF}'    // extension A
        | '\u{3040}'..='\u{30FF}'    // kana
        | '\u{AC00}'..='\u{D7AF}'    // hangul
    )
}

/// Format token count for display (e.g., 1.5M, 500K).
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}
