//! Trigger classification
//!
//! Classifies an inbound message into the trigger type the reply gate
//! keys its probabilities on. Detection priority: mention, then
//! configured keyword, then question shape, then ambient.

use once_cell::sync::Lazy;
use regex::Regex;

/// What prompted the bot to consider this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Mention,
    Keyword,
    Question,
    Ambient,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Mention => "mention",
            Trigger::Keyword => "keyword",
            Trigger::Question => "question",
            Trigger::Ambient => "ambient",
        }
    }
}

static QUESTION_TAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?？]\s*$").unwrap());

// Interrogatives that mark a question even without the punctuation;
// chats drop question marks constantly, CJK ones especially.
static QUESTION_MARKERS: &[&str] = &[
    "吗", "什么", "为什么", "怎么", "哪", "谁", "多少",
];

/// Keyword/question detector with a configurable keyword list.
pub struct TriggerDetector {
    keywords: Vec<String>,
}

impl TriggerDetector {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Classify one message. `is_mention` comes from the platform
    /// adapter (an explicit @-mention of the bot).
    pub fn detect(&self, text: &str, is_mention: bool) -> Trigger {
        if is_mention {
            return Trigger::Mention;
        }

        let lowered = text.to_lowercase();
        if self.keywords.iter().any(|k| lowered.contains(k)) {
            return Trigger::Keyword;
        }

        if is_question(text) {
            return Trigger::Question;
        }

        Trigger::Ambient
    }
}

fn is_question(text: &str) -> bool {
    if QUESTION_TAIL.is_match(text) {
        return true;
    }
    QUESTION_MARKERS.iter().any(|m| text.contains(m))
}
