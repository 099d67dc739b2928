//! Intent classification
//!
//! Asks the `intent` capability what to do with an inbound message:
//! reply, remember, forget, or ignore. The classifier must degrade
//! gracefully — a failed call or garbage output means "ignore", never
//! an error. Missed engagement is acceptable; spam is not.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capability::CapabilityConfig;
use crate::model::{extract_json, ChatMessage, ModelInvoker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryOpKind {
    Add,
    Forget,
}

/// A remember/forget instruction extracted from a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOp {
    pub op: MemoryOpKind,
    pub content: String,
}

/// Per-message action decision. Produced once, consumed once.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntentDecision {
    pub should_reply: bool,
    #[serde(default)]
    pub memory_ops: Vec<MemoryOp>,
    #[serde(default)]
    pub confidence: f32,
}

impl IntentDecision {
    /// The safe default: stay silent, touch nothing.
    pub fn ignore() -> Self {
        Self {
            should_reply: false,
            memory_ops: Vec::new(),
            confidence: 0.0,
        }
    }
}

const SYSTEM_PROMPT: &str = "\
You watch one message from a group chat and decide what an assistant \
bot should do with it. Respond with ONLY a JSON object, no prose:
{\"should_reply\": true|false, \"memory_ops\": [{\"op\": \"add\"|\"forget\", \"content\": \"...\"}], \"confidence\": 0.0-1.0}
Emit a memory op only when the message states a durable fact about a \
participant (a birthday, a preference, a plan) or explicitly asks to \
remember or forget something. Small talk gets an empty memory_ops list.";

/// Classifier over the `intent` capability.
pub struct IntentClassifier {
    invoker: Arc<dyn ModelInvoker>,
    config: CapabilityConfig,
}

impl IntentClassifier {
    pub fn new(invoker: Arc<dyn ModelInvoker>, config: CapabilityConfig) -> Self {
        Self { invoker, config }
    }

    /// Classify one message given recent conversation context.
    pub async fn classify(&self, message: &str, context: &str) -> IntentDecision {
        let user = if context.is_empty() {
            format!("Message: {}", message)
        } else {
            format!("{}\n\nMessage: {}", context, message)
        };

        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)];

        match self.invoker.complete(&self.config, &messages).await {
            Ok(raw) => match parse_decision(&raw) {
                Some(decision) => {
                    debug!(
                        should_reply = decision.should_reply,
                        ops = decision.memory_ops.len(),
                        confidence = decision.confidence,
                        "intent classified"
                    );
                    decision
                }
                None => {
                    warn!("intent output unparseable, defaulting to ignore");
                    IntentDecision::ignore()
                }
            },
            Err(e) => {
                warn!("intent model call failed: {}", e);
                IntentDecision::ignore()
            }
        }
    }
}

fn parse_decision(raw: &str) -> Option<IntentDecision> {
    let json = extract_json(raw)?;
    serde_json::from_str(&json).ok()
}
