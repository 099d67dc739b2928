//! Dialogue orchestration
//!
//! Top-level pipeline for one inbound message: length guard, intent
//! classification, trigger detection, reply gate, token reservation,
//! memory retrieval, prompt assembly, model call. Memory operations
//! apply whether or not a reply goes out — remembering is independent
//! of speaking. Failures stay silent toward the chat: the worst a user
//! sees is no reply.

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ResponseCache;
use crate::capability::{resolve, CapabilityConfig, CapabilityScope};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::error::{ConfigError, ModelError};
use crate::gate::ReplyGate;
use crate::intent::{IntentClassifier, MemoryOp, MemoryOpKind};
use crate::memory::{MemoryStore, ModelMatcher};
use crate::model::{ChatMessage, ModelInvoker};
use crate::rate_limit::RateLimiter;
use crate::scope::ScopeId;
use crate::tokenizer::TokenCounter;
use crate::trigger::TriggerDetector;

/// Sender label for the bot's own turns in the conversation window.
const BOT_SENDER: &str = "bot";

/// How many memory records flow into one prompt.
const MEMORY_PROMPT_LIMIT: usize = 8;

/// Inbound message event from the platform adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub scope_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_mention: bool,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub mime: String,
    #[serde(default)]
    pub data_base64: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }
}

/// Why a message was suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    MessageTooLong,
    IntentIgnored,
    GateDeclined,
    RateLimited,
}

impl SuppressReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressReason::MessageTooLong => "message_too_long",
            SuppressReason::IntentIgnored => "intent_ignored",
            SuppressReason::GateDeclined => "gate_declined",
            SuppressReason::RateLimited => "rate_limited",
        }
    }
}

/// Result of handling one inbound event.
#[derive(Debug)]
pub enum Outcome {
    Sent(String),
    Suppressed(SuppressReason),
    Error(ModelError),
}

/// Coordinates the decision components for every inbound message.
pub struct Orchestrator {
    persona: String,
    context_turns: usize,
    max_message_length: usize,
    dialogue: CapabilityConfig,
    vision: Option<CapabilityConfig>,
    detector: TriggerDetector,
    gate: ReplyGate,
    limiter: RateLimiter,
    counter: TokenCounter,
    cache: ResponseCache,
    intent: IntentClassifier,
    memory: MemoryStore,
    conversations: ConversationStore,
    invoker: Arc<dyn ModelInvoker>,
}

impl Orchestrator {
    /// Resolve capabilities and wire the components. Configuration
    /// problems surface here, once, at startup.
    pub fn new(
        config: Config,
        invoker: Arc<dyn ModelInvoker>,
        mut memory: MemoryStore,
        conversations: ConversationStore,
    ) -> Result<Self, ConfigError> {
        let dialogue = resolve(CapabilityScope::Dialogue, &config.dialogue, &config.dialogue)?;
        let intent_cfg = resolve(CapabilityScope::Intent, &config.intent, &config.dialogue)?;
        let memory_cfg = resolve(CapabilityScope::Memory, &config.memory, &config.dialogue)?;
        let vision = if config.vision.is_configured() {
            Some(resolve(CapabilityScope::Vision, &config.vision, &config.dialogue)?)
        } else {
            None
        };

        // Model-assisted memory matching only when the operator set up
        // the memory capability; otherwise the heuristic carries it.
        // The matcher budget is separate from the dialogue budget.
        if config.memory.is_configured() {
            memory.set_matcher(Arc::new(ModelMatcher::new(
                invoker.clone(),
                memory_cfg,
                config.guardrails.rate_limit_tokens,
                config.guardrails.rate_limit_window,
            )));
        }

        Ok(Self {
            persona: config.persona,
            context_turns: config.context_turns,
            max_message_length: config.guardrails.max_message_length,
            dialogue,
            vision,
            detector: TriggerDetector::new(&config.triggers.keywords),
            gate: ReplyGate::new(config.stalker_mode),
            limiter: RateLimiter::new(
                config.guardrails.rate_limit_tokens,
                config.guardrails.rate_limit_window,
            ),
            counter: TokenCounter::new(),
            cache: ResponseCache::new(1024, 600, true),
            intent: IntentClassifier::new(invoker.clone(), intent_cfg),
            memory,
            conversations,
            invoker,
        })
    }

    pub fn gate(&self) -> &ReplyGate {
        &self.gate
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Handle one inbound event end to end.
    pub async fn handle_message(&self, event: InboundEvent) -> Outcome {
        let scope = ScopeId::chat(&event.scope_id);

        if event.text.chars().count() > self.max_message_length {
            debug!(scope = %scope, "message over length cap");
            return Outcome::Suppressed(SuppressReason::MessageTooLong);
        }

        let sender = event
            .sender_name
            .clone()
            .unwrap_or_else(|| event.sender_id.clone());
        if let Err(e) = self.conversations.add_turn(&event.scope_id, &sender, &event.text) {
            warn!("failed to record turn: {:#}", e);
        }

        let context = self
            .conversations
            .context_block(&event.scope_id, self.context_turns)
            .unwrap_or_default();

        let decision = self.intent.classify(&event.text, &context).await;
        let trigger = self.detector.detect(&event.text, event.is_mention);

        if !decision.should_reply {
            // The message still advances the gate's gap counter.
            self.gate.note_message(&scope);
            self.apply_memory_ops(&event, &decision.memory_ops).await;
            return Outcome::Suppressed(SuppressReason::IntentIgnored);
        }

        if !self.gate.should_reply(&scope, trigger) {
            self.apply_memory_ops(&event, &decision.memory_ops).await;
            return Outcome::Suppressed(SuppressReason::GateDeclined);
        }

        let estimate_basis = format!("{}{}{}", self.persona, context, event.text);
        let estimated = self
            .counter
            .estimate_request(&estimate_basis, self.dialogue.max_tokens);
        if !self.limiter.reserve(&scope, estimated) {
            info!(scope = %scope, "reply skipped, token budget exhausted");
            self.apply_memory_ops(&event, &decision.memory_ops).await;
            return Outcome::Suppressed(SuppressReason::RateLimited);
        }

        let memory_block = self.memory_block(&event);
        let vision_note = self.vision_note(&event).await;

        let mut system = self.persona.clone();
        if !memory_block.is_empty() {
            system.push_str("\n\n");
            system.push_str(&memory_block);
        }
        if let Some(description) = &vision_note {
            system.push_str("\n\nThe current message includes an image: ");
            system.push_str(description);
        }

        let user = if context.is_empty() {
            format!("{}: {}", sender, event.text)
        } else {
            format!("{}[Current message:]\n{}: {}", context, sender, event.text)
        };

        let key = ResponseCache::compute_key(&event.text, &self.persona, &memory_block);
        if let Some(cached) = self.cache.get(&key).await {
            self.finish_reply(&event, &decision.memory_ops, &cached).await;
            return Outcome::Sent(cached);
        }

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        match self.invoker.complete(&self.dialogue, &messages).await {
            Ok(reply) => {
                self.cache.set(&key, reply.clone()).await;
                self.finish_reply(&event, &decision.memory_ops, &reply).await;
                info!(scope = %scope, trigger = trigger.as_str(), "reply sent");
                Outcome::Sent(reply)
            }
            Err(e) => {
                // The reservation taken above stays committed.
                warn!(scope = %scope, "dialogue model call failed: {}", e);
                Outcome::Error(e)
            }
        }
    }

    async fn finish_reply(&self, event: &InboundEvent, ops: &[MemoryOp], reply: &str) {
        if let Err(e) = self.conversations.add_turn(&event.scope_id, BOT_SENDER, reply) {
            warn!("failed to record bot turn: {:#}", e);
        }
        self.apply_memory_ops(event, ops).await;
    }

    fn memory_block(&self, event: &InboundEvent) -> String {
        match self.memory.query(
            &event.sender_id,
            &event.scope_id,
            Some(&event.text),
            MEMORY_PROMPT_LIMIT,
        ) {
            Ok(records) if !records.is_empty() => {
                let mut block = String::from("Known facts about the participants:\n");
                for record in records {
                    block.push_str("- ");
                    block.push_str(&record.content);
                    block.push('\n');
                }
                block
            }
            Ok(_) => String::new(),
            Err(e) => {
                warn!("memory query failed: {:#}", e);
                String::new()
            }
        }
    }

    async fn vision_note(&self, event: &InboundEvent) -> Option<String> {
        let cfg = self.vision.as_ref()?;
        let image = event
            .attachments
            .iter()
            .find(|a| a.is_image() && !a.data_base64.is_empty())?;

        if base64::engine::general_purpose::STANDARD
            .decode(&image.data_base64)
            .is_err()
        {
            warn!("image attachment is not valid base64, skipping description");
            return None;
        }

        match self
            .invoker
            .describe_image(
                cfg,
                &image.data_base64,
                "Describe this image in one or two sentences for chat context.",
            )
            .await
        {
            Ok(description) => Some(description),
            Err(e) => {
                // The reply still goes out without the description.
                warn!("vision description failed: {}", e);
                None
            }
        }
    }

    async fn apply_memory_ops(&self, event: &InboundEvent, ops: &[MemoryOp]) {
        for op in ops {
            let result = match op.op {
                MemoryOpKind::Add => self
                    .memory
                    .add(&event.sender_id, &event.scope_id, &op.content)
                    .await
                    .map(|record| {
                        debug!(id = %record.id, "memory op: add");
                    }),
                MemoryOpKind::Forget => self
                    .memory
                    .forget(&event.sender_id, &event.scope_id, &op.content)
                    .await
                    .map(|removed| {
                        debug!(removed, "memory op: forget");
                    }),
            };
            if let Err(e) = result {
                warn!("memory op failed: {:#}", e);
            }
        }
    }
}
