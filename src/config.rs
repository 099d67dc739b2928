//! Configuration management
//!
//! Loads the structured config document (TOML) and overlays credentials
//! from the environment. Validation happens once at load; a malformed
//! document is a startup failure, never a per-message one.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::capability::CapabilitySection;
use crate::error::ConfigError;

/// Stalker-mode parameters: low-probability ambient participation for
/// group chats, with hard caps on reply volume.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StalkerModeConfig {
    pub enabled: bool,
    pub default_probability: f64,
    pub mention_probability: f64,
    pub keyword_probability: f64,
    pub question_probability: f64,
    pub min_messages_between_replies: u32,
    pub max_replies_per_hour: u32,
}

impl Default for StalkerModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_probability: 0.03,
            mention_probability: 0.8,
            keyword_probability: 0.5,
            question_probability: 0.4,
            min_messages_between_replies: 15,
            max_replies_per_hour: 8,
        }
    }
}

/// Guardrails: message-size and token-budget limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Inbound messages longer than this (chars) are dropped outright.
    pub max_message_length: usize,
    /// Token budget per scope within the sliding window.
    pub rate_limit_tokens: u64,
    /// Sliding window length in seconds.
    pub rate_limit_window: u64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_message_length: 2000,
            rate_limit_tokens: 8000,
            rate_limit_window: 60,
        }
    }
}

/// Trigger detection knobs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Words that raise the reply probability from ambient to keyword.
    pub keywords: Vec<String>,
}

fn default_persona() -> String {
    "You are a friendly member of this group chat. Keep replies short and conversational."
        .to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ambientbot")
}

fn default_context_turns() -> usize {
    10
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// System prompt for the dialogue model.
    #[serde(default = "default_persona")]
    pub persona: String,

    /// Directory holding the SQLite databases.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Turns of conversation context injected into prompts.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,

    /// Base capability; other scopes inherit its credentials.
    pub dialogue: CapabilitySection,
    #[serde(default)]
    pub memory: CapabilitySection,
    #[serde(default)]
    pub intent: CapabilitySection,
    #[serde(default)]
    pub vision: CapabilitySection,

    #[serde(default)]
    pub stalker_mode: StalkerModeConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
}

impl Config {
    /// Load and validate a TOML config file, then overlay environment
    /// credentials.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Credentials may live in the environment instead of the document.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("AMBIENTBOT_API_KEY") {
            if !key.is_empty() {
                self.dialogue.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("AMBIENTBOT_BASE_URL") {
            if !url.is_empty() {
                self.dialogue.base_url = url;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dialogue.base_url.is_empty() {
            return Err(ConfigError::MissingField("dialogue.base_url"));
        }
        if self.guardrails.max_message_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "guardrails.max_message_length",
                reason: "must be positive".to_string(),
            });
        }
        if self.guardrails.rate_limit_window == 0 {
            return Err(ConfigError::InvalidValue {
                field: "guardrails.rate_limit_window",
                reason: "must be positive".to_string(),
            });
        }
        for (name, p) in [
            ("stalker_mode.default_probability", self.stalker_mode.default_probability),
            ("stalker_mode.mention_probability", self.stalker_mode.mention_probability),
            ("stalker_mode.keyword_probability", self.stalker_mode.keyword_probability),
            ("stalker_mode.question_probability", self.stalker_mode.question_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidValue {
                    field: name,
                    reason: format!("{} is outside 0.0..=1.0", p),
                });
            }
        }
        Ok(())
    }
}
