//! Capability configuration
//!
//! Each functional role (dialogue, memory, intent, vision) is
//! independently configurable but defaults to the dialogue scope's
//! credentials. Resolution follows a fixed, enumerated fallback order
//! per field so behavior stays auditable: the capability's own value,
//! then — for `api_key` and `base_url` only — the dialogue value, then
//! a built-in default for sampling parameters. `model` never inherits
//! across scopes.

use serde::Deserialize;

use crate::error::ConfigError;

/// Functional roles of the decision core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityScope {
    Dialogue,
    Memory,
    Intent,
    Vision,
}

impl CapabilityScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityScope::Dialogue => "dialogue",
            CapabilityScope::Memory => "memory",
            CapabilityScope::Intent => "intent",
            CapabilityScope::Vision => "vision",
        }
    }
}

/// Partial per-capability section as written in the config document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitySection {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i64>,
}

impl CapabilitySection {
    /// Whether the section carries any explicit value at all.
    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
            || !self.api_key.is_empty()
            || !self.model.is_empty()
            || self.temperature.is_some()
            || self.max_tokens.is_some()
    }
}

/// Fully resolved capability configuration, ready for a model call.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityConfig {
    pub scope: CapabilityScope,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Built-in model per scope. Deliberately not inherited from dialogue —
/// a cheap classifier model must not silently become the expensive
/// dialogue model (or vice versa).
fn default_model(scope: CapabilityScope) -> &'static str {
    match scope {
        CapabilityScope::Dialogue => "qwen-plus",
        CapabilityScope::Memory => "qwen-turbo",
        CapabilityScope::Intent => "qwen-turbo",
        CapabilityScope::Vision => "qwen-vl-plus",
    }
}

fn default_temperature(scope: CapabilityScope) -> f32 {
    match scope {
        CapabilityScope::Dialogue => 0.7,
        CapabilityScope::Memory => 0.3,
        CapabilityScope::Intent => 0.1,
        CapabilityScope::Vision => 0.3,
    }
}

fn default_max_tokens(scope: CapabilityScope) -> u32 {
    match scope {
        CapabilityScope::Dialogue => 1024,
        CapabilityScope::Memory => 256,
        CapabilityScope::Intent => 256,
        CapabilityScope::Vision => 512,
    }
}

/// Resolve a capability section against the dialogue base.
///
/// `base` is the dialogue section itself when resolving
/// `CapabilityScope::Dialogue`.
pub fn resolve(
    scope: CapabilityScope,
    section: &CapabilitySection,
    base: &CapabilitySection,
) -> Result<CapabilityConfig, ConfigError> {
    let base_url = if !section.base_url.is_empty() {
        section.base_url.clone()
    } else {
        base.base_url.clone()
    };

    let api_key = if !section.api_key.is_empty() {
        section.api_key.clone()
    } else {
        base.api_key.clone()
    };

    let model = if !section.model.is_empty() {
        section.model.clone()
    } else {
        default_model(scope).to_string()
    };

    let temperature = section.temperature.unwrap_or_else(|| default_temperature(scope));
    if !(0.0..=2.0).contains(&temperature) {
        return Err(ConfigError::InvalidValue {
            field: "temperature",
            reason: format!("{} is outside 0.0..=2.0", temperature),
        });
    }

    let max_tokens = match section.max_tokens {
        Some(n) if n <= 0 => {
            return Err(ConfigError::InvalidValue {
                field: "max_tokens",
                reason: format!("{} must be positive", n),
            })
        }
        Some(n) if n > 200_000 => {
            return Err(ConfigError::InvalidValue {
                field: "max_tokens",
                reason: format!("{} exceeds the supported ceiling", n),
            })
        }
        Some(n) => n as u32,
        None => default_max_tokens(scope),
    };

    Ok(CapabilityConfig {
        scope,
        base_url,
        api_key,
        model,
        temperature,
        max_tokens,
    })
}
