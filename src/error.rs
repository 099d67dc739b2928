//! Error taxonomy
//!
//! Two failure classes carry types: configuration problems (fatal at
//! startup) and model invocation failures (recovered per message).
//! Rate-limit denial and zero-match forgets are ordinary return values.

use thiserror::Error;

/// Malformed or missing configuration. Raised once at startup, never
/// per message.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A model endpoint call failed. Handlers recover locally; the chat
/// never sees these.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error("completion was empty")]
    EmptyCompletion,

    #[error("malformed response: {0}")]
    Malformed(String),
}
