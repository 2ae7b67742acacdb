//! Error types for the automod engine
//!
//! This module defines the errors that can occur while loading rules,
//! evaluating them and applying their actions.

use thiserror::Error;

/// Errors that can occur during automod operations
#[derive(Debug, Error)]
pub enum AutomodError {
    /// Rule configuration was rejected at load time
    #[error("Invalid configuration for rule {rule}: {message}")]
    Config { rule: String, message: String },

    /// A rule referenced a trigger that is not registered
    #[error("Unknown trigger: {0}")]
    UnknownTrigger(String),

    /// A rule referenced an action that is not registered
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// Pattern matching exceeded its time budget
    #[error("Regex timed out after {timeout_ms}ms: {source_pattern}")]
    RegexTimeout {
        source_pattern: String,
        timeout_ms: u64,
    },

    /// Every pattern worker stayed busy for the whole time budget
    #[error("No pattern worker free within {waited_ms}ms for: {source_pattern}")]
    RegexWorkersBusy {
        source_pattern: String,
        waited_ms: u64,
    },

    /// A pattern could not be compiled
    #[error("Invalid pattern {pattern}: {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The pattern worker failed for a reason other than a timeout
    #[error("Pattern worker failed: {0}")]
    PatternWorker(String),

    /// A trigger or action received a config of the wrong shape
    #[error("{0} received a config of the wrong kind")]
    ConfigMismatch(&'static str),

    /// An action effect failed at the collaborator
    #[error("Effect {effect} failed: {message}")]
    Effect {
        effect: &'static str,
        message: String,
    },

    /// The durable antiraid store failed
    #[error("Antiraid store error: {0}")]
    Store(String),

    /// The guild's execution queue no longer accepts jobs
    #[error("Execution queue is closed")]
    QueueClosed,

    /// Discord API error
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<poise::serenity_prelude::Error>),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("Automod error: {0}")]
    Other(String),
}

impl From<poise::serenity_prelude::Error> for AutomodError {
    fn from(error: poise::serenity_prelude::Error) -> Self {
        Self::DiscordApi(Box::new(error))
    }
}

impl From<String> for AutomodError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl AutomodError {
    /// Create a configuration error for a rule
    pub fn config(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Whether this error is a pattern timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RegexTimeout { .. })
    }

    /// Pattern errors that only mean "this pattern gave no answer this time"
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RegexTimeout { .. } | Self::RegexWorkersBusy { .. })
    }
}

/// Result type for automod operations
pub type AutomodResult<T> = Result<T, AutomodError>;
