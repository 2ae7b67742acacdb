//! Operator-facing audit and alert notifications

use crate::AUDIT_TARGET;
use async_trait::async_trait;
use poise::serenity_prelude::GuildId;
use tracing::{info, warn};

/// Notification emitted by the engine for operators
#[derive(Debug, Clone, PartialEq)]
pub enum AuditEvent {
    /// A pattern exceeded its time budget
    RegexTimeout { pattern: String, timeout_ms: u64 },
    /// A pattern timed out repeatedly and was disabled for a while
    RepeatedRegexTimeout {
        pattern: String,
        failures: usize,
        cooldown_secs: u64,
    },
    /// A rule matched
    RuleMatched {
        rule: String,
        trigger: String,
        summary: String,
    },
    /// An action of a matched rule failed
    ActionFailed {
        rule: String,
        action: String,
        error: String,
    },
    /// Output of the `log` action
    Log { rule: String, summary: String },
    /// The antiraid level was changed
    AntiraidLevelChanged {
        level: Option<String>,
        actor: String,
    },
}

/// Receiver of audit notifications
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn notify(&self, guild_id: GuildId, event: AuditEvent);
}

/// Audit sink that writes every event to the `audit` tracing target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn notify(&self, guild_id: GuildId, event: AuditEvent) {
        match event {
            AuditEvent::RegexTimeout {
                pattern,
                timeout_ms,
            } => warn!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                pattern = %pattern,
                timeout_ms,
                event = "regex_timeout",
                "Regex timed out"
            ),
            AuditEvent::RepeatedRegexTimeout {
                pattern,
                failures,
                cooldown_secs,
            } => warn!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                pattern = %pattern,
                failures,
                cooldown_secs,
                event = "regex_repeated_timeout",
                "Regex timed out repeatedly and is disabled for a while"
            ),
            AuditEvent::RuleMatched {
                rule,
                trigger,
                summary,
            } => info!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                rule = %rule,
                trigger = %trigger,
                summary = %summary,
                event = "rule_matched",
                "Automod rule matched"
            ),
            AuditEvent::ActionFailed {
                rule,
                action,
                error,
            } => warn!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                rule = %rule,
                action = %action,
                error = %error,
                event = "action_failed",
                "Automod action failed"
            ),
            AuditEvent::Log { rule, summary } => info!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                rule = %rule,
                summary = %summary,
                event = "log",
            ),
            AuditEvent::AntiraidLevelChanged { level, actor } => info!(
                target: AUDIT_TARGET,
                guild_id = %guild_id,
                level = level.as_deref().unwrap_or("off"),
                actor = %actor,
                event = "antiraid_level",
                "Antiraid level changed"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Audit sink that remembers everything it was told
    #[derive(Default)]
    pub struct RecordingAuditSink {
        pub events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingAuditSink {
        pub fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for RecordingAuditSink {
        async fn notify(&self, _guild_id: GuildId, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
