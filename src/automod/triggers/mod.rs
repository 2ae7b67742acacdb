//! Trigger registry
//!
//! A trigger decides whether an evaluation context satisfies one condition
//! of a rule. The set of triggers is closed: every kind is registered by its
//! stable name in [`TriggerRegistry::new`], and rule configs naming anything
//! else are rejected when they load.

mod content;
mod member;
mod spam;
mod synthetic;

pub use content::{
    MatchAttachmentTypeConfig, MatchInvitesConfig, MatchLinksConfig, MatchRegexConfig,
    MatchWordsConfig,
};
pub use member::{ChannelsConfig, MemberJoinConfig, RolesConfig, ThreadsConfig};
pub use spam::{EventSpamConfig, SpamConfig};
pub use synthetic::{AntiraidLevelConfig, CounterTriggerConfig, ModActionConfig};

use crate::automod::context::EvaluationContext;
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::recent_actions::RecentActionKind;
use crate::automod::regex_runner::Pattern;
use crate::automod::state::GuildState;
use async_trait::async_trait;
use derive_more::Display;
use poise::serenity_prelude::{ChannelId, RoleId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Inputs of one trigger check
pub struct TriggerArgs<'a> {
    pub state: &'a GuildState,
    pub rule_name: &'a str,
    pub context: &'a Arc<EvaluationContext>,
    pub config: &'a TriggerConfig,
}

/// Inputs of summary rendering after a match
pub struct SummaryArgs<'a> {
    pub rule_name: &'a str,
    pub context: &'a EvaluationContext,
    pub config: &'a TriggerConfig,
    pub matched: &'a TriggerMatch,
}

/// Where matched text came from
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    #[display("message")]
    Message,
    #[display("username")]
    Username,
    #[display("nickname")]
    Nickname,
}

/// What a trigger found, kept for summaries
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MatchDetail {
    #[default]
    None,
    Spam {
        kind: RecentActionKind,
        count: u64,
        within: Duration,
    },
    Found {
        what: String,
        source: MatchSource,
    },
    Roles(Vec<RoleId>),
    Channel(ChannelId),
}

/// A successful trigger check
#[derive(Debug, Clone, Default)]
pub struct TriggerMatch {
    /// Other contexts that belong to the same incident, such as the earlier
    /// messages of a spam burst
    pub extra_contexts: Vec<Arc<EvaluationContext>>,
    /// Only clean up the event; the incident was already handled
    pub silent_clean: bool,
    pub detail: MatchDetail,
}

impl TriggerMatch {
    #[must_use]
    pub fn with_detail(detail: MatchDetail) -> Self {
        Self {
            detail,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn silent_clean() -> Self {
        Self {
            silent_clean: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_extra_contexts(mut self, contexts: Vec<Arc<EvaluationContext>>) -> Self {
        self.extra_contexts = contexts;
        self
    }
}

/// Parsed trigger configuration, one variant per config shape
#[derive(Debug, Clone)]
pub enum TriggerConfig {
    Empty,
    Spam(SpamConfig),
    EventSpam(EventSpamConfig),
    MatchWords {
        config: MatchWordsConfig,
        pattern: Pattern,
    },
    MatchRegex {
        config: MatchRegexConfig,
        patterns: Vec<Pattern>,
    },
    MatchInvites(MatchInvitesConfig),
    MatchLinks(MatchLinksConfig),
    MatchAttachmentType(MatchAttachmentTypeConfig),
    MemberJoin(MemberJoinConfig),
    Roles(RolesConfig),
    Channels(ChannelsConfig),
    Threads(ThreadsConfig),
    CounterTrigger(CounterTriggerConfig),
    AntiraidLevel(AntiraidLevelConfig),
    ModAction(ModActionConfig),
}

/// A rule condition
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Stable name used in rule configuration
    fn name(&self) -> &'static str;

    /// Deserialize and validate this trigger's config
    ///
    /// # Errors
    /// Malformed or contradictory options.
    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig>;

    /// Check the context
    ///
    /// # Errors
    /// A config of the wrong kind, or a failed pattern match.
    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>>;

    /// Describe a match for audit logs and alerts
    fn render_summary(&self, args: SummaryArgs<'_>) -> String;
}

/// Deserialize a typed config; an absent config or `true` selects the defaults
pub(crate) fn parse_typed<T>(raw: serde_yaml::Value) -> AutomodResult<T>
where
    T: DeserializeOwned + Default,
{
    match raw {
        serde_yaml::Value::Null | serde_yaml::Value::Bool(true) => Ok(T::default()),
        raw => Ok(serde_yaml::from_value(raw)?),
    }
}

/// Accept only an absent, `true` or empty config
pub(crate) fn parse_empty(name: &str, raw: &serde_yaml::Value) -> AutomodResult<TriggerConfig> {
    match raw {
        serde_yaml::Value::Null | serde_yaml::Value::Bool(true) => Ok(TriggerConfig::Empty),
        serde_yaml::Value::Mapping(map) if map.is_empty() => Ok(TriggerConfig::Empty),
        _ => Err(AutomodError::Other(format!("{name} takes no options"))),
    }
}

/// Mention of the context's user for summaries
pub(crate) fn user_mention(context: &EvaluationContext) -> String {
    context
        .user_id()
        .map_or_else(|| "unknown user".to_string(), |id| format!("<@{id}>"))
}

/// Closed set of triggers, by name
pub struct TriggerRegistry {
    triggers: HashMap<&'static str, Box<dyn Trigger>>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerRegistry {
    /// Create a registry holding every trigger kind
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            triggers: HashMap::new(),
        };

        registry.register(Box::new(content::AnyMessageTrigger));
        for trigger in spam::message_spam_triggers() {
            registry.register(Box::new(trigger));
        }
        registry.register(Box::new(spam::EventSpamTrigger::member_join()));
        registry.register(Box::new(spam::EventSpamTrigger::thread_create()));
        registry.register(Box::new(content::MatchWordsTrigger));
        registry.register(Box::new(content::MatchRegexTrigger));
        registry.register(Box::new(content::MatchInvitesTrigger));
        registry.register(Box::new(content::MatchLinksTrigger));
        registry.register(Box::new(content::MatchAttachmentTypeTrigger));
        registry.register(Box::new(member::MemberJoinTrigger));
        registry.register(Box::new(member::MemberLeaveTrigger));
        registry.register(Box::new(member::RoleChangeTrigger::added()));
        registry.register(Box::new(member::RoleChangeTrigger::removed()));
        registry.register(Box::new(member::VoiceChannelTrigger::join()));
        registry.register(Box::new(member::VoiceChannelTrigger::leave()));
        registry.register(Box::new(member::ThreadTrigger::create()));
        registry.register(Box::new(member::ThreadTrigger::delete()));
        registry.register(Box::new(synthetic::CounterTriggerTrigger));
        registry.register(Box::new(synthetic::AntiraidLevelTrigger));
        for trigger in synthetic::mod_action_triggers() {
            registry.register(Box::new(trigger));
        }

        registry
    }

    /// Register a trigger under its own name
    pub fn register(&mut self, trigger: Box<dyn Trigger>) {
        self.triggers.insert(trigger.name(), trigger);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Trigger> {
        self.triggers.get(name).map(AsRef::as_ref)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.triggers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Parse the config of the trigger called `name`
    ///
    /// # Errors
    /// `UnknownTrigger` for unregistered names, otherwise whatever the
    /// trigger's own validation reports.
    pub fn parse_config(&self, name: &str, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        self.get(name)
            .ok_or_else(|| AutomodError::UnknownTrigger(name.to_string()))?
            .parse_config(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_closed() {
        let registry = TriggerRegistry::new();
        let names = registry.names();
        for expected in [
            "any_message",
            "message_spam",
            "mention_spam",
            "link_spam",
            "attachment_spam",
            "emoji_spam",
            "line_spam",
            "character_spam",
            "sticker_spam",
            "member_join_spam",
            "thread_create_spam",
            "match_words",
            "match_regex",
            "match_invites",
            "match_links",
            "match_attachment_type",
            "member_join",
            "member_leave",
            "role_added",
            "role_removed",
            "voice_channel_join",
            "voice_channel_leave",
            "thread_create",
            "thread_delete",
            "counter_trigger",
            "antiraid_level",
            "mute",
            "unmute",
            "warn",
            "kick",
            "ban",
            "unban",
            "note",
        ] {
            assert!(names.contains(&expected), "missing trigger {expected}");
        }
        assert_eq!(names.len(), 33);

        let err = registry
            .parse_config("telepathy", serde_yaml::Value::Null)
            .unwrap_err();
        assert!(matches!(err, AutomodError::UnknownTrigger(name) if name == "telepathy"));
    }

    #[test]
    fn test_empty_configs() {
        let registry = TriggerRegistry::new();
        assert!(registry.parse_config("any_message", serde_yaml::Value::Null).is_ok());
        assert!(registry.parse_config("member_leave", serde_yaml::Value::Bool(true)).is_ok());
        let raw: serde_yaml::Value = serde_yaml::from_str("{ amount: 3 }").unwrap();
        assert!(registry.parse_config("any_message", raw).is_err());
    }
}
