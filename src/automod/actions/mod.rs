//! Action registry
//!
//! Actions are the side effects of a matched rule. Like triggers they form a
//! closed set registered by name at startup. An action turns the matched
//! contexts and its config into [`Effect`]s for the effects collaborator, or
//! talks to the engine directly for engine-owned state.

mod guild;
mod member;
mod messaging;
mod moderation;

pub use guild::{AddToCounterConfig, ArchiveThreadConfig, SetCounterConfig, SlowmodeConfig};
pub use member::{NicknameConfig, RoleListConfig};
pub use messaging::{AlertConfig, ReplyConfig};
pub use moderation::{BanConfig, MuteConfig, ReasonConfig};

use crate::automod::context::EvaluationContext;
use crate::automod::effects::Effect;
use crate::automod::engine::GuildEngine;
use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::UserId;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Inputs of one action application
pub struct ActionArgs<'a> {
    pub engine: &'a GuildEngine,
    pub rule_name: &'a str,
    /// The primary context followed by the linked ones
    pub contexts: &'a [Arc<EvaluationContext>],
    pub config: &'a ActionConfig,
    /// Rendered summary of the match
    pub summary: &'a str,
}

impl ActionArgs<'_> {
    /// The context that caused the evaluation
    #[must_use]
    pub fn primary(&self) -> Option<&EvaluationContext> {
        self.contexts.first().map(AsRef::as_ref)
    }

    /// Every distinct user across the contexts, in order of appearance
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut users = Vec::new();
        for user_id in self.contexts.iter().filter_map(|context| context.user_id()) {
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        }
        users
    }

    /// Perform every effect, attempting all of them even if some fail
    ///
    /// # Errors
    /// The first failure, after the remaining effects were attempted.
    pub async fn perform_all(&self, effects: Vec<Effect>) -> AutomodResult<()> {
        let guild_id = self.engine.guild_id();
        let mut first_error = None;
        for effect in effects {
            let name = effect.name();
            if let Err(e) = self.engine.effects().perform(guild_id, effect).await {
                warn!(
                    guild_id = %guild_id,
                    rule = self.rule_name,
                    effect = name,
                    error = %e,
                    "Automod effect failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Parsed action configuration, one variant per config shape
#[derive(Debug, Clone, PartialEq)]
pub enum ActionConfig {
    Clean,
    Log,
    Reason(ReasonConfig),
    Mute(MuteConfig),
    Ban(BanConfig),
    Alert(AlertConfig),
    Reply(ReplyConfig),
    Roles(RoleListConfig),
    ChangeNickname(NicknameConfig),
    SetSlowmode(SlowmodeConfig),
    ArchiveThread(ArchiveThreadConfig),
    /// `None` turns antiraid off
    SetAntiraidLevel(Option<String>),
    AddToCounter(AddToCounterConfig),
    SetCounter(SetCounterConfig),
}

/// A rule side effect
#[async_trait]
pub trait Action: Send + Sync {
    /// Stable name used in rule configuration
    fn name(&self) -> &'static str;

    /// Deserialize and validate this action's config; `true` arrives as null
    ///
    /// # Errors
    /// Malformed options or missing required ones.
    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig>;

    /// Apply the action to the matched contexts
    ///
    /// # Errors
    /// A config of the wrong kind, or a failure of the underlying effect.
    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()>;
}

/// Accept only an absent, `true` or empty config
pub(crate) fn parse_unit(
    name: &str,
    raw: &serde_yaml::Value,
    config: ActionConfig,
) -> AutomodResult<ActionConfig> {
    match raw {
        serde_yaml::Value::Null => Ok(config),
        serde_yaml::Value::Mapping(map) if map.is_empty() => Ok(config),
        _ => Err(AutomodError::Other(format!("{name} takes no options"))),
    }
}

/// Deserialize a config whose options have no defaults
pub(crate) fn parse_required<T: DeserializeOwned>(
    name: &str,
    raw: serde_yaml::Value,
) -> AutomodResult<T> {
    if raw.is_null() {
        return Err(AutomodError::Other(format!("{name} requires options")));
    }
    Ok(serde_yaml::from_value(raw)?)
}

/// Fill `{user}`, `{rule}`, `{summary}` and `{channel}` in an operator text
pub(crate) fn render_text(template: &str, args: &ActionArgs<'_>) -> String {
    let primary = args.primary();
    let user = primary
        .and_then(EvaluationContext::user_id)
        .map_or_else(|| "unknown user".to_string(), |id| format!("<@{id}>"));
    let channel = primary
        .and_then(EvaluationContext::channel_id)
        .map_or_else(String::new, |id| format!("<#{id}>"));
    template
        .replace("{user}", &user)
        .replace("{rule}", args.rule_name)
        .replace("{summary}", args.summary)
        .replace("{channel}", &channel)
}

/// Closed set of actions, by name
pub struct ActionRegistry {
    actions: HashMap<&'static str, Box<dyn Action>>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    /// Create a registry holding every action kind
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
        };

        registry.register(Box::new(moderation::CleanAction));
        registry.register(Box::new(moderation::WarnAction));
        registry.register(Box::new(moderation::MuteAction));
        registry.register(Box::new(moderation::KickAction));
        registry.register(Box::new(moderation::BanAction));
        registry.register(Box::new(messaging::AlertAction));
        registry.register(Box::new(messaging::LogAction));
        registry.register(Box::new(messaging::ReplyAction));
        registry.register(Box::new(member::RoleAction::add()));
        registry.register(Box::new(member::RoleAction::remove()));
        registry.register(Box::new(member::ChangeNicknameAction));
        registry.register(Box::new(guild::SetSlowmodeAction));
        registry.register(Box::new(guild::SetAntiraidLevelAction));
        registry.register(Box::new(guild::CounterAction::add()));
        registry.register(Box::new(guild::CounterAction::set()));
        registry.register(Box::new(guild::ArchiveThreadAction));

        registry
    }

    /// Register an action under its own name
    pub fn register(&mut self, action: Box<dyn Action>) {
        self.actions.insert(action.name(), action);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Action> {
        self.actions.get(name).map(AsRef::as_ref)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Parse the config of the action called `name`
    ///
    /// Returns `None` for a disabled action (`false` or null).
    ///
    /// # Errors
    /// `UnknownAction` for unregistered names, otherwise whatever the
    /// action's own validation reports.
    pub fn parse_config(
        &self,
        name: &str,
        raw: serde_yaml::Value,
    ) -> AutomodResult<Option<ActionConfig>> {
        let action = self
            .get(name)
            .ok_or_else(|| AutomodError::UnknownAction(name.to_string()))?;
        match raw {
            serde_yaml::Value::Null | serde_yaml::Value::Bool(false) => Ok(None),
            serde_yaml::Value::Bool(true) => action.parse_config(serde_yaml::Value::Null).map(Some),
            raw => action.parse_config(raw).map(Some),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::automod::context::test_support::message_context;
    use chrono::Utc;
    use poise::serenity_prelude::MessageId;
    use std::sync::atomic::{AtomicU64, Ordering};

    pub fn parse(name: &str, yaml: &str) -> AutomodResult<Option<ActionConfig>> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        ActionRegistry::new().parse_config(name, raw)
    }

    /// Apply the named action to the given contexts
    pub async fn apply(
        engine: &GuildEngine,
        name: &str,
        yaml: &str,
        contexts: &[Arc<EvaluationContext>],
    ) -> AutomodResult<()> {
        let config = parse(name, yaml)?.expect("action is enabled");
        ActionRegistry::new()
            .get(name)
            .unwrap()
            .apply(ActionArgs {
                engine,
                rule_name: "test_rule",
                contexts,
                config: &config,
                summary: "test summary",
            })
            .await
    }

    static NEXT_MESSAGE: AtomicU64 = AtomicU64::new(1);

    /// Message context with a unique message id
    pub fn message(user_id: u64, channel_id: u64, content: &str) -> Arc<EvaluationContext> {
        let mut context = message_context(Utc::now(), user_id, channel_id, content);
        if let Some(message) = context.message.as_mut() {
            message.id = MessageId::new(NEXT_MESSAGE.fetch_add(1, Ordering::Relaxed));
        }
        context.shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_is_closed() {
        let registry = ActionRegistry::new();
        assert_eq!(
            registry.names(),
            vec![
                "add_roles",
                "add_to_counter",
                "alert",
                "archive_thread",
                "ban",
                "change_nickname",
                "clean",
                "kick",
                "log",
                "mute",
                "remove_roles",
                "reply",
                "set_antiraid_level",
                "set_counter",
                "set_slowmode",
                "warn",
            ]
        );
        assert!(matches!(
            registry.parse_config("explode", serde_yaml::Value::Null),
            Err(AutomodError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_disabled_and_default_configs() {
        assert_eq!(test_support::parse("clean", "false").unwrap(), None);
        assert_eq!(test_support::parse("clean", "~").unwrap(), None);
        assert_eq!(
            test_support::parse("clean", "true").unwrap(),
            Some(ActionConfig::Clean)
        );
        assert!(test_support::parse("clean", "{ everything: true }").is_err());
        // Required options cannot be defaulted
        assert!(test_support::parse("alert", "true").is_err());
    }
}
