//! Triggers fed by the engine and sibling subsystems rather than by the gateway

use super::{
    SummaryArgs, Trigger, TriggerArgs, TriggerConfig, TriggerMatch, parse_typed, user_mention,
};
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::events::ModActionKind;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterTriggerConfig {
    pub counter: String,
    pub trigger: String,
    /// Match when the counter drops back below the trigger instead
    pub reverse: bool,
}

pub struct CounterTriggerTrigger;

#[async_trait]
impl Trigger for CounterTriggerTrigger {
    fn name(&self) -> &'static str {
        "counter_trigger"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: CounterTriggerConfig = parse_typed(raw)?;
        if config.counter.is_empty() || config.trigger.is_empty() {
            return Err(AutomodError::Other(
                "counter and trigger are required".to_string(),
            ));
        }
        Ok(TriggerConfig::CounterTrigger(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::CounterTrigger(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let matched = args.context.counter_trigger.as_ref().is_some_and(|info| {
            info.counter == config.counter
                && info.trigger == config.trigger
                && info.reverse == config.reverse
        });
        Ok(matched.then(TriggerMatch::default))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        match &args.context.counter_trigger {
            Some(info) if info.reverse => format!(
                "counter `{}` went back below trigger `{}`",
                info.counter, info.trigger
            ),
            Some(info) => format!(
                "counter `{}` reached trigger `{}`",
                info.counter, info.trigger
            ),
            None => "counter trigger".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AntiraidLevelConfig {
    /// Level to match, `off` for no level; absent matches any level
    pub level: Option<String>,
    /// Ignore sets that did not change the level
    pub only_on_change: bool,
}

impl Default for AntiraidLevelConfig {
    fn default() -> Self {
        Self {
            level: None,
            only_on_change: true,
        }
    }
}

impl AntiraidLevelConfig {
    /// Level name this config refers to, excluding `off`
    #[must_use]
    pub fn referenced_level(&self) -> Option<&str> {
        self.level.as_deref().filter(|level| *level != "off")
    }
}

pub struct AntiraidLevelTrigger;

#[async_trait]
impl Trigger for AntiraidLevelTrigger {
    fn name(&self) -> &'static str {
        "antiraid_level"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::AntiraidLevel(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::AntiraidLevel(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let Some(change) = &args.context.antiraid else {
            return Ok(None);
        };

        if config.only_on_change && change.level == change.previous {
            return Ok(None);
        }
        let level_matches = match config.level.as_deref() {
            None => true,
            Some("off") => change.level.is_none(),
            Some(level) => change.level.as_deref() == Some(level),
        };
        Ok(level_matches.then(TriggerMatch::default))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let level = args
            .context
            .antiraid
            .as_ref()
            .and_then(|change| change.level.as_deref())
            .unwrap_or("off");
        format!("antiraid level set to {level}")
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModActionConfig {
    /// Match actions taken by moderators
    pub manual: bool,
    /// Match actions taken by automod itself
    pub automatic: bool,
}

impl Default for ModActionConfig {
    fn default() -> Self {
        Self {
            manual: true,
            automatic: true,
        }
    }
}

/// Fires when a moderation action of one kind was taken
pub struct ModActionTrigger {
    kind: ModActionKind,
}

pub fn mod_action_triggers() -> Vec<ModActionTrigger> {
    ModActionKind::ALL
        .into_iter()
        .map(|kind| ModActionTrigger { kind })
        .collect()
}

#[async_trait]
impl Trigger for ModActionTrigger {
    fn name(&self) -> &'static str {
        self.kind.trigger_name()
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::ModAction(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::ModAction(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let matched = args.context.mod_action.as_ref().is_some_and(|event| {
            event.kind == self.kind
                && if event.automatic {
                    config.automatic
                } else {
                    config.manual
                }
        });
        Ok(matched.then(TriggerMatch::default))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let reason = args
            .context
            .mod_action
            .as_ref()
            .and_then(|event| event.reason.as_deref())
            .map(|reason| format!(": {reason}"))
            .unwrap_or_default();
        format!("{} received a {}{reason}", user_mention(args.context), self.kind)
    }
}
