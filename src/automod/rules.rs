//! Rule configuration
//!
//! Rules are loaded from YAML and validated once. Every error found while
//! loading names the rule it came from. Triggers and actions are resolved
//! against the registries here, so a loaded [`Rule`] only ever refers to
//! known kinds with parsed configs.

use crate::automod::actions::{ActionConfig, ActionRegistry};
use crate::automod::antiraid::{AntiraidCriterion, DEFAULT_LEVELS};
use crate::automod::duration::{serde_duration, serde_duration_map, serde_opt_duration};
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::recent_actions::RecentActionKind;
use crate::automod::regex_runner::RegexRunnerSettings;
use crate::automod::triggers::{TriggerConfig, TriggerRegistry};
use poise::serenity_prelude::GuildId;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Engine-wide tunables shared by every guild
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(with = "serde_duration")]
    pub recent_action_ttl: Duration,
    #[serde(with = "serde_duration_map")]
    pub recent_action_ttl_overrides: HashMap<RecentActionKind, Duration>,
    #[serde(with = "serde_duration")]
    pub recent_spam_ttl: Duration,
    #[serde(with = "serde_duration")]
    pub nickname_change_ttl: Duration,
    #[serde(with = "serde_duration")]
    pub sweep_interval: Duration,
    pub regex: RegexRunnerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recent_action_ttl: Duration::from_secs(300),
            recent_action_ttl_overrides: HashMap::new(),
            recent_spam_ttl: Duration::from_secs(10),
            nickname_change_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            regex: RegexRunnerSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerInvocation {
    pub name: String,
    pub config: TriggerConfig,
}

#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub name: String,
    pub config: ActionConfig,
}

/// A loaded, validated rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub affects_bots: bool,
    pub affects_self: bool,
    /// Checked in order, first match wins
    pub triggers: Vec<TriggerInvocation>,
    /// Applied in declaration order
    pub actions: Vec<ActionInvocation>,
    pub cooldown: Option<Duration>,
    pub allow_further_rules: bool,
    pub antiraid_level: Option<AntiraidCriterion>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    affects_bots: bool,
    #[serde(default)]
    affects_self: bool,
    #[serde(default)]
    triggers: Vec<Value>,
    #[serde(default)]
    actions: Mapping,
    #[serde(default, with = "serde_opt_duration")]
    cooldown: Option<Duration>,
    #[serde(default)]
    allow_further_rules: bool,
    #[serde(default)]
    antiraid_level: Option<AntiraidCriterion>,
}

/// Registries and levels a rule is validated against
#[derive(Clone, Copy)]
pub struct RuleParser<'a> {
    pub triggers: &'a TriggerRegistry,
    pub actions: &'a ActionRegistry,
    pub levels: &'a [String],
}

impl RuleParser<'_> {
    /// Parse and validate one rule
    ///
    /// # Errors
    /// `AutomodError::Config` naming the rule.
    pub fn parse(&self, name: &str, raw: Value) -> AutomodResult<Rule> {
        let raw: RawRule =
            serde_yaml::from_value(raw).map_err(|e| AutomodError::config(name, e.to_string()))?;
        self.build(name, raw)
            .map_err(|e| match e {
                AutomodError::Config { .. } => e,
                e => AutomodError::config(name, e.to_string()),
            })
    }

    fn build(&self, name: &str, raw: RawRule) -> AutomodResult<Rule> {
        if raw.triggers.is_empty() {
            return Err(AutomodError::config(name, "a rule needs at least one trigger"));
        }

        let triggers = raw
            .triggers
            .into_iter()
            .map(|entry| self.trigger(entry))
            .collect::<AutomodResult<Vec<_>>>()?;

        let mut actions = Vec::new();
        for (key, value) in raw.actions {
            let action_name = key_name(&key)?;
            if let Some(config) = self.actions.parse_config(&action_name, value)? {
                actions.push(ActionInvocation {
                    name: action_name,
                    config,
                });
            }
        }

        if let Some(criterion) = &raw.antiraid_level {
            self.check_level(criterion.referenced_level())?;
        }
        for trigger in &triggers {
            if let TriggerConfig::AntiraidLevel(config) = &trigger.config {
                self.check_level(config.referenced_level())?;
            }
        }
        for action in &actions {
            if let ActionConfig::SetAntiraidLevel(level) = &action.config {
                self.check_level(level.as_deref())?;
            }
        }

        Ok(Rule {
            name: name.to_string(),
            enabled: raw.enabled,
            affects_bots: raw.affects_bots,
            affects_self: raw.affects_self,
            triggers,
            actions,
            cooldown: raw.cooldown,
            allow_further_rules: raw.allow_further_rules,
            antiraid_level: raw.antiraid_level,
        })
    }

    /// A trigger entry is `{ name: config }` or a bare `name`
    fn trigger(&self, entry: Value) -> AutomodResult<TriggerInvocation> {
        let (name, raw) = match entry {
            Value::String(name) => (name, Value::Null),
            Value::Mapping(map) if map.len() == 1 => {
                let Some((key, value)) = map.into_iter().next() else {
                    return Err(AutomodError::Other("empty trigger entry".to_string()));
                };
                (key_name(&key)?, value)
            }
            _ => {
                return Err(AutomodError::Other(
                    "each trigger entry must name exactly one trigger".to_string(),
                ));
            }
        };
        let config = self.triggers.parse_config(&name, raw)?;
        Ok(TriggerInvocation { name, config })
    }

    fn check_level(&self, level: Option<&str>) -> AutomodResult<()> {
        match level {
            Some(level) if !self.levels.iter().any(|known| known == level) => {
                Err(AutomodError::Other(format!(
                    "unknown antiraid level `{level}`, expected one of: {}",
                    self.levels.join(", ")
                )))
            }
            _ => Ok(()),
        }
    }
}

fn key_name(key: &Value) -> AutomodResult<String> {
    key.as_str()
        .map(ToString::to_string)
        .ok_or_else(|| AutomodError::Other(format!("expected a name, got {key:?}")))
}

fn default_levels() -> Vec<String> {
    DEFAULT_LEVELS.iter().map(ToString::to_string).collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGuildConfig {
    #[serde(default = "default_levels")]
    antiraid_levels: Vec<String>,
    #[serde(default)]
    rules: Mapping,
}

/// Rules and antiraid levels of one guild
#[derive(Debug, Clone)]
pub struct GuildConfig {
    /// Lowest first
    pub antiraid_levels: Vec<String>,
    /// In declaration order
    pub rules: Vec<Rule>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            antiraid_levels: default_levels(),
            rules: Vec::new(),
        }
    }
}

impl GuildConfig {
    /// Parse a guild section
    ///
    /// # Errors
    /// Invalid level lists, and any rule error.
    pub fn parse(
        raw: Value,
        triggers: &TriggerRegistry,
        actions: &ActionRegistry,
    ) -> AutomodResult<Self> {
        let raw: RawGuildConfig = serde_yaml::from_value(raw)?;
        validate_levels(&raw.antiraid_levels)?;

        let parser = RuleParser {
            triggers,
            actions,
            levels: &raw.antiraid_levels,
        };
        let mut rules = Vec::with_capacity(raw.rules.len());
        for (key, value) in raw.rules {
            let name = key_name(&key)?;
            rules.push(parser.parse(&name, value)?);
        }

        Ok(Self {
            antiraid_levels: raw.antiraid_levels,
            rules,
        })
    }
}

fn validate_levels(levels: &[String]) -> AutomodResult<()> {
    if levels.is_empty() {
        return Err(AutomodError::Other(
            "antiraid_levels must not be empty".to_string(),
        ));
    }
    for (index, level) in levels.iter().enumerate() {
        if level.is_empty() || level == "off" {
            return Err(AutomodError::Other(format!(
                "`{level}` is not a valid antiraid level name"
            )));
        }
        if levels[..index].contains(level) {
            return Err(AutomodError::Other(format!(
                "antiraid level `{level}` is listed twice"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAutomodConfig {
    #[serde(default)]
    engine: EngineSettings,
    #[serde(default)]
    guilds: Mapping,
}

/// The whole automod configuration file
#[derive(Debug, Clone, Default)]
pub struct AutomodConfig {
    pub engine: EngineSettings,
    pub guilds: HashMap<GuildId, GuildConfig>,
}

impl AutomodConfig {
    /// Parse and validate a configuration document
    ///
    /// # Errors
    /// Malformed YAML, bad guild ids and any rule error.
    pub fn from_yaml(
        text: &str,
        triggers: &TriggerRegistry,
        actions: &ActionRegistry,
    ) -> AutomodResult<Self> {
        let raw: RawAutomodConfig = if text.trim().is_empty() {
            RawAutomodConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };

        let mut guilds = HashMap::with_capacity(raw.guilds.len());
        for (key, value) in raw.guilds {
            let guild_id = parse_guild_id(&key)?;
            guilds.insert(guild_id, GuildConfig::parse(value, triggers, actions)?);
        }

        Ok(Self {
            engine: raw.engine,
            guilds,
        })
    }
}

fn parse_guild_id(key: &Value) -> AutomodResult<GuildId> {
    let id = match key {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    id.filter(|id| *id != 0)
        .map(GuildId::new)
        .ok_or_else(|| AutomodError::Other(format!("invalid guild id {key:?}")))
}
