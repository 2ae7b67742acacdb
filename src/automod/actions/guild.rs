//! Actions on guild-level state: channels, threads, counters and the antiraid level

use super::{Action, ActionArgs, ActionConfig, parse_required};
use crate::automod::duration::serde_duration;
use crate::automod::effects::{CounterChange, Effect};
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::triggers::parse_typed;
use async_trait::async_trait;
use poise::serenity_prelude::ChannelId;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Longest slowmode the platform accepts
const MAX_SLOWMODE: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlowmodeConfig {
    /// Channels to slow down; empty means the channel of the match
    pub channels: Vec<ChannelId>,
    #[serde(with = "serde_duration")]
    pub duration: Duration,
}

impl Default for SlowmodeConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            duration: Duration::from_secs(10),
        }
    }
}

pub struct SetSlowmodeAction;

#[async_trait]
impl Action for SetSlowmodeAction {
    fn name(&self) -> &'static str {
        "set_slowmode"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config: SlowmodeConfig = parse_typed(raw)?;
        if config.duration > MAX_SLOWMODE {
            return Err(AutomodError::Other(
                "slowmode must be at most 6 hours".to_string(),
            ));
        }
        Ok(ActionConfig::SetSlowmode(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::SetSlowmode(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let channels = if config.channels.is_empty() {
            args.primary()
                .and_then(|context| context.channel_id())
                .into_iter()
                .collect()
        } else {
            config.channels.clone()
        };
        let seconds = u16::try_from(config.duration.as_secs()).unwrap_or(u16::MAX);

        let effects = channels
            .into_iter()
            .map(|channel_id| Effect::SetSlowmode {
                channel_id,
                seconds,
            })
            .collect();
        args.perform_all(effects).await
    }
}

/// Switches the guild's antiraid level from within a rule
pub struct SetAntiraidLevelAction;

#[async_trait]
impl Action for SetAntiraidLevelAction {
    fn name(&self) -> &'static str {
        "set_antiraid_level"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        match raw {
            serde_yaml::Value::String(level) if level == "off" => {
                Ok(ActionConfig::SetAntiraidLevel(None))
            }
            serde_yaml::Value::String(level) if !level.is_empty() => {
                Ok(ActionConfig::SetAntiraidLevel(Some(level)))
            }
            _ => Err(AutomodError::Other(
                "set_antiraid_level takes a level name or off".to_string(),
            )),
        }
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::SetAntiraidLevel(level) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let actor = format!("automod rule {}", args.rule_name);
        args.engine
            .change_antiraid_level(level.clone(), &actor)
            .await
            .map(|_| ())
    }
}

fn default_amount() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddToCounterConfig {
    pub counter: String,
    #[serde(default = "default_amount")]
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetCounterConfig {
    pub counter: String,
    pub value: i64,
}

/// Changes a named counter scoped to the matched user and channel
pub struct CounterAction {
    set: bool,
}

impl CounterAction {
    #[must_use]
    pub fn add() -> Self {
        Self { set: false }
    }

    #[must_use]
    pub fn set() -> Self {
        Self { set: true }
    }
}

#[async_trait]
impl Action for CounterAction {
    fn name(&self) -> &'static str {
        if self.set { "set_counter" } else { "add_to_counter" }
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config = if self.set {
            let config: SetCounterConfig = parse_required(self.name(), raw)?;
            if config.counter.is_empty() {
                return Err(AutomodError::Other("counter is required".to_string()));
            }
            ActionConfig::SetCounter(config)
        } else {
            let config: AddToCounterConfig = parse_required(self.name(), raw)?;
            if config.counter.is_empty() {
                return Err(AutomodError::Other("counter is required".to_string()));
            }
            ActionConfig::AddToCounter(config)
        };
        Ok(config)
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let (counter, change) = match args.config {
            ActionConfig::AddToCounter(config) => {
                (config.counter.clone(), CounterChange::Add(config.amount))
            }
            ActionConfig::SetCounter(config) => {
                (config.counter.clone(), CounterChange::Set(config.value))
            }
            _ => return Err(AutomodError::ConfigMismatch(self.name())),
        };
        let primary = args.primary();
        args.perform_all(vec![Effect::ChangeCounter {
            counter,
            user_id: primary.and_then(|context| context.user_id()),
            channel_id: primary.and_then(|context| context.channel_id()),
            change,
        }])
        .await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveThreadConfig {
    /// Also lock the thread so only moderators can reopen it
    pub lock: bool,
}

pub struct ArchiveThreadAction;

#[async_trait]
impl Action for ArchiveThreadAction {
    fn name(&self) -> &'static str {
        "archive_thread"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        Ok(ActionConfig::ArchiveThread(parse_typed(raw)?))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::ArchiveThread(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let Some(primary) = args.primary() else {
            return Ok(());
        };
        let thread_id = primary
            .thread_change
            .as_ref()
            .and_then(|change| change.created.as_ref())
            .map(|thread| thread.id)
            .or_else(|| primary.message.as_ref().map(|message| message.channel_id));
        let Some(thread_id) = thread_id else {
            debug!(rule = args.rule_name, "No thread to archive, skipping");
            return Ok(());
        };
        args.perform_all(vec![Effect::ArchiveThread {
            thread_id,
            lock: config.lock,
        }])
        .await
    }
}
