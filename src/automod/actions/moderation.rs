//! Moderation actions: clean, warn, mute, kick and ban

use super::{Action, ActionArgs, ActionConfig, parse_unit};
use crate::automod::duration::serde_duration;
use crate::automod::effects::Effect;
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::events::{ModActionEvent, ModActionKind};
use crate::automod::triggers::parse_typed;
use async_trait::async_trait;
use poise::serenity_prelude::{ChannelId, MessageId, UserId};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// Longest timeout the platform accepts
const MAX_MUTE: Duration = Duration::from_secs(28 * 24 * 3600);

/// Reason shared by warn and kick
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReasonConfig {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MuteConfig {
    #[serde(with = "serde_duration")]
    pub duration: Duration,
    pub reason: Option<String>,
}

impl Default for MuteConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(600),
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BanConfig {
    pub reason: Option<String>,
    pub delete_message_days: u8,
}

fn reason_or_summary(reason: Option<&String>, args: &ActionArgs<'_>) -> String {
    reason.cloned().unwrap_or_else(|| args.summary.to_string())
}

/// Tell sibling subsystems that automod moderated `user_id`
fn publish(args: &ActionArgs<'_>, kind: ModActionKind, user_id: UserId, reason: &str) {
    let receivers = args.engine.bus().publish(ModActionEvent {
        guild_id: args.engine.guild_id(),
        kind,
        user_id,
        moderator_id: args.engine.self_user_id(),
        reason: Some(reason.to_string()),
        automatic: true,
    });
    info!(
        guild_id = %args.engine.guild_id(),
        rule = args.rule_name,
        user_id = %user_id,
        action = %kind,
        receivers,
        "Automod moderated user"
    );
}

/// Apply one per-user moderation effect to every matched user
async fn moderate_users(
    args: &ActionArgs<'_>,
    kind: ModActionKind,
    reason: &str,
    effect: impl Fn(UserId) -> Effect,
) -> AutomodResult<()> {
    let guild_id = args.engine.guild_id();
    let mut first_error = None;
    for user_id in args.user_ids() {
        match args.engine.effects().perform(guild_id, effect(user_id)).await {
            Ok(()) => publish(args, kind, user_id, reason),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Deletes every matched message
pub struct CleanAction;

#[async_trait]
impl Action for CleanAction {
    fn name(&self) -> &'static str {
        "clean"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        parse_unit(self.name(), &raw, ActionConfig::Clean)
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let mut by_channel: Vec<(ChannelId, Vec<MessageId>)> = Vec::new();
        for message in args.contexts.iter().filter_map(|context| context.message.as_ref()) {
            match by_channel
                .iter_mut()
                .find(|(channel_id, _)| *channel_id == message.channel_id)
            {
                Some((_, ids)) if ids.contains(&message.id) => {}
                Some((_, ids)) => ids.push(message.id),
                None => by_channel.push((message.channel_id, vec![message.id])),
            }
        }

        let effects = by_channel
            .into_iter()
            .map(|(channel_id, message_ids)| Effect::DeleteMessages {
                channel_id,
                message_ids,
            })
            .collect();
        args.perform_all(effects).await
    }
}

pub struct WarnAction;

#[async_trait]
impl Action for WarnAction {
    fn name(&self) -> &'static str {
        "warn"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        Ok(ActionConfig::Reason(parse_typed(raw)?))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Reason(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let reason = reason_or_summary(config.reason.as_ref(), &args);
        moderate_users(&args, ModActionKind::Warn, &reason, |user_id| Effect::Warn {
            user_id,
            reason: reason.clone(),
        })
        .await
    }
}

pub struct MuteAction;

#[async_trait]
impl Action for MuteAction {
    fn name(&self) -> &'static str {
        "mute"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config: MuteConfig = parse_typed(raw)?;
        if config.duration.is_zero() || config.duration > MAX_MUTE {
            return Err(AutomodError::Other(
                "mute duration must be between 1s and 28 days".to_string(),
            ));
        }
        Ok(ActionConfig::Mute(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Mute(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let reason = reason_or_summary(config.reason.as_ref(), &args);
        moderate_users(&args, ModActionKind::Mute, &reason, |user_id| Effect::Mute {
            user_id,
            duration: config.duration,
            reason: reason.clone(),
        })
        .await
    }
}

pub struct KickAction;

#[async_trait]
impl Action for KickAction {
    fn name(&self) -> &'static str {
        "kick"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        Ok(ActionConfig::Reason(parse_typed(raw)?))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Reason(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let reason = reason_or_summary(config.reason.as_ref(), &args);
        moderate_users(&args, ModActionKind::Kick, &reason, |user_id| Effect::Kick {
            user_id,
            reason: reason.clone(),
        })
        .await
    }
}

pub struct BanAction;

#[async_trait]
impl Action for BanAction {
    fn name(&self) -> &'static str {
        "ban"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config: BanConfig = parse_typed(raw)?;
        if config.delete_message_days > 7 {
            return Err(AutomodError::Other(
                "delete_message_days must be at most 7".to_string(),
            ));
        }
        Ok(ActionConfig::Ban(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Ban(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let reason = reason_or_summary(config.reason.as_ref(), &args);
        moderate_users(&args, ModActionKind::Ban, &reason, |user_id| Effect::Ban {
            user_id,
            delete_message_days: config.delete_message_days,
            reason: reason.clone(),
        })
        .await
    }
}
