//! Membership, role, voice and thread triggers

use super::{
    MatchDetail, SummaryArgs, Trigger, TriggerArgs, TriggerConfig, TriggerMatch, parse_empty,
    parse_typed, user_mention,
};
use crate::automod::clock::to_chrono;
use crate::automod::context::ThreadInfo;
use crate::automod::duration::serde_duration;
use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::{ChannelId, RoleId};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemberJoinConfig {
    /// Only match accounts younger than `new_threshold`
    pub only_new: bool,
    #[serde(with = "serde_duration")]
    pub new_threshold: Duration,
}

impl Default for MemberJoinConfig {
    fn default() -> Self {
        Self {
            only_new: false,
            new_threshold: Duration::from_secs(3600),
        }
    }
}

pub struct MemberJoinTrigger;

#[async_trait]
impl Trigger for MemberJoinTrigger {
    fn name(&self) -> &'static str {
        "member_join"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::MemberJoin(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::MemberJoin(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let context = args.context;
        if !context.member_joined {
            return Ok(None);
        }

        if config.only_new {
            let Some(user) = &context.user else {
                return Ok(None);
            };
            if context.timestamp - user.created_at >= to_chrono(config.new_threshold) {
                return Ok(None);
            }
        }

        Ok(Some(TriggerMatch::default()))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let age = args
            .context
            .user
            .as_ref()
            .map(|user| {
                let days = (args.context.timestamp - user.created_at).num_days();
                format!(" (account age: {days} days)")
            })
            .unwrap_or_default();
        format!("{} joined the server{age}", user_mention(args.context))
    }
}

pub struct MemberLeaveTrigger;

#[async_trait]
impl Trigger for MemberLeaveTrigger {
    fn name(&self) -> &'static str {
        "member_leave"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        parse_empty(self.name(), &raw)
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        Ok(args.context.member_left.then(TriggerMatch::default))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        format!("{} left the server", user_mention(args.context))
    }
}

/// Roles to watch; empty watches every role
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolesConfig {
    pub roles: Vec<RoleId>,
}

pub struct RoleChangeTrigger {
    name: &'static str,
    added: bool,
}

impl RoleChangeTrigger {
    #[must_use]
    pub fn added() -> Self {
        Self {
            name: "role_added",
            added: true,
        }
    }

    #[must_use]
    pub fn removed() -> Self {
        Self {
            name: "role_removed",
            added: false,
        }
    }
}

#[async_trait]
impl Trigger for RoleChangeTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::Roles(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::Roles(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name));
        };
        let Some(change) = &args.context.roles_changed else {
            return Ok(None);
        };

        let changed = if self.added {
            &change.added
        } else {
            &change.removed
        };
        let matched: Vec<RoleId> = changed
            .iter()
            .filter(|role| config.roles.is_empty() || config.roles.contains(role))
            .copied()
            .collect();

        if matched.is_empty() {
            Ok(None)
        } else {
            Ok(Some(TriggerMatch::with_detail(MatchDetail::Roles(matched))))
        }
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let roles = match &args.matched.detail {
            MatchDetail::Roles(roles) => roles
                .iter()
                .map(|role| format!("<@&{role}>"))
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        };
        let verb = if self.added { "received" } else { "lost" };
        format!("{} {verb} {roles}", user_mention(args.context))
    }
}

/// Channels to watch; empty watches every channel
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelsConfig {
    pub channels: Vec<ChannelId>,
}

pub struct VoiceChannelTrigger {
    name: &'static str,
    joined: bool,
}

impl VoiceChannelTrigger {
    #[must_use]
    pub fn join() -> Self {
        Self {
            name: "voice_channel_join",
            joined: true,
        }
    }

    #[must_use]
    pub fn leave() -> Self {
        Self {
            name: "voice_channel_leave",
            joined: false,
        }
    }
}

#[async_trait]
impl Trigger for VoiceChannelTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::Channels(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::Channels(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name));
        };
        let Some(change) = &args.context.voice_channel else {
            return Ok(None);
        };

        let channel = if self.joined { change.joined } else { change.left };
        Ok(channel
            .filter(|channel| config.channels.is_empty() || config.channels.contains(channel))
            .map(|channel| TriggerMatch::with_detail(MatchDetail::Channel(channel))))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let verb = if self.joined { "joined" } else { "left" };
        match &args.matched.detail {
            MatchDetail::Channel(channel) => {
                format!("{} {verb} voice channel <#{channel}>", user_mention(args.context))
            }
            _ => format!("{} {verb} a voice channel", user_mention(args.context)),
        }
    }
}

/// Parent channels to watch; empty watches every parent
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThreadsConfig {
    pub parents: Vec<ChannelId>,
}

pub struct ThreadTrigger {
    name: &'static str,
    created: bool,
}

impl ThreadTrigger {
    #[must_use]
    pub fn create() -> Self {
        Self {
            name: "thread_create",
            created: true,
        }
    }

    #[must_use]
    pub fn delete() -> Self {
        Self {
            name: "thread_delete",
            created: false,
        }
    }

    fn thread<'a>(&self, args: &TriggerArgs<'a>) -> Option<&'a ThreadInfo> {
        let change = args.context.thread_change.as_ref()?;
        if self.created {
            change.created.as_ref()
        } else {
            change.deleted.as_ref()
        }
    }
}

#[async_trait]
impl Trigger for ThreadTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        Ok(TriggerConfig::Threads(parse_typed(raw)?))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::Threads(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name));
        };
        let Some(thread) = self.thread(&args) else {
            return Ok(None);
        };

        let parent_matches = config.parents.is_empty()
            || thread
                .parent_id
                .is_some_and(|parent| config.parents.contains(&parent));
        Ok(parent_matches.then(|| TriggerMatch::with_detail(MatchDetail::Channel(thread.id))))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let thread = args.context.thread_change.as_ref().and_then(|change| {
            if self.created {
                change.created.as_ref()
            } else {
                change.deleted.as_ref()
            }
        });
        let verb = if self.created { "created" } else { "deleted" };
        match thread {
            Some(thread) => format!(
                "{} {verb} thread `{}`",
                user_mention(args.context),
                thread.name
            ),
            None => format!("{} {verb} a thread", user_mention(args.context)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::clock::{Clock, ManualClock};
    use crate::automod::context::test_support::user;
    use crate::automod::context::{
        EvaluationContext, RoleChange, ThreadChange, UserInfo, VoiceChange,
    };
    use crate::automod::state::GuildState;
    use crate::automod::state::test_support::state;
    use crate::automod::triggers::TriggerRegistry;
    use chrono::Utc;
    use std::sync::Arc;

    async fn check(
        state: &GuildState,
        name: &str,
        yaml: &str,
        context: EvaluationContext,
    ) -> Option<TriggerMatch> {
        let registry = TriggerRegistry::new();
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let config = registry.parse_config(name, raw).unwrap();
        let context = Arc::new(context);
        registry
            .get(name)
            .unwrap()
            .matches(TriggerArgs {
                state,
                rule_name: "test",
                context: &context,
                config: &config,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_member_join_only_new() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);

        let young = UserInfo {
            created_at: clock.now() - chrono::Duration::minutes(10),
            ..user(1)
        };
        let context = EvaluationContext::new(clock.now()).with_user(young).joined();
        assert!(check(&state, "member_join", "{ only_new: true, new_threshold: 1h }", context).await.is_some());

        let context = EvaluationContext::new(clock.now()).with_user(user(2)).joined();
        assert!(check(&state, "member_join", "{ only_new: true }", context).await.is_none());

        let context = EvaluationContext::new(clock.now()).with_user(user(2)).joined();
        assert!(check(&state, "member_join", "~", context).await.is_some());
    }

    #[tokio::test]
    async fn test_role_added() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let change = RoleChange {
            added: vec![RoleId::new(10), RoleId::new(11)],
            removed: vec![],
        };

        let context = EvaluationContext::new(clock.now())
            .with_user(user(1))
            .with_roles_changed(change.clone());
        let result = check(&state, "role_added", "{ roles: [11] }", context).await.unwrap();
        assert_eq!(result.detail, MatchDetail::Roles(vec![RoleId::new(11)]));

        let context = EvaluationContext::new(clock.now())
            .with_user(user(1))
            .with_roles_changed(change);
        assert!(check(&state, "role_removed", "{}", context).await.is_none());
    }

    #[tokio::test]
    async fn test_voice_channel_switch() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let change = VoiceChange {
            joined: Some(ChannelId::new(5)),
            left: Some(ChannelId::new(6)),
        };

        let context = EvaluationContext::new(clock.now())
            .with_user(user(1))
            .with_voice_change(change.clone());
        assert!(check(&state, "voice_channel_join", "{ channels: [5] }", context).await.is_some());

        let context = EvaluationContext::new(clock.now())
            .with_user(user(1))
            .with_voice_change(change);
        assert!(check(&state, "voice_channel_leave", "{ channels: [5] }", context).await.is_none());
    }

    #[tokio::test]
    async fn test_thread_create_parent_filter() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let thread = ThreadInfo {
            id: ChannelId::new(90),
            parent_id: Some(ChannelId::new(9)),
            name: "help".to_string(),
        };
        let change = ThreadChange {
            created: Some(thread),
            deleted: None,
        };

        let context = EvaluationContext::new(clock.now()).with_thread_change(change.clone());
        assert!(check(&state, "thread_create", "{ parents: [9] }", context).await.is_some());

        let context = EvaluationContext::new(clock.now()).with_thread_change(change);
        assert!(check(&state, "thread_create", "{ parents: [8] }", context).await.is_none());
    }
}
