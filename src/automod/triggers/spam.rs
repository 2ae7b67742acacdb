//! Windowed spam triggers

use super::{
    MatchDetail, SummaryArgs, Trigger, TriggerArgs, TriggerConfig, TriggerMatch, parse_typed,
    user_mention,
};
use crate::automod::clock::before;
use crate::automod::context::EvaluationContext;
use crate::automod::duration::{format_duration, serde_duration};
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::recent_actions::{
    RecentActionKind, RecentActionRecord, RecentActionTracker, channel_scoped_identifier,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Config of the per-user message spam triggers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpamConfig {
    pub amount: u64,
    #[serde(with = "serde_duration")]
    pub within: Duration,
    /// Count each channel separately
    pub per_channel: bool,
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            amount: 5,
            within: Duration::from_secs(10),
            per_channel: false,
        }
    }
}

/// Config of the guild-wide event spam triggers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventSpamConfig {
    pub amount: u64,
    #[serde(with = "serde_duration")]
    pub within: Duration,
}

impl Default for EventSpamConfig {
    fn default() -> Self {
        Self {
            amount: 10,
            within: Duration::from_secs(60),
        }
    }
}

fn validate_window(amount: u64, within: Duration) -> AutomodResult<()> {
    if amount == 0 {
        return Err(AutomodError::Other("amount must be at least 1".to_string()));
    }
    if within.is_zero() {
        return Err(AutomodError::Other("within must be longer than zero".to_string()));
    }
    Ok(())
}

/// The records' contexts other than `primary`, each once
fn linked_contexts(
    records: &[RecentActionRecord],
    primary: &EvaluationContext,
) -> Vec<Arc<EvaluationContext>> {
    let mut seen = HashSet::from([primary.id]);
    records
        .iter()
        .filter(|record| seen.insert(record.context.id))
        .map(|record| Arc::clone(&record.context))
        .collect()
}

/// Per-user spam over one counted message kind
pub struct MessageSpamTrigger {
    name: &'static str,
    kind: RecentActionKind,
}

/// One trigger per counted message kind
pub fn message_spam_triggers() -> Vec<MessageSpamTrigger> {
    [
        ("message_spam", RecentActionKind::Message),
        ("mention_spam", RecentActionKind::Mention),
        ("link_spam", RecentActionKind::Link),
        ("attachment_spam", RecentActionKind::Attachment),
        ("emoji_spam", RecentActionKind::Emoji),
        ("line_spam", RecentActionKind::Line),
        ("character_spam", RecentActionKind::Character),
        ("sticker_spam", RecentActionKind::Sticker),
    ]
    .into_iter()
    .map(|(name, kind)| MessageSpamTrigger { name, kind })
    .collect()
}

#[async_trait]
impl Trigger for MessageSpamTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: SpamConfig = parse_typed(raw)?;
        validate_window(config.amount, config.within)?;
        Ok(TriggerConfig::Spam(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::Spam(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name));
        };
        let context = args.context;
        let (Some(message), Some(user_id)) = (context.message.as_ref(), context.user_id()) else {
            return Ok(None);
        };

        let channel_identifier = channel_scoped_identifier(message.channel_id, user_id);
        let identifier = if config.per_channel {
            channel_identifier.clone()
        } else {
            user_id.to_string()
        };

        let state = args.state;
        if state.recent_spam.find(self.kind, Some(&identifier)).is_some() {
            state
                .recent_spam
                .merge(self.kind, Some(&identifier), channel_identifier);
            debug!(
                rule = args.rule_name,
                kind = %self.kind,
                identifier = %identifier,
                "Coalescing event into active spam incident"
            );
            return Ok(Some(TriggerMatch::silent_clean()));
        }

        let since = before(context.timestamp, config.within);
        let records =
            state
                .recent_actions
                .query(self.kind, Some(&identifier), since, context.timestamp);
        let count = RecentActionTracker::sum_counts(&records);
        if count < config.amount {
            return Ok(None);
        }

        state.recent_spam.add(
            self.kind,
            [user_id.to_string(), channel_identifier],
            None,
        );

        Ok(Some(
            TriggerMatch::with_detail(MatchDetail::Spam {
                kind: self.kind,
                count,
                within: config.within,
            })
            .with_extra_contexts(linked_contexts(&records, context)),
        ))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        let channel = args
            .context
            .channel_id()
            .map(|channel_id| format!(" in <#{channel_id}>"))
            .unwrap_or_default();
        match &args.matched.detail {
            MatchDetail::Spam {
                kind,
                count,
                within,
            } => format!(
                "{} {kind} spam detected{channel}: {count} within {}",
                user_mention(args.context),
                format_duration(*within)
            ),
            _ => format!("{} {} spam detected{channel}", user_mention(args.context), self.kind),
        }
    }
}

/// Guild-wide spam of member joins or thread creations
pub struct EventSpamTrigger {
    name: &'static str,
    kind: RecentActionKind,
}

impl EventSpamTrigger {
    #[must_use]
    pub fn member_join() -> Self {
        Self {
            name: "member_join_spam",
            kind: RecentActionKind::MemberJoin,
        }
    }

    #[must_use]
    pub fn thread_create() -> Self {
        Self {
            name: "thread_create_spam",
            kind: RecentActionKind::ThreadCreate,
        }
    }

    fn applies_to(&self, context: &EvaluationContext) -> bool {
        match self.kind {
            RecentActionKind::MemberJoin => context.member_joined,
            RecentActionKind::ThreadCreate => context
                .thread_change
                .as_ref()
                .is_some_and(|change| change.created.is_some()),
            _ => false,
        }
    }
}

#[async_trait]
impl Trigger for EventSpamTrigger {
    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<TriggerConfig> {
        let config: EventSpamConfig = parse_typed(raw)?;
        validate_window(config.amount, config.within)?;
        Ok(TriggerConfig::EventSpam(config))
    }

    async fn matches(&self, args: TriggerArgs<'_>) -> AutomodResult<Option<TriggerMatch>> {
        let TriggerConfig::EventSpam(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name));
        };
        let context = args.context;
        if !self.applies_to(context) {
            return Ok(None);
        }

        let state = args.state;
        if state.recent_spam.find(self.kind, None).is_some() {
            // Part of an incident that was already acted on
            context.mark_actioned();
            return Ok(None);
        }

        let since = before(context.timestamp, config.within);
        let records = state
            .recent_actions
            .query(self.kind, None, since, context.timestamp);
        let count = RecentActionTracker::sum_counts(&records);
        if count < config.amount {
            return Ok(None);
        }

        state
            .recent_spam
            .add(self.kind, std::iter::empty::<String>(), None);

        Ok(Some(
            TriggerMatch::with_detail(MatchDetail::Spam {
                kind: self.kind,
                count,
                within: config.within,
            })
            .with_extra_contexts(linked_contexts(&records, context)),
        ))
    }

    fn render_summary(&self, args: SummaryArgs<'_>) -> String {
        match &args.matched.detail {
            MatchDetail::Spam {
                kind,
                count,
                within,
            } => format!(
                "{kind} spam detected: {count} within {}",
                format_duration(*within)
            ),
            _ => format!("{} spam detected", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::clock::{Clock, ManualClock};
    use crate::automod::context::test_support::{message_context, user};
    use crate::automod::state::GuildState;
    use crate::automod::state::test_support::state;
    use crate::automod::triggers::TriggerRegistry;
    use chrono::Utc;

    fn spam_config(amount: u64, within_secs: u64) -> TriggerConfig {
        TriggerConfig::Spam(SpamConfig {
            amount,
            within: Duration::from_secs(within_secs),
            per_channel: false,
        })
    }

    async fn send(
        trigger: &MessageSpamTrigger,
        state: &GuildState,
        clock: &ManualClock,
        config: &TriggerConfig,
    ) -> (Arc<EvaluationContext>, Option<TriggerMatch>) {
        let context = message_context(clock.now(), 7, 70, "spam").shared();
        state.recent_actions.record_message(&context);
        let result = trigger
            .matches(TriggerArgs {
                state,
                rule_name: "spam",
                context: &context,
                config,
            })
            .await
            .unwrap();
        (context, result)
    }

    #[tokio::test]
    async fn test_message_spam_threshold_and_coalescing() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let trigger = message_spam_triggers().remove(0);
        let config = spam_config(5, 10);

        // Four messages in eight seconds stay below the threshold
        for step in 0..4 {
            if step > 0 {
                clock.advance(chrono::Duration::seconds(2) + chrono::Duration::milliseconds(667));
            }
            let (_, result) = send(&trigger, &state, &clock, &config).await;
            assert!(result.is_none());
        }

        clock.advance(chrono::Duration::seconds(1));
        let (_, result) = send(&trigger, &state, &clock, &config).await;
        let matched = result.expect("fifth message matches");
        assert!(!matched.silent_clean);
        assert_eq!(matched.extra_contexts.len(), 4);
        assert!(matches!(matched.detail, MatchDetail::Spam { count: 5, .. }));

        clock.advance(chrono::Duration::milliseconds(500));
        let (_, result) = send(&trigger, &state, &clock, &config).await;
        assert!(result.expect("sixth message coalesces").silent_clean);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let trigger = message_spam_triggers().remove(0);
        let config = spam_config(3, 10);

        send(&trigger, &state, &clock, &config).await;
        clock.advance(chrono::Duration::seconds(6));
        send(&trigger, &state, &clock, &config).await;
        clock.advance(chrono::Duration::seconds(6));
        // The first message fell out of the window
        let (_, result) = send(&trigger, &state, &clock, &config).await;
        assert!(result.is_none());

        clock.advance(chrono::Duration::seconds(1));
        let (_, result) = send(&trigger, &state, &clock, &config).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_member_join_spam_marks_followers_actioned() {
        let clock = ManualClock::new(Utc::now());
        let state = state(&clock);
        let trigger = EventSpamTrigger::member_join();
        let config = TriggerConfig::EventSpam(EventSpamConfig {
            amount: 3,
            within: Duration::from_secs(30),
        });

        let mut results = Vec::new();
        for id in 1..=4 {
            let context = EvaluationContext::new(clock.now())
                .with_user(user(id))
                .joined()
                .shared();
            state
                .recent_actions
                .record(RecentActionKind::MemberJoin, None, 1, Arc::clone(&context));
            let result = trigger
                .matches(TriggerArgs {
                    state: &state,
                    rule_name: "raid",
                    context: &context,
                    config: &config,
                })
                .await
                .unwrap();
            results.push((context, result));
            clock.advance(chrono::Duration::seconds(1));
        }

        assert!(results[0].1.is_none());
        assert!(results[1].1.is_none());
        assert_eq!(results[2].1.as_ref().unwrap().extra_contexts.len(), 2);
        assert!(results[3].1.is_none());
        assert!(results[3].0.is_actioned());
    }

    #[test]
    fn test_spam_config_validation() {
        let registry = TriggerRegistry::new();
        let raw: serde_yaml::Value = serde_yaml::from_str("{ amount: 0, within: 10s }").unwrap();
        assert!(registry.parse_config("message_spam", raw).is_err());

        let raw: serde_yaml::Value =
            serde_yaml::from_str("{ amount: 5, within: 10s, per_channel: true }").unwrap();
        let config = registry.parse_config("link_spam", raw).unwrap();
        assert!(matches!(config, TriggerConfig::Spam(SpamConfig { per_channel: true, .. })));

        let raw: serde_yaml::Value = serde_yaml::from_str("{ amount: 5, within: soon }").unwrap();
        assert!(registry.parse_config("message_spam", raw).is_err());
    }
}
