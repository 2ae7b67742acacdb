//! Actions that post text: alerts for moderators, replies to users and audit log entries

use super::{Action, ActionArgs, ActionConfig, parse_required, parse_unit, render_text};
use crate::automod::audit::AuditEvent;
use crate::automod::effects::Effect;
use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::ChannelId;
use serde::Deserialize;
use tracing::debug;

/// Discord's message length limit
const MAX_MESSAGE_LENGTH: usize = 2000;

fn default_alert_text() -> String {
    "{user} triggered rule `{rule}`: {summary}".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlertConfig {
    pub channel: ChannelId,
    #[serde(default = "default_alert_text")]
    pub text: String,
}

fn default_reply_to_message() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyConfig {
    pub text: String,
    /// Reply to the triggering message rather than posting next to it
    #[serde(default = "default_reply_to_message")]
    pub reply_to_message: bool,
}

fn check_length(text: &str) -> AutomodResult<()> {
    if text.trim().is_empty() {
        return Err(AutomodError::Other("text must not be empty".to_string()));
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(AutomodError::Other(format!(
            "text must be at most {MAX_MESSAGE_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Cut rendered text down to what a message can hold
fn truncate(mut text: String) -> String {
    if let Some((index, _)) = text.char_indices().nth(MAX_MESSAGE_LENGTH) {
        text.truncate(index);
    }
    text
}

/// Posts a rendered text to a moderator channel
pub struct AlertAction;

#[async_trait]
impl Action for AlertAction {
    fn name(&self) -> &'static str {
        "alert"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config: AlertConfig = parse_required(self.name(), raw)?;
        check_length(&config.text)?;
        Ok(ActionConfig::Alert(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Alert(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let content = truncate(render_text(&config.text, &args));
        args.perform_all(vec![Effect::Alert {
            channel_id: config.channel,
            content,
        }])
        .await
    }
}

/// Writes the match summary to the audit sink
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    fn name(&self) -> &'static str {
        "log"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        parse_unit(self.name(), &raw, ActionConfig::Log)
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        args.engine
            .audit()
            .notify(
                args.engine.guild_id(),
                AuditEvent::Log {
                    rule: args.rule_name.to_string(),
                    summary: args.summary.to_string(),
                },
            )
            .await;
        Ok(())
    }
}

/// Answers in the channel of the triggering message
pub struct ReplyAction;

#[async_trait]
impl Action for ReplyAction {
    fn name(&self) -> &'static str {
        "reply"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config: ReplyConfig = parse_required(self.name(), raw)?;
        check_length(&config.text)?;
        Ok(ActionConfig::Reply(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Reply(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let Some(primary) = args.primary() else {
            return Ok(());
        };
        let Some(channel_id) = primary.channel_id() else {
            debug!(rule = args.rule_name, "Nothing to reply to, skipping");
            return Ok(());
        };
        let message_id = primary
            .message
            .as_ref()
            .filter(|_| config.reply_to_message)
            .map(|message| message.id);

        args.perform_all(vec![Effect::Reply {
            channel_id,
            message_id,
            content: truncate(render_text(&config.text, &args)),
        }])
        .await
    }
}
