//! Platform side effects of automod actions
//!
//! Actions never talk to Discord directly. They build an [`Effect`] and hand
//! it to an [`ActionEffects`] implementation, which makes the engine testable
//! without a gateway connection.

use crate::automod::clock::after;
use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::{
    self as serenity, ChannelId, EditChannel, EditMember, EditThread, GuildId, Http, MessageId,
    RoleId, UserId,
};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How a counter is changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterChange {
    Add(i64),
    Set(i64),
}

/// One platform mutation requested by an action
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DeleteMessages {
        channel_id: ChannelId,
        message_ids: Vec<MessageId>,
    },
    Warn {
        user_id: UserId,
        reason: String,
    },
    Mute {
        user_id: UserId,
        duration: Duration,
        reason: String,
    },
    Kick {
        user_id: UserId,
        reason: String,
    },
    Ban {
        user_id: UserId,
        delete_message_days: u8,
        reason: String,
    },
    Alert {
        channel_id: ChannelId,
        content: String,
    },
    Reply {
        channel_id: ChannelId,
        message_id: Option<MessageId>,
        content: String,
    },
    AddRoles {
        user_id: UserId,
        roles: Vec<RoleId>,
        reason: String,
    },
    RemoveRoles {
        user_id: UserId,
        roles: Vec<RoleId>,
        reason: String,
    },
    ChangeNickname {
        user_id: UserId,
        nickname: String,
    },
    SetSlowmode {
        channel_id: ChannelId,
        seconds: u16,
    },
    ChangeCounter {
        counter: String,
        user_id: Option<UserId>,
        channel_id: Option<ChannelId>,
        change: CounterChange,
    },
    ArchiveThread {
        thread_id: ChannelId,
        lock: bool,
    },
}

impl Effect {
    /// Short name used in logs and errors
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeleteMessages { .. } => "delete_messages",
            Self::Warn { .. } => "warn",
            Self::Mute { .. } => "mute",
            Self::Kick { .. } => "kick",
            Self::Ban { .. } => "ban",
            Self::Alert { .. } => "alert",
            Self::Reply { .. } => "reply",
            Self::AddRoles { .. } => "add_roles",
            Self::RemoveRoles { .. } => "remove_roles",
            Self::ChangeNickname { .. } => "change_nickname",
            Self::SetSlowmode { .. } => "set_slowmode",
            Self::ChangeCounter { .. } => "change_counter",
            Self::ArchiveThread { .. } => "archive_thread",
        }
    }
}

/// Performs platform mutations on behalf of actions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionEffects: Send + Sync {
    async fn perform(&self, guild_id: GuildId, effect: Effect) -> AutomodResult<()>;
}

/// [`ActionEffects`] backed by the Discord HTTP API
pub struct SerenityEffects {
    http: Arc<Http>,
}

impl SerenityEffects {
    #[must_use]
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    fn failed(effect: &'static str) -> impl FnOnce(serenity::Error) -> AutomodError {
        move |e| AutomodError::Effect {
            effect,
            message: e.to_string(),
        }
    }
}

/// Delete every message, carrying on past failures
///
/// The error lists each message that could not be deleted.
async fn delete_each<F, Fut, E>(message_ids: Vec<MessageId>, mut delete: F) -> Result<(), String>
where
    F: FnMut(MessageId) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut failures = Vec::new();
    for message_id in message_ids {
        if let Err(e) = delete(message_id).await {
            failures.push(format!("{message_id}: {e}"));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

#[async_trait]
impl ActionEffects for SerenityEffects {
    async fn perform(&self, guild_id: GuildId, effect: Effect) -> AutomodResult<()> {
        let http = &self.http;
        let name = effect.name();
        debug!(guild_id = %guild_id, effect = name, "Performing automod effect");

        match effect {
            Effect::DeleteMessages {
                channel_id,
                message_ids,
            } => {
                delete_each(message_ids, |message_id| channel_id.delete_message(http, message_id))
                    .await
                    .map_err(|message| AutomodError::Effect {
                        effect: name,
                        message,
                    })?;
            }
            Effect::Warn { user_id, reason } => {
                let dm = user_id
                    .create_dm_channel(http)
                    .await
                    .map_err(Self::failed(name))?;
                let guild_name = guild_id
                    .to_partial_guild(http)
                    .await
                    .map_or_else(|_| guild_id.to_string(), |guild| guild.name);
                dm.id
                    .say(http, format!("You received a warning in {guild_name}: {reason}"))
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::Mute {
                user_id,
                duration,
                reason,
            } => {
                let until = after(chrono::Utc::now(), duration);
                guild_id
                    .edit_member(
                        http,
                        user_id,
                        EditMember::new()
                            .disable_communication_until_datetime(until.into())
                            .audit_log_reason(&reason),
                    )
                    .await
                    .map_err(Self::failed(name))?;
                info!(guild_id = %guild_id, user_id = %user_id, until = %until, "Muted user");
            }
            Effect::Kick { user_id, reason } => {
                guild_id
                    .kick_with_reason(http, user_id, &reason)
                    .await
                    .map_err(Self::failed(name))?;
                info!(guild_id = %guild_id, user_id = %user_id, "Kicked user");
            }
            Effect::Ban {
                user_id,
                delete_message_days,
                reason,
            } => {
                guild_id
                    .ban_with_reason(http, user_id, delete_message_days, &reason)
                    .await
                    .map_err(Self::failed(name))?;
                info!(guild_id = %guild_id, user_id = %user_id, "Banned user");
            }
            Effect::Alert {
                channel_id,
                content,
            } => {
                channel_id
                    .say(http, content)
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::Reply {
                channel_id,
                message_id,
                content,
            } => {
                let mut message = serenity::CreateMessage::new().content(content);
                if let Some(message_id) = message_id {
                    message = message.reference_message((channel_id, message_id));
                }
                channel_id
                    .send_message(http, message)
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::AddRoles {
                user_id,
                roles,
                reason,
            } => {
                for role_id in roles {
                    http.add_member_role(guild_id, user_id, role_id, Some(reason.as_str()))
                        .await
                        .map_err(Self::failed(name))?;
                }
            }
            Effect::RemoveRoles {
                user_id,
                roles,
                reason,
            } => {
                for role_id in roles {
                    http.remove_member_role(guild_id, user_id, role_id, Some(reason.as_str()))
                        .await
                        .map_err(Self::failed(name))?;
                }
            }
            Effect::ChangeNickname { user_id, nickname } => {
                guild_id
                    .edit_member(http, user_id, EditMember::new().nickname(nickname))
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::SetSlowmode {
                channel_id,
                seconds,
            } => {
                channel_id
                    .edit(http, EditChannel::new().rate_limit_per_user(seconds))
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::ArchiveThread { thread_id, lock } => {
                thread_id
                    .edit_thread(http, EditThread::new().archived(true).locked(lock))
                    .await
                    .map_err(Self::failed(name))?;
            }
            Effect::ChangeCounter { counter, .. } => {
                return Err(AutomodError::Effect {
                    effect: name,
                    message: format!("no counter backend is configured for `{counter}`"),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Effects sink that records every effect and fails the configured ones
    #[derive(Default)]
    pub struct RecordingEffects {
        pub performed: Mutex<Vec<(GuildId, Effect)>>,
        pub failing: HashSet<&'static str>,
    }

    impl RecordingEffects {
        pub fn failing(names: &[&'static str]) -> Self {
            Self {
                performed: Mutex::new(Vec::new()),
                failing: names.iter().copied().collect(),
            }
        }

        pub fn effects(&self) -> Vec<Effect> {
            self.performed
                .lock()
                .unwrap()
                .iter()
                .map(|(_, effect)| effect.clone())
                .collect()
        }

        pub fn names(&self) -> Vec<&'static str> {
            self.effects().iter().map(Effect::name).collect()
        }
    }

    #[async_trait]
    impl ActionEffects for RecordingEffects {
        async fn perform(&self, guild_id: GuildId, effect: Effect) -> AutomodResult<()> {
            let name = effect.name();
            self.performed.lock().unwrap().push((guild_id, effect));
            if self.failing.contains(name) {
                return Err(AutomodError::Effect {
                    effect: name,
                    message: "simulated failure".to_string(),
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effect_names() {
        let effect = Effect::Kick {
            user_id: UserId::new(1),
            reason: "spam".to_string(),
        };
        assert_eq!(effect.name(), "kick");

        let effect = Effect::ChangeCounter {
            counter: "strikes".to_string(),
            user_id: None,
            channel_id: None,
            change: CounterChange::Add(1),
        };
        assert_eq!(effect.name(), "change_counter");
    }

    #[tokio::test]
    async fn test_delete_each_continues_past_failures() {
        let ids: Vec<_> = (1..=3).map(MessageId::new).collect();
        let attempted = std::sync::Mutex::new(Vec::new());

        let result = delete_each(ids.clone(), |message_id| {
            attempted.lock().unwrap().push(message_id);
            async move {
                if message_id == MessageId::new(2) {
                    Err("Unknown Message")
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempted.into_inner().unwrap(), ids);
        assert_eq!(result, Err("2: Unknown Message".to_string()));
        assert_eq!(delete_each(ids, |_| async { Ok::<_, String>(()) }).await, Ok(()));
    }

    #[tokio::test]
    async fn test_recording_effects_fail_on_request() {
        let effects = test_support::RecordingEffects::failing(&["ban"]);
        let ban = Effect::Ban {
            user_id: UserId::new(1),
            delete_message_days: 0,
            reason: "raid".to_string(),
        };
        assert!(effects.perform(GuildId::new(1), ban).await.is_err());
        assert_eq!(effects.names(), vec!["ban"]);
    }
}
