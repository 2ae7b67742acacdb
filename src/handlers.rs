//! Gateway events into automod evaluations
//!
//! Every event the engine cares about is normalized into an
//! [`EvaluationContext`] and handed to the guild's engine. Guild
//! availability events load and unload engines.

use crate::automod::context::{
    AttachmentInfo, EvaluationContext, MemberInfo, MessageInfo, RoleChange, ThreadChange,
    ThreadInfo, UserInfo, VoiceChange,
};
use crate::{Data, EVENT_TARGET, Error};
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{self as serenity, ChannelId, GuildId, RoleId, Timestamp};
use tracing::{debug, info, warn};

/// Poise event handler
///
/// # Errors
/// Never fails; per-guild problems are logged and the event is dropped.
pub async fn event_handler(
    ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    let now = data.services.clock.now();
    match event {
        serenity::FullEvent::Ready { data_about_bot } => {
            info!(
                target: EVENT_TARGET,
                "Connected as {}, shard {}",
                data_about_bot.user.name,
                ctx.shard_id
            );
        }
        serenity::FullEvent::CacheReady { guilds } => {
            info!(target: EVENT_TARGET, "Cache ready! The bot is in {} guild(s)", guilds.len());
        }
        serenity::FullEvent::GuildCreate { guild, .. } => {
            match data.load_guild(guild.id).await {
                Ok(true) => debug!(target: EVENT_TARGET, guild_id = %guild.id, "Guild engine started"),
                Ok(false) => {}
                Err(e) => warn!(
                    target: EVENT_TARGET,
                    guild_id = %guild.id,
                    error = %e,
                    "Could not load automod for guild"
                ),
            }
        }
        serenity::FullEvent::GuildDelete { incomplete, .. } => {
            // Outages keep the engine; only leaving the guild stops it
            if !incomplete.unavailable {
                data.unload_guild(incomplete.id);
            }
        }
        serenity::FullEvent::Message { new_message } => {
            if let Some(guild_id) = new_message.guild_id {
                dispatch(data, guild_id, message_context(new_message, now, false));
            }
        }
        serenity::FullEvent::MessageUpdate { new, event, .. } => {
            let context = match new {
                Some(message) => message
                    .guild_id
                    .map(|guild_id| (guild_id, message_context(message, now, true))),
                None => edited_message_context(event, now),
            };
            if let Some((guild_id, context)) = context {
                dispatch(data, guild_id, context);
            }
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            let context = EvaluationContext::new(now)
                .with_user(user_info(&new_member.user))
                .with_member(MemberInfo {
                    nickname: new_member.nick.clone(),
                    roles: new_member.roles.clone(),
                    joined_at: new_member.joined_at.map(to_utc),
                })
                .joined();
            dispatch(data, new_member.guild_id, context);
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            let context = EvaluationContext::new(now).with_user(user_info(user)).left();
            dispatch(data, *guild_id, context);
        }
        serenity::FullEvent::GuildMemberUpdate {
            old_if_available,
            event,
            ..
        } => {
            // Without the previous roles there is nothing to diff against
            let Some(old) = old_if_available else {
                return Ok(());
            };
            if let Some(change) = role_change(&old.roles, &event.roles) {
                let context = EvaluationContext::new(now)
                    .with_user(user_info(&event.user))
                    .with_member(MemberInfo {
                        nickname: event.nick.clone(),
                        roles: event.roles.clone(),
                        joined_at: Some(to_utc(event.joined_at)),
                    })
                    .with_roles_changed(change);
                dispatch(data, event.guild_id, context);
            }
        }
        serenity::FullEvent::VoiceStateUpdate { old, new } => {
            let Some(guild_id) = new.guild_id else {
                return Ok(());
            };
            let before = old.as_ref().and_then(|state| state.channel_id);
            if let Some(change) = voice_change(before, new.channel_id) {
                let user = new
                    .member
                    .as_ref()
                    .map_or_else(|| UserInfo::from_id(new.user_id), |member| user_info(&member.user));
                let context = EvaluationContext::new(now)
                    .with_user(user)
                    .with_voice_change(change);
                dispatch(data, guild_id, context);
            }
        }
        serenity::FullEvent::ThreadCreate { thread } => {
            let mut context = EvaluationContext::new(now).with_thread_change(ThreadChange {
                created: Some(ThreadInfo {
                    id: thread.id,
                    parent_id: thread.parent_id,
                    name: thread.name.clone(),
                }),
                deleted: None,
            });
            if let Some(owner) = thread.owner_id {
                context = context.with_user(UserInfo::from_id(owner));
            }
            dispatch(data, thread.guild_id, context);
        }
        serenity::FullEvent::ThreadDelete {
            thread,
            full_thread_data,
        } => {
            let name = full_thread_data
                .as_ref()
                .map(|full| full.name.clone())
                .unwrap_or_default();
            let context = EvaluationContext::new(now).with_thread_change(ThreadChange {
                created: None,
                deleted: Some(ThreadInfo {
                    id: thread.id,
                    parent_id: Some(thread.parent_id),
                    name,
                }),
            });
            dispatch(data, thread.guild_id, context);
        }
        _ => {}
    }
    Ok(())
}

/// Queue a context on the guild's engine, if the guild is moderated
fn dispatch(data: &Data, guild_id: GuildId, context: EvaluationContext) {
    let Some(engine) = data.engine(guild_id) else {
        return;
    };
    if let Err(e) = engine.handle_event(context.shared()) {
        warn!(target: EVENT_TARGET, guild_id = %guild_id, error = %e, "Dropped automod event");
    }
}

fn message_context(message: &serenity::Message, now: DateTime<Utc>, edited: bool) -> EvaluationContext {
    let info = MessageInfo {
        id: message.id,
        channel_id: message.channel_id,
        content: message.content.clone(),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| AttachmentInfo {
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
            })
            .collect(),
        mentioned_users: message.mentions.iter().map(|user| user.id).collect(),
        mentioned_roles: message.mention_roles.clone(),
        mentions_everyone: message.mention_everyone,
        sticker_count: message.sticker_items.len(),
        edited,
    };

    let mut context = EvaluationContext::new(now)
        .with_user(user_info(&message.author))
        .with_message(info);
    if let Some(member) = &message.member {
        context = context.with_member(MemberInfo {
            nickname: member.nick.clone(),
            roles: member.roles.clone(),
            joined_at: member.joined_at.map(to_utc),
        });
    }
    context
}

/// Edit without a cached copy; embed-only updates carry no content
fn edited_message_context(
    event: &serenity::MessageUpdateEvent,
    now: DateTime<Utc>,
) -> Option<(GuildId, EvaluationContext)> {
    let guild_id = event.guild_id?;
    let author = event.author.as_ref()?;
    let content = event.content.as_ref()?;

    let mut info = MessageInfo::new(event.id, event.channel_id, content.clone());
    info.edited = true;
    info.mentioned_users = event
        .mentions
        .as_ref()
        .map(|users| users.iter().map(|user| user.id).collect())
        .unwrap_or_default();
    info.mentioned_roles = event.mention_roles.clone().unwrap_or_default();
    info.mentions_everyone = event.mention_everyone.unwrap_or(false);

    let context = EvaluationContext::new(now)
        .with_user(user_info(author))
        .with_message(info);
    Some((guild_id, context))
}

fn user_info(user: &serenity::User) -> UserInfo {
    UserInfo {
        name: user.name.clone(),
        bot: user.bot,
        ..UserInfo::from_id(user.id)
    }
}

fn to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_default()
}

/// Roles gained and lost between two role lists, if any changed
fn role_change(before: &[RoleId], after: &[RoleId]) -> Option<RoleChange> {
    let added: Vec<_> = after.iter().filter(|role| !before.contains(role)).copied().collect();
    let removed: Vec<_> = before.iter().filter(|role| !after.contains(role)).copied().collect();
    if added.is_empty() && removed.is_empty() {
        None
    } else {
        Some(RoleChange { added, removed })
    }
}

/// Voice transition between two channel states; mute toggles are not one
fn voice_change(before: Option<ChannelId>, after: Option<ChannelId>) -> Option<VoiceChange> {
    if before == after {
        return None;
    }
    Some(VoiceChange {
        joined: after,
        left: before,
    })
}
