//! Evaluation contexts
//!
//! An [`EvaluationContext`] is the normalized snapshot of one platform event.
//! Contexts are shared behind `Arc` because recent-action records keep a
//! reference to them and spam matches link several of them together; the
//! `actioned` flag is therefore atomic.

use crate::automod::events::ModActionEvent;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{ChannelId, MessageId, RoleId, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// The user an event is about
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: UserId,
    pub name: String,
    pub bot: bool,
    /// Account creation time
    pub created_at: DateTime<Utc>,
}

/// Milliseconds between the Unix epoch and the Discord epoch
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

impl UserInfo {
    /// Minimal user info when only the id is known
    ///
    /// The creation time is recovered from the snowflake.
    #[must_use]
    pub fn from_id(id: UserId) -> Self {
        let millis = (id.get() >> 22) + DISCORD_EPOCH_MS;
        let created_at = i64::try_from(millis)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default();
        Self {
            id,
            name: id.to_string(),
            bot: false,
            created_at,
        }
    }
}

/// Guild membership details of the user, when known
#[derive(Debug, Clone, Default)]
pub struct MemberInfo {
    pub nickname: Option<String>,
    pub roles: Vec<RoleId>,
    pub joined_at: Option<DateTime<Utc>>,
}

/// An attachment on a message
#[derive(Debug, Clone)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: Option<String>,
}

impl AttachmentInfo {
    /// Lowercase file extension, if the filename has one
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        let (_, ext) = self.filename.rsplit_once('.')?;
        if ext.is_empty() {
            None
        } else {
            Some(ext.to_lowercase())
        }
    }
}

/// A created or edited message
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    pub attachments: Vec<AttachmentInfo>,
    pub mentioned_users: Vec<UserId>,
    pub mentioned_roles: Vec<RoleId>,
    pub mentions_everyone: bool,
    pub sticker_count: usize,
    pub edited: bool,
}

impl MessageInfo {
    /// Create a plain text message
    pub fn new(id: MessageId, channel_id: ChannelId, content: impl Into<String>) -> Self {
        Self {
            id,
            channel_id,
            content: content.into(),
            attachments: Vec::new(),
            mentioned_users: Vec::new(),
            mentioned_roles: Vec::new(),
            mentions_everyone: false,
            sticker_count: 0,
            edited: false,
        }
    }
}

/// Roles added to or removed from a member
#[derive(Debug, Clone, Default)]
pub struct RoleChange {
    pub added: Vec<RoleId>,
    pub removed: Vec<RoleId>,
}

/// A voice state transition; a switch has both fields set
#[derive(Debug, Clone, Default)]
pub struct VoiceChange {
    pub joined: Option<ChannelId>,
    pub left: Option<ChannelId>,
}

/// A thread that was created or deleted
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: ChannelId,
    pub parent_id: Option<ChannelId>,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadChange {
    pub created: Option<ThreadInfo>,
    pub deleted: Option<ThreadInfo>,
}

/// A counter crossed one of its configured triggers
#[derive(Debug, Clone)]
pub struct CounterTriggerInfo {
    pub counter: String,
    pub trigger: String,
    /// The counter went back below the trigger's threshold
    pub reverse: bool,
    pub channel_id: Option<ChannelId>,
}

/// The guild's antiraid level changed
#[derive(Debug, Clone)]
pub struct AntiraidChange {
    pub level: Option<String>,
    pub previous: Option<String>,
}

/// Normalized snapshot of one platform event
#[derive(Debug)]
pub struct EvaluationContext {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user: Option<UserInfo>,
    pub member: Option<MemberInfo>,
    pub message: Option<MessageInfo>,
    pub roles_changed: Option<RoleChange>,
    pub voice_channel: Option<VoiceChange>,
    pub thread_change: Option<ThreadChange>,
    pub counter_trigger: Option<CounterTriggerInfo>,
    pub antiraid: Option<AntiraidChange>,
    pub mod_action: Option<ModActionEvent>,
    /// Member left the guild
    pub member_left: bool,
    /// Member joined the guild
    pub member_joined: bool,
    actioned: AtomicBool,
}

impl EvaluationContext {
    /// Create an empty context at `timestamp`
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            user: None,
            member: None,
            message: None,
            roles_changed: None,
            voice_channel: None,
            thread_change: None,
            counter_trigger: None,
            antiraid: None,
            mod_action: None,
            member_left: false,
            member_joined: false,
            actioned: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn with_member(mut self, member: MemberInfo) -> Self {
        self.member = Some(member);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: MessageInfo) -> Self {
        self.message = Some(message);
        self
    }

    #[must_use]
    pub fn with_roles_changed(mut self, change: RoleChange) -> Self {
        self.roles_changed = Some(change);
        self
    }

    #[must_use]
    pub fn with_voice_change(mut self, change: VoiceChange) -> Self {
        self.voice_channel = Some(change);
        self
    }

    #[must_use]
    pub fn with_thread_change(mut self, change: ThreadChange) -> Self {
        self.thread_change = Some(change);
        self
    }

    #[must_use]
    pub fn with_counter_trigger(mut self, info: CounterTriggerInfo) -> Self {
        self.counter_trigger = Some(info);
        self
    }

    #[must_use]
    pub fn with_antiraid(mut self, change: AntiraidChange) -> Self {
        self.antiraid = Some(change);
        self
    }

    #[must_use]
    pub fn with_mod_action(mut self, event: ModActionEvent) -> Self {
        self.mod_action = Some(event);
        self
    }

    #[must_use]
    pub fn joined(mut self) -> Self {
        self.member_joined = true;
        self
    }

    #[must_use]
    pub fn left(mut self) -> Self {
        self.member_left = true;
        self
    }

    /// Freeze the context for sharing
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// The acting user's id
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.user.as_ref().map(|user| user.id)
    }

    /// Whether the acting user is a bot
    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.user.as_ref().is_some_and(|user| user.bot)
    }

    /// Channel the event happened in
    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.message
            .as_ref()
            .map(|message| message.channel_id)
            .or_else(|| {
                self.counter_trigger
                    .as_ref()
                    .and_then(|counter| counter.channel_id)
            })
    }

    /// Contexts created by the engine itself rather than by a user
    #[must_use]
    pub fn is_synthetic(&self) -> bool {
        self.counter_trigger.is_some() || self.antiraid.is_some()
    }

    /// Mark the context as handled by a matching rule
    pub fn mark_actioned(&self) {
        self.actioned.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_actioned(&self) -> bool {
        self.actioned.load(Ordering::SeqCst)
    }
}
