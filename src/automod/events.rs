//! Mod-action event bus
//!
//! Sibling subsystems (case creation, manual moderation commands, the action
//! effects themselves) publish moderation events here; each guild engine
//! subscribes and evaluates its rules against the events for its guild.

use derive_more::Display;
use poise::serenity_prelude::{GuildId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Kind of moderation action that happened
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModActionKind {
    #[display("mute")]
    Mute,
    #[display("unmute")]
    Unmute,
    #[display("warn")]
    Warn,
    #[display("kick")]
    Kick,
    #[display("ban")]
    Ban,
    #[display("unban")]
    Unban,
    #[display("note")]
    Note,
}

impl ModActionKind {
    pub const ALL: [Self; 7] = [
        Self::Mute,
        Self::Unmute,
        Self::Warn,
        Self::Kick,
        Self::Ban,
        Self::Unban,
        Self::Note,
    ];

    /// Trigger name used in rule configuration
    #[must_use]
    pub fn trigger_name(self) -> &'static str {
        match self {
            Self::Mute => "mute",
            Self::Unmute => "unmute",
            Self::Warn => "warn",
            Self::Kick => "kick",
            Self::Ban => "ban",
            Self::Unban => "unban",
            Self::Note => "note",
        }
    }
}

/// A moderation action performed in a guild
#[derive(Debug, Clone)]
pub struct ModActionEvent {
    pub guild_id: GuildId,
    pub kind: ModActionKind,
    pub user_id: UserId,
    pub moderator_id: Option<UserId>,
    pub reason: Option<String>,
    /// Performed by automod rather than a human moderator
    pub automatic: bool,
}

/// Broadcast bus for [`ModActionEvent`]s
#[derive(Clone)]
pub struct ModActionBus {
    tx: broadcast::Sender<ModActionEvent>,
}

impl Default for ModActionBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ModActionBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; returns how many subscribers received it
    pub fn publish(&self, event: ModActionEvent) -> usize {
        debug!(
            guild_id = %event.guild_id,
            user_id = %event.user_id,
            kind = %event.kind,
            "Publishing mod action event"
        );
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to every future event
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModActionEvent> {
        self.tx.subscribe()
    }
}
