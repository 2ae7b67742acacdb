//! Recent-action tracker
//!
//! Append-only, TTL-pruned log of counted events keyed by (kind, identifier).
//! Spam triggers query a window of it and compare the summed counts against
//! their threshold.

use crate::automod::clock::{SharedClock, after};
use crate::automod::context::EvaluationContext;
use crate::automod::text;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Kind of counted event
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecentActionKind {
    #[display("message")]
    Message,
    #[display("mention")]
    Mention,
    #[display("link")]
    Link,
    #[display("attachment")]
    Attachment,
    #[display("emoji")]
    Emoji,
    #[display("line")]
    Line,
    #[display("character")]
    Character,
    #[display("sticker")]
    Sticker,
    #[display("member join")]
    MemberJoin,
    #[display("member leave")]
    MemberLeave,
    #[display("thread create")]
    ThreadCreate,
    #[display("voice channel join")]
    VoiceChannelJoin,
}

/// One counted event
#[derive(Debug, Clone)]
pub struct RecentActionRecord {
    pub kind: RecentActionKind,
    pub identifier: Option<String>,
    pub count: u64,
    pub context: Arc<EvaluationContext>,
}

/// Per-channel identifier for a user's activity
#[must_use]
pub fn channel_scoped_identifier(channel_id: impl std::fmt::Display, user_id: impl std::fmt::Display) -> String {
    format!("{channel_id}-{user_id}")
}

/// TTL-bounded log of recent actions
pub struct RecentActionTracker {
    records: Mutex<Vec<RecentActionRecord>>,
    default_ttl: Duration,
    ttl_overrides: HashMap<RecentActionKind, Duration>,
    clock: SharedClock,
}

impl RecentActionTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new(
        clock: SharedClock,
        default_ttl: Duration,
        ttl_overrides: HashMap<RecentActionKind, Duration>,
    ) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            default_ttl,
            ttl_overrides,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RecentActionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How long records of `kind` are kept
    #[must_use]
    pub fn ttl(&self, kind: RecentActionKind) -> Duration {
        self.ttl_overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Append a record
    pub fn record(
        &self,
        kind: RecentActionKind,
        identifier: Option<String>,
        count: u64,
        context: Arc<EvaluationContext>,
    ) {
        self.lock().push(RecentActionRecord {
            kind,
            identifier,
            count,
            context,
        });
    }

    /// Record `count` under both the global user identifier and the
    /// channel-scoped one
    fn record_user_and_channel(
        &self,
        kind: RecentActionKind,
        count: u64,
        context: &Arc<EvaluationContext>,
    ) {
        if count == 0 {
            return;
        }
        let (Some(user_id), Some(channel_id)) = (context.user_id(), context.channel_id()) else {
            return;
        };

        self.record(kind, Some(user_id.to_string()), count, Arc::clone(context));
        self.record(
            kind,
            Some(channel_scoped_identifier(channel_id, user_id)),
            count,
            Arc::clone(context),
        );
    }

    /// Record every counted kind derived from a message context
    pub fn record_message(&self, context: &Arc<EvaluationContext>) {
        let Some(message) = context.message.as_ref() else {
            return;
        };

        let mut mentions = message.mentioned_users.len() + message.mentioned_roles.len();
        if message.mentions_everyone {
            mentions += 1;
        }

        let counts = [
            (RecentActionKind::Message, 1),
            (RecentActionKind::Mention, mentions),
            (RecentActionKind::Link, text::find_links(&message.content).len()),
            (RecentActionKind::Attachment, message.attachments.len()),
            (RecentActionKind::Emoji, text::count_emojis(&message.content)),
            (RecentActionKind::Line, text::count_lines(&message.content)),
            (RecentActionKind::Character, message.content.chars().count()),
            (RecentActionKind::Sticker, message.sticker_count),
        ];

        for (kind, count) in counts {
            self.record_user_and_channel(kind, count as u64, context);
        }
    }

    /// Return the live records of `kind` in `[since, to]`
    ///
    /// A `None` identifier matches records with any identifier. Records whose
    /// context already triggered a rule are excluded.
    #[must_use]
    pub fn query(
        &self,
        kind: RecentActionKind,
        identifier: Option<&str>,
        since: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<RecentActionRecord> {
        self.lock()
            .iter()
            .filter(|record| {
                record.kind == kind
                    && identifier.is_none_or(|id| record.identifier.as_deref() == Some(id))
                    && record.context.timestamp >= since
                    && record.context.timestamp <= to
                    && !record.context.is_actioned()
            })
            .cloned()
            .collect()
    }

    /// Sum the counts of `records`
    #[must_use]
    pub fn sum_counts(records: &[RecentActionRecord]) -> u64 {
        records.iter().map(|record| record.count).sum()
    }

    /// Remove every record whose `timestamp + ttl <= now`
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.lock();
        let before = records.len();
        records.retain(|record| after(record.context.timestamp, self.ttl(record.kind)) > now);
        before - records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
