//! Tracks nickname changes made by the engine so a user is not renamed over
//! and over while a spam burst is being handled.

use crate::automod::clock::{SharedClock, after};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use poise::serenity_prelude::UserId;
use std::time::Duration;

pub struct RecentNicknameChanges {
    changes: DashMap<UserId, DateTime<Utc>>,
    ttl: Duration,
    clock: SharedClock,
}

impl RecentNicknameChanges {
    #[must_use]
    pub fn new(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            changes: DashMap::new(),
            ttl,
            clock,
        }
    }

    pub fn record(&self, user_id: UserId) {
        self.changes.insert(user_id, self.clock.now());
    }

    /// Whether the engine changed this user's nickname within the TTL
    #[must_use]
    pub fn changed_recently(&self, user_id: UserId) -> bool {
        let now = self.clock.now();
        self.changes
            .get(&user_id)
            .is_some_and(|changed_at| after(*changed_at, self.ttl) > now)
    }

    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.changes.len();
        self.changes.retain(|_, changed_at| after(*changed_at, self.ttl) > now);
        before - self.changes.len()
    }
}
