//! Key-scoped cooldowns
//!
//! A cooldown is a "do not re-trigger until" deadline. Expired entries are
//! inert; they are dropped when looked up or overwritten, and `sweep` can be
//! called periodically to bound memory.

use crate::automod::clock::{SharedClock, after};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// Store for cooldown deadlines
pub struct CooldownManager {
    expiries: DashMap<String, DateTime<Utc>>,
    clock: SharedClock,
}

impl CooldownManager {
    /// Create an empty cooldown manager
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self {
            expiries: DashMap::new(),
            clock,
        }
    }

    /// Check whether `key` is still cooling down
    #[must_use]
    pub fn is_on_cooldown(&self, key: &str) -> bool {
        let now = self.clock.now();
        let active = self
            .expiries
            .get(key)
            .is_some_and(|expires_at| now < *expires_at);

        if !active {
            self.expiries.remove_if(key, |_, expires_at| now >= *expires_at);
        }

        active
    }

    /// Put `key` on cooldown for `duration`, overwriting any previous deadline
    pub fn set_cooldown(&self, key: impl Into<String>, duration: Duration) {
        let expires_at = after(self.clock.now(), duration);
        self.expiries.insert(key.into(), expires_at);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.expiries.len();
        self.expiries.retain(|_, expires_at| now < *expires_at);
        before - self.expiries.len()
    }

    /// Number of tracked entries, expired or not
    #[must_use]
    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::clock::ManualClock;
    use std::sync::Arc;

    fn manager() -> (CooldownManager, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        (CooldownManager::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_cooldown_expires() {
        let (cooldowns, clock) = manager();
        assert!(!cooldowns.is_on_cooldown("rule-1"));

        cooldowns.set_cooldown("rule-1", Duration::from_secs(60));
        assert!(cooldowns.is_on_cooldown("rule-1"));

        clock.advance(chrono::Duration::seconds(59));
        assert!(cooldowns.is_on_cooldown("rule-1"));

        // now == expires_at is no longer on cooldown
        clock.advance(chrono::Duration::seconds(1));
        assert!(!cooldowns.is_on_cooldown("rule-1"));
        assert!(cooldowns.is_empty());
    }

    #[test]
    fn test_set_cooldown_overwrites() {
        let (cooldowns, clock) = manager();
        cooldowns.set_cooldown("key", Duration::from_secs(10));
        clock.advance(chrono::Duration::seconds(5));
        cooldowns.set_cooldown("key", Duration::from_secs(10));
        clock.advance(chrono::Duration::seconds(8));
        assert!(cooldowns.is_on_cooldown("key"));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let (cooldowns, clock) = manager();
        cooldowns.set_cooldown("short", Duration::from_secs(1));
        cooldowns.set_cooldown("long", Duration::from_secs(100));
        clock.advance(chrono::Duration::seconds(2));

        assert_eq!(cooldowns.sweep(), 1);
        assert_eq!(cooldowns.len(), 1);
        assert!(cooldowns.is_on_cooldown("long"));
    }
}
