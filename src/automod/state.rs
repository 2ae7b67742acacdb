//! Per-guild mutable state
//!
//! Everything here is owned by one guild engine and mutated only from its
//! execution queue, except for the periodic sweep which only drops expired
//! entries.

use crate::automod::antiraid::AntiraidState;
use crate::automod::audit::AuditSink;
use crate::automod::clock::SharedClock;
use crate::automod::cooldown::CooldownManager;
use crate::automod::recent_actions::RecentActionTracker;
use crate::automod::recent_nicknames::RecentNicknameChanges;
use crate::automod::recent_spam::RecentSpamCoalescer;
use crate::automod::regex_runner::{PatternMatcher, RegexRunner};
use crate::automod::rules::EngineSettings;
use poise::serenity_prelude::GuildId;
use std::sync::Arc;

/// Entries removed by one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub recent_actions: usize,
    pub recent_spam: usize,
    pub nickname_changes: usize,
    pub cooldowns: usize,
    pub pattern_failures: usize,
}

impl SweepStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.recent_actions
            + self.recent_spam
            + self.nickname_changes
            + self.cooldowns
            + self.pattern_failures
    }
}

pub struct GuildState {
    pub guild_id: GuildId,
    pub clock: SharedClock,
    pub cooldowns: CooldownManager,
    pub recent_actions: RecentActionTracker,
    pub recent_spam: RecentSpamCoalescer,
    pub nickname_changes: RecentNicknameChanges,
    pub regex: RegexRunner,
    pub antiraid: AntiraidState,
}

impl GuildState {
    #[must_use]
    pub fn new(
        guild_id: GuildId,
        settings: &EngineSettings,
        clock: SharedClock,
        matcher: Arc<dyn PatternMatcher>,
        audit: Arc<dyn AuditSink>,
        antiraid: AntiraidState,
    ) -> Self {
        Self {
            guild_id,
            cooldowns: CooldownManager::new(Arc::clone(&clock)),
            recent_actions: RecentActionTracker::new(
                Arc::clone(&clock),
                settings.recent_action_ttl,
                settings.recent_action_ttl_overrides.clone(),
            ),
            recent_spam: RecentSpamCoalescer::new(Arc::clone(&clock), settings.recent_spam_ttl),
            nickname_changes: RecentNicknameChanges::new(
                Arc::clone(&clock),
                settings.nickname_change_ttl,
            ),
            regex: RegexRunner::new(
                guild_id,
                matcher,
                settings.regex.clone(),
                audit,
                Arc::clone(&clock),
            ),
            antiraid,
            clock,
        }
    }

    /// Drop every expired entry
    pub fn sweep(&self) -> SweepStats {
        SweepStats {
            recent_actions: self.recent_actions.prune(),
            recent_spam: self.recent_spam.prune(),
            nickname_changes: self.nickname_changes.prune(),
            cooldowns: self.cooldowns.sweep(),
            pattern_failures: self.regex.prune(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::clock::{Clock, ManualClock};
    use crate::automod::context::test_support::message_context;
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_sweep_drops_expired_entries() {
        let clock = ManualClock::new(Utc::now());
        let state = test_support::state(&clock);

        let context = message_context(clock.now(), 1, 2, "hello").shared();
        state.recent_actions.record_message(&context);
        state.cooldowns.set_cooldown("rule-1", Duration::from_secs(60));
        assert_eq!(state.sweep().total(), 0);

        clock.advance(chrono::Duration::minutes(6));
        let stats = state.sweep();
        assert!(stats.recent_actions > 0);
        assert_eq!(stats.cooldowns, 1);
        assert!(state.recent_actions.is_empty());
    }
}
