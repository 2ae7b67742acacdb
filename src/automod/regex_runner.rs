//! Sandboxed pattern matcher
//!
//! Pattern matching runs on the blocking pool with a hard timeout so that a
//! pathological pattern can never stall a guild's execution queue. Patterns
//! that keep timing out are put on cooldown: three strikes within the
//! counting period disable the pattern for a while, after which it is
//! retried automatically.

use crate::automod::audit::{AuditEvent, AuditSink};
use crate::automod::clock::{SharedClock, before};
use crate::automod::cooldown::CooldownManager;
use crate::automod::error::{AutomodError, AutomodResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use poise::serenity_prelude::GuildId;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Compiled regexes are capped to keep a hostile pattern from eating memory
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A pattern to run against some text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub source: String,
    pub case_insensitive: bool,
    /// Collect every match instead of stopping at the first
    pub global: bool,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            case_insensitive: false,
            global: false,
        }
    }

    #[must_use]
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    #[must_use]
    pub fn global(mut self, yes: bool) -> Self {
        self.global = yes;
        self
    }
}

/// Blocking pattern matcher executed on the worker pool
pub trait PatternMatcher: Send + Sync + 'static {
    /// Return the matched substrings: every match for a global pattern, at
    /// most one otherwise
    fn find(&self, pattern: &Pattern, text: &str) -> AutomodResult<Vec<String>>;
}

/// [`PatternMatcher`] backed by the `regex` crate, caching compiled patterns
#[derive(Default)]
pub struct RegexMatcher {
    cache: DashMap<(String, bool), Arc<Regex>>,
}

impl RegexMatcher {
    /// Compile a pattern, reporting why it is invalid
    pub fn compile(source: &str, case_insensitive: bool) -> AutomodResult<Regex> {
        RegexBuilder::new(source)
            .case_insensitive(case_insensitive)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| AutomodError::InvalidPattern {
                pattern: source.to_string(),
                message: e.to_string(),
            })
    }

    fn get(&self, pattern: &Pattern) -> AutomodResult<Arc<Regex>> {
        let key = (pattern.source.clone(), pattern.case_insensitive);
        if let Some(regex) = self.cache.get(&key) {
            return Ok(Arc::clone(&regex));
        }
        let regex = Arc::new(Self::compile(&pattern.source, pattern.case_insensitive)?);
        self.cache.insert(key, Arc::clone(&regex));
        Ok(regex)
    }
}

impl PatternMatcher for RegexMatcher {
    fn find(&self, pattern: &Pattern, text: &str) -> AutomodResult<Vec<String>> {
        let regex = self.get(pattern)?;
        let matches = if pattern.global {
            regex
                .find_iter(text)
                .map(|found| found.as_str().to_string())
                .collect()
        } else {
            regex
                .find(text)
                .map(|found| vec![found.as_str().to_string()])
                .unwrap_or_default()
        };
        Ok(matches)
    }
}

/// Timeout and circuit-breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexRunnerSettings {
    #[serde(with = "crate::automod::duration::serde_duration")]
    pub timeout: Duration,
    /// Timeouts within `failure_window` that put a pattern on cooldown
    pub failure_threshold: usize,
    #[serde(with = "crate::automod::duration::serde_duration")]
    pub failure_window: Duration,
    #[serde(with = "crate::automod::duration::serde_duration")]
    pub cooldown: Duration,
    /// Concurrent matches allowed per guild
    pub max_workers: usize,
}

impl Default for RegexRunnerSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(100),
            failure_threshold: 3,
            failure_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(300),
            max_workers: 4,
        }
    }
}

/// Timeout-bounded pattern execution with an escalating cooldown
pub struct RegexRunner {
    guild_id: GuildId,
    matcher: Arc<dyn PatternMatcher>,
    settings: RegexRunnerSettings,
    cooldowns: CooldownManager,
    failures: DashMap<String, Vec<DateTime<Utc>>>,
    workers: Arc<Semaphore>,
    audit: Arc<dyn AuditSink>,
    clock: SharedClock,
}

impl RegexRunner {
    #[must_use]
    pub fn new(
        guild_id: GuildId,
        matcher: Arc<dyn PatternMatcher>,
        settings: RegexRunnerSettings,
        audit: Arc<dyn AuditSink>,
        clock: SharedClock,
    ) -> Self {
        Self {
            guild_id,
            matcher,
            workers: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            settings,
            cooldowns: CooldownManager::new(Arc::clone(&clock)),
            failures: DashMap::new(),
            audit,
            clock,
        }
    }

    /// Whether the pattern is currently disabled after repeated timeouts
    #[must_use]
    pub fn is_on_cooldown(&self, pattern: &Pattern) -> bool {
        self.cooldowns.is_on_cooldown(&pattern.source)
    }

    /// Run `pattern` against `text`
    ///
    /// Returns `Ok(None)` without running anything while the pattern is on
    /// cooldown. A non-global pattern yields `None` when nothing matched; a
    /// global pattern always yields its (possibly empty) match list.
    ///
    /// Waiting for a free worker and matching each get the full time budget.
    /// Only the match itself counts toward the pattern's cooldown.
    ///
    /// # Errors
    /// `RegexTimeout` if matching exceeded the time budget,
    /// `RegexWorkersBusy` if no worker freed up in time; invalid patterns and
    /// worker failures propagate unchanged.
    pub async fn exec(&self, pattern: &Pattern, text: &str) -> AutomodResult<Option<Vec<String>>> {
        if self.is_on_cooldown(pattern) {
            debug!(
                guild_id = %self.guild_id,
                pattern = %pattern.source,
                "Skipping pattern on cooldown"
            );
            return Ok(None);
        }

        let timeout_ms = u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX);

        // A timed-out match keeps its worker until it finishes, so the wait
        // for a permit is bounded separately and never blamed on this pattern
        let permit = match tokio::time::timeout(
            self.settings.timeout,
            Arc::clone(&self.workers).acquire_owned(),
        )
        .await
        {
            Ok(permit) => permit.map_err(|e| AutomodError::PatternWorker(e.to_string()))?,
            Err(_) => {
                debug!(
                    guild_id = %self.guild_id,
                    pattern = %pattern.source,
                    "No pattern worker free"
                );
                return Err(AutomodError::RegexWorkersBusy {
                    source_pattern: pattern.source.clone(),
                    waited_ms: timeout_ms,
                });
            }
        };

        let matcher = Arc::clone(&self.matcher);
        let job_pattern = pattern.clone();
        let job_text = text.to_string();
        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            matcher.find(&job_pattern, &job_text)
        });

        match tokio::time::timeout(self.settings.timeout, work).await {
            Ok(joined) => {
                let matches = joined.map_err(|e| AutomodError::PatternWorker(e.to_string()))??;
                if pattern.global || !matches.is_empty() {
                    Ok(Some(matches))
                } else {
                    Ok(None)
                }
            }
            Err(_) => {
                self.record_timeout(pattern).await;
                Err(AutomodError::RegexTimeout {
                    source_pattern: pattern.source.clone(),
                    timeout_ms,
                })
            }
        }
    }

    async fn record_timeout(&self, pattern: &Pattern) {
        let now = self.clock.now();
        let window_start = before(now, self.settings.failure_window);

        let failures = {
            let mut entry = self.failures.entry(pattern.source.clone()).or_default();
            entry.retain(|failed_at| *failed_at > window_start);
            entry.push(now);
            entry.len()
        };

        self.audit
            .notify(
                self.guild_id,
                AuditEvent::RegexTimeout {
                    pattern: pattern.source.clone(),
                    timeout_ms: u64::try_from(self.settings.timeout.as_millis()).unwrap_or(u64::MAX),
                },
            )
            .await;

        if failures >= self.settings.failure_threshold {
            self.cooldowns
                .set_cooldown(pattern.source.clone(), self.settings.cooldown);
            self.failures.remove(&pattern.source);

            self.audit
                .notify(
                    self.guild_id,
                    AuditEvent::RepeatedRegexTimeout {
                        pattern: pattern.source.clone(),
                        failures,
                        cooldown_secs: self.settings.cooldown.as_secs(),
                    },
                )
                .await;
        }
    }

    /// Drop expired cooldowns and failures outside the counting period
    pub fn prune(&self) -> usize {
        let window_start = before(self.clock.now(), self.settings.failure_window);
        for mut entry in self.failures.iter_mut() {
            entry.retain(|failed_at| *failed_at > window_start);
        }
        self.failures.retain(|_, failures| !failures.is_empty());
        self.cooldowns.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::audit::test_support::RecordingAuditSink;
    use crate::automod::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Matcher that always takes far longer than the budget
    struct SlowMatcher {
        calls: AtomicUsize,
    }

    impl PatternMatcher for SlowMatcher {
        fn find(&self, _pattern: &Pattern, _text: &str) -> AutomodResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            Ok(Vec::new())
        }
    }

    /// Matcher that stalls only on the pattern `slow`
    struct OneSlowPattern;

    impl PatternMatcher for OneSlowPattern {
        fn find(&self, pattern: &Pattern, _text: &str) -> AutomodResult<Vec<String>> {
            if pattern.source == "slow" {
                std::thread::sleep(Duration::from_millis(300));
            }
            Ok(vec![pattern.source.clone()])
        }
    }

    fn runner(
        matcher: Arc<dyn PatternMatcher>,
        clock: &ManualClock,
        audit: Arc<RecordingAuditSink>,
    ) -> RegexRunner {
        RegexRunner::new(
            GuildId::new(1),
            matcher,
            RegexRunnerSettings {
                timeout: Duration::from_millis(20),
                ..Default::default()
            },
            audit,
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_exec_semantics() {
        let clock = ManualClock::new(Utc::now());
        let runner = runner(
            Arc::new(RegexMatcher::default()),
            &clock,
            Arc::new(RecordingAuditSink::default()),
        );

        let pattern = Pattern::new("b+");
        assert_eq!(
            runner.exec(&pattern, "abbcbd").await.unwrap(),
            Some(vec!["bb".to_string()])
        );
        assert_eq!(runner.exec(&pattern, "xyz").await.unwrap(), None);

        let global = Pattern::new("b+").global(true);
        assert_eq!(
            runner.exec(&global, "abbcbd").await.unwrap(),
            Some(vec!["bb".to_string(), "b".to_string()])
        );
        assert_eq!(runner.exec(&global, "xyz").await.unwrap(), Some(Vec::new()));

        let insensitive = Pattern::new("hello").case_insensitive(true);
        assert!(runner.exec(&insensitive, "HeLLo there").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_pattern_propagates() {
        let clock = ManualClock::new(Utc::now());
        let runner = runner(
            Arc::new(RegexMatcher::default()),
            &clock,
            Arc::new(RecordingAuditSink::default()),
        );

        let result = runner.exec(&Pattern::new("(unclosed"), "text").await;
        assert!(matches!(result, Err(AutomodError::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn test_repeated_timeouts_trip_cooldown() {
        let clock = ManualClock::new(Utc::now());
        let matcher = Arc::new(SlowMatcher {
            calls: AtomicUsize::new(0),
        });
        let audit = Arc::new(RecordingAuditSink::default());
        let runner = runner(matcher.clone(), &clock, Arc::clone(&audit));
        let pattern = Pattern::new("(a+)+$");

        for _ in 0..3 {
            let result = runner.exec(&pattern, "aaaaaaaaaaaaaaaaaaaaaaaa!").await;
            assert!(result.unwrap_err().is_timeout());
        }
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 3);
        assert!(runner.is_on_cooldown(&pattern));

        // Fourth call returns immediately without touching the matcher
        let started = Instant::now();
        assert_eq!(runner.exec(&pattern, "aaaa!").await.unwrap(), None);
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 3);

        let events = audit.events();
        let timeouts = events
            .iter()
            .filter(|event| matches!(event, AuditEvent::RegexTimeout { .. }))
            .count();
        assert_eq!(timeouts, 3);
        assert!(events.iter().any(|event| matches!(
            event,
            AuditEvent::RepeatedRegexTimeout { failures: 3, .. }
        )));

        // After the cooldown the pattern is attempted again
        clock.advance(chrono::Duration::minutes(5));
        let result = runner.exec(&pattern, "aaaa!").await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(matcher.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_count() {
        let clock = ManualClock::new(Utc::now());
        let matcher = Arc::new(SlowMatcher {
            calls: AtomicUsize::new(0),
        });
        let runner = runner(matcher, &clock, Arc::new(RecordingAuditSink::default()));
        let pattern = Pattern::new("slow");

        for _ in 0..2 {
            assert!(runner.exec(&pattern, "x").await.is_err());
        }
        clock.advance(chrono::Duration::minutes(3));
        assert!(runner.exec(&pattern, "x").await.is_err());
        assert!(!runner.is_on_cooldown(&pattern));
    }

    #[tokio::test]
    async fn test_busy_workers_are_not_blamed_on_waiting_pattern() {
        let clock = ManualClock::new(Utc::now());
        let audit = Arc::new(RecordingAuditSink::default());
        let runner = RegexRunner::new(
            GuildId::new(1),
            Arc::new(OneSlowPattern),
            RegexRunnerSettings {
                timeout: Duration::from_millis(50),
                max_workers: 1,
                ..Default::default()
            },
            audit.clone(),
            Arc::new(clock.clone()),
        );
        let slow = Pattern::new("slow");
        let fast = Pattern::new("fast");

        assert!(runner.exec(&slow, "x").await.unwrap_err().is_timeout());

        // The only worker is still stuck on `slow`
        for _ in 0..3 {
            let error = runner.exec(&fast, "x").await.unwrap_err();
            assert!(matches!(error, AutomodError::RegexWorkersBusy { .. }), "{error}");
            assert!(error.is_transient());
        }
        assert!(!runner.is_on_cooldown(&fast));
        let timed_out: Vec<_> = audit
            .events()
            .into_iter()
            .filter_map(|event| match event {
                AuditEvent::RegexTimeout { pattern, .. } => Some(pattern),
                _ => None,
            })
            .collect();
        assert_eq!(timed_out, vec!["slow".to_string()]);

        // Once `slow` finishes the worker is free again
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            runner.exec(&fast, "x").await.unwrap(),
            Some(vec!["fast".to_string()])
        );
    }
}
