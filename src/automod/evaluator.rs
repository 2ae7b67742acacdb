//! Rule evaluation
//!
//! Walks a guild's rules in declaration order against one context. This is
//! always called from inside the guild's execution queue.

use crate::automod::actions::{ActionArgs, ActionConfig};
use crate::automod::audit::AuditEvent;
use crate::automod::context::EvaluationContext;
use crate::automod::engine::GuildEngine;
use crate::automod::rules::Rule;
use crate::automod::triggers::{SummaryArgs, TriggerArgs, TriggerMatch};
use crate::AUTOMOD_TARGET;
use crate::automod::error::AutomodError;
use derive_more::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a rule was not checked
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    #[display("disabled")]
    Disabled,
    #[display("bot user")]
    Bot,
    #[display("own user")]
    OwnUser,
    #[display("on cooldown")]
    Cooldown,
}

/// An action of a matched rule that failed
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub action: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Skipped(SkipReason),
    NoMatch,
    Matched {
        trigger: String,
        summary: String,
        action_errors: Vec<ActionFailure>,
        /// Later rules were not evaluated
        stopped: bool,
    },
    /// An already handled incident; only its messages were cleaned up
    SilentClean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleReport {
    pub rule: String,
    pub outcome: RuleOutcome,
}

/// What happened to one context, rule by rule
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub context_id: Uuid,
    /// Visited rules in order; rules after a stop are absent
    pub outcomes: Vec<RuleReport>,
}

impl EvaluationReport {
    /// Names of the rules that matched, silent cleans included
    #[must_use]
    pub fn matched_rules(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|report| {
                matches!(
                    report.outcome,
                    RuleOutcome::Matched { .. } | RuleOutcome::SilentClean
                )
            })
            .map(|report| report.rule.as_str())
            .collect()
    }

    #[must_use]
    pub fn outcome(&self, rule: &str) -> Option<&RuleOutcome> {
        self.outcomes
            .iter()
            .find(|report| report.rule == rule)
            .map(|report| &report.outcome)
    }
}

/// Evaluate `rules` against `context`
pub async fn evaluate(
    engine: &GuildEngine,
    rules: &[Rule],
    context: &Arc<EvaluationContext>,
) -> EvaluationReport {
    let mut report = EvaluationReport {
        context_id: context.id,
        outcomes: Vec::new(),
    };

    let state = engine.state();
    let current_level = state.antiraid.get();
    let applicable = rules.iter().filter(|rule| {
        rule.antiraid_level.as_ref().is_none_or(|criterion| {
            criterion.matches(current_level.as_deref(), state.antiraid.levels())
        })
    });

    for rule in applicable {
        let (outcome, stop) = evaluate_rule(engine, rule, context).await;
        report.outcomes.push(RuleReport {
            rule: rule.name.clone(),
            outcome,
        });
        if stop {
            break;
        }
    }

    report
}

fn skip_reason(engine: &GuildEngine, rule: &Rule, context: &EvaluationContext) -> Option<SkipReason> {
    if !rule.enabled {
        return Some(SkipReason::Disabled);
    }
    if !rule.affects_bots && context.is_bot() && !context.is_synthetic() {
        return Some(SkipReason::Bot);
    }
    if !rule.affects_self
        && engine
            .self_user_id()
            .is_some_and(|own| context.user_id() == Some(own))
    {
        return Some(SkipReason::OwnUser);
    }
    if let Some(cooldown) = rule.cooldown {
        let user = context
            .user_id()
            .map_or_else(|| "unknown".to_string(), |id| id.to_string());
        let key = format!("{}-{user}", rule.name);
        let cooldowns = &engine.state().cooldowns;
        if cooldowns.is_on_cooldown(&key) {
            return Some(SkipReason::Cooldown);
        }
        // Armed once checked, whether or not a trigger matches
        cooldowns.set_cooldown(key, cooldown);
    }
    None
}

/// Evaluate one rule; the flag tells whether to stop processing the context
async fn evaluate_rule(
    engine: &GuildEngine,
    rule: &Rule,
    context: &Arc<EvaluationContext>,
) -> (RuleOutcome, bool) {
    if let Some(reason) = skip_reason(engine, rule, context) {
        debug!(rule = %rule.name, reason = %reason, "Rule skipped");
        return (RuleOutcome::Skipped(reason), false);
    }

    let Some((trigger_index, matched)) = first_match(engine, rule, context).await else {
        return (RuleOutcome::NoMatch, false);
    };

    let mut contexts = vec![Arc::clone(context)];
    for extra in matched.extra_contexts.iter() {
        if !contexts.iter().any(|known| known.id == extra.id) {
            contexts.push(Arc::clone(extra));
        }
    }
    for linked in &contexts {
        linked.mark_actioned();
    }

    if matched.silent_clean {
        silent_clean(engine, rule, &contexts).await;
        return (RuleOutcome::SilentClean, true);
    }

    let invocation = &rule.triggers[trigger_index];
    let summary = engine
        .triggers()
        .get(&invocation.name)
        .map(|trigger| {
            trigger.render_summary(SummaryArgs {
                rule_name: &rule.name,
                context,
                config: &invocation.config,
                matched: &matched,
            })
        })
        .unwrap_or_default();

    info!(
        target: AUTOMOD_TARGET,
        guild_id = %engine.guild_id(),
        rule = %rule.name,
        trigger = %invocation.name,
        contexts = contexts.len(),
        "Automod rule matched"
    );
    engine
        .audit()
        .notify(
            engine.guild_id(),
            AuditEvent::RuleMatched {
                rule: rule.name.clone(),
                trigger: invocation.name.clone(),
                summary: summary.clone(),
            },
        )
        .await;

    let mut action_errors = Vec::new();
    for action in &rule.actions {
        let result = match engine.actions().get(&action.name) {
            Some(handler) => {
                handler
                    .apply(ActionArgs {
                        engine,
                        rule_name: &rule.name,
                        contexts: &contexts,
                        config: &action.config,
                        summary: &summary,
                    })
                    .await
            }
            None => Err(AutomodError::UnknownAction(action.name.clone())),
        };

        if let Err(e) = result {
            warn!(
                target: AUTOMOD_TARGET,
                guild_id = %engine.guild_id(),
                rule = %rule.name,
                action = %action.name,
                error = %e,
                "Automod action failed"
            );
            engine
                .audit()
                .notify(
                    engine.guild_id(),
                    AuditEvent::ActionFailed {
                        rule: rule.name.clone(),
                        action: action.name.clone(),
                        error: e.to_string(),
                    },
                )
                .await;
            action_errors.push(ActionFailure {
                action: action.name.clone(),
                error: e.to_string(),
            });
        }
    }

    let stopped = !rule.allow_further_rules;
    (
        RuleOutcome::Matched {
            trigger: invocation.name.clone(),
            summary,
            action_errors,
            stopped,
        },
        stopped,
    )
}

/// First matching trigger of the rule and its index
async fn first_match(
    engine: &GuildEngine,
    rule: &Rule,
    context: &Arc<EvaluationContext>,
) -> Option<(usize, TriggerMatch)> {
    for (index, invocation) in rule.triggers.iter().enumerate() {
        let Some(trigger) = engine.triggers().get(&invocation.name) else {
            continue;
        };
        let result = trigger
            .matches(TriggerArgs {
                state: engine.state(),
                rule_name: &rule.name,
                context,
                config: &invocation.config,
            })
            .await;
        match result {
            Ok(Some(matched)) => return Some((index, matched)),
            Ok(None) => {}
            Err(e) => warn!(
                target: AUTOMOD_TARGET,
                guild_id = %engine.guild_id(),
                rule = %rule.name,
                trigger = %invocation.name,
                error = %e,
                "Trigger failed, treating as no match"
            ),
        }
    }
    None
}

async fn silent_clean(engine: &GuildEngine, rule: &Rule, contexts: &[Arc<EvaluationContext>]) {
    let Some(clean) = engine.actions().get("clean") else {
        return;
    };
    debug!(rule = %rule.name, contexts = contexts.len(), "Silently cleaning handled incident");
    let result = clean
        .apply(ActionArgs {
            engine,
            rule_name: &rule.name,
            contexts,
            config: &ActionConfig::Clean,
            summary: "",
        })
        .await;
    if let Err(e) = result {
        warn!(
            target: AUTOMOD_TARGET,
            guild_id = %engine.guild_id(),
            rule = %rule.name,
            error = %e,
            "Silent clean failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::context::test_support::{message_context, user};
    use crate::automod::context::{AntiraidChange, EvaluationContext, UserInfo};
    use crate::automod::effects::Effect;
    use crate::automod::engine::test_support::TestEngine;
    use crate::automod::rules::test_support::rules;
    use chrono::Utc;
    use poise::serenity_prelude::UserId;
    use std::time::Duration;

    async fn run(harness: &TestEngine, rules: &[Rule], user_id: u64, content: &str) -> EvaluationReport {
        let context = message_context(harness.now(), user_id, 10, content).shared();
        evaluate(&harness.engine, rules, &context).await
    }

    #[tokio::test]
    async fn test_first_match_stops_unless_further_rules_allowed() {
        let harness = TestEngine::new().await;
        let exclusive = rules(
            "  first: { triggers: [any_message], actions: { log: true } }\n  \
             second: { triggers: [any_message], actions: { log: true } }",
        );
        let report = run(&harness, &exclusive, 1, "hi").await;
        assert_eq!(report.matched_rules(), vec!["first"]);
        assert_eq!(report.outcomes.len(), 1);

        let chained = rules(
            "  first: { triggers: [any_message], allow_further_rules: true }\n  \
             second: { triggers: [any_message] }",
        );
        let report = run(&harness, &chained, 1, "hi").await;
        assert_eq!(report.matched_rules(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_skip_reasons() {
        let harness = TestEngine::new().await;
        let rules = rules(
            "  disabled: { enabled: false, triggers: [any_message], allow_further_rules: true }\n  \
             humans: { triggers: [any_message] }",
        );

        let bot = EvaluationContext::new(Utc::now())
            .with_user(UserInfo {
                bot: true,
                ..user(2)
            })
            .shared();
        let report = evaluate(&harness.engine, &rules, &bot).await;
        assert_eq!(report.outcome("disabled"), Some(&RuleOutcome::Skipped(SkipReason::Disabled)));
        assert_eq!(report.outcome("humans"), Some(&RuleOutcome::Skipped(SkipReason::Bot)));

        let own = run(&harness, &rules, TestEngine::SELF_USER, "hi").await;
        assert_eq!(
            own.outcome("humans"),
            Some(&RuleOutcome::Skipped(SkipReason::OwnUser))
        );
    }

    #[tokio::test]
    async fn test_bot_filter_ignores_synthetic_contexts() {
        let harness = TestEngine::new().await;
        let rules = rules("  raid: { triggers: [ { antiraid_level: { level: high } } ] }");
        let context = EvaluationContext::new(Utc::now())
            .with_user(UserInfo {
                bot: true,
                ..user(2)
            })
            .with_antiraid(AntiraidChange {
                level: Some("high".to_string()),
                previous: None,
            })
            .shared();

        let report = evaluate(&harness.engine, &rules, &context).await;
        assert_eq!(report.matched_rules(), vec!["raid"]);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_matches() {
        let harness = TestEngine::new().await;
        let rules = rules("  greet: { triggers: [any_message], cooldown: 1m, actions: { log: true } }");

        assert_eq!(run(&harness, &rules, 1, "a").await.matched_rules(), vec!["greet"]);
        assert_eq!(
            run(&harness, &rules, 1, "b").await.outcome("greet"),
            Some(&RuleOutcome::Skipped(SkipReason::Cooldown))
        );
        // Cooldowns are per user
        assert_eq!(run(&harness, &rules, 2, "c").await.matched_rules(), vec!["greet"]);

        harness.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(run(&harness, &rules, 1, "d").await.matched_rules(), vec!["greet"]);
    }

    #[tokio::test]
    async fn test_longest_cooldown_is_evaluated() {
        let harness = TestEngine::new().await;
        let rules = rules("  once: { triggers: [any_message], cooldown: 3650d }");

        assert_eq!(run(&harness, &rules, 1, "a").await.matched_rules(), vec!["once"]);
        assert_eq!(
            run(&harness, &rules, 1, "b").await.outcome("once"),
            Some(&RuleOutcome::Skipped(SkipReason::Cooldown))
        );
    }

    #[tokio::test]
    async fn test_cooldown_is_armed_without_a_match() {
        let harness = TestEngine::new().await;
        let rules = rules(
            "  words: { triggers: [ { match_words: { words: [forbidden] } } ], cooldown: 1m }",
        );

        assert_eq!(run(&harness, &rules, 1, "harmless").await.outcome("words"), Some(&RuleOutcome::NoMatch));
        assert_eq!(
            run(&harness, &rules, 1, "forbidden").await.outcome("words"),
            Some(&RuleOutcome::Skipped(SkipReason::Cooldown))
        );
    }

    #[tokio::test]
    async fn test_failed_action_does_not_stop_siblings() {
        let harness = TestEngine::with_failing_effects(&["warn"]).await;
        let rules = rules(
            "  strict: { triggers: [any_message], actions: { warn: true, kick: true, log: true } }",
        );

        let report = run(&harness, &rules, 1, "hi").await;
        let Some(RuleOutcome::Matched { action_errors, .. }) = report.outcome("strict") else {
            panic!("rule should have matched: {report:?}");
        };
        assert_eq!(action_errors.len(), 1);
        assert_eq!(action_errors[0].action, "warn");
        assert_eq!(harness.effects.names(), vec!["warn", "kick"]);
        assert!(harness.audit.events().iter().any(|event| matches!(
            event,
            AuditEvent::ActionFailed { action, .. } if action == "warn"
        )));
        assert!(harness.audit.events().iter().any(|event| matches!(event, AuditEvent::Log { .. })));
    }

    #[tokio::test]
    async fn test_antiraid_criterion_filters_rules() {
        let harness = TestEngine::new().await;
        let rules = rules(
            "  lockdown: { antiraid_level: { at_least: medium }, triggers: [any_message], allow_further_rules: true }\n  \
             calm: { antiraid_level: off, triggers: [any_message] }",
        );

        assert_eq!(run(&harness, &rules, 1, "a").await.matched_rules(), vec!["calm"]);

        harness.engine.set_antiraid_level(Some("high".to_string()), "test").await.unwrap();
        let report = run(&harness, &rules, 1, "b").await;
        assert_eq!(report.matched_rules(), vec!["lockdown"]);
        assert!(report.outcome("calm").is_none());
    }

    #[tokio::test]
    async fn test_spam_burst_mutes_once() {
        let harness = TestEngine::new().await;
        let rules = rules(
            "  spam:\n    triggers: [ { message_spam: { amount: 5, within: 10s } } ]\n    \
             actions: { clean: true, mute: { duration: 10m, reason: Spam } }",
        );

        let mut contexts = Vec::new();
        let mut reports = Vec::new();
        for index in 0..7 {
            let context = message_context(harness.now(), 1, 10, &format!("spam {index}")).shared();
            harness.engine.state().recent_actions.record_message(&context);
            reports.push(evaluate(&harness.engine, &rules, &context).await);
            contexts.push(context);
            harness.clock.advance(chrono::Duration::seconds(1));
        }

        for report in &reports[..4] {
            assert_eq!(report.outcome("spam"), Some(&RuleOutcome::NoMatch));
        }
        assert!(matches!(reports[4].outcome("spam"), Some(RuleOutcome::Matched { .. })));
        assert_eq!(reports[5].outcome("spam"), Some(&RuleOutcome::SilentClean));
        assert_eq!(reports[6].outcome("spam"), Some(&RuleOutcome::SilentClean));

        let mutes: Vec<_> = harness
            .effects
            .effects()
            .into_iter()
            .filter(|effect| matches!(effect, Effect::Mute { .. }))
            .collect();
        assert_eq!(
            mutes,
            vec![Effect::Mute {
                user_id: UserId::new(1),
                duration: Duration::from_secs(600),
                reason: "Spam".to_string(),
            }]
        );
        assert!(contexts.iter().all(|context| context.is_actioned()));
    }
}
