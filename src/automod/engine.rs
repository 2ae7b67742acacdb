//! Per-guild automod engine
//!
//! A [`GuildEngine`] owns everything one guild needs: its rules, its mutable
//! state, its execution queue and its background timers. Nothing is shared
//! between guilds except the registries and the collaborators handed in
//! through [`EngineServices`].

use crate::AUTOMOD_TARGET;
use crate::automod::actions::ActionRegistry;
use crate::automod::antiraid::{AntiraidState, AntiraidStore};
use crate::automod::audit::{AuditEvent, AuditSink};
use crate::automod::clock::SharedClock;
use crate::automod::context::{AntiraidChange, EvaluationContext, UserInfo};
use crate::automod::effects::ActionEffects;
use crate::automod::error::{AutomodError, AutomodResult};
use crate::automod::evaluator::{self, EvaluationReport};
use crate::automod::events::ModActionBus;
use crate::automod::queue::ExecutionQueue;
use crate::automod::recent_actions::RecentActionKind;
use crate::automod::regex_runner::PatternMatcher;
use crate::automod::rules::{EngineSettings, GuildConfig, Rule};
use crate::automod::state::{GuildState, SweepStats};
use crate::automod::triggers::TriggerRegistry;
use poise::serenity_prelude::{GuildId, UserId};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collaborators and registries shared by every guild engine
#[derive(Clone)]
pub struct EngineServices {
    pub triggers: Arc<TriggerRegistry>,
    pub actions: Arc<ActionRegistry>,
    pub effects: Arc<dyn ActionEffects>,
    pub audit: Arc<dyn AuditSink>,
    pub antiraid_store: Arc<dyn AntiraidStore>,
    pub matcher: Arc<dyn PatternMatcher>,
    pub bus: ModActionBus,
    pub clock: SharedClock,
    /// The bot's own user, for rules that must not act on it
    pub self_user_id: Option<UserId>,
}

pub struct GuildEngine {
    guild_id: GuildId,
    this: Weak<Self>,
    state: GuildState,
    rules: RwLock<Arc<Vec<Rule>>>,
    triggers: Arc<TriggerRegistry>,
    actions: Arc<ActionRegistry>,
    effects: Arc<dyn ActionEffects>,
    audit: Arc<dyn AuditSink>,
    bus: ModActionBus,
    self_user_id: Option<UserId>,
    queue: ExecutionQueue,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GuildEngine {
    /// Load a guild: read its antiraid level, build its state and start its
    /// timers
    ///
    /// # Errors
    /// Antiraid store failures; a guild whose level cannot be read is not
    /// loaded.
    pub async fn load(
        guild_id: GuildId,
        config: GuildConfig,
        settings: &EngineSettings,
        services: &EngineServices,
    ) -> AutomodResult<Arc<Self>> {
        let antiraid = AntiraidState::load(
            guild_id,
            config.antiraid_levels,
            Arc::clone(&services.antiraid_store),
        )
        .await?;
        let state = GuildState::new(
            guild_id,
            settings,
            Arc::clone(&services.clock),
            Arc::clone(&services.matcher),
            Arc::clone(&services.audit),
            antiraid,
        );

        let rule_count = config.rules.len();
        let engine = Arc::new_cyclic(|this| Self {
            guild_id,
            this: this.clone(),
            state,
            rules: RwLock::new(Arc::new(config.rules)),
            triggers: Arc::clone(&services.triggers),
            actions: Arc::clone(&services.actions),
            effects: Arc::clone(&services.effects),
            audit: Arc::clone(&services.audit),
            bus: services.bus.clone(),
            self_user_id: services.self_user_id,
            queue: ExecutionQueue::new(guild_id),
            tasks: Mutex::new(Vec::new()),
        });

        let sweeper = engine.spawn_sweeper(settings.sweep_interval);
        let listener = engine.spawn_mod_action_listener();
        engine.lock_tasks().extend([sweeper, listener]);

        info!(
            target: AUTOMOD_TARGET,
            guild_id = %guild_id,
            rules = rule_count,
            antiraid_level = engine.antiraid_level().as_deref().unwrap_or("off"),
            "Automod loaded for guild"
        );
        Ok(engine)
    }

    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    #[must_use]
    pub fn state(&self) -> &GuildState {
        &self.state
    }

    /// Snapshot of the current rules
    #[must_use]
    pub fn rules(&self) -> Arc<Vec<Rule>> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    #[must_use]
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    #[must_use]
    pub fn effects(&self) -> &dyn ActionEffects {
        self.effects.as_ref()
    }

    #[must_use]
    pub fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    #[must_use]
    pub fn bus(&self) -> &ModActionBus {
        &self.bus
    }

    #[must_use]
    pub fn self_user_id(&self) -> Option<UserId> {
        self.self_user_id
    }

    /// Queue an evaluation of `context`
    ///
    /// # Errors
    /// `QueueClosed` after the guild was unloaded.
    pub fn handle_event(&self, context: Arc<EvaluationContext>) -> AutomodResult<()> {
        let engine = self.this.upgrade().ok_or(AutomodError::QueueClosed)?;
        self.queue.add(async move {
            engine.run_evaluation(context).await;
        })
    }

    /// Queue an evaluation of `context` and wait for its report
    ///
    /// # Errors
    /// `QueueClosed` after the guild was unloaded.
    pub async fn process(&self, context: Arc<EvaluationContext>) -> AutomodResult<EvaluationReport> {
        let engine = self.this.upgrade().ok_or(AutomodError::QueueClosed)?;
        self.queue
            .run(async move { engine.run_evaluation(context).await })
            .await
    }

    /// Record the context's recent actions, then evaluate every rule
    async fn run_evaluation(&self, context: Arc<EvaluationContext>) -> EvaluationReport {
        self.record_recent_actions(&context);
        let rules = self.rules();
        let report = evaluator::evaluate(self, &rules, &context).await;
        debug!(
            guild_id = %self.guild_id,
            context_id = %context.id,
            visited = report.outcomes.len(),
            matched = ?report.matched_rules(),
            "Evaluation finished"
        );
        report
    }

    fn record_recent_actions(&self, context: &Arc<EvaluationContext>) {
        let recent = &self.state.recent_actions;
        // Edits are evaluated but not counted again
        if context.message.as_ref().is_some_and(|message| !message.edited) {
            recent.record_message(context);
        }
        if context.member_joined {
            recent.record(RecentActionKind::MemberJoin, None, 1, Arc::clone(context));
        }
        if context.member_left {
            recent.record(RecentActionKind::MemberLeave, None, 1, Arc::clone(context));
        }
        let thread_created = context
            .thread_change
            .as_ref()
            .is_some_and(|change| change.created.is_some());
        if thread_created {
            recent.record(RecentActionKind::ThreadCreate, None, 1, Arc::clone(context));
        }
        let joined_voice = context
            .voice_channel
            .as_ref()
            .is_some_and(|change| change.joined.is_some());
        if let (true, Some(user_id)) = (joined_voice, context.user_id()) {
            recent.record(
                RecentActionKind::VoiceChannelJoin,
                Some(user_id.to_string()),
                1,
                Arc::clone(context),
            );
        }
    }

    /// Current antiraid level, from the cache
    #[must_use]
    pub fn antiraid_level(&self) -> Option<String> {
        self.state.antiraid.get()
    }

    /// Change the antiraid level from outside the queue
    ///
    /// Returns the previous level.
    ///
    /// # Errors
    /// Unknown levels, store failures and a closed queue.
    pub async fn set_antiraid_level(
        &self,
        level: Option<String>,
        actor: &str,
    ) -> AutomodResult<Option<String>> {
        let engine = self.this.upgrade().ok_or(AutomodError::QueueClosed)?;
        let actor = actor.to_string();
        self.queue
            .run(async move { engine.change_antiraid_level(level, &actor).await })
            .await?
    }

    /// Change the antiraid level; must run inside the queue
    ///
    /// Writes through to the store, then queues an evaluation of the change.
    ///
    /// # Errors
    /// Unknown levels and store failures.
    pub async fn change_antiraid_level(
        &self,
        level: Option<String>,
        actor: &str,
    ) -> AutomodResult<Option<String>> {
        let previous = self.state.antiraid.set(level.clone(), actor).await?;
        self.audit
            .notify(
                self.guild_id,
                AuditEvent::AntiraidLevelChanged {
                    level: level.clone(),
                    actor: actor.to_string(),
                },
            )
            .await;

        let context = EvaluationContext::new(self.state.clock.now())
            .with_antiraid(AntiraidChange {
                level,
                previous: previous.clone(),
            })
            .shared();
        if let Err(e) = self.handle_event(context) {
            warn!(guild_id = %self.guild_id, error = %e, "Could not queue antiraid evaluation");
        }
        Ok(previous)
    }

    /// Replace the rules; evaluations already running keep the old set
    pub fn reload_rules(&self, rules: Vec<Rule>) {
        let count = rules.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        info!(target: AUTOMOD_TARGET, guild_id = %self.guild_id, rules = count, "Automod rules reloaded");
    }

    /// Drop every expired entry of the guild's state
    pub fn sweep(&self) -> SweepStats {
        self.state.sweep()
    }

    /// Stop timers, discard queued jobs and stop the worker
    pub fn unload(&self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.queue.shutdown();
        info!(target: AUTOMOD_TARGET, guild_id = %self.guild_id, "Automod unloaded for guild");
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let this = self.this.clone();
        let period = period.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = this.upgrade() else {
                    break;
                };
                let stats = engine.sweep();
                if stats.total() > 0 {
                    debug!(guild_id = %engine.guild_id, removed = stats.total(), ?stats, "Swept expired automod state");
                }
            }
        })
    }

    fn spawn_mod_action_listener(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let mut events = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mod action listener lagged behind");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(engine) = this.upgrade() else {
                    break;
                };
                if event.guild_id != engine.guild_id {
                    continue;
                }
                let context = EvaluationContext::new(engine.state.clock.now())
                    .with_user(UserInfo::from_id(event.user_id))
                    .with_mod_action(event)
                    .shared();
                if engine.handle_event(context).is_err() {
                    break;
                }
            }
        })
    }
}

impl Drop for GuildEngine {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}
