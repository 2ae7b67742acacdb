//! Automated moderation
//!
//! Each guild gets its own [`GuildEngine`], which evaluates operator-defined
//! rules against normalized platform events and applies their actions.
//!
//! Modules are listed leaves first:
//! - `clock`, `duration`, `text`: small shared utilities
//! - `cooldown`, `recent_actions`, `recent_spam`, `recent_nicknames`: windowed state
//! - `regex_runner`: timeout-bounded pattern matching
//! - `antiraid`: the guild's antiraid level and its durable store
//! - `triggers`, `actions`: the closed sets of rule conditions and side effects
//! - `rules`: configuration loading and validation
//! - `queue`, `evaluator`, `engine`: per-guild serialized evaluation

pub mod actions;
pub mod antiraid;
pub mod audit;
pub mod clock;
pub mod context;
pub mod cooldown;
pub mod duration;
pub mod effects;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod queue;
pub mod recent_actions;
pub mod recent_nicknames;
pub mod recent_spam;
pub mod regex_runner;
pub mod rules;
pub mod state;
pub mod text;
pub mod triggers;

pub use antiraid::{AntiraidStore, YamlAntiraidStore};
pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use context::EvaluationContext;
pub use effects::{ActionEffects, Effect, SerenityEffects};
pub use engine::{EngineServices, GuildEngine};
pub use error::{AutomodError, AutomodResult};
pub use evaluator::{EvaluationReport, RuleOutcome};
pub use events::{ModActionBus, ModActionEvent, ModActionKind};
pub use rules::{AutomodConfig, EngineSettings, GuildConfig, Rule};
