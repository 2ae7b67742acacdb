//! Actions that edit the matched members

use super::{Action, ActionArgs, ActionConfig, parse_required};
use crate::automod::effects::Effect;
use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::RoleId;
use serde::Deserialize;
use tracing::debug;

/// Discord's nickname length limit
const MAX_NICKNAME_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleListConfig {
    pub roles: Vec<RoleId>,
}

/// Adds or removes a fixed set of roles
pub struct RoleAction {
    add: bool,
}

impl RoleAction {
    #[must_use]
    pub fn add() -> Self {
        Self { add: true }
    }

    #[must_use]
    pub fn remove() -> Self {
        Self { add: false }
    }
}

#[async_trait]
impl Action for RoleAction {
    fn name(&self) -> &'static str {
        if self.add { "add_roles" } else { "remove_roles" }
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        // A bare list is shorthand for `roles: [...]`
        let config = if raw.is_sequence() {
            RoleListConfig {
                roles: serde_yaml::from_value(raw)?,
            }
        } else {
            parse_required(self.name(), raw)?
        };
        if config.roles.is_empty() {
            return Err(AutomodError::Other("roles must not be empty".to_string()));
        }
        Ok(ActionConfig::Roles(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::Roles(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let reason = format!("Automod rule {}", args.rule_name);
        let effects = args
            .user_ids()
            .into_iter()
            .map(|user_id| {
                let roles = config.roles.clone();
                let reason = reason.clone();
                if self.add {
                    Effect::AddRoles {
                        user_id,
                        roles,
                        reason,
                    }
                } else {
                    Effect::RemoveRoles {
                        user_id,
                        roles,
                        reason,
                    }
                }
            })
            .collect();
        args.perform_all(effects).await
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicknameConfig {
    pub name: String,
}

/// Renames matched members, at most once per user within the nickname TTL
pub struct ChangeNicknameAction;

#[async_trait]
impl Action for ChangeNicknameAction {
    fn name(&self) -> &'static str {
        "change_nickname"
    }

    fn parse_config(&self, raw: serde_yaml::Value) -> AutomodResult<ActionConfig> {
        let config = match raw {
            serde_yaml::Value::String(name) => NicknameConfig { name },
            raw => parse_required(self.name(), raw)?,
        };
        let length = config.name.chars().count();
        if config.name.trim().is_empty() || length > MAX_NICKNAME_LENGTH {
            return Err(AutomodError::Other(format!(
                "nickname must be 1 to {MAX_NICKNAME_LENGTH} characters"
            )));
        }
        Ok(ActionConfig::ChangeNickname(config))
    }

    async fn apply(&self, args: ActionArgs<'_>) -> AutomodResult<()> {
        let ActionConfig::ChangeNickname(config) = args.config else {
            return Err(AutomodError::ConfigMismatch(self.name()));
        };
        let changes = &args.engine.state().nickname_changes;

        let mut effects = Vec::new();
        for user_id in args.user_ids() {
            if changes.changed_recently(user_id) {
                debug!(user_id = %user_id, "Nickname changed recently, skipping");
                continue;
            }
            changes.record(user_id);
            effects.push(Effect::ChangeNickname {
                user_id,
                nickname: config.name.clone(),
            });
        }
        args.perform_all(effects).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automod::actions::test_support::{apply, message, parse};
    use crate::automod::engine::test_support::TestEngine;
    use poise::serenity_prelude::UserId;

    #[tokio::test]
    async fn test_roles_per_user() {
        let harness = TestEngine::new().await;
        apply(
            &harness.engine,
            "add_roles",
            "[5, 6]",
            &[message(1, 10, ""), message(2, 10, "")],
        )
        .await
        .unwrap();

        let effects = harness.effects.effects();
        assert_eq!(effects.len(), 2);
        assert!(matches!(
            &effects[1],
            Effect::AddRoles { user_id, roles, .. }
                if *user_id == UserId::new(2) && roles == &vec![RoleId::new(5), RoleId::new(6)]
        ));

        apply(&harness.engine, "remove_roles", "{ roles: [5] }", &[message(1, 10, "")])
            .await
            .unwrap();
        assert_eq!(harness.effects.names().last(), Some(&"remove_roles"));
    }

    #[tokio::test]
    async fn test_nickname_changed_once_within_ttl() {
        let harness = TestEngine::new().await;
        for _ in 0..3 {
            apply(&harness.engine, "change_nickname", "Moderated", &[message(1, 10, "")])
                .await
                .unwrap();
        }
        assert_eq!(harness.effects.names(), vec!["change_nickname"]);

        harness.clock.advance(chrono::Duration::minutes(6));
        apply(&harness.engine, "change_nickname", "{ name: Moderated }", &[message(1, 10, "")])
            .await
            .unwrap();
        assert_eq!(harness.effects.names().len(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(parse("add_roles", "[]").is_err());
        assert!(parse("add_roles", "true").is_err());
        assert!(parse("change_nickname", "''").is_err());
        assert!(parse("change_nickname", &"x".repeat(33)).is_err());
    }
}
