//! Antiraid level state
//!
//! The level is a nullable string cached in memory and written through to a
//! durable [`AntiraidStore`]. Writes happen as queue jobs, so they are
//! serialized against every rule evaluation of the guild.

use crate::automod::error::{AutomodError, AutomodResult};
use async_trait::async_trait;
use poise::serenity_prelude::GuildId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Level names used when a guild does not configure its own
pub const DEFAULT_LEVELS: [&str; 3] = ["low", "medium", "high"];

/// Durable storage of each guild's antiraid level
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AntiraidStore: Send + Sync {
    async fn get(&self, guild_id: GuildId) -> AutomodResult<Option<String>>;
    async fn set(&self, guild_id: GuildId, level: Option<String>) -> AutomodResult<()>;
}

/// [`AntiraidStore`] persisting every guild's level in one YAML file
pub struct YamlAntiraidStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl YamlAntiraidStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_all(&self) -> AutomodResult<BTreeMap<u64, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_yaml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(AutomodError::Store(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[async_trait]
impl AntiraidStore for YamlAntiraidStore {
    async fn get(&self, guild_id: GuildId) -> AutomodResult<Option<String>> {
        Ok(self.read_all().await?.remove(&guild_id.get()))
    }

    async fn set(&self, guild_id: GuildId, level: Option<String>) -> AutomodResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut levels = self.read_all().await?;
        match level {
            Some(level) => levels.insert(guild_id.get(), level),
            None => levels.remove(&guild_id.get()),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let yaml = serde_yaml::to_string(&levels)?;
        tokio::fs::write(&self.path, yaml).await?;
        Ok(())
    }
}

/// A rule's antiraid gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AntiraidCriterion {
    /// Exactly this level; `off` means no level is set
    Level(String),
    /// This level or any level configured after it
    AtLeast { at_least: String },
}

impl AntiraidCriterion {
    /// Level names referenced by the criterion, excluding `off`
    #[must_use]
    pub fn referenced_level(&self) -> Option<&str> {
        match self {
            Self::Level(level) if level == "off" => None,
            Self::Level(level) | Self::AtLeast { at_least: level } => Some(level),
        }
    }

    /// Whether the criterion holds for the current level
    #[must_use]
    pub fn matches(&self, current: Option<&str>, levels: &[String]) -> bool {
        match self {
            Self::Level(level) if level == "off" => current.is_none(),
            Self::Level(level) => current == Some(level.as_str()),
            Self::AtLeast { at_least } => {
                let position = |name: &str| levels.iter().position(|level| level == name);
                match (current.and_then(position), position(at_least)) {
                    (Some(current), Some(threshold)) => current >= threshold,
                    _ => false,
                }
            }
        }
    }
}

/// Cached antiraid level of one guild
pub struct AntiraidState {
    guild_id: GuildId,
    levels: Vec<String>,
    cached: RwLock<Option<String>>,
    store: Arc<dyn AntiraidStore>,
}

impl AntiraidState {
    /// Load the level from the store
    ///
    /// # Errors
    /// Store failures propagate so a guild never runs with an unknown level.
    pub async fn load(
        guild_id: GuildId,
        levels: Vec<String>,
        store: Arc<dyn AntiraidStore>,
    ) -> AutomodResult<Self> {
        let level = store.get(guild_id).await?;
        Ok(Self::new(guild_id, levels, level, store))
    }

    /// Create the state with an already known level
    #[must_use]
    pub fn new(
        guild_id: GuildId,
        levels: Vec<String>,
        level: Option<String>,
        store: Arc<dyn AntiraidStore>,
    ) -> Self {
        Self {
            guild_id,
            levels,
            cached: RwLock::new(level),
            store,
        }
    }

    /// Current level, from the cache
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Configured level names, lowest first
    #[must_use]
    pub fn levels(&self) -> &[String] {
        &self.levels
    }

    /// Write the level through to the store, then update the cache
    ///
    /// Returns the previous level.
    ///
    /// # Errors
    /// Unknown level names and store failures; the cache is untouched when
    /// the store write fails.
    pub async fn set(&self, level: Option<String>, actor: &str) -> AutomodResult<Option<String>> {
        if let Some(level) = &level {
            if !self.levels.contains(level) {
                return Err(AutomodError::Other(format!(
                    "Unknown antiraid level `{level}`, expected one of: {}",
                    self.levels.join(", ")
                )));
            }
        }

        self.store.set(self.guild_id, level.clone()).await?;

        let previous = {
            let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cached, level.clone())
        };

        info!(
            guild_id = %self.guild_id,
            level = level.as_deref().unwrap_or("off"),
            previous = previous.as_deref().unwrap_or("off"),
            actor = %actor,
            "Antiraid level set"
        );

        Ok(previous)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn levels() -> Vec<String> {
        DEFAULT_LEVELS.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_load_reads_store() {
        let mut store = MockAntiraidStore::new();
        store
            .expect_get()
            .with(eq(GuildId::new(5)))
            .returning(|_| Ok(Some("medium".to_string())));

        let state = AntiraidState::load(GuildId::new(5), levels(), Arc::new(store))
            .await
            .unwrap();
        assert_eq!(state.get().as_deref(), Some("medium"));
    }

    #[tokio::test]
    async fn test_load_fails_loudly() {
        let mut store = MockAntiraidStore::new();
        store
            .expect_get()
            .returning(|_| Err(AutomodError::Store("unreachable".to_string())));

        let result = AntiraidState::load(GuildId::new(5), levels(), Arc::new(store)).await;
        assert!(matches!(result, Err(AutomodError::Store(_))));
    }

    #[tokio::test]
    async fn test_set_writes_through() {
        let mut store = MockAntiraidStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set()
            .with(eq(GuildId::new(5)), eq(Some("high".to_string())))
            .times(1)
            .returning(|_, _| Ok(()));

        let state = AntiraidState::load(GuildId::new(5), levels(), Arc::new(store))
            .await
            .unwrap();
        let previous = state.set(Some("high".to_string()), "tester").await.unwrap();
        assert_eq!(previous, None);
        assert_eq!(state.get().as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_cache() {
        let mut store = MockAntiraidStore::new();
        store.expect_get().returning(|_| Ok(Some("low".to_string())));
        store
            .expect_set()
            .returning(|_, _| Err(AutomodError::Store("disk full".to_string())));

        let state = AntiraidState::load(GuildId::new(5), levels(), Arc::new(store))
            .await
            .unwrap();
        assert!(state.set(Some("high".to_string()), "tester").await.is_err());
        assert_eq!(state.get().as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn test_unknown_level_is_rejected() {
        let mut store = MockAntiraidStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_set().never();

        let state = AntiraidState::load(GuildId::new(5), levels(), Arc::new(store))
            .await
            .unwrap();
        assert!(state.set(Some("apocalypse".to_string()), "tester").await.is_err());
    }

    #[test]
    fn test_criterion_matches() {
        let levels = levels();
        let exact = AntiraidCriterion::Level("medium".to_string());
        assert!(exact.matches(Some("medium"), &levels));
        assert!(!exact.matches(Some("high"), &levels));

        let off = AntiraidCriterion::Level("off".to_string());
        assert!(off.matches(None, &levels));
        assert!(!off.matches(Some("low"), &levels));

        let at_least = AntiraidCriterion::AtLeast {
            at_least: "medium".to_string(),
        };
        assert!(at_least.matches(Some("high"), &levels));
        assert!(at_least.matches(Some("medium"), &levels));
        assert!(!at_least.matches(Some("low"), &levels));
        assert!(!at_least.matches(None, &levels));
    }

    #[test]
    fn test_criterion_from_yaml() {
        let criterion: AntiraidCriterion = serde_yaml::from_str("high").unwrap();
        assert_eq!(criterion, AntiraidCriterion::Level("high".to_string()));

        let criterion: AntiraidCriterion = serde_yaml::from_str("at_least: medium").unwrap();
        assert_eq!(
            criterion,
            AntiraidCriterion::AtLeast {
                at_least: "medium".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_yaml_store_round_trip() {
        let path = std::env::temp_dir().join(format!("antiraid-{}.yaml", uuid::Uuid::new_v4()));
        let store = YamlAntiraidStore::new(&path);

        assert_eq!(store.get(GuildId::new(1)).await.unwrap(), None);
        store.set(GuildId::new(1), Some("high".to_string())).await.unwrap();
        store.set(GuildId::new(2), Some("low".to_string())).await.unwrap();
        assert_eq!(store.get(GuildId::new(1)).await.unwrap().as_deref(), Some("high"));

        store.set(GuildId::new(1), None).await.unwrap();
        assert_eq!(store.get(GuildId::new(1)).await.unwrap(), None);
        assert_eq!(store.get(GuildId::new(2)).await.unwrap().as_deref(), Some("low"));

        let _ = std::fs::remove_file(path);
    }
}
