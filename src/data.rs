use std::{
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use crate::AUTOMOD_TARGET;
use crate::automod::{AutomodConfig, AutomodResult, EngineServices, GuildEngine};
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;
use tracing::{info, warn};

/// Rule configuration read at startup and on reload
pub const DEFAULT_CONFIG_FILE: &str = "data/automod.yaml";
/// Durable antiraid levels, one entry per guild
pub const ANTIRAID_FILE: &str = "data/antiraid.yaml";
/// Overrides [`DEFAULT_CONFIG_FILE`]
pub const CONFIG_ENV: &str = "AUTOMOD_CONFIG";

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("config_path", &self.config_path)
            .field("guilds_configured", &self.config().guilds.len())
            .field("guilds_loaded", &self.engines.len())
            .finish_non_exhaustive()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Main centralized data structure for the bot
pub struct DataInner {
    pub config_path: PathBuf,
    config: RwLock<Arc<AutomodConfig>>,
    pub services: EngineServices,
    // Map of guild_id -> loaded engine
    pub engines: DashMap<serenity::GuildId, Arc<GuildEngine>>,
}

/// Config file location, honoring the environment override
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV).map_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from)
}

/// Read and validate the rule configuration
///
/// A missing file is an empty configuration; anything unreadable or invalid
/// is an error.
async fn read_config(path: &Path, services: &EngineServices) -> AutomodResult<AutomodConfig> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                target: AUTOMOD_TARGET,
                path = %path.display(),
                "Automod config not found, no guild will be moderated"
            );
            String::new()
        }
        Err(e) => return Err(e.into()),
    };
    AutomodConfig::from_yaml(&text, &services.triggers, &services.actions)
}

impl Data {
    #[must_use]
    pub fn new(config_path: PathBuf, config: AutomodConfig, services: EngineServices) -> Self {
        Self(Arc::new(DataInner {
            config_path,
            config: RwLock::new(Arc::new(config)),
            services,
            engines: DashMap::new(),
        }))
    }

    /// Load the configuration from `config_path`
    ///
    /// # Errors
    /// The file exists but cannot be read, or the configuration is invalid.
    pub async fn load(config_path: PathBuf, services: EngineServices) -> AutomodResult<Self> {
        let config = read_config(&config_path, &services).await?;
        info!(
            target: AUTOMOD_TARGET,
            path = %config_path.display(),
            guilds = config.guilds.len(),
            "Automod config loaded"
        );
        Ok(Self::new(config_path, config, services))
    }

    /// Current configuration snapshot
    #[must_use]
    pub fn config(&self) -> Arc<AutomodConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The loaded engine of a guild
    #[must_use]
    pub fn engine(&self, guild_id: serenity::GuildId) -> Option<Arc<GuildEngine>> {
        self.engines.get(&guild_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Start moderating a guild, if it is configured
    ///
    /// Returns whether a new engine was loaded.
    ///
    /// # Errors
    /// The guild's antiraid level could not be read.
    pub async fn load_guild(&self, guild_id: serenity::GuildId) -> AutomodResult<bool> {
        if self.engines.contains_key(&guild_id) {
            return Ok(false);
        }
        let config = self.config();
        let Some(guild_config) = config.guilds.get(&guild_id).cloned() else {
            return Ok(false);
        };

        let engine =
            GuildEngine::load(guild_id, guild_config, &config.engine, &self.services).await?;
        match self.engines.entry(guild_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Lost a race with a concurrent load
                engine.unload();
                Ok(false)
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(engine);
                Ok(true)
            }
        }
    }

    /// Stop moderating a guild
    pub fn unload_guild(&self, guild_id: serenity::GuildId) -> bool {
        match self.engines.remove(&guild_id) {
            Some((_, engine)) => {
                engine.unload();
                true
            }
            None => false,
        }
    }

    /// Re-read the configuration and apply it
    ///
    /// Loaded guilds keep their engine and get the new rules, unless their
    /// antiraid levels or the engine settings changed, in which case the
    /// engine is rebuilt. Guilds no longer configured are unloaded, and
    /// configured guilds from `present` without an engine are loaded. An
    /// invalid file leaves everything as it was.
    ///
    /// Returns the number of guilds moderated afterwards.
    ///
    /// # Errors
    /// The configuration cannot be read or is invalid, or a guild failed to
    /// load.
    pub async fn reload(&self, present: &[serenity::GuildId]) -> AutomodResult<usize> {
        let config = read_config(&self.config_path, &self.services).await?;
        let previous = {
            let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, Arc::new(config))
        };
        let config = self.config();
        let settings_changed = previous.engine != config.engine;

        let loaded: Vec<_> = self.engines.iter().map(|entry| *entry.key()).collect();
        let mut reloaded = 0;
        for guild_id in loaded {
            let Some(guild_config) = config.guilds.get(&guild_id) else {
                self.unload_guild(guild_id);
                continue;
            };
            let Some(engine) = self.engine(guild_id) else {
                continue;
            };
            let same_levels =
                engine.state().antiraid.levels() == guild_config.antiraid_levels.as_slice();
            if same_levels && !settings_changed {
                engine.reload_rules(guild_config.rules.clone());
            } else {
                self.unload_guild(guild_id);
                self.load_guild(guild_id).await?;
            }
            reloaded += 1;
        }

        for guild_id in present {
            if !self.engines.contains_key(guild_id) && self.load_guild(*guild_id).await? {
                reloaded += 1;
            }
        }

        info!(target: AUTOMOD_TARGET, guilds = reloaded, "Automod config reloaded");
        Ok(reloaded)
    }

    /// Unload every guild, for shutdown
    pub fn unload_all(&self) {
        let loaded: Vec<_> = self.engines.iter().map(|entry| *entry.key()).collect();
        for guild_id in loaded {
            self.unload_guild(guild_id);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::automod::actions::ActionRegistry;
    use crate::automod::antiraid::test_support::MemoryAntiraidStore;
    use crate::automod::audit::test_support::RecordingAuditSink;
    use crate::automod::clock::ManualClock;
    use crate::automod::effects::test_support::RecordingEffects;
    use crate::automod::events::ModActionBus;
    use crate::automod::regex_runner::RegexMatcher;
    use crate::automod::triggers::TriggerRegistry;
    use chrono::Utc;

    pub fn services() -> EngineServices {
        EngineServices {
            triggers: Arc::new(TriggerRegistry::new()),
            actions: Arc::new(ActionRegistry::new()),
            effects: Arc::new(RecordingEffects::default()),
            audit: Arc::new(RecordingAuditSink::default()),
            antiraid_store: Arc::new(MemoryAntiraidStore::default()),
            matcher: Arc::new(RegexMatcher::default()),
            bus: ModActionBus::default(),
            clock: Arc::new(ManualClock::new(Utc::now())),
            self_user_id: None,
        }
    }
}

/// Tests for the data module
#[cfg(test)]
mod tests {
    use super::test_support::services;
    use super::*;
    use poise::serenity_prelude::GuildId;

    const CONFIG: &str = r"
guilds:
  100:
    rules:
      no_invites:
        triggers:
          - match_invites: {}
        actions:
          clean: true
";

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("automod-{name}-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_config_is_empty() {
        let path = std::env::temp_dir().join(format!("automod-missing-{}.yaml", uuid::Uuid::new_v4()));
        let data = Data::load(path, services()).await.unwrap();
        assert!(data.config().guilds.is_empty());
        assert!(!data.load_guild(GuildId::new(100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let path = temp_config("invalid", "guilds:\n  100:\n    rules:\n      bad:\n        triggers: []\n");
        assert!(Data::load(path.clone(), services()).await.is_err());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_load_and_unload_guild() {
        let path = temp_config("load", CONFIG);
        let data = Data::load(path.clone(), services()).await.unwrap();

        assert!(data.load_guild(GuildId::new(100)).await.unwrap());
        assert!(!data.load_guild(GuildId::new(100)).await.unwrap());
        assert!(!data.load_guild(GuildId::new(200)).await.unwrap());
        assert_eq!(data.engine(GuildId::new(100)).unwrap().rules().len(), 1);

        assert!(data.unload_guild(GuildId::new(100)));
        assert!(data.engine(GuildId::new(100)).is_none());
        assert!(!data.unload_guild(GuildId::new(100)));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_reload_replaces_rules() {
        let path = temp_config("reload", CONFIG);
        let data = Data::load(path.clone(), services()).await.unwrap();
        data.load_guild(GuildId::new(100)).await.unwrap();
        let engine = data.engine(GuildId::new(100)).unwrap();

        let updated = format!(
            "{CONFIG}      no_links:\n        triggers:\n          - match_links: {{}}\n        actions:\n          clean: true\n"
        );
        std::fs::write(&path, updated).unwrap();
        assert_eq!(data.reload(&[GuildId::new(100)]).await.unwrap(), 1);

        // Same levels, so the engine is kept and its rules swapped
        let reloaded = data.engine(GuildId::new(100)).unwrap();
        assert!(Arc::ptr_eq(&engine, &reloaded));
        assert_eq!(reloaded.rules().len(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_reload_with_invalid_file_keeps_rules() {
        let path = temp_config("keep", CONFIG);
        let data = Data::load(path.clone(), services()).await.unwrap();
        data.load_guild(GuildId::new(100)).await.unwrap();

        std::fs::write(&path, "guilds: [not, a, map]").unwrap();
        assert!(data.reload(&[GuildId::new(100)]).await.is_err());
        assert_eq!(data.engine(GuildId::new(100)).unwrap().rules().len(), 1);
        assert_eq!(data.config().guilds.len(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_reload_unloads_removed_guilds() {
        let path = temp_config("removed", CONFIG);
        let data = Data::load(path.clone(), services()).await.unwrap();
        data.load_guild(GuildId::new(100)).await.unwrap();

        std::fs::write(&path, "").unwrap();
        assert_eq!(data.reload(&[GuildId::new(100)]).await.unwrap(), 0);
        assert!(data.engine(GuildId::new(100)).is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_reload_loads_new_guilds_and_applies_engine_settings() {
        let path = temp_config("added", CONFIG);
        let data = Data::load(path.clone(), services()).await.unwrap();
        data.load_guild(GuildId::new(100)).await.unwrap();
        let engine = data.engine(GuildId::new(100)).unwrap();

        let updated = format!(
            "engine:\n  recent_spam_ttl: 20s\n{CONFIG}  200:\n    rules:\n      no_links:\n        triggers:\n          - match_links: {{}}\n        actions:\n          clean: true\n"
        );
        std::fs::write(&path, updated).unwrap();
        let present = [GuildId::new(100), GuildId::new(200), GuildId::new(300)];
        assert_eq!(data.reload(&present).await.unwrap(), 2);

        // New settings rebuild the existing engine
        let rebuilt = data.engine(GuildId::new(100)).unwrap();
        assert!(!Arc::ptr_eq(&engine, &rebuilt));
        assert_eq!(data.engine(GuildId::new(200)).unwrap().rules().len(), 1);
        assert!(data.engine(GuildId::new(300)).is_none());

        // Loaded guilds stay loaded whatever the present list holds
        assert_eq!(data.reload(&[GuildId::new(100)]).await.unwrap(), 2);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_config_path_default() {
        if std::env::var_os(CONFIG_ENV).is_none() {
            assert_eq!(config_path(), PathBuf::from(DEFAULT_CONFIG_FILE));
        }
    }
}
