//! Key-value settings storage (redb).

use crate::error::{Result, SettingsError};
use crate::settings::Settings;

use async_trait::async_trait;
use redb::{Database, ReadableTable as _, TableDefinition};
use std::collections::HashSet;
use std::path::Path;

/// Scope id -> JSON-encoded [`Settings`].
const SETTINGS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("settings");

/// Guild id -> JSON list of disabled site names.
const BLACKLIST_TABLE: TableDefinition<u64, &str> = TableDefinition::new("blacklist");

/// A settings scope: the guild itself, or a category/channel/thread in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    pub guild_id: u64,
    pub id: u64,
}

impl Scope {
    pub fn guild(guild_id: u64) -> Self {
        Self {
            guild_id,
            id: guild_id,
        }
    }

    pub fn channel(guild_id: u64, channel_id: u64) -> Self {
        Self {
            guild_id,
            id: channel_id,
        }
    }
}

/// Persistent per-scope settings and per-guild site blacklist.
#[async_trait]
pub trait SettingsStore: Send + Sync + 'static {
    /// Settings stored for exactly this scope.
    async fn get(&self, scope: Scope) -> Result<Option<Settings>>;

    /// Replace the settings for a scope. Empty settings clear the row.
    async fn set(&self, scope: Scope, settings: Settings) -> Result<()>;

    /// Site names disabled in a guild.
    async fn blacklist(&self, guild_id: u64) -> Result<HashSet<String>>;

    async fn set_site_enabled(&self, guild_id: u64, site: &str, enabled: bool) -> Result<()>;

    /// Effective settings for a destination.
    ///
    /// `chain` lists scope ids from least to most specific below the guild
    /// (category, channel, thread). Without a guild the DM defaults apply.
    async fn effective(
        &self,
        guild_id: Option<u64>,
        chain: &[u64],
        baseline: &Settings,
    ) -> Result<Settings> {
        let Some(guild_id) = guild_id else {
            return Ok(Settings::DM_DEFAULT);
        };

        let guild = self.get(Scope::guild(guild_id)).await?.unwrap_or_default();
        let mut merged = baseline.merge(&guild);
        for &id in chain {
            if id == guild_id {
                continue;
            }
            if let Some(level) = self.get(Scope::channel(guild_id, id)).await? {
                merged = merged.merge(&level);
            }
        }
        Ok(merged)
    }
}

fn db_error<E: Into<redb::Error>>(error: E) -> SettingsError {
    SettingsError::Database(error.into())
}

/// redb-backed settings store.
pub struct RedbSettingsStore {
    db: Database,
}

impl RedbSettingsStore {
    /// Open (or create) the database and make sure both tables exist.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_error)?;

        let write = db.begin_write().map_err(db_error)?;
        write.open_table(SETTINGS_TABLE).map_err(db_error)?;
        write.open_table(BLACKLIST_TABLE).map_err(db_error)?;
        write.commit().map_err(db_error)?;

        tracing::debug!(path = %path.display(), "settings store opened");
        Ok(Self { db })
    }

    fn read_value(
        &self,
        table: TableDefinition<'static, u64, &'static str>,
        key: u64,
    ) -> Result<Option<String>> {
        let read = self.db.begin_read().map_err(db_error)?;
        let table = read.open_table(table).map_err(db_error)?;
        let value = table.get(key).map_err(db_error)?;
        Ok(value.map(|guard| guard.value().to_string()))
    }

    fn write_value(
        &self,
        table: TableDefinition<'static, u64, &'static str>,
        key: u64,
        value: Option<&str>,
    ) -> Result<()> {
        let write = self.db.begin_write().map_err(db_error)?;
        {
            let mut table = write.open_table(table).map_err(db_error)?;
            match value {
                Some(value) => {
                    table.insert(key, value).map_err(db_error)?;
                }
                None => {
                    table.remove(key).map_err(db_error)?;
                }
            }
        }
        write.commit().map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for RedbSettingsStore {
    async fn get(&self, scope: Scope) -> Result<Option<Settings>> {
        let Some(raw) = self.read_value(SETTINGS_TABLE, scope.id)? else {
            return Ok(None);
        };
        let settings = serde_json::from_str(&raw).map_err(|source| SettingsError::Corrupt {
            scope: scope.id,
            source,
        })?;
        Ok(Some(settings))
    }

    async fn set(&self, scope: Scope, settings: Settings) -> Result<()> {
        if settings.is_empty() {
            return self.write_value(SETTINGS_TABLE, scope.id, None);
        }
        let raw = serde_json::to_string(&settings).map_err(|source| SettingsError::Corrupt {
            scope: scope.id,
            source,
        })?;
        self.write_value(SETTINGS_TABLE, scope.id, Some(&raw))?;
        tracing::info!(guild_id = scope.guild_id, scope = scope.id, %settings, "settings updated");
        Ok(())
    }

    async fn blacklist(&self, guild_id: u64) -> Result<HashSet<String>> {
        let Some(raw) = self.read_value(BLACKLIST_TABLE, guild_id)? else {
            return Ok(HashSet::new());
        };
        let sites: Vec<String> =
            serde_json::from_str(&raw).map_err(|source| SettingsError::Corrupt {
                scope: guild_id,
                source,
            })?;
        Ok(sites.into_iter().collect())
    }

    async fn set_site_enabled(&self, guild_id: u64, site: &str, enabled: bool) -> Result<()> {
        let mut sites = self.blacklist(guild_id).await?;
        let changed = if enabled {
            sites.remove(site)
        } else {
            sites.insert(site.to_string())
        };
        if !changed {
            return Ok(());
        }

        if sites.is_empty() {
            return self.write_value(BLACKLIST_TABLE, guild_id, None);
        }
        let mut sorted: Vec<String> = sites.into_iter().collect();
        sorted.sort();
        let raw = serde_json::to_string(&sorted).map_err(|source| SettingsError::Corrupt {
            scope: guild_id,
            source,
        })?;
        self.write_value(BLACKLIST_TABLE, guild_id, Some(&raw))?;
        tracing::info!(guild_id, site, enabled, "site toggled");
        Ok(())
    }
}
