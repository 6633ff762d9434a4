//! Per-owner preferences consulted by the pipeline. Read-only from the
//! pipeline's point of view.

mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{OwnerId, RemoteRef};

pub use sqlite::{SqliteSettingsStore, SqliteSettingsStoreBuilder};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("settings store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("settings task aborted: {0}")]
    Join(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerSettings {
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub caption_template: Option<String>,
    pub default_thumbnail: Option<RemoteRef>,
    pub metadata_enabled: bool,
    pub metadata_value: Option<String>,
}

impl OwnerSettings {
    /// The tag value to inject, if injection is switched on and has a value.
    pub fn metadata(&self) -> Option<&str> {
        if !self.metadata_enabled {
            return None;
        }
        self.metadata_value
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }
}

#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Settings for `owner`; an owner with nothing stored gets the defaults.
    async fn owner_settings(&self, owner: OwnerId) -> SettingsResult<OwnerSettings>;
}

/// Fixed in-memory settings.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    owners: HashMap<OwnerId, OwnerSettings>,
    fallback: OwnerSettings,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: OwnerId, settings: OwnerSettings) -> Self {
        self.owners.insert(owner, settings);
        self
    }

    pub fn with_fallback(mut self, settings: OwnerSettings) -> Self {
        self.fallback = settings;
        self
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn owner_settings(&self, owner: OwnerId) -> SettingsResult<OwnerSettings> {
        Ok(self
            .owners
            .get(&owner)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
