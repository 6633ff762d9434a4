use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::session::{OwnerId, RemoteRef};
use crate::sqlite::configure_connection;

use super::{OwnerSettings, SettingsError, SettingsResult, SettingsSource};

const SETTINGS_SCHEMA: &str = include_str!("../../../sql/settings.sql");

#[derive(Debug, Clone)]
pub struct SqliteSettingsStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteSettingsStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteSettingsStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SettingsResult<SqliteSettingsStore> {
        let path = self.path.ok_or(SettingsError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteSettingsStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSettingsStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteSettingsStore {
    pub fn builder() -> SqliteSettingsStoreBuilder {
        SqliteSettingsStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SettingsResult<Self> {
        SqliteSettingsStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SettingsResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SettingsError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| SettingsError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute_batch(SETTINGS_SCHEMA)?;
        Ok(())
    }

    pub fn get(&self, owner: OwnerId) -> SettingsResult<Option<OwnerSettings>> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT prefix, suffix, caption_template, default_thumbnail, \
                 metadata_enabled, metadata_value FROM owner_settings WHERE owner_id = ?1",
                params![owner],
                |row| {
                    Ok(OwnerSettings {
                        prefix: row.get(0)?,
                        suffix: row.get(1)?,
                        caption_template: row.get(2)?,
                        default_thumbnail: row.get::<_, Option<String>>(3)?.map(RemoteRef),
                        metadata_enabled: row.get::<_, i64>(4)? != 0,
                        metadata_value: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn upsert(&self, owner: OwnerId, settings: &OwnerSettings) -> SettingsResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO owner_settings (owner_id, prefix, suffix, caption_template, \
             default_thumbnail, metadata_enabled, metadata_value, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%Y-%m-%dT%H:%M:%SZ', 'now')) \
             ON CONFLICT(owner_id) DO UPDATE SET \
             prefix = excluded.prefix, suffix = excluded.suffix, \
             caption_template = excluded.caption_template, \
             default_thumbnail = excluded.default_thumbnail, \
             metadata_enabled = excluded.metadata_enabled, \
             metadata_value = excluded.metadata_value, \
             updated_at = excluded.updated_at",
            params![
                owner,
                settings.prefix,
                settings.suffix,
                settings.caption_template,
                settings.default_thumbnail.as_ref().map(RemoteRef::as_str),
                settings.metadata_enabled as i64,
                settings.metadata_value,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, owner: OwnerId) -> SettingsResult<bool> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM owner_settings WHERE owner_id = ?1",
            params![owner],
        )?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl SettingsSource for SqliteSettingsStore {
    async fn owner_settings(&self, owner: OwnerId) -> SettingsResult<OwnerSettings> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get(owner))
            .await
            .map_err(|err| SettingsError::Join(err.to_string()))?
            .map(Option::unwrap_or_default)
    }
}
