//! Persistence for the [`AppConfig`] document and runtime settings.
//!
//! The document is a single JSON file that is always read and written whole.
//! Reads never fail (a missing or corrupt file yields the default document);
//! writes go through a temporary sibling that is renamed over the target so
//! a crash mid-write never leaves a truncated file behind.

pub mod settings;

pub use settings::RuntimeSettings;

use crate::models::{AppConfig, ValidationError};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{self, File};
use std::io::{self, Write};
use thiserror::Error;

/// Errors that can occur while persisting the document
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to create config directory {path}: {source}")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Loads and saves the persisted build document.
///
/// There is no locking and no optimistic concurrency check: a single
/// running instance is assumed, and every operation is a full
/// read-modify-write of the file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Utf8PathBuf,
}

impl ConfigStore {
    pub fn new<P: AsRef<Utf8Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<platform config dir>/unreal-builder/config.json`, or `config.json`
    /// in the working directory when the platform has no config dir.
    pub fn default_path() -> Utf8PathBuf {
        dirs::config_dir()
            .and_then(|dir| Utf8PathBuf::try_from(dir).ok())
            .map(|dir| dir.join("unreal-builder").join("config.json"))
            .unwrap_or_else(|| Utf8PathBuf::from("config.json"))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Load the document, falling back to defaults on any read problem
    pub fn load(&self) -> AppConfig {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, starting with defaults", self.path);
                return AppConfig::default();
            }
            Err(e) => {
                tracing::warn!("Failed to read config {}: {}, using defaults", self.path, e);
                return AppConfig::default();
            }
        };

        match serde_json::from_str::<AppConfig>(&contents) {
            Ok(mut config) => {
                config.upgrade();
                tracing::debug!(
                    "Loaded config from {}: {} engines, {} projects, {} builds",
                    self.path,
                    config.engines.len(),
                    config.projects.len(),
                    config.build_history.len()
                );
                config
            }
            Err(e) => {
                tracing::warn!("Config {} is not valid JSON ({}), using defaults", self.path, e);
                AppConfig::default()
            }
        }
    }

    /// Prune history to the configured cap and write the document atomically
    pub fn save(&self, config: &mut AppConfig) -> Result<(), ConfigError> {
        config.prune_history();

        let json = serde_json::to_string_pretty(config)?;
        self.write_atomic(json.as_bytes())?;

        tracing::debug!("Saved config to {}", self.path);
        Ok(())
    }

    /// Read-modify-write helper.
    ///
    /// # Example
    /// ```ignore
    /// let id = store.update(|config| {
    ///     let record = BuildRecord::queued(project_id, None);
    ///     let id = record.id.clone();
    ///     config.build_history.push(record);
    ///     id
    /// })?;
    /// ```
    pub fn update<F, R>(&self, update_fn: F) -> Result<R, ConfigError>
    where
        F: FnOnce(&mut AppConfig) -> R,
    {
        let mut config = self.load();
        let result = update_fn(&mut config);
        self.save(&mut config)?;
        Ok(result)
    }

    /// Like [`update`](Self::update) for edits that can be rejected.
    ///
    /// Nothing is written when the closure fails.
    pub fn try_update<F, R>(&self, update_fn: F) -> Result<R, ConfigError>
    where
        F: FnOnce(&mut AppConfig) -> Result<R, ValidationError>,
    {
        let mut config = self.load();
        let result = update_fn(&mut config)?;
        self.save(&mut config)?;
        Ok(result)
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
            _ => Utf8PathBuf::from("."),
        };
        fs::create_dir_all(&parent).map_err(|source| ConfigError::CreateDir {
            path: parent.clone(),
            source,
        })?;

        let file_name = self.path.file_name().unwrap_or("config.json");
        let temp_path = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

        let write_temp = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()
        };

        if let Err(source) = write_temp().and_then(|_| fs::rename(&temp_path, &self.path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(ConfigError::Write {
                path: self.path.clone(),
                source,
            });
        }

        Ok(())
    }
}
