//! JSON-backed user settings.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{error, info};

pub const DEFAULT_LOG_ROTATION_LIMIT: u32 = 5;
pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const LOG_LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_rotation_limit")]
    pub log_rotation_limit: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_check_for_release")]
    pub check_for_release: bool,
    /// Keys this build does not know about; written back untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

fn default_rotation_limit() -> u32 {
    DEFAULT_LOG_ROTATION_LIMIT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_check_for_release() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_rotation_limit: default_rotation_limit(),
            log_level: default_log_level(),
            check_for_release: default_check_for_release(),
            extra: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// `tracing` filter directive for the stored level.
    pub fn filter_directive(&self) -> &'static str {
        match self.log_level.to_ascii_uppercase().as_str() {
            "DEBUG" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" | "CRITICAL" => "error",
            _ => "info",
        }
    }
}

/// Canonical spelling of a user-supplied level, `None` if unknown.
pub fn normalize_log_level(input: &str) -> Option<&'static str> {
    let upper = input.trim().to_ascii_uppercase();
    let upper = if upper == "WARN" { "WARNING".to_string() } else { upper };
    LOG_LEVELS.iter().copied().find(|level| *level == upper)
}

/// Result of [`SettingsStore::read`].
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,
    path: PathBuf,
    /// Why the file on disk was replaced with defaults, if it was.
    pub reset_reason: Option<String>,
}

impl LoadedSettings {
    pub fn report(&self) {
        if let Some(reason) = &self.reset_reason {
            error!(path = %self.path.display(), error = %reason, "settings file not loaded, rewriting defaults");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings file. A missing file is created with defaults; an
    /// unreadable or corrupt one is logged and overwritten with defaults.
    pub fn load(&self) -> Result<Settings> {
        let loaded = self.read()?;
        loaded.report();
        Ok(loaded.settings)
    }

    /// Same recovery as [`SettingsStore::load`] but without emitting events,
    /// for callers that read settings before a subscriber is installed.
    /// Call [`LoadedSettings::report`] once logging is up.
    pub fn read(&self) -> Result<LoadedSettings> {
        if !self.path.exists() {
            return Ok(LoadedSettings {
                settings: self.write_defaults()?,
                path: self.path.clone(),
                reset_reason: None,
            });
        }
        let parsed = std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<Settings>(&text).map_err(anyhow::Error::from));
        match parsed {
            Ok(settings) => Ok(LoadedSettings {
                settings,
                path: self.path.clone(),
                reset_reason: None,
            }),
            Err(err) => Ok(LoadedSettings {
                settings: self.write_defaults()?,
                path: self.path.clone(),
                reset_reason: Some(format!("{err:#}")),
            }),
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(settings).context("serializing settings")?;
        std::fs::write(&self.path, json).with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn write_defaults(&self) -> Result<Settings> {
        let defaults = Settings::default();
        self.save(&defaults)?;
        Ok(defaults)
    }

    pub fn reset_to_defaults(&self) -> Result<Settings> {
        info!(path = %self.path.display(), "settings reset to defaults");
        self.write_defaults()
    }

    /// Load, mutate, save. Returns the saved value.
    pub fn update<F>(&self, mutate: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.load()?;
        mutate(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }
}
