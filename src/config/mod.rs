// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Settings management for shotsort
//!
//! One JSON document holds the provider selection, endpoint details and the
//! running statistics. Field names on disk match the desktop app's
//! `settings.json` so an existing file can be pointed at directly.

pub mod folders;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::{Result, ShotsortError};

pub use folders::{app_data_dir, default_screenshot_dir, FolderList};

/// File name of the settings document inside the app data directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Environment variable consulted when no Together AI key is configured
pub const CLOUD_KEY_ENV: &str = "TOGETHER_API_KEY";

/// Which AI backend classifies images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Provider {
    /// Hosted chat-completion API (Together AI)
    #[default]
    #[serde(rename = "Together AI", alias = "cloud")]
    CloudApi,
    /// Local Ollama runtime
    #[serde(rename = "Ollama", alias = "local")]
    LocalApi,
}

impl Provider {
    pub fn label(&self) -> &'static str {
        match self {
            Self::CloudApi => "Together AI",
            Self::LocalApi => "Ollama",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::ShotsortError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cloud" | "together" | "together ai" => Ok(Self::CloudApi),
            "local" | "ollama" => Ok(Self::LocalApi),
            other => Err(crate::ShotsortError::Config(format!(
                "Unknown provider '{}', expected 'cloud' or 'local'",
                other
            ))),
        }
    }
}

/// Application settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub provider: Provider,

    /// Vision model name passed to whichever provider is active
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(rename = "together_url", default = "default_cloud_url")]
    pub cloud_url: String,

    /// Empty means "use `TOGETHER_API_KEY`", see [`Settings::cloud_key`]
    #[serde(rename = "together_api_key", default)]
    pub cloud_api_key: String,

    #[serde(rename = "ollama_url", default = "default_local_url")]
    pub local_url: String,

    /// Optional bearer token for a proxied Ollama
    #[serde(rename = "ollama_api_key", default)]
    pub local_api_key: String,

    #[serde(default)]
    pub stats: Stats,
}

/// Usage statistics accumulated across runs
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Stats {
    #[serde(default)]
    pub total_images_processed: u64,

    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub last_processed_date: Option<DateTime<Local>>,

    #[serde(default)]
    pub categories_created: BTreeSet<String>,
}

impl Stats {
    /// Count one moved file under `category_key`
    pub fn record(&mut self, category_key: &str, at: DateTime<Local>) {
        self.total_images_processed += 1;
        self.categories_created.insert(category_key.to_string());
        self.last_processed_date = Some(at);
    }
}

// Default value functions
fn default_model() -> String { "meta-llama/Llama-3.2-11B-Vision-Instruct-Turbo".to_string() }
fn default_cloud_url() -> String { "https://api.together.xyz".to_string() }
fn default_local_url() -> String { "http://localhost:11434".to_string() }

/// Accepts RFC 3339, a naive local timestamp, or anything else as `None`
fn lenient_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Local>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(dt.with_timezone(&Local)));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Local.from_local_datetime(&naive).single());
    }

    warn!("Ignoring unparsable last_processed_date: {}", raw);
    Ok(None)
}

impl Settings {
    /// Configured Together AI key, falling back to the `TOGETHER_API_KEY` environment variable.
    ///
    /// The environment value is never written back to the settings file.
    pub fn cloud_key(&self) -> String {
        if !self.cloud_api_key.trim().is_empty() {
            return self.cloud_api_key.clone();
        }
        std::env::var(CLOUD_KEY_ENV).unwrap_or_default()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            cloud_url: default_cloud_url(),
            cloud_api_key: String::new(),
            local_url: default_local_url(),
            local_api_key: String::new(),
            stats: Stats::default(),
        }
    }
}

/// Owner of the settings file.
///
/// Cloning shares the write lock, so every clone handed to the classifier,
/// organizer and coordinator serializes its read-merge-write cycles.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store at `<app data dir>/settings.json`
    pub fn at_default_location() -> Result<Self> {
        Ok(Self::new(app_data_dir()?.join(SETTINGS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file is absent or corrupt
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            info!("Settings file not found at {:?}, using defaults", self.path);
            return Settings::default();
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read settings {:?}: {}, using defaults", self.path, e);
                return Settings::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", self.path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse settings {:?}: {}, using defaults", self.path, e);
                Settings::default()
            }
        }
    }

    /// Overwrite the settings file atomically
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let _guard = self.lock();
        self.write(settings)
    }

    /// Re-read the file, apply `f`, and write the result back.
    ///
    /// Unlike [`load`](Self::load) this refuses to work from defaults when the
    /// file exists but cannot be read or parsed; the file is left untouched.
    pub fn update<F>(&self, f: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let _guard = self.lock();
        let mut settings = self.read_strict()?;
        f(&mut settings);
        self.write(&settings)?;
        Ok(settings)
    }

    /// Merge one processed image into the persisted stats
    pub fn record_processed(&self, category_key: &str, at: DateTime<Local>) -> Result<Stats> {
        let settings = self.update(|s| s.stats.record(category_key, at))?;
        Ok(settings.stats)
    }

    fn read_strict(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&content).map_err(|e| {
            ShotsortError::Config(format!(
                "Refusing to overwrite unparsable settings {:?}: {}",
                self.path, e
            ))
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| SETTINGS_FILE.to_string());
        let tmp = self.path.with_file_name(format!(".{}.tmp", file_name));

        let content = serde_json::to_string_pretty(settings)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
