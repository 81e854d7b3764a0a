// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Application data locations and the list of watched folders

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::{Result, ShotsortError};

/// File name of the watched-folder list inside the app data directory
pub const FOLDERS_FILE: &str = "folders.json";

const APP_DIR_NAME: &str = "ScreenshotOrganizer";

/// Platform directory holding settings, folder list, journal and logs
pub fn app_data_dir() -> Result<PathBuf> {
    let home = || {
        dirs::home_dir()
            .ok_or_else(|| ShotsortError::Config("Cannot determine home directory".to_string()))
    };

    if cfg!(windows) {
        dirs::config_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .ok_or_else(|| ShotsortError::Config("APPDATA is not set".to_string()))
    } else if cfg!(target_os = "macos") {
        Ok(home()?.join("Library").join("Application Support").join(APP_DIR_NAME))
    } else {
        Ok(home()?.join(".screenshotorganizer"))
    }
}

/// Where the operating system usually drops screenshots
pub fn default_screenshot_dir() -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let dir = if cfg!(windows) {
        home.join("Pictures").join("Screenshots")
    } else if cfg!(target_os = "macos") {
        home.join("Desktop")
    } else {
        home.join("Pictures")
    };
    Some(dir)
}

/// Persisted list of folders to organize, stored as a JSON array of paths
pub struct FolderList {
    path: PathBuf,
}

impl FolderList {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// List stored next to the given settings file
    pub fn beside(settings_path: &Path) -> Self {
        let dir = settings_path.parent().unwrap_or_else(|| Path::new("."));
        Self::new(dir.join(FOLDERS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the folder list; absent or corrupt files yield an empty list
    pub fn load(&self) -> Vec<PathBuf> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        match serde_json::from_str::<Vec<PathBuf>>(&content) {
            Ok(folders) => folders,
            Err(e) => {
                warn!("Failed to parse folder list {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    pub fn save(&self, folders: &[PathBuf]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(folders)?)?;
        Ok(())
    }

    /// Add a folder; returns false if it was already listed
    pub fn add(&self, folder: PathBuf) -> Result<bool> {
        let mut folders = self.load();
        if folders.contains(&folder) {
            return Ok(false);
        }
        info!("Adding watched folder: {:?}", folder);
        folders.push(folder);
        self.save(&folders)?;
        Ok(true)
    }

    /// Remove a folder; returns false if it was not listed
    pub fn remove(&self, folder: &Path) -> Result<bool> {
        let mut folders = self.load();
        let before = folders.len();
        folders.retain(|f| f != folder);
        if folders.len() == before {
            return Ok(false);
        }
        info!("Removing watched folder: {:?}", folder);
        self.save(&folders)?;
        Ok(true)
    }
}
