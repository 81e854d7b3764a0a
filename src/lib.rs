// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! shotsort: AI screenshot organizer
//!
//! Watches screenshot folders, classifies each image with a vision model
//! (Together AI or a local Ollama server) and files it into a
//! `<category>_<subcategory>` folder.

pub mod classifier;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod organizer;
pub mod providers;
pub mod watcher;

pub use config::{Settings, SettingsStore};
pub use error::{Result, ShotsortError};
