// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Error types for shotsort

use thiserror::Error;

/// Result type alias for shotsort operations
pub type Result<T> = std::result::Result<T, ShotsortError>;

/// shotsort error types
#[derive(Error, Debug)]
pub enum ShotsortError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("API error: {0}")]
    Api(#[from] reqwest::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Could not connect to Ollama at {0}. Please ensure Ollama is running and try again.")]
    ServiceNotRunning(String),

    #[error("Model '{0}' not found. Please pull the model first using 'ollama pull {0}'")]
    ModelNotPulled(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("A batch is already running")]
    BatchAlreadyRunning,

    #[error("Watcher cannot be started from state {0}")]
    WatcherAlreadyStarted(String),
}

impl ShotsortError {
    /// True for failures that come from talking to the AI backend
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::Api(_) | Self::Provider(_) | Self::ServiceNotRunning(_) | Self::ModelNotPulled(_)
        )
    }
}
