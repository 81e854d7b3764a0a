// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Moves classified screenshots into `<category>_<subcategory>` folders

use chrono::{DateTime, Local};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classification, ImageClassifier};
use crate::config::{SettingsStore, Stats};
use crate::history::{create_entry, History};
use crate::{Result, ShotsortError};

/// Extensions picked up from watched folders (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

const MAX_MOVE_ATTEMPTS: u32 = 16;

/// Something that happened to one file during a sweep
#[derive(Debug, Clone)]
pub enum OrganizerEvent {
    /// File classified and moved; `stats` is the merged persisted snapshot
    Moved {
        file: PathBuf,
        destination: PathBuf,
        classification: Classification,
        stats: Stats,
    },
    /// Classification or move failed; the file was left in place
    Failed { file: PathBuf, message: String },
}

/// Result of moving a single file
#[derive(Debug, Clone)]
pub struct MovedFile {
    pub destination: PathBuf,
    pub classification: Classification,
    pub stats: Stats,
}

/// Replace every character outside `[A-Za-z0-9_.\- ]` with `_`
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Check if a path looks like a screenshot we should organize
pub fn is_image(path: &Path) -> bool {
    let filename = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };

    // Skip hidden files (macOS writes screenshots to a dotfile first)
    if filename.starts_with('.') {
        return false;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|i| i.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Image files directly inside `folder`, sorted by name
pub fn list_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image(p))
        .collect();
    files.sort();
    Ok(files)
}

/// On-disk creation time, or modification time where creation is unavailable
pub fn creation_time(path: &Path) -> Result<DateTime<Local>> {
    let meta = std::fs::metadata(path)?;
    let time = meta.created().or_else(|_| meta.modified())?;
    Ok(DateTime::<Local>::from(time))
}

/// Compute `<folder>/<category>_<subcategory>/<stem>_<YYYYMMDD_HHMMSS><.ext>`
pub fn destination_for(
    folder: &Path,
    file: &Path,
    classification: &Classification,
    created: DateTime<Local>,
) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let name = format!("{}_{}{}", sanitize(&stem), created.format("%Y%m%d_%H%M%S"), ext);
    folder.join(classification.folder_name()).join(name)
}

/// First free path among `path`, `<stem>_1<.ext>`, `<stem>_2<.ext>`, ...
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1u32..)
        .map(|n| parent.join(format!("{}_{}{}", stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}

/// Move `from` to `to`, failing with `AlreadyExists` rather than replacing `to`
pub async fn move_no_clobber(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::hard_link(from, to).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(from).await {
                // Leave the file where it was found
                let _ = tokio::fs::remove_file(to).await;
                return Err(e);
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            // Filesystems without hard links
            debug!("Hard link to {:?} failed ({}), falling back to rename", to, e);
            if to.exists() {
                return Err(ErrorKind::AlreadyExists.into());
            }
            tokio::fs::rename(from, to).await
        }
    }
}

/// Classifies images in a folder and files them into category folders
#[derive(Clone)]
pub struct FileOrganizer {
    classifier: Arc<dyn ImageClassifier>,
    store: SettingsStore,
    history: Option<Arc<History>>,
}

impl FileOrganizer {
    pub fn new(classifier: Arc<dyn ImageClassifier>, store: SettingsStore) -> Self {
        Self {
            classifier,
            store,
            history: None,
        }
    }

    /// Record every move in a journal so it can be undone
    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(Arc::new(history));
        self
    }

    /// Organize every image directly inside `folder`.
    ///
    /// Per-file failures are reported through `on_event` and skipped. The
    /// token is checked before each file. Returns the stats for this call only.
    pub async fn organize(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
        on_event: &(dyn Fn(OrganizerEvent) + Send + Sync),
    ) -> Result<Stats> {
        let files = list_images(folder)?;
        info!("Found {} images in {:?}", files.len(), folder);

        let mut batch = Stats::default();

        for file in files {
            if cancel.is_cancelled() {
                info!("Organizing {:?} cancelled", folder);
                break;
            }

            // The watcher may have queued a file that an earlier sweep already moved
            if !file.exists() {
                debug!("Skipping vanished file: {:?}", file);
                continue;
            }

            match self.organize_file(&file).await {
                Ok(moved) => {
                    batch.record(&moved.classification.folder_name(), Local::now());
                    on_event(OrganizerEvent::Moved {
                        file,
                        destination: moved.destination,
                        classification: moved.classification,
                        stats: moved.stats,
                    });
                }
                Err(e) => {
                    error!("Error processing {:?}: {}", file, e);
                    on_event(OrganizerEvent::Failed {
                        file,
                        message: e.to_string(),
                    });
                }
            }
        }

        Ok(batch)
    }

    /// Classify and move one file, then merge the result into persisted stats
    pub async fn organize_file(&self, file: &Path) -> Result<MovedFile> {
        let folder = file.parent().unwrap_or_else(|| Path::new("."));

        let classification = self.classifier.classify(file).await?;
        info!("Classified {:?} as {}", file, classification);

        let created = creation_time(file)?;
        let target = destination_for(folder, file, &classification, created);
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let mut destination = unique_path(&target);
        let mut attempts = 1;
        loop {
            match move_no_clobber(file, &destination).await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists && attempts < MAX_MOVE_ATTEMPTS => {
                    debug!("{:?} appeared while moving, retrying", destination);
                    attempts += 1;
                    destination = unique_path(&target);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if destination != target {
            warn!("{:?} already exists, used {:?}", target, destination);
        }
        info!("Moved {:?} to {:?}", file, destination);

        let key = classification.folder_name();

        if let Some(history) = &self.history {
            let entry = create_entry(
                uuid::Uuid::new_v4().to_string(),
                file.to_path_buf(),
                destination.clone(),
                classification.clone(),
            );
            if let Err(e) = history.append(&entry) {
                warn!("Failed to write history entry: {}", e);
            }
        }

        let store = self.store.clone();
        let recorded = tokio::task::spawn_blocking(move || store.record_processed(&key, Local::now()))
            .await
            .map_err(ShotsortError::from)
            .and_then(|r| r);
        let stats = match recorded {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to persist stats: {}", e);
                self.store.load().stats
            }
        };

        Ok(MovedFile {
            destination,
            classification,
            stats,
        })
    }
}
