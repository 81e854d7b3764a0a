// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Polling watcher for screenshot folders

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::organizer::list_images;
use crate::{Result, ShotsortError};

/// Callback receiving each newly detected image
pub type PathSink = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Lifecycle of a watcher instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Polling,
    /// Terminal; a stopped watcher cannot be restarted
    Stopped,
}

/// Watcher timing
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pause between scans
    pub poll_interval: Duration,
    /// Grace period before emitting a new file, so writers can finish
    pub settle_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Watches a fixed set of folders for new image files
pub struct FolderWatcher {
    folders: Vec<PathBuf>,
    config: WatcherConfig,
    phase: Arc<Mutex<WatchPhase>>,
}

impl FolderWatcher {
    pub fn new(folders: Vec<PathBuf>, config: WatcherConfig) -> Self {
        Self {
            folders,
            config,
            phase: Arc::new(Mutex::new(WatchPhase::Idle)),
        }
    }

    pub fn phase(&self) -> WatchPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn folders(&self) -> &[PathBuf] {
        &self.folders
    }

    /// Spawn the polling loop.
    ///
    /// Files already present are ignored. Each new file is passed to `sink`
    /// once for the lifetime of this watcher. The loop ends when `cancel` fires.
    pub fn start(&self, sink: PathSink, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        self.start_since(sink, cancel, SystemTime::now())
    }

    /// Like [`start`](Self::start), but treats any file modified after `since`
    /// as new, so files written before the loop began are not missed.
    pub fn start_since(
        &self,
        sink: PathSink,
        cancel: CancellationToken,
        since: SystemTime,
    ) -> Result<JoinHandle<()>> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if *phase != WatchPhase::Idle {
                return Err(ShotsortError::WatcherAlreadyStarted(format!("{:?}", *phase)));
            }
            *phase = WatchPhase::Polling;
        }

        let mut state = PollState {
            last_check: self.folders.iter().map(|f| (f.clone(), since)).collect(),
            seen: HashSet::new(),
        };
        let folders = self.folders.clone();
        let config = self.config.clone();
        let phase = self.phase.clone();

        for folder in &folders {
            info!("Watching: {:?}", folder);
        }

        Ok(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                for folder in &folders {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if let Err(e) = state.scan(folder, &config, &sink, &cancel).await {
                        error!("Error watching {:?}: {}", folder, e);
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }

            *phase.lock().unwrap_or_else(|e| e.into_inner()) = WatchPhase::Stopped;
            info!("Watcher stopped");
        }))
    }
}

struct PollState {
    last_check: HashMap<PathBuf, SystemTime>,
    seen: HashSet<PathBuf>,
}

impl PollState {
    async fn scan(
        &mut self,
        folder: &Path,
        config: &WatcherConfig,
        sink: &PathSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !folder.is_dir() {
            debug!("Watched folder does not exist: {:?}", folder);
            return Ok(());
        }

        let scan_started = SystemTime::now();
        let since = self
            .last_check
            .get(folder)
            .copied()
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for file in list_images(folder)? {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.seen.contains(&file) {
                continue;
            }

            let modified = match std::fs::metadata(&file).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Skipping {:?}: {}", file, e);
                    continue;
                }
            };
            if modified <= since {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(config.settle_delay) => {}
            }

            info!("New screenshot detected: {:?}", file);
            self.seen.insert(file.clone());
            sink(file);
        }

        self.last_check.insert(folder.to_path_buf(), scan_started);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    fn fast() -> WatcherConfig {
        WatcherConfig {
            poll_interval: Duration::from_millis(30),
            settle_delay: Duration::from_millis(5),
        }
    }

    fn collector() -> (PathSink, Arc<Mutex<Vec<PathBuf>>>) {
        let seen: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
        let sink_seen = seen.clone();
        let sink: PathSink = Arc::new(move |p| sink_seen.lock().unwrap().push(p));
        (sink, seen)
    }

    fn touch(path: &Path, offset_secs: i64) {
        if !path.exists() {
            std::fs::write(path, b"png").unwrap();
        }
        let now = FileTime::from_system_time(SystemTime::now());
        let t = FileTime::from_unix_time(now.unix_seconds() + offset_secs, 0);
        filetime::set_file_mtime(path, t).unwrap();
    }

    async fn wait_for(seen: &Arc<Mutex<Vec<PathBuf>>>, count: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_emits_new_files_once() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("old.png"), -3600);

        let watcher = FolderWatcher::new(vec![dir.path().to_path_buf()], fast());
        let (sink, seen) = collector();
        let cancel = CancellationToken::new();
        let handle = watcher.start(sink, cancel.clone()).unwrap();
        assert_eq!(watcher.phase(), WatchPhase::Polling);

        let new_file = dir.path().join("new.PNG");
        touch(&new_file, 10);
        std::fs::write(dir.path().join("notes.txt"), b"text").unwrap();
        wait_for(&seen, 1).await;

        // Touch again; still reported only once
        touch(&new_file, 20);
        tokio::time::sleep(Duration::from_millis(150)).await;

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![new_file]);
        assert_eq!(watcher.phase(), WatchPhase::Stopped);
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let dir = TempDir::new().unwrap();
        let watcher = FolderWatcher::new(vec![dir.path().to_path_buf()], fast());
        let cancel = CancellationToken::new();

        let (sink, _) = collector();
        let handle = watcher.start(sink.clone(), cancel.clone()).unwrap();
        assert!(matches!(
            watcher.start(sink.clone(), cancel.clone()),
            Err(ShotsortError::WatcherAlreadyStarted(_))
        ));

        cancel.cancel();
        handle.await.unwrap();

        // Stopped is terminal
        assert!(matches!(
            watcher.start(sink, CancellationToken::new()),
            Err(ShotsortError::WatcherAlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_folder_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let watcher = FolderWatcher::new(
            vec![dir.path().join("does-not-exist"), dir.path().to_path_buf()],
            fast(),
        );
        let (sink, seen) = collector();
        let cancel = CancellationToken::new();
        let handle = watcher.start(sink, cancel.clone()).unwrap();

        let file = dir.path().join("shot.jpg");
        touch(&file, 10);
        wait_for(&seen, 1).await;

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![file]);
    }

    #[tokio::test]
    async fn test_cancel_during_settle_emits_nothing() {
        let dir = TempDir::new().unwrap();
        let config = WatcherConfig {
            poll_interval: Duration::from_millis(20),
            settle_delay: Duration::from_secs(30),
        };
        let watcher = FolderWatcher::new(vec![dir.path().to_path_buf()], config);
        let (sink, seen) = collector();
        let cancel = CancellationToken::new();
        let handle = watcher.start(sink, cancel.clone()).unwrap();

        touch(&dir.path().join("shot.png"), 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_since_catches_files_written_earlier() {
        let dir = TempDir::new().unwrap();
        touch(&dir.path().join("before.png"), -120);
        let during = dir.path().join("during.png");
        touch(&during, -30);

        let watcher = FolderWatcher::new(vec![dir.path().to_path_buf()], fast());
        let (sink, seen) = collector();
        let cancel = CancellationToken::new();
        let since = SystemTime::now() - Duration::from_secs(60);
        let handle = watcher.start_since(sink, cancel.clone(), since).unwrap();

        wait_for(&seen, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![during]);
    }
}
