// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Batch coordinator: initial sweep, then watch-and-drain
//!
//! One batch runs at a time. The sweep organizes every configured folder,
//! after which a [`FolderWatcher`] feeds newly detected files into a
//! [`ProcessingQueue`] that a drain loop routes back through the organizer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Stats;
use crate::organizer::{FileOrganizer, OrganizerEvent};
use crate::watcher::{FolderWatcher, PathSink, WatcherConfig};
use crate::{Result, ShotsortError};

/// What the coordinator reports to its caller
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Progress(String),
    Error(String),
    StatsUpdated(Stats),
    /// The batch completed without being cancelled
    Finished,
}

/// How a call to [`Coordinator::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// No batch was running
    NotRunning,
    /// The batch exited on its own within the timeout
    Graceful,
    /// The batch was aborted after the timeout
    Forced,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Keep watching after the initial sweep
    pub watch: bool,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    /// How long `stop` waits before aborting the batch
    pub stop_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let watcher = WatcherConfig::default();
        Self {
            watch: true,
            poll_interval: watcher.poll_interval,
            settle_delay: watcher.settle_delay,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// FIFO of detected paths; a path is never queued twice while pending
#[derive(Default)]
pub struct ProcessingQueue {
    items: Mutex<VecDeque<PathBuf>>,
    notify: Notify,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `path` unless it is already pending. Returns whether it was added.
    pub fn push(&self, path: PathBuf) -> bool {
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.contains(&path) {
                return false;
            }
            items.push_back(path);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<PathBuf> {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until something is pushed
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

struct Batch {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Closes when the batch task is dropped, whether it finished or was aborted
    done: watch::Receiver<()>,
    stopping: bool,
}

impl Batch {
    fn is_active(&self) -> bool {
        // `has_changed` errors once the sender is gone
        self.stopping || self.done.has_changed().is_ok()
    }
}

/// Runs organize batches and reports through an event channel
pub struct Coordinator {
    organizer: FileOrganizer,
    config: CoordinatorConfig,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    batch: Mutex<Option<Batch>>,
}

impl Coordinator {
    pub fn new(
        organizer: FileOrganizer,
        config: CoordinatorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            organizer,
            config,
            events: tx,
            batch: Mutex::new(None),
        };
        (coordinator, rx)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Batch>> {
        self.batch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while a batch task is alive or still being stopped
    pub fn is_running(&self) -> bool {
        self.slot().as_ref().map(Batch::is_active).unwrap_or(false)
    }

    /// Start a batch over `folders`
    pub fn start(&self, folders: Vec<PathBuf>) -> Result<()> {
        let mut slot = self.slot();
        if slot.as_ref().map(Batch::is_active).unwrap_or(false) {
            return Err(ShotsortError::BatchAlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(());
        let task = BatchTask {
            organizer: self.organizer.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };

        info!("Starting batch over {} folder(s)", folders.len());
        let handle = tokio::spawn(async move {
            let _done = done_tx;
            if task.run(folders).await {
                info!("Batch finished");
                task.send(CoordinatorEvent::Finished);
            } else {
                info!("Batch cancelled");
            }
        });

        *slot = Some(Batch {
            cancel,
            handle,
            done: done_rx,
            stopping: false,
        });
        Ok(())
    }

    /// Request the batch to stop, aborting it if it outlives the timeout.
    ///
    /// The batch keeps its slot until it has exited, so `start` is refused
    /// for the whole grace period.
    pub async fn stop(&self) -> StopOutcome {
        let (cancel, mut done) = {
            let mut slot = self.slot();
            match slot.as_mut() {
                Some(batch) if batch.is_active() => {
                    batch.stopping = true;
                    (batch.cancel.clone(), batch.done.clone())
                }
                _ => {
                    *slot = None;
                    return StopOutcome::NotRunning;
                }
            }
        };

        info!("Stopping batch");
        cancel.cancel();

        let outcome = match tokio::time::timeout(self.config.stop_timeout, done.changed()).await {
            Ok(_) => StopOutcome::Graceful,
            Err(_) => {
                warn!(
                    "Batch did not stop within {:?}, aborting",
                    self.config.stop_timeout
                );
                if let Some(batch) = self.slot().as_ref() {
                    batch.handle.abort();
                }
                let _ = done.changed().await;
                StopOutcome::Forced
            }
        };

        *self.slot() = None;
        outcome
    }

    /// Wait for the current batch to end on its own
    pub async fn wait(&self) {
        let done = self.slot().as_ref().map(|b| b.done.clone());
        if let Some(mut done) = done {
            let _ = done.changed().await;
        }
    }
}

struct BatchTask {
    organizer: FileOrganizer,
    config: CoordinatorConfig,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    cancel: CancellationToken,
}

impl BatchTask {
    fn send(&self, event: CoordinatorEvent) {
        // The receiver may have been dropped by a caller that stopped listening
        let _ = self.events.send(event);
    }

    /// Returns true when the batch ended cleanly
    async fn run(&self, folders: Vec<PathBuf>) -> bool {
        // Anything modified after this instant and missed by the sweep is left to the watcher
        let started = SystemTime::now();

        for folder in &folders {
            if self.cancel.is_cancelled() {
                return false;
            }
            if folder.is_dir() {
                self.send(CoordinatorEvent::Progress(format!(
                    "Processing folder: {}",
                    folder.display()
                )));
                self.organize(folder).await;
            } else {
                warn!("Folder not found: {:?}", folder);
                self.send(CoordinatorEvent::Error(format!(
                    "Folder not found: {}",
                    folder.display()
                )));
            }
        }

        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.config.watch {
            return true;
        }

        self.watch_and_drain(folders, started).await
    }

    async fn watch_and_drain(&self, folders: Vec<PathBuf>, since: SystemTime) -> bool {
        let queue = Arc::new(ProcessingQueue::new());
        let watcher = FolderWatcher::new(
            folders,
            WatcherConfig {
                poll_interval: self.config.poll_interval,
                settle_delay: self.config.settle_delay,
            },
        );

        let sink_queue = queue.clone();
        let sink: PathSink = Arc::new(move |path| {
            if !sink_queue.push(path.clone()) {
                debug!("Already queued: {:?}", path);
            }
        });

        let watch_handle = match watcher.start_since(sink, self.cancel.clone(), since) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start watcher: {}", e);
                self.send(CoordinatorEvent::Error(e.to_string()));
                return false;
            }
        };
        self.send(CoordinatorEvent::Progress("Watching for new screenshots".to_string()));

        let clean = loop {
            if self.cancel.is_cancelled() {
                break queue.is_empty();
            }

            match queue.pop() {
                Some(path) => {
                    match path.parent() {
                        Some(folder) => self.organize(folder).await,
                        None => warn!("Queued path has no parent: {:?}", path),
                    }
                    if self.cancel.is_cancelled() {
                        // Stopped while a file was in flight
                        break false;
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break queue.is_empty(),
                        _ = queue.notified() => {}
                    }
                }
            }
        };

        if !queue.is_empty() {
            info!("Abandoning {} queued file(s)", queue.len());
        }
        if let Err(e) = watch_handle.await {
            error!("Watcher task failed: {}", e);
        }
        clean
    }

    async fn organize(&self, folder: &Path) {
        let on_event = |event: OrganizerEvent| match event {
            OrganizerEvent::Moved {
                file,
                destination,
                classification,
                stats,
            } => {
                self.send(CoordinatorEvent::Progress(format!(
                    "Moved {} to {} ({})",
                    display_name(&file),
                    destination.display(),
                    classification
                )));
                self.send(CoordinatorEvent::StatsUpdated(stats));
            }
            OrganizerEvent::Failed { file, message } => {
                self.send(CoordinatorEvent::Error(format!(
                    "Error processing {}: {}",
                    display_name(&file),
                    message
                )));
            }
        };

        if let Err(e) = self.organizer.organize(folder, &self.cancel, &on_event).await {
            error!("Error organizing {:?}: {}", folder, e);
            self.send(CoordinatorEvent::Error(format!(
                "Error organizing {}: {}",
                folder.display(),
                e
            )));
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classification, ImageClassifier};
    use crate::config::SettingsStore;
    use crate::organizer::tests::FakeClassifier;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Classifier that never answers in time
    struct SlowClassifier;

    #[async_trait]
    impl ImageClassifier for SlowClassifier {
        async fn classify(&self, _image_path: &Path) -> Result<Classification> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Classification::new("late", "reply"))
        }
    }

    /// Classifier that takes a while and records what it was asked
    struct DelayedClassifier {
        delay: Duration,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl DelayedClassifier {
        fn new(delay: Duration) -> Self {
            Self { delay, calls: Mutex::new(Vec::new()) }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ImageClassifier for DelayedClassifier {
        async fn classify(&self, image_path: &Path) -> Result<Classification> {
            self.calls.lock().unwrap().push(image_path.to_path_buf());
            tokio::time::sleep(self.delay).await;
            Ok(Classification::new("code", "rust"))
        }
    }

    fn write_future(path: &Path) {
        std::fs::write(path, b"png").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(10);
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(future)).unwrap();
    }

    fn fast_config(watch: bool) -> CoordinatorConfig {
        CoordinatorConfig {
            watch,
            poll_interval: Duration::from_millis(30),
            settle_delay: Duration::from_millis(5),
            stop_timeout: Duration::from_millis(500),
        }
    }

    fn organizer(dir: &TempDir, classifier: Arc<dyn ImageClassifier>) -> FileOrganizer {
        FileOrganizer::new(classifier, SettingsStore::new(dir.path().join("settings.json")))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn finished(events: &[CoordinatorEvent]) -> bool {
        events.iter().any(|e| matches!(e, CoordinatorEvent::Finished))
    }

    #[test]
    fn test_queue_dedupes_pending_paths() {
        let queue = ProcessingQueue::new();
        assert!(queue.push(PathBuf::from("/a.png")));
        assert!(!queue.push(PathBuf::from("/a.png")));
        assert!(queue.push(PathBuf::from("/b.png")));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(PathBuf::from("/a.png")));
        // Once popped it may be queued again
        assert!(queue.push(PathBuf::from("/a.png")));
        assert_eq!(queue.pop(), Some(PathBuf::from("/b.png")));
        assert_eq!(queue.pop(), Some(PathBuf::from("/a.png")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_only_finishes() {
        let dir = TempDir::new().unwrap();
        let inbox = dir.path().join("inbox");
        std::fs::create_dir(&inbox).unwrap();
        std::fs::write(inbox.join("shot1.png"), b"png").unwrap();
        std::fs::write(inbox.join("shot2.png"), b"png").unwrap();

        let classifier = Arc::new(FakeClassifier::always("receipt", "payment"));
        let (coordinator, mut rx) =
            Coordinator::new(organizer(&dir, classifier), fast_config(false));

        coordinator
            .start(vec![inbox.clone(), dir.path().join("missing")])
            .unwrap();
        coordinator.wait().await;
        assert!(!coordinator.is_running());

        let events = drain(&mut rx);
        assert!(finished(&events));
        assert!(matches!(events.last(), Some(CoordinatorEvent::Finished)));
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::Progress(m) if m.starts_with("Processing folder:")
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            CoordinatorEvent::Error(m) if m.starts_with("Folder not found:")
        )));

        let last_stats = events
            .iter()
            .filter_map(|e| match e {
                CoordinatorEvent::StatsUpdated(s) => Some(s.clone()),
                _ => None,
            })
            .last()
            .unwrap();
        assert_eq!(last_stats.total_images_processed, 2);
        assert_eq!(std::fs::read_dir(inbox.join("receipt_payment")).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_rejects_second_batch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("shot.png"), b"png").unwrap();

        let (coordinator, _rx) =
            Coordinator::new(organizer(&dir, Arc::new(SlowClassifier)), fast_config(false));
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();
        assert!(coordinator.is_running());
        assert!(matches!(
            coordinator.start(vec![dir.path().to_path_buf()]),
            Err(ShotsortError::BatchAlreadyRunning)
        ));

        coordinator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_mid_batch_is_forced_and_not_finished() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), b"png").unwrap();
        std::fs::write(dir.path().join("b.png"), b"png").unwrap();

        let (coordinator, mut rx) =
            Coordinator::new(organizer(&dir, Arc::new(SlowClassifier)), fast_config(true));
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert_eq!(coordinator.stop().await, StopOutcome::Forced);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!coordinator.is_running());

        assert!(!finished(&drain(&mut rx)));
        // Nothing was moved
        assert!(dir.path().join("a.png").exists());
        assert!(dir.path().join("b.png").exists());
    }

    #[tokio::test]
    async fn test_watch_picks_up_new_files_and_finishes_when_idle() {
        let dir = TempDir::new().unwrap();
        let classifier = Arc::new(FakeClassifier::always("code", "rust"));
        let (coordinator, mut rx) =
            Coordinator::new(organizer(&dir, classifier), fast_config(true));
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();

        // Give the empty sweep time to hand over to the watcher
        tokio::time::sleep(Duration::from_millis(100)).await;
        let file = dir.path().join("new.png");
        std::fs::write(&file, b"png").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(10);
        filetime::set_file_mtime(&file, filetime::FileTime::from_system_time(future)).unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(CoordinatorEvent::StatsUpdated(stats)) = rx.recv().await {
                    return stats;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(stats.total_images_processed, 1);
        assert!(!file.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("code_rust")).unwrap().count(), 1);

        // Let the drain loop go back to waiting
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.stop().await, StopOutcome::Graceful);
        assert!(finished(&drain(&mut rx)));
    }

    #[tokio::test]
    async fn test_stop_without_batch() {
        let dir = TempDir::new().unwrap();
        let classifier = Arc::new(FakeClassifier::always("code", "rust"));
        let (coordinator, _rx) = Coordinator::new(organizer(&dir, classifier), fast_config(true));
        assert_eq!(coordinator.stop().await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_start_is_refused_while_stop_is_pending() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("shot.png"), b"png").unwrap();

        let (coordinator, _rx) =
            Coordinator::new(organizer(&dir, Arc::new(SlowClassifier)), fast_config(false));
        let coordinator = Arc::new(coordinator);
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stopper = coordinator.clone();
        let stopping = tokio::spawn(async move { stopper.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The old batch is still inside its grace period
        assert!(coordinator.is_running());
        assert!(matches!(
            coordinator.start(vec![dir.path().to_path_buf()]),
            Err(ShotsortError::BatchAlreadyRunning)
        ));

        assert_eq!(stopping.await.unwrap(), StopOutcome::Forced);
        assert!(!coordinator.is_running());

        // Once the stop completes a new batch may start
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();
        assert_eq!(coordinator.stop().await, StopOutcome::Forced);
    }

    #[tokio::test]
    async fn test_file_written_during_sweep_is_organized() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.png"), b"png").unwrap();

        let classifier = Arc::new(DelayedClassifier::new(Duration::from_millis(300)));
        let (coordinator, mut rx) =
            Coordinator::new(organizer(&dir, classifier.clone()), fast_config(true));
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();

        // The sweep has already listed the folder and is busy with a.png
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(dir.path().join("b.png"), b"png").unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), async {
            let mut updates = 0;
            loop {
                if let Some(CoordinatorEvent::StatsUpdated(stats)) = rx.recv().await {
                    updates += 1;
                    if updates == 2 {
                        return stats;
                    }
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(stats.total_images_processed, 2);
        assert!(!dir.path().join("a.png").exists());
        assert!(!dir.path().join("b.png").exists());
        assert_eq!(std::fs::read_dir(dir.path().join("code_rust")).unwrap().count(), 2);
        assert_eq!(classifier.call_count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(coordinator.stop().await, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_stop_mid_drain_abandons_queued_files() {
        let dir = TempDir::new().unwrap();
        let classifier = Arc::new(DelayedClassifier::new(Duration::from_millis(300)));
        let mut config = fast_config(true);
        config.stop_timeout = Duration::from_secs(2);
        let (coordinator, mut rx) = Coordinator::new(organizer(&dir, classifier.clone()), config);
        coordinator.start(vec![dir.path().to_path_buf()]).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        write_future(&dir.path().join("a.png"));
        write_future(&dir.path().join("b.png"));

        // Wait until the first file is being classified
        tokio::time::timeout(Duration::from_secs(5), async {
            while classifier.call_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.stop().await, StopOutcome::Graceful);
        assert!(!finished(&drain(&mut rx)));

        // Exactly one file was in flight; the other stays where it was
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(classifier.call_count(), 1);
        let in_flight = classifier.calls.lock().unwrap()[0].clone();
        let untouched = if in_flight.ends_with("a.png") { "b.png" } else { "a.png" };
        assert!(dir.path().join(untouched).exists());
        assert!(!in_flight.exists());
    }
}
