// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! shotsort: AI screenshot organizer
//!
//! Command-line front end for watching folders, one-off sweeps, journal undo
//! and settings management.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use shotsort::classifier::{Classifier, ImageClassifier};
use shotsort::config::{default_screenshot_dir, FolderList, Provider, Settings, SettingsStore, Stats};
use shotsort::coordinator::{Coordinator, CoordinatorConfig, CoordinatorEvent, StopOutcome};
use shotsort::history::{History, UndoOutcome, HISTORY_FILE};
use shotsort::organizer::{FileOrganizer, OrganizerEvent};
use shotsort::providers::LocalProvider;
use shotsort::{Result, ShotsortError};

const LOG_FILE: &str = "shotsort.log";

/// shotsort CLI - AI screenshot organizer
#[derive(Parser, Debug)]
#[command(name = "shotsort")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Sorts screenshots into folders using a vision model", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to settings file (default: app data directory)
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Organize existing screenshots, then watch for new ones
    Watch {
        /// Folders to watch (overrides folders.json)
        #[arg(short, long)]
        dir: Vec<PathBuf>,

        /// Organize existing files and exit without watching
        #[arg(long)]
        once: bool,

        /// Skip provider health check on startup
        #[arg(long)]
        skip_health_check: bool,
    },

    /// Organize one folder once
    Organize {
        /// Folder to organize
        path: PathBuf,

        /// Output format for results
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },

    /// Classify a single image without moving it
    Classify {
        /// Image to classify
        path: PathBuf,
    },

    /// Show processing statistics
    Stats,

    /// Manage the list of watched folders
    Folders {
        #[command(subcommand)]
        action: FolderCommands,
    },

    /// History and undo operations
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },

    /// Settings management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show AI provider status
    Status,
}

#[derive(Subcommand, Debug)]
enum FolderCommands {
    /// List watched folders
    List,

    /// Add a folder
    Add {
        path: PathBuf,
    },

    /// Remove a folder
    Remove {
        path: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List recent moves
    List {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        count: usize,
    },

    /// Move recently organized files back
    Undo {
        /// Number of moves to undo
        #[arg(short, long, default_value = "1")]
        count: usize,

        /// Dry run (show what would be undone)
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear all history
    Clear {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current settings (API keys masked)
    Show,

    /// Generate a default settings file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "settings.json")]
        output: PathBuf,
    },

    /// Switch between the cloud and local provider
    SetProvider {
        /// `cloud` (Together AI) or `local` (Ollama)
        provider: Provider,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let store = match &cli.settings {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::at_default_location()?,
    };

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let _log_guard = init_tracing(filter, &data_dir(&store).join("logs"));

    debug!("Using settings at {:?}", store.path());

    match cli.command {
        Some(Commands::Watch { dir, once, skip_health_check }) => {
            run_watch(store, dir, once, skip_health_check, cli.quiet).await
        }
        Some(Commands::Organize { path, format }) => run_organize(store, path, &format).await,
        Some(Commands::Classify { path }) => run_classify(store, path).await,
        Some(Commands::Stats) => {
            print_stats(&store.load().stats);
            Ok(())
        }
        Some(Commands::Folders { action }) => run_folders_command(&store, action),
        Some(Commands::History { action }) => run_history_command(&store, action),
        Some(Commands::Config { action }) => run_config_command(&store, action),
        Some(Commands::Status) => run_status(&store).await,
        None => {
            // Default: run watch mode
            run_watch(store, vec![], false, false, cli.quiet).await
        }
    }
}

/// Console logging plus a daily-rolled file in `log_dir`.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(
    filter: &str,
    log_dir: &Path,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let mut guard = None;
    let file_layer = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE);
            let (writer, g) = tracing_appender::non_blocking(appender);
            guard = Some(g);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(EnvFilter::new(filter)),
            )
        }
        Err(e) => {
            eprintln!("Warning: failed to create logs directory {:?}: {}", log_dir, e);
            None
        }
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

/// Directory holding the settings file, journal, folder list and logs
fn data_dir(store: &SettingsStore) -> PathBuf {
    store
        .path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn history_for(store: &SettingsStore) -> History {
    History::new(data_dir(store).join(HISTORY_FILE))
}

fn organizer_for(store: &SettingsStore) -> FileOrganizer {
    let classifier: Arc<dyn ImageClassifier> = Arc::new(Classifier::new(store.clone()));
    FileOrganizer::new(classifier, store.clone()).with_history(history_for(store))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

/// Explicit folders, else folders.json, else the platform screenshot folder
fn resolve_folders(store: &SettingsStore, overrides: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    if !overrides.is_empty() {
        return Ok(overrides);
    }

    let saved = FolderList::beside(store.path()).load();
    if !saved.is_empty() {
        return Ok(saved);
    }

    default_screenshot_dir().map(|d| vec![d]).ok_or_else(|| {
        ShotsortError::Config(
            "No folders configured. Use `shotsort folders add <DIR>` or --dir".to_string(),
        )
    })
}

/// Fail early when the configured provider cannot possibly work
async fn check_provider(settings: &Settings) -> Result<()> {
    match settings.provider {
        Provider::CloudApi => {
            if settings.cloud_key().trim().is_empty() {
                return Err(ShotsortError::Config(
                    "Together AI API key is not set. Set TOGETHER_API_KEY or together_api_key in settings.json"
                        .to_string(),
                ));
            }
            info!("Using Together AI with model '{}'", settings.model);
        }
        Provider::LocalApi => {
            info!("Checking Ollama availability...");
            let key = Some(settings.local_api_key.as_str()).filter(|k| !k.trim().is_empty());
            let client = LocalProvider::new(&settings.local_url, &settings.model, key)?;
            client.health_check().await?;
            info!("Ollama is running");

            match client.model_available().await {
                Ok(true) => info!("Vision model '{}' available", settings.model),
                Ok(false) => {
                    warn!("Vision model '{}' not found", settings.model);
                    warn!("Try: ollama pull {}", settings.model);
                }
                Err(e) => warn!("Could not list Ollama models: {}", e),
            }
        }
    }
    Ok(())
}

/// Run the coordinator until the sweep ends (`--once`) or a stop signal arrives
async fn run_watch(
    store: SettingsStore,
    dir_overrides: Vec<PathBuf>,
    once: bool,
    skip_health_check: bool,
    quiet: bool,
) -> Result<()> {
    let folders = resolve_folders(&store, dir_overrides)?;
    info!("Watch folders: {:?}", folders);

    if !skip_health_check {
        check_provider(&store.load()).await?;
    } else {
        warn!("Skipping provider health check");
    }

    let config = CoordinatorConfig {
        watch: !once,
        ..CoordinatorConfig::default()
    };
    let (coordinator, mut events) = Coordinator::new(organizer_for(&store), config);
    coordinator.start(folders)?;

    if !once {
        info!("Watching for new screenshots. Press Ctrl+C to stop.");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let finished = matches!(event, CoordinatorEvent::Finished);
                print_event(event, quiet);
                if finished {
                    coordinator.wait().await;
                    break;
                }
            }
            _ = &mut shutdown => {
                match coordinator.stop().await {
                    StopOutcome::Forced => warn!("Stopped forcefully; an in-flight file may remain unprocessed"),
                    outcome => debug!("Stop outcome: {:?}", outcome),
                }
                break;
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        print_event(event, quiet);
    }

    info!("shotsort stopped.");
    Ok(())
}

fn print_event(event: CoordinatorEvent, quiet: bool) {
    match event {
        CoordinatorEvent::Progress(message) => {
            if !quiet {
                println!("{}", message);
            }
        }
        CoordinatorEvent::Error(message) => eprintln!("Error: {}", message),
        CoordinatorEvent::StatsUpdated(stats) => {
            debug!(
                "Stats: {} images, {} categories",
                stats.total_images_processed,
                stats.categories_created.len()
            );
        }
        CoordinatorEvent::Finished => {
            if !quiet {
                println!("Done.");
            }
        }
    }
}

/// Sweep one folder once
async fn run_organize(store: SettingsStore, path: PathBuf, format: &str) -> Result<()> {
    let organizer = organizer_for(&store);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.cancel();
    });

    let json = format == "json";
    let records: Mutex<Vec<serde_json::Value>> = Mutex::new(Vec::new());
    let on_event = |event: OrganizerEvent| match event {
        OrganizerEvent::Moved { file, destination, classification, .. } => {
            if json {
                let mut records = records.lock().unwrap_or_else(|e| e.into_inner());
                records.push(serde_json::json!({
                    "file": file,
                    "destination": destination,
                    "category": classification.category,
                    "subcategory": classification.subcategory,
                }));
            } else {
                println!("{} -> {}", file.display(), destination.display());
            }
        }
        OrganizerEvent::Failed { file, message } => {
            if json {
                let mut records = records.lock().unwrap_or_else(|e| e.into_inner());
                records.push(serde_json::json!({ "file": file, "error": message }));
            } else {
                eprintln!("Failed: {}: {}", file.display(), message);
            }
        }
    };

    let batch = organizer.organize(&path, &cancel, &on_event).await?;

    if json {
        let records = records.into_inner().unwrap_or_else(|e| e.into_inner());
        let output = serde_json::json!({
            "folder": path,
            "processed": batch.total_images_processed,
            "categories": batch.categories_created,
            "files": records,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "\nOrganized {} image(s) into {} categor{}",
            batch.total_images_processed,
            batch.categories_created.len(),
            if batch.categories_created.len() == 1 { "y" } else { "ies" }
        );
    }

    Ok(())
}

/// Classify a single image and print the result
async fn run_classify(store: SettingsStore, path: PathBuf) -> Result<()> {
    let classifier = Classifier::new(store);
    match classifier.classify(&path).await {
        Ok(result) => {
            println!("Category:    {}", result.category);
            println!("Subcategory: {}", result.subcategory);
            println!("Folder:      {}", result.folder_name());
            Ok(())
        }
        Err(e) => {
            if e.is_provider_failure() {
                eprintln!("Hint: run `shotsort status` to check the provider");
            }
            Err(e)
        }
    }
}

fn print_stats(stats: &Stats) {
    println!("shotsort statistics");
    println!("===================");
    println!("Images processed:   {}", stats.total_images_processed);
    match &stats.last_processed_date {
        Some(date) => println!("Last processed:     {}", date.format("%Y-%m-%d %H:%M:%S")),
        None => println!("Last processed:     never"),
    }
    println!("Categories created: {}", stats.categories_created.len());
    for category in &stats.categories_created {
        println!("  - {}", category);
    }
}

fn run_folders_command(store: &SettingsStore, action: FolderCommands) -> Result<()> {
    let list = FolderList::beside(store.path());

    match action {
        FolderCommands::List => {
            let folders = list.load();
            if folders.is_empty() {
                match default_screenshot_dir() {
                    Some(dir) => println!("No folders configured (default: {})", dir.display()),
                    None => println!("No folders configured"),
                }
            }
            for folder in folders {
                let marker = if folder.is_dir() { " " } else { "!" };
                println!("{} {}", marker, folder.display());
            }
        }
        FolderCommands::Add { path } => {
            if !path.is_dir() {
                warn!("{:?} does not exist yet", path);
            }
            if list.add(path.clone())? {
                println!("Added {}", path.display());
            } else {
                println!("{} is already watched", path.display());
            }
        }
        FolderCommands::Remove { path } => {
            if list.remove(&path)? {
                println!("Removed {}", path.display());
            } else {
                println!("{} was not in the list", path.display());
            }
        }
    }

    Ok(())
}

/// Run history commands
fn run_history_command(store: &SettingsStore, action: HistoryCommands) -> Result<()> {
    let history = history_for(store);

    match action {
        HistoryCommands::List { count } => {
            let entries = history.get_recent(count)?;
            println!("Recent moves ({} entries):", entries.len());
            for entry in entries {
                let status = if entry.undone { "[UNDONE]" } else { "" };
                println!(
                    "  {} [{}_{}] {} -> {} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.category,
                    entry.subcategory,
                    entry.original_path.display(),
                    entry.new_path.display(),
                    status
                );
            }
        }
        HistoryCommands::Undo { count, dry_run } => {
            let entries = history.get_undoable()?;
            let to_undo: Vec<_> = entries.into_iter().rev().take(count).collect();

            if to_undo.is_empty() {
                println!("No moves to undo");
                return Ok(());
            }

            for entry in to_undo {
                if dry_run {
                    println!(
                        "Would undo: {} -> {}",
                        entry.new_path.display(),
                        entry.original_path.display()
                    );
                    continue;
                }
                match history.undo(&entry)? {
                    UndoOutcome::Restored => println!(
                        "Undone: {} -> {}",
                        entry.new_path.display(),
                        entry.original_path.display()
                    ),
                    UndoOutcome::Missing => {
                        println!("Skipped (file missing): {}", entry.new_path.display())
                    }
                    UndoOutcome::Occupied => {
                        println!("Skipped (original path in use): {}", entry.original_path.display())
                    }
                }
            }
        }
        HistoryCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm clearing history");
                return Ok(());
            }
            history.clear()?;
            println!("History cleared");
        }
    }

    Ok(())
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        String::new()
    } else if chars.len() <= 4 {
        "****".to_string()
    } else {
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("****{}", tail)
    }
}

/// Run config commands
fn run_config_command(store: &SettingsStore, action: ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let mut settings = store.load();
            settings.cloud_api_key = mask_key(&settings.cloud_api_key);
            settings.local_api_key = mask_key(&settings.local_api_key);
            println!("# {}", store.path().display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommands::Generate { output } => {
            SettingsStore::new(&output).save(&Settings::default())?;
            println!("Generated settings at {:?}", output);
        }
        ConfigCommands::SetProvider { provider } => {
            let settings = store.update(|s| s.provider = provider)?;
            println!("Provider set to {}", settings.provider.label());
            if settings.provider == Provider::CloudApi && settings.cloud_key().trim().is_empty() {
                println!("Note: no Together AI API key configured yet");
            }
        }
    }

    Ok(())
}

/// Run status check
async fn run_status(store: &SettingsStore) -> Result<()> {
    let settings = store.load();

    println!("shotsort {} Status", env!("CARGO_PKG_VERSION"));
    println!("======================");
    println!("Provider: {}", settings.provider.label());
    println!("Model:    {}", settings.model);

    match settings.provider {
        Provider::CloudApi => {
            println!("Endpoint: {}", settings.cloud_url);
            let key = settings.cloud_key();
            if key.trim().is_empty() {
                println!("API key:  not set");
            } else {
                println!("API key:  {}", mask_key(&key));
            }
        }
        Provider::LocalApi => {
            println!("Endpoint: {}", settings.local_url);
            let key = Some(settings.local_api_key.as_str()).filter(|k| !k.trim().is_empty());
            let client = LocalProvider::new(&settings.local_url, &settings.model, key)?;
            match client.health_check().await {
                Ok(()) => println!("Ollama:   Running"),
                Err(e) => println!("Ollama:   Error - {}", e),
            }
            match client.list_models().await {
                Ok(models) => {
                    println!("\nAvailable models:");
                    for m in &models {
                        let marker = if m == &settings.model || m.starts_with(&format!("{}:", settings.model)) {
                            "→"
                        } else {
                            " "
                        };
                        println!("  {} {}", marker, m);
                    }
                }
                Err(e) => println!("  Error listing models: {}", e),
            }
        }
    }

    println!("\nSettings: {}", store.path().display());
    println!("Folders:");
    for folder in FolderList::beside(store.path()).load() {
        println!("  {}", folder.display());
    }

    Ok(())
}
