// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Move journal for undo support

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::classifier::Classification;
use crate::Result;

/// File name of the journal inside the app data directory
pub const HISTORY_FILE: &str = "move_history.jsonl";

/// A single move in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub original_path: PathBuf,
    pub new_path: PathBuf,
    pub category: String,
    pub subcategory: String,
    pub undone: bool,
}

/// Outcome of undoing one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    Restored,
    /// The moved file no longer exists
    Missing,
    /// Something else now occupies the original path
    Occupied,
}

/// Append-only JSONL journal of moves
pub struct History {
    path: PathBuf,
    // Serializes appends from concurrent organizers sharing one journal
    write_lock: Mutex<()>,
}

impl History {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Append an entry to the journal
    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Read all journal entries
    pub fn read_all(&self) -> Result<Vec<HistoryEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Failed to parse history entry: {}", e);
                }
            }
        }

        Ok(entries)
    }

    /// Get the most recent N entries (newest first)
    pub fn get_recent(&self, count: usize) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        entries.truncate(count);
        Ok(entries)
    }

    /// Mark an entry as undone
    pub fn mark_undone(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let entries = self.read_all()?;

        // Rewrite into a sibling file and swap it in, so a crash leaves the old journal intact
        let tmp = self.temp_path();
        {
            let mut writer = std::io::BufWriter::new(File::create(&tmp)?);
            for mut entry in entries {
                if entry.id == id {
                    entry.undone = true;
                }
                let json = serde_json::to_string(&entry)?;
                writeln!(writer, "{}", json)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| HISTORY_FILE.to_string());
        self.path.with_file_name(format!(".{}.tmp", file_name))
    }

    /// Get entries that haven't been undone (oldest first)
    pub fn get_undoable(&self) -> Result<Vec<HistoryEntry>> {
        let entries = self.read_all()?;
        Ok(entries.into_iter().filter(|e| !e.undone).collect())
    }

    /// Move a file back to where it was found and mark the entry undone
    pub fn undo(&self, entry: &HistoryEntry) -> Result<UndoOutcome> {
        if !entry.new_path.exists() {
            warn!("File not found (may have been moved/deleted): {:?}", entry.new_path);
            return Ok(UndoOutcome::Missing);
        }
        if entry.original_path.exists() {
            warn!("Original path is occupied: {:?}", entry.original_path);
            return Ok(UndoOutcome::Occupied);
        }

        fs::rename(&entry.new_path, &entry.original_path)?;
        self.mark_undone(&entry.id)?;
        info!("Undone: {:?} -> {:?}", entry.new_path, entry.original_path);
        Ok(UndoOutcome::Restored)
    }

    /// Clear the journal
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Create a new journal entry
pub fn create_entry(
    id: String,
    original_path: PathBuf,
    new_path: PathBuf,
    classification: Classification,
) -> HistoryEntry {
    HistoryEntry {
        id,
        timestamp: Utc::now(),
        original_path,
        new_path,
        category: classification.category,
        subcategory: classification.subcategory,
        undone: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(dir: &Path, id: &str) -> HistoryEntry {
        create_entry(
            id.to_string(),
            dir.join(format!("{}.png", id)),
            dir.join("code_rust").join(format!("{}_20240101_000000.png", id)),
            Classification::new("code", "rust"),
        )
    }

    #[test]
    fn test_append_and_recent() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));

        history.append(&entry(dir.path(), "a")).unwrap();
        history.append(&entry(dir.path(), "b")).unwrap();
        history.append(&entry(dir.path(), "c")).unwrap();

        let recent = history.get_recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "c");
        assert_eq!(recent[1].id, "b");
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));
        history.append(&entry(dir.path(), "a")).unwrap();

        let mut file = OpenOptions::new().append(true).open(history.path()).unwrap();
        writeln!(file, "{{ broken").unwrap();

        assert_eq!(history.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_restores_file() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));
        let e = entry(dir.path(), "shot");

        fs::create_dir_all(e.new_path.parent().unwrap()).unwrap();
        fs::write(&e.new_path, b"png").unwrap();
        history.append(&e).unwrap();

        assert_eq!(history.undo(&e).unwrap(), UndoOutcome::Restored);
        assert!(e.original_path.exists());
        assert!(!e.new_path.exists());
        assert!(history.get_undoable().unwrap().is_empty());
    }

    #[test]
    fn test_undo_refuses_occupied_original() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));
        let e = entry(dir.path(), "shot");

        fs::create_dir_all(e.new_path.parent().unwrap()).unwrap();
        fs::write(&e.new_path, b"moved").unwrap();
        fs::write(&e.original_path, b"newer").unwrap();
        history.append(&e).unwrap();

        assert_eq!(history.undo(&e).unwrap(), UndoOutcome::Occupied);
        assert_eq!(fs::read(&e.original_path).unwrap(), b"newer");
        assert_eq!(history.get_undoable().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_missing_file() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));
        let e = entry(dir.path(), "gone");
        history.append(&e).unwrap();

        assert_eq!(history.undo(&e).unwrap(), UndoOutcome::Missing);
    }

    #[test]
    fn test_mark_undone_swaps_journal_in_place() {
        let dir = TempDir::new().unwrap();
        let history = History::new(dir.path().join(HISTORY_FILE));
        history.append(&entry(dir.path(), "a")).unwrap();
        history.append(&entry(dir.path(), "b")).unwrap();

        history.mark_undone("a").unwrap();

        assert!(!history.temp_path().exists());
        let entries = history.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].undone);
        assert!(!entries[1].undone);
        assert_eq!(history.get_undoable().unwrap()[0].id, "b");
    }
}
