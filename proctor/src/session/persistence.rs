// Local journal of in-progress attempts
// One JSON file per (test, student) under $STATE_DIR/journal, written atomically
// while holding an exclusive lock on the directory's lock file

use crate::session::protocol::Violation;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".journal.lock";

/// What survives a restart of the hosting process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub test_id: String,
    pub student_id: String,
    /// Countdown anchor, already shifted back by earlier elapsed time
    pub started_at_epoch_ms: i64,
    pub duration_seconds: u64,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

/// Journal directory handle
#[derive(Debug, Clone)]
pub struct SessionJournal {
    dir: PathBuf,
}

impl SessionJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Journal file for one attempt; ids are hashed so they never hit the filesystem raw
    pub fn entry_path(&self, test_id: &str, student_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(test_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(student_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.dir.join(format!("{}.json", &digest[..32]))
    }

    /// Load the entry for this attempt, if one exists
    pub fn load(&self, test_id: &str, student_id: &str) -> Result<Option<JournalEntry>> {
        let path = self.entry_path(test_id, student_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read journal entry: {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(None);
        }

        let entry: JournalEntry = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse journal entry: {}", path.display()))?;

        // Hash collision or a hand-edited file
        if entry.test_id != test_id || entry.student_id != student_id {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Write the entry atomically under the journal lock
    pub fn save(&self, entry: &JournalEntry) -> Result<()> {
        let _lock = self.lock()?;
        let path = self.entry_path(&entry.test_id, &entry.student_id);
        let contents =
            serde_json::to_string_pretty(entry).with_context(|| "Failed to serialize journal entry")?;
        replace_entry_file(&path, &contents)
    }

    /// Forget an attempt; missing entries are fine
    pub fn remove(&self, test_id: &str, student_id: &str) -> Result<()> {
        let _lock = self.lock()?;
        let path = self.entry_path(test_id, student_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove journal entry: {}", path.display())),
        }
    }

    fn lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create journal directory: {}", self.dir.display())
        })?;

        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open journal lock: {}", path.display()))?;

        // Released when the file is dropped
        file.lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on journal")?;
        Ok(file)
    }
}

/// Stage next to the entry, then rename over it; readers see the old or new file, never half of one
fn replace_entry_file(path: &Path, contents: &str) -> Result<()> {
    let staged = path.with_extension(format!("json.{}.partial", std::process::id()));
    fs::write(&staged, contents)
        .with_context(|| format!("Failed to stage journal entry: {}", staged.display()))?;
    fs::rename(&staged, path)
        .with_context(|| format!("Failed to move journal entry into place: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::ViolationType;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(test_id: &str, student_id: &str) -> JournalEntry {
        JournalEntry {
            test_id: test_id.to_string(),
            student_id: student_id.to_string(),
            started_at_epoch_ms: 1_700_000_000_000,
            duration_seconds: 3600,
            violations: vec![Violation::new(ViolationType::TabSwitch, "hidden", Utc::now())],
        }
    }

    #[test]
    fn test_journal_roundtrip() {
        let temp = TempDir::new().unwrap();
        let journal = SessionJournal::new(temp.path().join("journal"));

        assert_eq!(journal.load("t-1", "s-1").unwrap(), None);

        let saved = entry("t-1", "s-1");
        journal.save(&saved).unwrap();
        assert_eq!(journal.load("t-1", "s-1").unwrap(), Some(saved));
        assert_eq!(journal.load("t-1", "s-2").unwrap(), None);
    }

    #[test]
    fn test_entry_path_is_hashed_and_distinct() {
        let journal = SessionJournal::new("/tmp/j");
        let a = journal.entry_path("t-1", "s-1");
        let b = journal.entry_path("t-1", "s-2");
        let c = journal.entry_path("t-1s", "-1");

        assert_ne!(a, b);
        assert_ne!(a, c);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains("t-1"));
        assert_eq!(name.len(), 32 + ".json".len());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let journal = SessionJournal::new(temp.path());

        journal.save(&entry("t-1", "s-1")).unwrap();
        journal.remove("t-1", "s-1").unwrap();
        journal.remove("t-1", "s-1").unwrap();
        assert_eq!(journal.load("t-1", "s-1").unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let temp = TempDir::new().unwrap();
        let journal = SessionJournal::new(temp.path());
        fs::write(journal.entry_path("t-1", "s-1"), "{not json").unwrap();
        assert!(journal.load("t-1", "s-1").is_err());
    }

    #[test]
    fn test_rewrite_leaves_no_staging_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry.json");

        replace_entry_file(&path, "{\"a\":1}").unwrap();
        replace_entry_file(&path, "{\"a\":2}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("entry.json")]);
    }
}
