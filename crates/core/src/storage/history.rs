use crate::events::History;
use crate::ports::HistorySink;
use anyhow::{bail, Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};

const FILE_PREFIX: &str = "workflow-";
const FILE_SUFFIX: &str = ".json";

/// A stored history file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub file_name: String,
    pub path: PathBuf,
}

/// Execution history as one pretty-printed JSON file per run
pub struct JsonHistoryStore {
    base_path: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Format: workflow-YYYY-MM-DD_HH-mm-ss-xxxx.json, in local time
    fn file_name_for(history: &History) -> String {
        let stamp = history
            .initial_timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d_%H-%M-%S");
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(4).collect();
        format!("{}{}-{}{}", FILE_PREFIX, stamp, suffix, FILE_SUFFIX)
    }

    /// Write a history file and return its path
    pub async fn write(&self, history: &History) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .context("Failed to create history directory")?;

        let path = self.base_path.join(Self::file_name_for(history));
        let json = serde_json::to_vec_pretty(history).context("Failed to serialize history")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write history file {}", path.display()))?;

        tracing::debug!("Saved execution history to {}", path.display());
        Ok(path)
    }

    /// Stored history files, newest first
    pub async fn list(&self) -> Result<Vec<HistoryEntry>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_path)
            .await
            .context("Failed to read history directory")?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .context("Failed to read history entry")?
        {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with(FILE_PREFIX) && file_name.ends_with(FILE_SUFFIX) {
                entries.push(HistoryEntry {
                    path: entry.path(),
                    file_name,
                });
            }
        }

        // The timestamp in the name sorts chronologically
        entries.sort_by(|a, b| b.file_name.cmp(&a.file_name));
        Ok(entries)
    }

    pub async fn load(&self, file_name: &str) -> Result<History> {
        let path = self.entry_path(file_name)?;
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read history file {}", path.display()))?;
        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse history file {}", path.display()))
    }

    /// Delete one history file; `false` if it did not exist
    pub async fn remove(&self, file_name: &str) -> Result<bool> {
        let path = self.entry_path(file_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Path of a stored file; only bare file names inside the history directory resolve
    fn entry_path(&self, file_name: &str) -> Result<PathBuf> {
        let bare = Path::new(file_name).file_name().and_then(|name| name.to_str());
        if bare != Some(file_name) || file_name.contains(['/', '\\']) || file_name == ".." {
            bail!("Invalid history file name: {}", file_name);
        }
        Ok(self.base_path.join(file_name))
    }

    /// Delete every history file and return how many were removed
    pub async fn clear(&self) -> Result<usize> {
        let entries = self.list().await?;
        let mut removed = 0;
        for entry in entries {
            if self.remove(&entry.file_name).await? {
                removed += 1;
            }
        }
        tracing::info!("Removed {} history file(s)", removed);
        Ok(removed)
    }
}

#[async_trait::async_trait]
impl HistorySink for JsonHistoryStore {
    async fn save(&self, history: &History) -> Result<()> {
        self.write(history).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventType};
    use crate::types::RunId;
    use tempfile::TempDir;

    fn history(name: &str, offset_secs: i64) -> History {
        let run_id = RunId::new();
        let mut history = History::new(run_id, Some(name.to_string()));
        history.initial_timestamp += chrono::Duration::seconds(offset_secs);
        history.events.push(Event::new(
            run_id,
            EventType::RunCompleted { duration_ms: 5 },
        ));
        history
    }

    #[tokio::test]
    async fn test_write_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonHistoryStore::new(temp_dir.path().join("history"));

        let original = history("build", 0);
        let path = store.write(&original).await.unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(file_name.starts_with("workflow-"));
        assert!(file_name.ends_with(".json"));
        // workflow- + 19 timestamp chars + - + 4 random chars + .json
        assert_eq!(file_name.len(), 9 + 19 + 1 + 4 + 5);

        let loaded = store.load(&file_name).await.unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_ignores_other_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonHistoryStore::new(temp_dir.path());

        let old = store.write(&history("old", -3600)).await.unwrap();
        let new = store.write(&history("new", 0)).await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "x").unwrap();

        let entries = store.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, new);
        assert_eq!(entries[1].path, old);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonHistoryStore::new(temp_dir.path());

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.clear().await.unwrap(), 0);

        let path = store.write(&history("a", 0)).await.unwrap();
        store.write(&history("b", 10)).await.unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();

        assert!(store.remove(&file_name).await.unwrap());
        assert!(!store.remove(&file_name).await.unwrap());
        assert_eq!(store.clear().await.unwrap(), 1);
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_names_outside_history_dir_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonHistoryStore::new(temp_dir.path().join("history"));
        store.write(&history("kept", 0)).await.unwrap();
        let outside = temp_dir.path().join("schedules.json");
        std::fs::write(&outside, "{}").unwrap();

        for name in ["../schedules.json", "..", "sub/file.json", "a\\b.json", ""] {
            let err = store.remove(name).await.unwrap_err();
            assert!(err.to_string().contains("Invalid history file name"), "{}", name);
            assert!(store.load(name).await.is_err());
        }
        let absolute = outside.to_string_lossy().into_owned();
        assert!(store.remove(&absolute).await.is_err());

        assert!(outside.exists());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sink_save_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonHistoryStore::new(temp_dir.path());
        let sink: &dyn HistorySink = &store;

        sink.save(&history("sink", 0)).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
