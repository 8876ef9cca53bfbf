use crate::error::ScheduleError;
use crate::types::{NewSchedule, Schedule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

type Result<T> = std::result::Result<T, ScheduleError>;

/// Serializes read-modify-write cycles of every store in this process
static WRITE_LOCK: Mutex<()> = Mutex::new(());

fn write_lock() -> MutexGuard<'static, ()> {
    WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleDocument {
    #[serde(default)]
    schedules: Vec<Schedule>,
}

/// Schedule records persisted as a single JSON document
pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records; a missing file reads as empty
    pub fn load(&self) -> Result<Vec<Schedule>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ScheduleError::io(&self.path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let document: ScheduleDocument = serde_json::from_str(&content)?;
        Ok(document.schedules)
    }

    /// Replace every record. Writes to a uniquely named sibling file and
    /// renames it into place, so readers only ever see a complete document.
    pub fn save(&self, schedules: &[Schedule]) -> Result<()> {
        let _guard = write_lock();
        self.write(schedules)
    }

    fn write(&self, schedules: &[Schedule]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScheduleError::io(parent, e))?;
        }

        let document = ScheduleDocument {
            schedules: schedules.to_vec(),
        };
        let json = serde_json::to_string_pretty(&document)?;
        let staging = self.staging_path();
        let written = std::fs::write(&staging, json)
            .map_err(|e| ScheduleError::io(&staging, e))
            .and_then(|_| {
                std::fs::rename(&staging, &self.path).map_err(|e| ScheduleError::io(&self.path, e))
            });
        if written.is_err() {
            let _ = std::fs::remove_file(&staging);
        }
        written
    }

    fn staging_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "schedules.json".to_string());
        self.path.with_file_name(format!(
            ".{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    /// Persist a new enabled record with a fresh id
    pub fn add(&self, new: NewSchedule) -> Result<Schedule> {
        let _guard = write_lock();
        let mut schedules = self.load()?;
        let schedule = Schedule {
            id: generate_id(&schedules),
            name: new.name,
            workflow_path: new.workflow_path,
            cron: new.cron,
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
            timezone: new.timezone,
            silent: new.silent,
            profile: new.profile,
        };
        schedules.push(schedule.clone());
        self.write(&schedules)?;

        tracing::info!("Added schedule {} ({})", schedule.id, schedule.cron);
        Ok(schedule)
    }

    /// Delete a record; `false` if no record has that id
    pub fn remove(&self, id: &str) -> Result<bool> {
        let _guard = write_lock();
        let mut schedules = self.load()?;
        let before = schedules.len();
        schedules.retain(|schedule| schedule.id != id);
        if schedules.len() == before {
            return Ok(false);
        }
        self.write(&schedules)?;
        tracing::info!("Removed schedule {}", id);
        Ok(true)
    }

    /// Flip `enabled` and return the updated record
    pub fn toggle(&self, id: &str) -> Result<Schedule> {
        let _guard = write_lock();
        let mut schedules = self.load()?;
        let schedule = schedules
            .iter_mut()
            .find(|schedule| schedule.id == id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        schedule.enabled = !schedule.enabled;
        let updated = schedule.clone();
        self.write(&schedules)?;
        Ok(updated)
    }

    pub fn update_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let _guard = write_lock();
        let mut schedules = self.load()?;
        let schedule = schedules
            .iter_mut()
            .find(|schedule| schedule.id == id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        schedule.last_run = Some(at);
        self.write(&schedules)
    }

    pub fn get(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.load()?.into_iter().find(|schedule| schedule.id == id))
    }
}

/// First 8 hex chars of a v4 UUID, regenerated on the unlikely collision
fn generate_id(existing: &[Schedule]) -> String {
    loop {
        let id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        if !existing.iter().any(|schedule| schedule.id == id) {
            return id;
        }
    }
}
