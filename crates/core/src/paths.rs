use std::path::{Path, PathBuf};

/// Overrides the state directory
pub const HOME_ENV: &str = "PIPELINER_HOME";

/// Set to `true` in the environment of a detached scheduler daemon
pub const DAEMON_MODE_ENV: &str = "PIPELINER_DAEMON_MODE";

const STATE_DIR_NAME: &str = ".pipeliner";

/// Locations of everything the runner persists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
    pub history_dir: PathBuf,
    pub schedules_file: PathBuf,
    pub daemon_dir: PathBuf,
}

impl StatePaths {
    /// Default layout beneath `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            history_dir: root.join("history"),
            schedules_file: root.join("schedules.json"),
            daemon_dir: root.join("daemon"),
            root,
        }
    }

    /// `$PIPELINER_HOME`, else `~/.pipeliner`
    pub fn from_env() -> Self {
        Self::new(default_root())
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.daemon_dir.join("scheduler.pid")
    }

    pub fn start_time_file(&self) -> PathBuf {
        self.daemon_dir.join("scheduler.started")
    }

    pub fn error_log(&self) -> PathBuf {
        self.daemon_dir.join("daemon-error.log")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.daemon_dir.join("scheduler.log")
    }
}

fn default_root() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return PathBuf::from(home);
    }
    let user_home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new(".").to_path_buf());
    user_home.join(STATE_DIR_NAME)
}

/// Whether this process was started as the detached scheduler daemon
pub fn is_daemon_process() -> bool {
    std::env::var(DAEMON_MODE_ENV)
        .map(|value| value == "true")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_beneath_root() {
        let paths = StatePaths::new("/state");
        assert_eq!(paths.history_dir, PathBuf::from("/state/history"));
        assert_eq!(paths.schedules_file, PathBuf::from("/state/schedules.json"));
        assert_eq!(paths.pid_file(), PathBuf::from("/state/daemon/scheduler.pid"));
        assert_eq!(paths.start_time_file(), PathBuf::from("/state/daemon/scheduler.started"));
        assert_eq!(paths.error_log(), PathBuf::from("/state/daemon/daemon-error.log"));
        assert_eq!(paths.config_file(), PathBuf::from("/state/config.toml"));
    }
}
