// Lifecycle of the detached scheduler daemon: PID files, liveness and spawning

use crate::error::ScheduleError;
use crate::paths::{StatePaths, DAEMON_MODE_ENV};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

type Result<T> = std::result::Result<T, ScheduleError>;

/// Snapshot of the daemon as seen from another process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
}

impl DaemonStatus {
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.start_time.map(|started| now - started)
    }
}

/// Handle on a daemon spawned by this process, used to reap it if it dies
/// before the launcher exits
#[derive(Debug)]
pub struct DaemonChild {
    child: std::process::Child,
}

impl DaemonChild {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Exit status once the process has ended; reaps it on the first call
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("Could not check daemon process {}: {}", self.child.id(), e);
                None
            }
        }
    }
}

impl From<std::process::Child> for DaemonChild {
    fn from(child: std::process::Child) -> Self {
        Self { child }
    }
}

/// Reads and writes the daemon's state files
#[derive(Debug, Clone)]
pub struct DaemonManager {
    pid_file: PathBuf,
    start_time_file: PathBuf,
    error_log: PathBuf,
}

impl DaemonManager {
    pub fn new(paths: &StatePaths) -> Self {
        Self {
            pid_file: paths.pid_file(),
            start_time_file: paths.start_time_file(),
            error_log: paths.error_log(),
        }
    }

    /// PID of a live daemon. An unparsable or stale PID file is removed.
    pub fn pid(&self) -> Result<Option<u32>> {
        let content = match std::fs::read_to_string(&self.pid_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ScheduleError::io(&self.pid_file, e)),
        };

        match content.trim().parse::<u32>() {
            Ok(pid) if is_process_alive(pid) => Ok(Some(pid)),
            Ok(pid) => {
                tracing::info!("Removing stale PID file for process {}", pid);
                remove_if_exists(&self.pid_file)?;
                Ok(None)
            }
            Err(_) => {
                tracing::warn!("Removing unparsable PID file {}", self.pid_file.display());
                remove_if_exists(&self.pid_file)?;
                Ok(None)
            }
        }
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.pid()?.is_some())
    }

    /// Record this process as the daemon, with the current time as its start
    pub fn save_pid(&self) -> Result<()> {
        if let Some(dir) = self.pid_file.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ScheduleError::io(dir, e))?;
        }
        std::fs::write(&self.pid_file, std::process::id().to_string())
            .map_err(|e| ScheduleError::io(&self.pid_file, e))?;
        std::fs::write(&self.start_time_file, Utc::now().to_rfc3339())
            .map_err(|e| ScheduleError::io(&self.start_time_file, e))?;
        Ok(())
    }

    pub fn remove_pid(&self) -> Result<()> {
        remove_if_exists(&self.pid_file)?;
        remove_if_exists(&self.start_time_file)
    }

    /// Start time from the start-time file, else the PID file's mtime
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let recorded = std::fs::read_to_string(&self.start_time_file)
            .ok()
            .and_then(|content| DateTime::parse_from_rfc3339(content.trim()).ok())
            .map(|time| time.with_timezone(&Utc));
        recorded.or_else(|| {
            std::fs::metadata(&self.pid_file)
                .and_then(|meta| meta.modified())
                .ok()
                .map(DateTime::<Utc>::from)
        })
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        let pid = self.pid()?;
        Ok(DaemonStatus {
            running: pid.is_some(),
            pid,
            start_time: pid.and_then(|_| self.start_time()),
        })
    }

    /// Append a timestamped line to the error log
    pub fn write_error(&self, message: &str) -> Result<()> {
        if let Some(dir) = self.error_log.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ScheduleError::io(dir, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_log)
            .map_err(|e| ScheduleError::io(&self.error_log, e))?;
        writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), message)
            .map_err(|e| ScheduleError::io(&self.error_log, e))
    }

    /// Error log contents, if any were written
    pub fn read_error_log(&self) -> Option<String> {
        std::fs::read_to_string(&self.error_log)
            .ok()
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
    }

    pub fn clear_error_log(&self) -> Result<()> {
        remove_if_exists(&self.error_log)
    }

    /// Re-run the current executable with `args` as a detached daemon
    pub fn spawn_background(&self, args: &[String]) -> Result<DaemonChild> {
        let exe = std::env::current_exe().map_err(|e| ScheduleError::io("current executable", e))?;
        let mut command = std::process::Command::new(&exe);
        command
            .args(args)
            .env(DAEMON_MODE_ENV, "true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| ScheduleError::io(&exe, e))?;
        tracing::info!("Spawned scheduler daemon with PID {}", child.id());
        Ok(DaemonChild::from(child))
    }

    /// Poll until a live daemon PID appears. Gives up early once `child`
    /// has exited, reaping it so its PID no longer looks alive.
    pub async fn wait_until_running(
        &self,
        child: &mut DaemonChild,
        attempts: u32,
        interval: Duration,
    ) -> Option<u32> {
        for _ in 0..attempts {
            tokio::time::sleep(interval).await;
            if let Some(status) = child.exit_status() {
                tracing::debug!("Daemon process {} exited during startup: {}", child.id(), status);
                return None;
            }
            match self.pid() {
                Ok(Some(pid)) => return Some(pid),
                Ok(None) => {}
                Err(e) => tracing::debug!("Could not read daemon PID: {}", e),
            }
        }
        None
    }

    /// Stop the daemon: SIGTERM, then SIGKILL if it outlives `grace`.
    /// Returns `false` when no daemon was running.
    pub async fn stop(&self, grace: Duration) -> Result<bool> {
        let Some(pid) = self.pid()? else {
            return Ok(false);
        };

        tracing::info!("Stopping scheduler daemon (PID: {})", pid);
        send_signal(pid, Termination::Graceful);
        tokio::time::sleep(grace).await;
        if is_process_alive(pid) {
            tracing::warn!("Daemon {} ignored SIGTERM, sending SIGKILL", pid);
            send_signal(pid, Termination::Forced);
        }

        self.remove_pid()?;
        Ok(true)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ScheduleError::io(path, e)),
    }
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Graceful,
    Forced,
}

/// Signal-0 liveness check. A process we may not signal still exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, termination: Termination) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match termination {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), signal) {
        tracing::debug!("Failed to send {:?} to {}: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, termination: Termination) {
    tracing::warn!("Cannot send {:?} to {} on this platform", termination, pid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> DaemonManager {
        DaemonManager::new(&StatePaths::new(dir.path()))
    }

    #[test]
    fn test_no_pid_file_means_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = manager(&temp_dir);
        assert_eq!(daemon.pid().unwrap(), None);
        assert!(!daemon.status().unwrap().running);
    }

    #[cfg(unix)]
    #[test]
    fn test_save_pid_reports_current_process() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = manager(&temp_dir);

        daemon.save_pid().unwrap();
        let status = daemon.status().unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));
        let started = status.start_time.unwrap();
        assert!(status.uptime(Utc::now()).unwrap() >= chrono::Duration::zero());
        assert!(started <= Utc::now());

        daemon.remove_pid().unwrap();
        assert_eq!(daemon.pid().unwrap(), None);
        daemon.remove_pid().unwrap();
    }

    #[test]
    fn test_unparsable_pid_file_is_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let paths = StatePaths::new(temp_dir.path());
        std::fs::create_dir_all(&paths.daemon_dir).unwrap();
        std::fs::write(paths.pid_file(), "not-a-pid").unwrap();

        let daemon = DaemonManager::new(&paths);
        assert_eq!(daemon.pid().unwrap(), None);
        assert!(!paths.pid_file().exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_pid_file_is_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let paths = StatePaths::new(temp_dir.path());
        std::fs::create_dir_all(&paths.daemon_dir).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        std::fs::write(paths.pid_file(), pid.to_string()).unwrap();

        let daemon = DaemonManager::new(&paths);
        assert_eq!(daemon.pid().unwrap(), None);
        assert!(!paths.pid_file().exists());
    }

    #[test]
    fn test_start_time_falls_back_to_pid_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let paths = StatePaths::new(temp_dir.path());
        std::fs::create_dir_all(&paths.daemon_dir).unwrap();
        std::fs::write(paths.pid_file(), "1").unwrap();

        let daemon = DaemonManager::new(&paths);
        assert!(daemon.start_time().is_some());

        std::fs::write(paths.start_time_file(), "2024-01-02T03:04:05Z").unwrap();
        assert_eq!(
            daemon.start_time().unwrap().to_rfc3339(),
            "2024-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn test_error_log_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let daemon = manager(&temp_dir);
        assert!(daemon.read_error_log().is_none());

        daemon.write_error("first failure").unwrap();
        daemon.write_error("second failure").unwrap();
        let log = daemon.read_error_log().unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.lines().next().unwrap().ends_with("first failure"));

        daemon.clear_error_log().unwrap();
        assert!(daemon.read_error_log().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_gives_up_when_child_exits() {
        let temp_dir = TempDir::new().unwrap();
        let paths = StatePaths::new(temp_dir.path());
        std::fs::create_dir_all(&paths.daemon_dir).unwrap();

        let mut child = DaemonChild::from(std::process::Command::new("true").spawn().unwrap());
        std::fs::write(paths.pid_file(), child.id().to_string()).unwrap();
        let daemon = DaemonManager::new(&paths);

        let found = daemon
            .wait_until_running(&mut child, 3, Duration::from_millis(100))
            .await;
        assert_eq!(found, None);
        assert!(child.exit_status().is_some());
        assert_eq!(daemon.pid().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_without_daemon_returns_false() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!manager(&temp_dir).stop(Duration::from_millis(10)).await.unwrap());
    }
}
