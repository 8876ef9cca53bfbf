use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a workflow definition
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Unsupported file format: {path}. Use .yaml, .yml or .json")]
    UnsupportedFormat { path: PathBuf },

    #[error("Invalid {format} format: {message}")]
    Format {
        format: &'static str,
        message: String,
    },

    #[error("Invalid workflow structure:\n{}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Profile \"{name}\" requested but workflow has no \"profiles\" defined")]
    NoProfiles { name: String },

    #[error("Profile \"{name}\" not found. Available profile(s): {available}")]
    ProfileNotFound { name: String, available: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One structural problem found in a workflow or schedule file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub message: String,
    /// Location such as `step 2 → parallel branch 1`
    pub location: Option<String>,
    pub reason: Option<String>,
}

impl ValidationIssue {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            reason: None,
        }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "  - {}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, " ({})", location)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, "\n    Reason: {}", reason)?;
        }
        Ok(())
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised by the schedule store, scheduler and daemon manager
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression \"{expression}\": {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid timezone \"{0}\". Use an IANA name or a UTC offset between -12 and +14")]
    InvalidTimezone(String),

    #[error("Schedule not found: {0}")]
    NotFound(String),

    #[error("Workflow file not found: {0}")]
    WorkflowNotFound(PathBuf),

    #[error("Scheduler daemon is already running (PID: {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Scheduler daemon failed to start{}", .log.as_deref().map(|l| format!(":\n{l}")).unwrap_or_default())]
    DaemonStartFailed { log: Option<String> },

    #[error("Invalid schedule file: {0}")]
    InvalidFile(String),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScheduleError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
