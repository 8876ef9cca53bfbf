// Capabilities the engine consumes from its host

use crate::events::{EventType, History};
use crate::runner::CommandOutcome;
use crate::types::ChoiceOption;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interactive input for `choose` and `prompt` steps
#[async_trait::async_trait]
pub trait PromptPort: Send + Sync {
    /// Ask the user to pick one of `options`
    async fn choose(&self, message: &str, options: &[ChoiceOption]) -> anyhow::Result<ChoiceOption>;

    /// Ask for free text, offering `default` when given
    async fn text(&self, message: &str, default: Option<&str>) -> anyhow::Result<String>;
}

/// Existence checks for `file` conditions
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// Checks paths on the local disk, relative to the process working directory
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }
}

/// Resolves relative paths against a root before delegating
pub struct RootedFileSystem<'a> {
    inner: &'a dyn FileSystem,
    root: Option<&'a Path>,
}

impl<'a> RootedFileSystem<'a> {
    pub fn new(inner: &'a dyn FileSystem, root: Option<&'a Path>) -> Self {
        Self { inner, root }
    }
}

impl FileSystem for RootedFileSystem<'_> {
    fn exists(&self, path: &str) -> bool {
        match self.root {
            Some(root) if Path::new(path).is_relative() => {
                let joined: PathBuf = root.join(path);
                self.inner.exists(&joined.to_string_lossy())
            }
            _ => self.inner.exists(path),
        }
    }
}

/// Persists the history of a finished run
#[async_trait::async_trait]
pub trait HistorySink: Send + Sync {
    async fn save(&self, history: &History) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Identifies a step in rendered output and failure messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLabel {
    /// Zero-based index among the top-level steps
    pub index: usize,
    /// Zero-based branch index inside a parallel step
    pub branch: Option<usize>,
    pub line: Option<usize>,
    pub kind: &'static str,
    /// Command or message shown to the user
    pub text: String,
    pub conditional: bool,
}

impl StepLabel {
    pub fn new(index: usize, kind: &'static str, text: impl Into<String>) -> Self {
        Self {
            index,
            branch: None,
            line: None,
            kind,
            text: text.into(),
            conditional: false,
        }
    }
}

impl std::fmt::Display for StepLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step {}", self.index + 1)?;
        if let Some(branch) = self.branch {
            write!(f, " → branch {}", branch + 1)?;
        }
        match self.line {
            Some(line) => write!(f, " (line {})", line),
            None => Ok(()),
        }
    }
}

/// Rendering hooks. Every method defaults to doing nothing.
pub trait ExecutionOutput: Send + Sync {
    fn step_started(&self, _label: &StepLabel) {}

    fn output_line(&self, _stream: OutputStream, _line: &str) {}

    fn step_finished(&self, _label: &StepLabel, _success: bool, _duration: Duration) {}

    /// Output of a command that ran in buffered mode, shown after it finished
    fn buffered_result(&self, _label: &StepLabel, _outcome: &CommandOutcome) {}

    fn step_skipped(&self, _label: &StepLabel) {}

    fn error(&self, _message: &str) {}

    fn parallel_started(&self, _label: &StepLabel, _branches: usize) {}

    fn parallel_finished(&self, _label: &StepLabel, _success: bool) {}

    fn total_duration(&self, _duration: Duration) {}

    fn timeline(&self, _history: &History) {}
}

/// Output that renders nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentOutput;

impl ExecutionOutput for SilentOutput {}

/// Output that forwards everything to `tracing`, for runs without a terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOutput;

impl ExecutionOutput for TracingOutput {
    fn step_started(&self, label: &StepLabel) {
        tracing::info!("{} started: {}", label, label.text);
    }

    fn output_line(&self, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => tracing::info!("│ {}", line),
            OutputStream::Stderr => tracing::warn!("│ {}", line),
        }
    }

    fn step_finished(&self, label: &StepLabel, success: bool, duration: Duration) {
        if success {
            tracing::info!("{} completed in {:?}", label, duration);
        } else {
            tracing::warn!("{} failed after {:?}", label, duration);
        }
    }

    fn buffered_result(&self, label: &StepLabel, outcome: &CommandOutcome) {
        self.step_started(label);
        for line in &outcome.stdout {
            self.output_line(OutputStream::Stdout, line);
        }
        for line in &outcome.stderr {
            self.output_line(OutputStream::Stderr, line);
        }
        self.step_finished(label, outcome.success, outcome.duration);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }

    fn total_duration(&self, duration: Duration) {
        tracing::info!("Total execution time: {:?}", duration);
    }

    fn timeline(&self, history: &History) {
        let failed = history
            .events
            .iter()
            .filter(|event| matches!(event.event_type, EventType::StepFailed { .. }))
            .count();
        tracing::info!(
            "Run {} finished: {} step result(s), {} failure(s)",
            history.run_id,
            history.step_results().count(),
            failed
        );
    }
}
