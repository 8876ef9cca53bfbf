use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed { message: String },
}

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

/// A parsed workflow definition
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    pub name: Option<String>,
    /// Working directory for every command, relative to the workflow file
    pub base_dir: Option<PathBuf>,
    /// Program and leading arguments used to run commands
    pub shell: Option<Vec<String>>,
    pub profiles: Vec<Profile>,
    pub steps: Vec<Step>,
    pub source: WorkflowSource,
}

/// Where a workflow came from. Only used for diagnostics and path resolution.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowSource {
    pub file_name: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Zero-based step index to one-based source line
    pub step_lines: BTreeMap<usize, usize>,
}

/// A named bundle of variables for unattended runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub when: Option<Condition>,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Run(RunStep),
    Choose(ChooseStep),
    Prompt(PromptStep),
    Parallel(Vec<Step>),
    Fail { message: String },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Run(_) => "run",
            StepKind::Choose(_) => "choose",
            StepKind::Prompt(_) => "prompt",
            StepKind::Parallel(_) => "parallel",
            StepKind::Fail { .. } => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunStep {
    pub command: String,
    pub timeout: Option<Duration>,
    pub retry: Retry,
    pub shell: Option<Vec<String>>,
    pub continue_on_error: bool,
    pub on_error: Option<Box<OnError>>,
    pub captures: Vec<CaptureRule>,
}

impl RunStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
            retry: Retry::default(),
            shell: None,
            continue_on_error: false,
            on_error: None,
            captures: Vec::new(),
        }
    }
}

/// One fallback level of an `onError` chain
#[derive(Debug, Clone, PartialEq)]
pub struct OnError {
    pub command: String,
    pub timeout: Option<Duration>,
    pub retry: Retry,
    pub on_error: Option<Box<OnError>>,
}

/// How many extra attempts a failing command gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Count(u32),
    Forever,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::Count(0)
    }
}

impl Retry {
    /// Whether another attempt is allowed after `retries_made` retries
    pub fn allows(&self, retries_made: u32) -> bool {
        match self {
            Retry::Count(max) => retries_made < *max,
            Retry::Forever => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChooseStep {
    pub message: String,
    pub options: Vec<ChoiceOption>,
    pub store_as: Option<String>,
}

impl ChooseStep {
    /// Variable the selected id is stored under
    pub fn variable_name(&self) -> &str {
        self.store_as.as_deref().unwrap_or(DEFAULT_CHOICE_VARIABLE)
    }
}

/// Variable name used by a `choose` step without `as`
pub const DEFAULT_CHOICE_VARIABLE: &str = "choice";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptStep {
    pub message: String,
    pub store_as: String,
    pub default: Option<String>,
}

/// Derived status of a fact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactStatus {
    Ready,
    Failed,
    Pending,
}

/// Predicate over a workspace, used by `when`
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    FileExists { path: String },
    Var(VarCheck),
    HasVar { name: String },
    FactStatus { fact: String, expected: FactStatus },
    LastStep { success: bool },
    ChoiceMade { option_id: String },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarCheck {
    /// `var: name`
    Exists(String),
    /// `var: {name: value, ...}`, every pair must match
    Equals(BTreeMap<String, String>),
}

/// Extraction rule applied to a step's stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRule {
    pub store_as: String,
    pub capture: Capture,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    Full,
    Regex { pattern: String },
    JsonPath { expr: String },
    YamlPath { expr: String },
    KeyValue { key: String },
    After { marker: String },
    Before { marker: String },
    Between { after: String, before: String },
    LineRange { from: i64, to: i64 },
}

/// A persisted binding of a cron expression to a workflow file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub workflow_path: PathBuf,
    pub cron: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

impl Schedule {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn is_silent(&self) -> bool {
        self.silent.unwrap_or(false)
    }
}

/// Fields needed to create a schedule; id and timestamps are assigned on add
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewSchedule {
    pub name: Option<String>,
    pub workflow_path: PathBuf,
    pub cron: String,
    pub timezone: Option<String>,
    pub silent: Option<bool>,
    pub profile: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_allows() {
        assert!(!Retry::Count(0).allows(0));
        assert!(Retry::Count(2).allows(1));
        assert!(!Retry::Count(2).allows(2));
        assert!(Retry::Forever.allows(u32::MAX));
    }

    #[test]
    fn test_choose_variable_defaults_to_choice() {
        let step = ChooseStep {
            message: "env?".to_string(),
            options: vec![],
            store_as: None,
        };
        assert_eq!(step.variable_name(), "choice");
    }

    #[test]
    fn test_schedule_serializes_camel_case() {
        let schedule = Schedule {
            id: "abcd1234".to_string(),
            name: Some("nightly".to_string()),
            workflow_path: PathBuf::from("/tmp/wf.yaml"),
            cron: "0 2 * * *".to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
            timezone: Some("+9".to_string()),
            silent: None,
            profile: None,
        };

        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["workflowPath"], "/tmp/wf.yaml");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("lastRun").is_none());

        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }
}
