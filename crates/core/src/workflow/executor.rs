use super::condition::ConditionEvaluator;
use super::step_executor::{RetryBackoff, RunContext, RunRecorder, RunStepResult, StepExecutor};
use super::workspace::Workspace;
use crate::error::WorkflowError;
use crate::events::{EventType, History, ResolvedValue};
use crate::ports::{
    ExecutionOutput, FileSystem, HistorySink, LocalFileSystem, PromptPort, RootedFileSystem,
    StepLabel,
};
use crate::runner::{ShellTaskRunner, TaskRunner};
use crate::template;
use crate::types::*;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Index under which a parallel branch records its own step result
const BRANCH_INDEX_STRIDE: usize = 1000;

/// Per-execution inputs
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Values that answer `choose`/`prompt` steps without asking
    pub execution_vars: BTreeMap<String, String>,
}

impl ExecuteOptions {
    /// Profile variables of `workflow` overlaid with `overrides`; overrides win
    pub fn with_profile(
        workflow: &Workflow,
        profile: Option<&str>,
        overrides: BTreeMap<String, String>,
    ) -> Result<Self, WorkflowError> {
        let mut execution_vars = match profile {
            Some(name) => workflow.profile_vars(name)?,
            None => BTreeMap::new(),
        };
        execution_vars.extend(overrides);
        Ok(Self { execution_vars })
    }
}

/// Outcome of one workflow execution
#[derive(Debug, Clone)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration: Duration,
    pub workspace: Workspace,
    pub history: History,
}

impl Run {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Failure message, if the run failed
    pub fn failure(&self) -> Option<&str> {
        match &self.status {
            RunStatus::Failed { message } => Some(message),
            _ => None,
        }
    }
}

/// Why the step loop stopped early
enum Abort {
    Failed(String),
}

/// Read-only state shared by every step of one execution
struct RunScope<'a> {
    workflow: &'a Workflow,
    execution_vars: &'a BTreeMap<String, String>,
    working_dir: Option<&'a Path>,
    recorder: &'a RunRecorder,
}

/// Interprets a workflow step by step against one root workspace
pub struct WorkflowExecutor {
    prompt: Arc<dyn PromptPort>,
    output: Arc<dyn ExecutionOutput>,
    fs: Arc<dyn FileSystem>,
    step_executor: StepExecutor,
    history: Option<Arc<dyn HistorySink>>,
}

impl WorkflowExecutor {
    /// Executor running real shell commands and checking the local disk
    pub fn new(prompt: Arc<dyn PromptPort>, output: Arc<dyn ExecutionOutput>) -> Self {
        let runner: Arc<dyn TaskRunner> = Arc::new(ShellTaskRunner::new(output.clone()));
        Self {
            prompt,
            step_executor: StepExecutor::new(runner, output.clone(), RetryBackoff::default()),
            output,
            fs: Arc::new(LocalFileSystem),
            history: None,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.step_executor.runner = runner;
        self
    }

    pub fn with_file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_history(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history = Some(sink);
        self
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.step_executor.backoff = backoff;
        self
    }

    /// Execute a workflow and return the run.
    ///
    /// Step failures end the run with [`RunStatus::Failed`]; `Err` means the
    /// executor itself could not continue.
    pub async fn execute(&self, workflow: &Workflow, options: ExecuteOptions) -> Result<Run> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let started = Instant::now();
        let recorder = RunRecorder::new(run_id);

        tracing::info!(
            "Starting workflow execution: run_id={}, workflow={}",
            run_id,
            workflow.name.as_deref().unwrap_or("<unnamed>")
        );
        recorder.record(EventType::RunStarted {
            workflow_name: workflow.name.clone(),
            step_count: workflow.steps.len(),
        });

        let working_dir: Option<PathBuf> = workflow.working_dir();
        let scope = RunScope {
            workflow,
            execution_vars: &options.execution_vars,
            working_dir: working_dir.as_deref(),
            recorder: &recorder,
        };

        // Profile values and overrides are visible to every step from the start
        let mut workspace = Workspace::new();
        for (name, value) in &options.execution_vars {
            workspace.set_variable(name.clone(), value.clone());
        }
        let result = self.run_steps(&scope, &mut workspace).await;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        let status = match result {
            Ok(()) => {
                recorder.record(EventType::RunCompleted { duration_ms });
                tracing::info!("Workflow execution completed: run_id={}", run_id);
                RunStatus::Completed
            }
            Err(Abort::Failed(message)) => {
                recorder.record(EventType::RunFailed {
                    error: message.clone(),
                    duration_ms,
                });
                tracing::error!(
                    "Workflow execution failed: run_id={}, error={}",
                    run_id,
                    message
                );
                self.output.error(&message);
                RunStatus::Failed { message }
            }
        };

        self.output.total_duration(duration);
        let history = History {
            run_id,
            workflow_name: workflow.name.clone(),
            initial_timestamp: started_at,
            events: recorder.into_events(),
        };
        self.output.timeline(&history);

        if let Some(sink) = &self.history {
            if let Err(e) = sink.save(&history).await {
                tracing::warn!("Failed to save execution history: {:#}", e);
            }
        }

        Ok(Run {
            id: run_id,
            status,
            started_at,
            completed_at: Utc::now(),
            duration,
            workspace,
            history,
        })
    }

    async fn run_steps(&self, scope: &RunScope<'_>, workspace: &mut Workspace) -> Result<(), Abort> {
        for (index, step) in scope.workflow.steps.iter().enumerate() {
            let label = self.label(scope, step, index, None, workspace);

            if !self.should_run(scope, step, workspace) {
                tracing::debug!("Skipping {}: condition not met", label);
                self.output.step_skipped(&label);
                scope.recorder.record(EventType::StepSkipped {
                    step_index: index,
                    branch_index: None,
                });
                continue;
            }

            match &step.kind {
                StepKind::Run(run) => {
                    let ctx = RunContext {
                        label: label.clone(),
                        shell: scope.workflow.shell.as_deref(),
                        working_dir: scope.working_dir,
                    };
                    let result = self
                        .step_executor
                        .execute(run, &ctx, workspace, scope.recorder)
                        .await;
                    workspace.set_step_result(index, result.success, result.exit_code);
                    record_run_result(scope.recorder, &label, &result);

                    if !result.success && !run.continue_on_error {
                        return Err(Abort::Failed(format!("{} failed", label)));
                    }
                    if !result.success {
                        tracing::warn!("{} failed, continuing", label);
                    }
                }
                StepKind::Choose(choose) => {
                    self.choose(scope, choose, &label, workspace).await?;
                }
                StepKind::Prompt(prompt) => {
                    self.prompt(scope, prompt, &label, workspace).await?;
                }
                StepKind::Parallel(branches) => {
                    let success = self
                        .parallel(scope, branches, &label, workspace)
                        .await
                        .map_err(|e| Abort::Failed(format!("{} failed: {:#}", label, e)))?;
                    workspace.set_step_result(index, success, None);
                    if !success {
                        return Err(Abort::Failed(format!("{} failed", label)));
                    }
                }
                StepKind::Fail { message } => {
                    let message = template::substitute(message, workspace);
                    workspace.set_step_result(index, false, None);
                    scope.recorder.record(EventType::StepFailed {
                        step_index: index,
                        branch_index: None,
                        kind: "fail".to_string(),
                        resolved: None,
                        exit_code: None,
                        error: message.clone(),
                        duration_ms: 0,
                    });
                    return Err(Abort::Failed(message));
                }
            }
        }
        Ok(())
    }

    fn should_run(&self, scope: &RunScope<'_>, step: &Step, workspace: &Workspace) -> bool {
        let Some(condition) = &step.when else {
            return true;
        };
        let fs = RootedFileSystem::new(self.fs.as_ref(), scope.working_dir);
        ConditionEvaluator::new(workspace, &fs).evaluate(condition)
    }

    fn label(
        &self,
        scope: &RunScope<'_>,
        step: &Step,
        index: usize,
        branch: Option<usize>,
        workspace: &Workspace,
    ) -> StepLabel {
        let text = match &step.kind {
            StepKind::Run(run) => template::substitute(&run.command, workspace),
            StepKind::Choose(choose) => choose.message.clone(),
            StepKind::Prompt(prompt) => prompt.message.clone(),
            StepKind::Parallel(branches) => format!("{} branch(es)", branches.len()),
            StepKind::Fail { message } => message.clone(),
        };
        let mut label = StepLabel::new(index, step.kind.name(), text);
        label.branch = branch;
        label.line = scope.workflow.step_line(index);
        label.conditional = step.when.is_some();
        label
    }

    async fn choose(
        &self,
        scope: &RunScope<'_>,
        choose: &ChooseStep,
        label: &StepLabel,
        workspace: &mut Workspace,
    ) -> Result<(), Abort> {
        let started = Instant::now();
        let variable = choose.variable_name();

        let selected = match scope.execution_vars.get(variable) {
            Some(value) => {
                if !choose.options.iter().any(|option| &option.id == value) {
                    tracing::warn!(
                        "Value '{}' for '{}' is not one of the options of {}",
                        value,
                        variable,
                        label
                    );
                }
                tracing::info!("{}: using '{}' from execution variables", label, value);
                value.clone()
            }
            None => {
                let message = template::substitute(&choose.message, workspace);
                let option = self
                    .prompt
                    .choose(&message, &choose.options)
                    .await
                    .map_err(|e| self.prompt_failed(scope, label, started, e))?;
                option.id
            }
        };

        workspace.set_choice(selected.clone(), selected.clone());
        workspace.set_variable(variable, selected.clone());
        workspace.set_step_result(label.index, true, None);
        scope.recorder.record(EventType::StepCompleted {
            step_index: label.index,
            branch_index: None,
            kind: "choose".to_string(),
            resolved: Some(ResolvedValue::Choice(selected)),
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    async fn prompt(
        &self,
        scope: &RunScope<'_>,
        prompt: &PromptStep,
        label: &StepLabel,
        workspace: &mut Workspace,
    ) -> Result<(), Abort> {
        let started = Instant::now();

        let value = match scope.execution_vars.get(&prompt.store_as) {
            Some(value) => {
                tracing::info!("{}: using '{}' from execution variables", label, value);
                value.clone()
            }
            None => {
                let message = template::substitute(&prompt.message, workspace);
                let default = prompt
                    .default
                    .as_deref()
                    .map(|default| template::substitute(default, workspace));
                self.prompt
                    .text(&message, default.as_deref())
                    .await
                    .map_err(|e| self.prompt_failed(scope, label, started, e))?
            }
        };

        workspace.set_variable(prompt.store_as.clone(), value.clone());
        workspace.set_fact(prompt.store_as.clone(), value.clone());
        workspace.set_step_result(label.index, true, None);
        scope.recorder.record(EventType::StepCompleted {
            step_index: label.index,
            branch_index: None,
            kind: "prompt".to_string(),
            resolved: Some(ResolvedValue::Prompt(value)),
            exit_code: None,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(())
    }

    fn prompt_failed(
        &self,
        scope: &RunScope<'_>,
        label: &StepLabel,
        started: Instant,
        error: anyhow::Error,
    ) -> Abort {
        let error = format!("{:#}", error);
        scope.recorder.record(EventType::StepFailed {
            step_index: label.index,
            branch_index: None,
            kind: label.kind.to_string(),
            resolved: None,
            exit_code: None,
            error: error.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Abort::Failed(format!("{} failed: {}", label, error))
    }

    /// Run every branch to completion on its own workspace clone, then merge.
    /// Returns whether all branches succeeded.
    async fn parallel(
        &self,
        scope: &RunScope<'_>,
        branches: &[Step],
        label: &StepLabel,
        workspace: &mut Workspace,
    ) -> Result<bool> {
        let index = label.index;
        tracing::info!("{}: starting {} parallel branch(es)", label, branches.len());
        self.output.parallel_started(label, branches.len());
        scope.recorder.record(EventType::ParallelStarted {
            step_index: index,
            branches: branches.len(),
        });

        let snapshot = workspace.clone();
        let tasks = branches.iter().enumerate().map(|(branch, step)| {
            let branch_workspace = snapshot.clone();
            self.branch(scope, step, index, branch, branch_workspace)
        });
        let results = join_all(tasks).await;

        let mut success = true;
        for result in results {
            let (branch_success, branch_workspace) = result?;
            success &= branch_success;
            workspace.merge_from(&branch_workspace);
        }

        self.output.parallel_finished(label, success);
        scope.recorder.record(EventType::ParallelFinished {
            step_index: index,
            success,
        });
        Ok(success)
    }

    /// One branch; a skipped branch counts as a success
    async fn branch(
        &self,
        scope: &RunScope<'_>,
        step: &Step,
        index: usize,
        branch: usize,
        mut workspace: Workspace,
    ) -> Result<(bool, Workspace)> {
        let label = self.label(scope, step, index, Some(branch), &workspace);

        if !self.should_run(scope, step, &workspace) {
            self.output.step_skipped(&label);
            scope.recorder.record(EventType::StepSkipped {
                step_index: index,
                branch_index: Some(branch),
            });
            return Ok((true, workspace));
        }

        let branch_slot = index * BRANCH_INDEX_STRIDE + branch;
        match &step.kind {
            StepKind::Run(run) => {
                let ctx = RunContext {
                    label: label.clone(),
                    shell: scope.workflow.shell.as_deref(),
                    working_dir: scope.working_dir,
                };
                let result = self
                    .step_executor
                    .execute(run, &ctx, &mut workspace, scope.recorder)
                    .await;
                workspace.set_step_result(branch_slot, result.success, result.exit_code);
                record_run_result(scope.recorder, &label, &result);
                Ok((result.success || run.continue_on_error, workspace))
            }
            StepKind::Fail { message } => {
                let message = template::substitute(message, &workspace);
                tracing::warn!("{}: {}", label, message);
                workspace.set_step_result(branch_slot, false, None);
                scope.recorder.record(EventType::StepFailed {
                    step_index: index,
                    branch_index: Some(branch),
                    kind: "fail".to_string(),
                    resolved: None,
                    exit_code: None,
                    error: message,
                    duration_ms: 0,
                });
                Ok((false, workspace))
            }
            other => bail!("'{}' step cannot run inside a parallel block", other.name()),
        }
    }
}

fn record_run_result(recorder: &RunRecorder, label: &StepLabel, result: &RunStepResult) {
    let resolved = Some(ResolvedValue::Command(result.command.clone()));
    let duration_ms = result.duration.as_millis() as u64;
    let event = match &result.error {
        None => EventType::StepCompleted {
            step_index: label.index,
            branch_index: label.branch,
            kind: "run".to_string(),
            resolved,
            exit_code: result.exit_code,
            duration_ms,
        },
        Some(error) => EventType::StepFailed {
            step_index: label.index,
            branch_index: label.branch,
            kind: "run".to_string(),
            resolved,
            exit_code: result.exit_code,
            error: error.clone(),
            duration_ms,
        },
    };
    recorder.record(event);
}
