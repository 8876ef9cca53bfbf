use super::capture::parse_capture;
use super::workspace::Workspace;
use crate::events::{Event, EventType};
use crate::ports::{ExecutionOutput, StepLabel};
use crate::runner::{CommandOutcome, CommandRequest, OutputMode, TaskRunner};
use crate::template;
use crate::types::{Retry, RunId, RunStep};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Delay schedule between retry attempts: `base * 2^(n-1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        }
    }
}

impl RetryBackoff {
    /// No waiting between attempts
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before the `retry`-th retry (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Collects the events of one run. Shared by concurrently running branches.
pub struct RunRecorder {
    run_id: RunId,
    events: Mutex<Vec<Event>>,
}

impl RunRecorder {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn record(&self, event_type: EventType) {
        let event = Event::new(self.run_id, event_type);
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Where and how a run step executes
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub label: StepLabel,
    /// Workflow-level shell, overridden by the step's own
    pub shell: Option<&'a [String]>,
    pub working_dir: Option<&'a Path>,
}

/// Result of a run step after retries and fallbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStepResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Main command after template substitution
    pub command: String,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Executes `run` steps: retries, the `onError` chain and captures
pub struct StepExecutor {
    pub(crate) runner: Arc<dyn TaskRunner>,
    output: Arc<dyn ExecutionOutput>,
    pub(crate) backoff: RetryBackoff,
}

impl StepExecutor {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        output: Arc<dyn ExecutionOutput>,
        backoff: RetryBackoff,
    ) -> Self {
        Self {
            runner,
            output,
            backoff,
        }
    }

    /// Execute a run step against `workspace`. Failures are returned as values.
    pub async fn execute(
        &self,
        step: &RunStep,
        ctx: &RunContext<'_>,
        workspace: &mut Workspace,
        recorder: &RunRecorder,
    ) -> RunStepResult {
        let started = Instant::now();
        let command = template::substitute(&step.command, workspace);
        for name in template::unresolved_parameters(&step.command, workspace) {
            tracing::debug!("Template variable '{}' is not set, left as is", name);
        }

        // Captures need the whole stdout, and branch output must not interleave
        let mode = if !step.captures.is_empty() || ctx.label.branch.is_some() {
            OutputMode::Buffered
        } else {
            OutputMode::Realtime
        };

        let mut label = ctx.label.clone();
        label.text = command.clone();
        let request = CommandRequest {
            command: command.clone(),
            shell: step.shell.as_deref().or(ctx.shell).map(<[String]>::to_vec),
            working_dir: ctx.working_dir.map(Path::to_path_buf),
            timeout: step.timeout,
            mode,
            label,
        };

        tracing::info!("Executing {}: {}", ctx.label, command);
        let mut outcome = self.attempt(&request, step.retry, recorder).await;

        if outcome.success {
            self.apply_captures(step, &outcome, workspace);
        } else {
            let mut level = 0;
            let mut next = step.on_error.as_deref();
            while let Some(fallback) = next {
                level += 1;
                let fallback_command = template::substitute(&fallback.command, workspace);
                tracing::info!(
                    "{} failed, running fallback {}: {}",
                    ctx.label,
                    level,
                    fallback_command
                );
                recorder.record(EventType::FallbackStarted {
                    step_index: ctx.label.index,
                    branch_index: ctx.label.branch,
                    level,
                    command: fallback_command.clone(),
                });

                let mut request = request.clone();
                request.command = fallback_command.clone();
                request.timeout = fallback.timeout;
                request.label.text = fallback_command;

                outcome = self.attempt(&request, fallback.retry, recorder).await;
                if outcome.success {
                    break;
                }
                next = fallback.on_error.as_deref();
            }
        }

        RunStepResult {
            success: outcome.success,
            exit_code: outcome.exit_code,
            command,
            error: (!outcome.success).then(|| failure_reason(&outcome)),
            duration: started.elapsed(),
        }
    }

    /// Run one command, retrying while `retry` allows
    async fn attempt(
        &self,
        request: &CommandRequest,
        retry: Retry,
        recorder: &RunRecorder,
    ) -> CommandOutcome {
        let mut retries = 0u32;
        loop {
            let outcome = self.runner.run(request).await;
            if request.mode == OutputMode::Buffered {
                self.output.buffered_result(&request.label, &outcome);
            }
            if outcome.success || !retry.allows(retries) {
                return outcome;
            }

            retries = retries.saturating_add(1);
            let delay = self.backoff.delay(retries);
            tracing::info!(
                "Retrying {} after {:?} (retry {})",
                request.label,
                delay,
                retries
            );
            recorder.record(EventType::StepRetried {
                step_index: request.label.index,
                branch_index: request.label.branch,
                attempt: retries,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn apply_captures(&self, step: &RunStep, outcome: &CommandOutcome, workspace: &mut Workspace) {
        for rule in &step.captures {
            match parse_capture(&rule.capture, &outcome.stdout) {
                Some(value) => workspace.set_variable(rule.store_as.clone(), value),
                None => tracing::debug!("Capture '{}' matched nothing", rule.store_as),
            }
        }
    }
}

fn failure_reason(outcome: &CommandOutcome) -> String {
    if outcome.timed_out {
        if let Some(line) = outcome.stderr.last() {
            return line.clone();
        }
    }
    match outcome.exit_code {
        Some(code) => format!("Command exited with code {}", code),
        None => outcome
            .stderr
            .last()
            .cloned()
            .unwrap_or_else(|| "Command failed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SilentOutput;
    use crate::types::{Capture, CaptureRule, OnError};
    use std::collections::HashMap;

    /// Answers commands from a script; unknown commands succeed with no output
    #[derive(Default)]
    struct ScriptedRunner {
        results: Mutex<HashMap<String, Vec<CommandOutcome>>>,
        calls: Mutex<Vec<CommandRequest>>,
    }

    impl ScriptedRunner {
        fn script(&self, command: &str, outcomes: Vec<CommandOutcome>) {
            self.results
                .lock()
                .unwrap()
                .insert(command.to_string(), outcomes);
        }

        fn commands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|request| request.command.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn run(&self, request: &CommandRequest) -> CommandOutcome {
            self.calls.lock().unwrap().push(request.clone());
            let mut results = self.results.lock().unwrap();
            match results.get_mut(&request.command) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) if !queue.is_empty() => queue[0].clone(),
                _ => ok(&[]),
            }
        }
    }

    fn ok(stdout: &[&str]) -> CommandOutcome {
        CommandOutcome {
            success: true,
            exit_code: Some(0),
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn failed(code: i32) -> CommandOutcome {
        CommandOutcome {
            success: false,
            exit_code: Some(code),
            ..Default::default()
        }
    }

    fn executor(runner: Arc<ScriptedRunner>) -> StepExecutor {
        StepExecutor::new(runner, Arc::new(SilentOutput), RetryBackoff::none())
    }

    fn context() -> RunContext<'static> {
        RunContext {
            label: StepLabel::new(0, "run", ""),
            shell: None,
            working_dir: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay(4), Duration::from_millis(8000));
        assert_eq!(backoff.delay(5), Duration::from_millis(10_000));
        assert_eq!(backoff.delay(200), Duration::from_millis(10_000));
        assert_eq!(RetryBackoff::none().delay(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_substitutes_variables_and_uses_workflow_shell() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut workspace = Workspace::new();
        workspace.set_variable("env", "prod");
        let shell = vec!["bash".to_string(), "-c".to_string()];
        let ctx = RunContext {
            shell: Some(&shell),
            ..context()
        };
        let recorder = RunRecorder::new(RunId::new());

        let result = executor(runner.clone())
            .execute(&RunStep::new("deploy {{ env }} {{missing}}"), &ctx, &mut workspace, &recorder)
            .await;

        assert!(result.success);
        assert_eq!(result.command, "deploy prod {{missing}}");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].shell.as_deref(), Some(shell.as_slice()));
        assert_eq!(calls[0].mode, OutputMode::Realtime);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.script("flaky", vec![failed(1), failed(1), ok(&[])]);
        let mut step = RunStep::new("flaky");
        step.retry = Retry::Count(3);
        let recorder = RunRecorder::new(RunId::new());

        let result = executor(runner.clone())
            .execute(&step, &context(), &mut Workspace::new(), &recorder)
            .await;

        assert!(result.success);
        assert_eq!(runner.commands().len(), 3);
        let retried = recorder
            .into_events()
            .iter()
            .filter(|e| matches!(e.event_type, EventType::StepRetried { .. }))
            .count();
        assert_eq!(retried, 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.script("broken", vec![failed(2)]);
        let mut step = RunStep::new("broken");
        step.retry = Retry::Count(2);

        let result = executor(runner.clone())
            .execute(&step, &context(), &mut Workspace::new(), &RunRecorder::new(RunId::new()))
            .await;

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.error.as_deref(), Some("Command exited with code 2"));
        assert_eq!(runner.commands(), vec!["broken", "broken", "broken"]);
    }

    #[tokio::test]
    async fn test_on_error_chain_walks_until_success() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.script("main", vec![failed(1)]);
        runner.script("first", vec![failed(1)]);
        runner.script("second", vec![ok(&[])]);

        let mut step = RunStep::new("main");
        step.on_error = Some(Box::new(OnError {
            command: "first".to_string(),
            timeout: None,
            retry: Retry::Count(1),
            on_error: Some(Box::new(OnError {
                command: "second".to_string(),
                timeout: Some(Duration::from_secs(5)),
                retry: Retry::default(),
                on_error: Some(Box::new(OnError {
                    command: "never".to_string(),
                    timeout: None,
                    retry: Retry::default(),
                    on_error: None,
                })),
            })),
        }));

        let result = executor(runner.clone())
            .execute(&step, &context(), &mut Workspace::new(), &RunRecorder::new(RunId::new()))
            .await;

        assert!(result.success);
        assert_eq!(runner.commands(), vec!["main", "first", "first", "second"]);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[3].timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_captures_applied_on_success_only() {
        let runner = Arc::new(ScriptedRunner::default());
        runner.script("version", vec![ok(&["v=1.2.3", "done"])]);
        runner.script("bad", vec![failed(1)]);

        let mut step = RunStep::new("version");
        step.captures = vec![
            CaptureRule {
                store_as: "version".to_string(),
                capture: Capture::Regex {
                    pattern: r"v=(\S+)".to_string(),
                },
            },
            CaptureRule {
                store_as: "absent".to_string(),
                capture: Capture::After {
                    marker: "nope".to_string(),
                },
            },
        ];
        let mut workspace = Workspace::new();
        let exec = executor(runner.clone());
        let recorder = RunRecorder::new(RunId::new());

        exec.execute(&step, &context(), &mut workspace, &recorder).await;
        assert_eq!(workspace.variable("version"), Some("1.2.3"));
        assert!(!workspace.has_variable("absent"));
        assert_eq!(runner.calls.lock().unwrap()[0].mode, OutputMode::Buffered);

        step.command = "bad".to_string();
        step.captures[0].store_as = "other".to_string();
        exec.execute(&step, &context(), &mut workspace, &recorder).await;
        assert!(!workspace.has_variable("other"));
    }

    #[tokio::test]
    async fn test_branch_steps_run_buffered() {
        let runner = Arc::new(ScriptedRunner::default());
        let mut label = StepLabel::new(1, "run", "");
        label.branch = Some(0);
        let ctx = RunContext {
            label,
            ..context()
        };

        executor(runner.clone())
            .execute(&RunStep::new("echo"), &ctx, &mut Workspace::new(), &RunRecorder::new(RunId::new()))
            .await;

        assert_eq!(runner.calls.lock().unwrap()[0].mode, OutputMode::Buffered);
    }
}
