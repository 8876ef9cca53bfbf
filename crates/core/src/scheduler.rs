use crate::daemon::DaemonManager;
use crate::error::ScheduleError;
use crate::storage::ScheduleStore;
use crate::timezone::{next_fire, parse_cron, resolve_timezone, ScheduleZone};
use crate::types::{RunStatus, Schedule};
use crate::workflow::executor::{ExecuteOptions, WorkflowExecutor};
use crate::workflow::parser::load_workflow;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Grace period between SIGTERM and SIGKILL when stopping the daemon
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Builds a fresh executor for every scheduled run
pub trait ExecutorFactory: Send + Sync {
    fn create_executor(&self, silent: bool) -> WorkflowExecutor;
}

/// Display hooks for scheduler progress. Every method defaults to doing nothing.
pub trait SchedulerOutput: Send + Sync {
    fn scheduler_starting(&self, _daemon_mode: bool) {}

    fn no_enabled_schedules(&self) {}

    fn schedule_registered(&self, _schedule: &Schedule, _zone: ScheduleZone, _next: Option<DateTime<Utc>>) {}

    fn schedule_rejected(&self, _schedule_id: &str, _reason: &str) {}

    fn scheduler_started(&self, _daemon_mode: bool, _pid: u32) {}

    fn run_started(&self, _name: &str, _profile: Option<&str>) {}

    fn run_completed(&self, _name: &str) {}

    fn run_failed(&self, _name: &str, _error: &str) {}

    fn scheduler_stopping(&self, _daemon_mode: bool) {}
}

/// Scheduler output that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSchedulerOutput;

impl SchedulerOutput for TracingSchedulerOutput {
    fn schedule_registered(&self, schedule: &Schedule, zone: ScheduleZone, next: Option<DateTime<Utc>>) {
        tracing::info!(
            "Registered schedule {} ({}, {}), next run {:?}",
            schedule.display_name(),
            schedule.cron,
            zone,
            next
        );
    }

    fn schedule_rejected(&self, schedule_id: &str, reason: &str) {
        tracing::warn!("Schedule {} not registered: {}", schedule_id, reason);
    }

    fn run_failed(&self, name: &str, error: &str) {
        tracing::error!("Scheduled workflow {} failed: {}", name, error);
    }
}

/// Hooks invoked while `start` registers schedules
#[derive(Default)]
pub struct StartOptions {
    pub on_schedule_started: Option<Box<dyn Fn(&Schedule) + Send + Sync>>,
}

/// Result of registering the enabled schedules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    pub registered: Vec<String>,
    /// Schedule id and the reason it was not registered
    pub rejected: Vec<(String, String)>,
}

/// Shared state a schedule task needs to run its workflow
#[derive(Clone)]
struct RunDeps {
    store: Arc<ScheduleStore>,
    factory: Arc<dyn ExecutorFactory>,
    output: Arc<dyn SchedulerOutput>,
}

/// Runs enabled schedules on their cron triggers, one tokio task per schedule
pub struct WorkflowScheduler {
    deps: RunDeps,
    daemon: DaemonManager,
    running_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    shutting_down: AtomicBool,
}

impl WorkflowScheduler {
    pub fn new(
        store: Arc<ScheduleStore>,
        daemon: DaemonManager,
        factory: Arc<dyn ExecutorFactory>,
        output: Arc<dyn SchedulerOutput>,
    ) -> Self {
        Self {
            deps: RunDeps {
                store,
                factory,
                output,
            },
            daemon,
            running_tasks: Arc::new(Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Register every enabled schedule.
    ///
    /// Fails when another live process owns the daemon PID file. In daemon
    /// mode this process records itself as the daemon.
    pub fn start(&self, daemon_mode: bool, options: StartOptions) -> Result<StartReport, ScheduleError> {
        if let Some(pid) = self.daemon.pid()? {
            if pid != std::process::id() {
                return Err(ScheduleError::AlreadyRunning { pid });
            }
        }

        self.deps.output.scheduler_starting(daemon_mode);
        if daemon_mode {
            self.daemon.save_pid()?;
        }

        let report = self.reload(&options)?;
        tracing::info!(
            "Scheduler started: {} registered, {} rejected",
            report.registered.len(),
            report.rejected.len()
        );
        self.deps
            .output
            .scheduler_started(daemon_mode, std::process::id());
        Ok(report)
    }

    /// Replace every running task with tasks for the currently enabled schedules
    pub fn reload(&self, options: &StartOptions) -> Result<StartReport, ScheduleError> {
        self.stop_tasks();

        let schedules: Vec<Schedule> = self
            .deps
            .store
            .load()?
            .into_iter()
            .filter(|schedule| schedule.enabled)
            .collect();
        if schedules.is_empty() {
            self.deps.output.no_enabled_schedules();
        }

        let mut report = StartReport::default();
        for schedule in schedules {
            match self.register(&schedule) {
                Ok(()) => {
                    if let Some(callback) = &options.on_schedule_started {
                        callback(&schedule);
                    }
                    report.registered.push(schedule.id.clone());
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.deps.output.schedule_rejected(&schedule.id, &reason);
                    report.rejected.push((schedule.id.clone(), reason));
                }
            }
        }
        Ok(report)
    }

    fn register(&self, schedule: &Schedule) -> Result<(), ScheduleError> {
        let cron = parse_cron(&schedule.cron)?;
        let zone = resolve_timezone(schedule.timezone.as_deref())?;
        let first = next_fire(&cron, zone, Utc::now());
        self.deps.output.schedule_registered(schedule, zone, first);

        let deps = self.deps.clone();
        let schedule_for_task = schedule.clone();
        let handle = tokio::spawn(async move {
            let schedule = schedule_for_task;
            loop {
                let Some(next_run) = next_fire(&cron, zone, Utc::now()) else {
                    tracing::warn!(
                        "Schedule {} has no future fire times, stopping",
                        schedule.display_name()
                    );
                    break;
                };

                let wait = (next_run - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!("Schedule {} sleeping {:?}", schedule.display_name(), wait);
                tokio::time::sleep(wait).await;

                run_schedule(&deps, &schedule).await;
            }
        });

        let mut tasks = self
            .running_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = tasks.insert(schedule.id.clone(), handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Ids of schedules with a live task
    pub fn active_schedules(&self) -> Vec<String> {
        let tasks = self
            .running_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<String> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn stop_tasks(&self) {
        let mut tasks = self
            .running_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// Abort every task; in daemon mode also remove the PID files.
    /// Only the first call does anything.
    pub fn shutdown(&self, daemon_mode: bool) -> Result<(), ScheduleError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.deps.output.scheduler_stopping(daemon_mode);
        self.stop_tasks();
        if daemon_mode {
            self.daemon.remove_pid()?;
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Stop a daemon running in another process. `false` if none was running.
    pub async fn stop_daemon(&self) -> Result<bool, ScheduleError> {
        self.daemon.stop(STOP_GRACE).await
    }
}

/// One scheduled run. Failures are reported, never propagated.
async fn run_schedule(deps: &RunDeps, schedule: &Schedule) {
    let name = schedule.display_name().to_string();
    let silent = schedule.is_silent();
    tracing::info!("Running scheduled workflow {}", name);
    if !silent {
        deps.output.run_started(&name, schedule.profile.as_deref());
    }

    match execute_schedule(deps, schedule).await {
        Ok(RunStatus::Completed) => {
            if let Err(e) = deps.store.update_last_run(&schedule.id, Utc::now()) {
                tracing::warn!("Failed to record last run of {}: {}", name, e);
            }
            tracing::info!("Scheduled workflow {} completed", name);
            if !silent {
                deps.output.run_completed(&name);
            }
        }
        Ok(RunStatus::Failed { message }) => report_failure(deps, &name, silent, &message),
        Ok(RunStatus::Running) => {}
        Err(e) => report_failure(deps, &name, silent, &format!("{:#}", e)),
    }
}

async fn execute_schedule(deps: &RunDeps, schedule: &Schedule) -> anyhow::Result<RunStatus> {
    let workflow = load_workflow(&schedule.workflow_path)
        .with_context(|| format!("Failed to load {}", schedule.workflow_path.display()))?;
    let options = ExecuteOptions::with_profile(
        &workflow,
        schedule.profile.as_deref(),
        BTreeMap::new(),
    )?;

    let executor = deps.factory.create_executor(schedule.is_silent());
    let run = executor.execute(&workflow, options).await?;
    Ok(run.status)
}

fn report_failure(deps: &RunDeps, name: &str, silent: bool, error: &str) {
    tracing::error!("Scheduled workflow {} failed: {}", name, error);
    if !silent {
        deps.output.run_failed(name, error);
    }
}

/// Resolves on the first SIGINT or SIGTERM. Once the handlers are installed,
/// later signals no longer terminate the process.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                    _ = terminate.recv() => tracing::info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl-C");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::StatePaths;
    use crate::ports::{ExecutionOutput, PromptPort, SilentOutput};
    use crate::runner::{CommandOutcome, CommandRequest, TaskRunner};
    use crate::types::{ChoiceOption, NewSchedule};
    use tempfile::TempDir;

    struct NoPrompt;

    #[async_trait::async_trait]
    impl PromptPort for NoPrompt {
        async fn choose(&self, _message: &str, _options: &[ChoiceOption]) -> anyhow::Result<ChoiceOption> {
            anyhow::bail!("scheduled runs cannot prompt")
        }

        async fn text(&self, _message: &str, _default: Option<&str>) -> anyhow::Result<String> {
            anyhow::bail!("scheduled runs cannot prompt")
        }
    }

    #[derive(Default)]
    struct CountingRunner(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl TaskRunner for CountingRunner {
        async fn run(&self, request: &CommandRequest) -> CommandOutcome {
            self.0.lock().unwrap().push(request.command.clone());
            CommandOutcome {
                success: !request.command.contains("fail"),
                exit_code: Some(0),
                ..Default::default()
            }
        }
    }

    struct TestFactory {
        runner: Arc<CountingRunner>,
        silent_requests: Mutex<Vec<bool>>,
    }

    impl ExecutorFactory for TestFactory {
        fn create_executor(&self, silent: bool) -> WorkflowExecutor {
            self.silent_requests.lock().unwrap().push(silent);
            let output: Arc<dyn ExecutionOutput> = Arc::new(SilentOutput);
            WorkflowExecutor::new(Arc::new(NoPrompt), output).with_runner(self.runner.clone())
        }
    }

    #[derive(Default)]
    struct RecordingOutput {
        completed: Mutex<Vec<String>>,
        failed: Mutex<Vec<(String, String)>>,
    }

    impl SchedulerOutput for RecordingOutput {
        fn run_completed(&self, name: &str) {
            self.completed.lock().unwrap().push(name.to_string());
        }

        fn run_failed(&self, name: &str, error: &str) {
            self.failed
                .lock()
                .unwrap()
                .push((name.to_string(), error.to_string()));
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        dir: std::path::PathBuf,
        store: Arc<ScheduleStore>,
        factory: Arc<TestFactory>,
        output: Arc<RecordingOutput>,
        scheduler: WorkflowScheduler,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let paths = StatePaths::new(&dir);
        let store = Arc::new(ScheduleStore::new(paths.schedules_file.clone()));
        let factory = Arc::new(TestFactory {
            runner: Arc::new(CountingRunner::default()),
            silent_requests: Mutex::new(Vec::new()),
        });
        let output = Arc::new(RecordingOutput::default());
        let scheduler = WorkflowScheduler::new(
            store.clone(),
            DaemonManager::new(&paths),
            factory.clone(),
            output.clone(),
        );
        Fixture {
            _temp_dir: temp_dir,
            dir,
            store,
            factory,
            output,
            scheduler,
        }
    }

    fn add(fixture: &Fixture, name: &str, cron: &str, workflow: &str) -> Schedule {
        let path = fixture.dir.join(format!("{}.yaml", name));
        std::fs::write(&path, workflow).unwrap();
        fixture
            .store
            .add(NewSchedule {
                name: Some(name.to_string()),
                workflow_path: path,
                cron: cron.to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_valid_and_reports_invalid() {
        let f = fixture();
        let good = add(&f, "good", "0 3 * * *", "steps:\n  - run: echo\n");
        let bad = add(&f, "bad", "not a cron", "steps:\n  - run: echo\n");
        let disabled = add(&f, "off", "0 4 * * *", "steps:\n  - run: echo\n");
        f.store.toggle(&disabled.id).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        let options = StartOptions {
            on_schedule_started: Some(Box::new(move |schedule: &Schedule| {
                seen_in_callback.lock().unwrap().push(schedule.id.clone());
            })),
        };

        let report = f.scheduler.start(false, options).unwrap();

        assert_eq!(report.registered, vec![good.id.clone()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, bad.id);
        assert_eq!(*seen.lock().unwrap(), vec![good.id.clone()]);
        assert_eq!(f.scheduler.active_schedules(), vec![good.id]);

        f.scheduler.shutdown(false).unwrap();
        f.scheduler.shutdown(false).unwrap();
    }

    #[tokio::test]
    async fn test_run_schedule_records_last_run_on_success() {
        let f = fixture();
        let schedule = add(&f, "nightly", "0 3 * * *", "steps:\n  - run: echo nightly\n");

        run_schedule(&f.scheduler.deps, &schedule).await;

        assert_eq!(*f.factory.runner.0.lock().unwrap(), vec!["echo nightly"]);
        assert!(f.store.get(&schedule.id).unwrap().unwrap().last_run.is_some());
        assert_eq!(*f.output.completed.lock().unwrap(), vec!["nightly"]);
    }

    #[tokio::test]
    async fn test_run_schedule_failure_is_reported_not_recorded() {
        let f = fixture();
        let failing = add(&f, "failing", "0 3 * * *", "steps:\n  - run: will fail\n");
        let mut missing = add(&f, "missing", "0 3 * * *", "steps:\n  - run: echo\n");
        missing.workflow_path = f.dir.join("gone.yaml");

        run_schedule(&f.scheduler.deps, &failing).await;
        run_schedule(&f.scheduler.deps, &missing).await;

        assert!(f.store.get(&failing.id).unwrap().unwrap().last_run.is_none());
        let failed = f.output.failed.lock().unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].1, "Step 1 (line 2) failed");
        assert!(failed[1].1.starts_with("Failed to load"));
    }

    #[tokio::test]
    async fn test_profile_is_applied_to_scheduled_runs() {
        let f = fixture();
        let workflow = "profiles:\n  - name: Prod\n    var:\n      env: prod\nsteps:\n  - prompt:\n      message: env?\n      as: env\n  - run: deploy {{env}}\n";
        let mut schedule = add(&f, "deploy", "0 3 * * *", workflow);
        schedule.profile = Some("Prod".to_string());
        schedule.silent = Some(true);

        run_schedule(&f.scheduler.deps, &schedule).await;

        assert_eq!(*f.factory.runner.0.lock().unwrap(), vec!["deploy prod"]);
        assert_eq!(*f.factory.silent_requests.lock().unwrap(), vec![true]);
        assert!(f.output.completed.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_daemon_mode_saves_and_removes_pid() {
        let f = fixture();
        let daemon = DaemonManager::new(&StatePaths::new(&f.dir));

        f.scheduler.start(true, StartOptions::default()).unwrap();
        assert_eq!(daemon.pid().unwrap(), Some(std::process::id()));

        f.scheduler.shutdown(true).unwrap();
        assert_eq!(daemon.pid().unwrap(), None);
    }

    #[tokio::test]
    async fn test_stop_daemon_without_daemon() {
        let f = fixture();
        assert!(!f.scheduler.stop_daemon().await.unwrap());
    }
}
