use crate::config::CliConfig;
use crate::console::{ConsoleOutput, StdinPrompt};
use crate::RunArgs;
use anyhow::Result;
use pipeliner_core::ports::{ExecutionOutput, SilentOutput};
use pipeliner_core::storage::JsonHistoryStore;
use pipeliner_core::workflow::{load_workflow, ExecuteOptions, WorkflowExecutor};
use std::process::ExitCode;
use std::sync::Arc;

pub async fn execute(config: &CliConfig, args: RunArgs) -> Result<ExitCode> {
    let workflow = load_workflow(&args.file)?;
    let options = ExecuteOptions::with_profile(
        &workflow,
        args.profile.as_deref(),
        args.vars.into_iter().collect(),
    )?;

    let output: Arc<dyn ExecutionOutput> = if args.silent {
        Arc::new(SilentOutput)
    } else {
        Arc::new(ConsoleOutput)
    };
    let history = Arc::new(JsonHistoryStore::new(config.paths().history_dir));
    let executor = WorkflowExecutor::new(Arc::new(StdinPrompt), output)
        .with_backoff(config.retry_backoff())
        .with_history(history);

    let run = executor.execute(&workflow, options).await?;
    match run.failure() {
        Some(message) => {
            eprintln!("Workflow failed: {}", message);
            Ok(ExitCode::FAILURE)
        }
        None => {
            if !args.silent {
                println!("✓ Workflow completed");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
