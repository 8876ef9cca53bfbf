use crate::config::CliConfig;
use crate::console::{format_duration, ConsoleOutput};
use crate::HistoryCommand;
use anyhow::{bail, Result};
use chrono::Local;
use pipeliner_core::ports::ExecutionOutput;
use pipeliner_core::storage::JsonHistoryStore;
use std::process::ExitCode;
use std::time::Duration;

pub async fn execute(config: &CliConfig, command: HistoryCommand) -> Result<ExitCode> {
    let store = JsonHistoryStore::new(config.paths().history_dir);

    match command {
        HistoryCommand::List => {
            let entries = store.list().await?;
            if entries.is_empty() {
                println!("No execution history.");
            }
            for entry in entries {
                println!("{}", entry.file_name);
            }
        }
        HistoryCommand::Show { file } => {
            let history = store.load(&file).await?;
            println!(
                "{} started {}",
                history.workflow_name.as_deref().unwrap_or("(unnamed workflow)"),
                history
                    .initial_timestamp
                    .with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
            );
            ConsoleOutput.timeline(&history);
            println!(
                "Elapsed: {}",
                format_duration(Duration::from_millis(history.elapsed_ms()))
            );
        }
        HistoryCommand::Remove { file } => {
            if !store.remove(&file).await? {
                bail!("History file not found: {}", file);
            }
            println!("Removed {}", file);
        }
        HistoryCommand::Clean => {
            let removed = store.clear().await?;
            println!("Removed {} history file(s)", removed);
        }
    }

    Ok(ExitCode::SUCCESS)
}
