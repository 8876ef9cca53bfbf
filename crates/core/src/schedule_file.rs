// Schedule files: several schedule definitions in one YAML or JSON document

use crate::error::{ScheduleError, ValidationIssue};
use crate::storage::ScheduleStore;
use crate::timezone::{parse_cron, resolve_timezone};
use crate::types::{NewSchedule, Schedule};
use crate::workflow::parser::{parse_document, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// One entry of a schedule file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cron: String,
    #[serde(default)]
    pub workflow: String,
    pub base_dir: Option<String>,
    pub timezone: Option<String>,
    pub silent: Option<bool>,
    pub profile: Option<String>,
}

impl ScheduleDefinition {
    /// Workflow path resolved against `baseDir`, or the schedule file's directory
    pub fn workflow_path(&self, schedule_file: &Path) -> PathBuf {
        let file_dir = schedule_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let base = match self.base_dir.as_deref() {
            Some(base) if Path::new(base).is_absolute() => PathBuf::from(base),
            Some(base) => file_dir.join(base),
            None => file_dir,
        };
        base.join(&self.workflow)
    }
}

#[derive(Debug, Deserialize)]
struct ScheduleFileDocument {
    schedules: Option<Vec<ScheduleDefinition>>,
}

/// What `add_from_file` did with each definition
#[derive(Debug, Default)]
pub struct AddReport {
    pub added: Vec<Schedule>,
    /// Definition name and the reason it was not added
    pub rejected: Vec<(String, String)>,
}

/// Read and structurally validate a schedule file
pub fn parse_schedule_file(path: &Path) -> Result<Vec<ScheduleDefinition>, ScheduleError> {
    let format = FileFormat::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|e| ScheduleError::io(path, e))?;
    let document = parse_document(&content, format)?;

    let parsed: ScheduleFileDocument = serde_json::from_value(document)
        .map_err(|e| ScheduleError::InvalidFile(e.to_string()))?;

    let definitions = parsed.schedules.unwrap_or_default();
    let mut issues = Vec::new();
    if definitions.is_empty() {
        issues.push(
            ValidationIssue::new("Schedule file must have at least one schedule").at("schedules"),
        );
    }
    for (i, definition) in definitions.iter().enumerate() {
        let at = |field: &str| format!("schedules.{}.{}", i, field);
        if definition.name.trim().is_empty() {
            issues.push(ValidationIssue::new("Schedule name must be non-empty").at(at("name")));
        }
        if definition.cron.trim().is_empty() {
            issues.push(ValidationIssue::new("Cron expression is required").at(at("cron")));
        }
        if definition.workflow.trim().is_empty() {
            issues.push(ValidationIssue::new("Workflow path is required").at(at("workflow")));
        }
    }

    if !issues.is_empty() {
        let listed = issues
            .iter()
            .map(ValidationIssue::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ScheduleError::InvalidFile(format!("\n{}", listed)));
    }
    Ok(definitions)
}

/// Check one definition and turn it into a schedule record
pub fn prepare_schedule(
    definition: &ScheduleDefinition,
    schedule_file: &Path,
) -> Result<NewSchedule, ScheduleError> {
    parse_cron(&definition.cron)?;
    resolve_timezone(definition.timezone.as_deref())?;

    let workflow_path = definition.workflow_path(schedule_file);
    if !workflow_path.is_file() {
        return Err(ScheduleError::WorkflowNotFound(workflow_path));
    }

    Ok(NewSchedule {
        name: Some(definition.name.trim().to_string()),
        workflow_path: workflow_path.canonicalize().unwrap_or(workflow_path),
        cron: definition.cron.trim().to_string(),
        timezone: definition.timezone.clone(),
        silent: definition.silent,
        profile: definition.profile.clone(),
    })
}

/// Add every valid definition of a schedule file to `store`. Invalid
/// definitions are reported without stopping the rest.
pub fn add_from_file(store: &ScheduleStore, path: &Path) -> Result<AddReport, ScheduleError> {
    let definitions = parse_schedule_file(path)?;
    let mut report = AddReport::default();

    for definition in &definitions {
        match prepare_schedule(definition, path) {
            Ok(new) => report.added.push(store.add(new)?),
            Err(e) => {
                tracing::warn!("Rejected schedule '{}': {}", definition.name, e);
                report.rejected.push((definition.name.clone(), e.to_string()));
            }
        }
    }

    Ok(report)
}
