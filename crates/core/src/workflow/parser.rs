// Loading, repair and structural validation of workflow files

use crate::error::{ValidationIssue, WorkflowError};
use crate::types::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const STEP_KINDS: [&str; 5] = ["run", "choose", "prompt", "parallel", "fail"];
const USER_INPUT_REASON: &str = "User input prompts cannot run in parallel";

/// Serialization format of a workflow or schedule file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Pick the format from the file extension
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
            Some("json") => Ok(FileFormat::Json),
            _ => Err(WorkflowError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FileFormat::Yaml => "YAML",
            FileFormat::Json => "JSON",
        }
    }
}

/// Parse file content into a JSON value tree
pub fn parse_document(content: &str, format: FileFormat) -> Result<Value, WorkflowError> {
    let parsed = match format {
        FileFormat::Yaml => serde_yaml::from_str::<Value>(content).map_err(|e| e.to_string()),
        FileFormat::Json => serde_json::from_str::<Value>(content).map_err(|e| e.to_string()),
    };
    parsed.map_err(|message| WorkflowError::Format {
        format: format.label(),
        message,
    })
}

/// Read, validate and annotate a workflow file
pub fn load_workflow(path: &Path) -> Result<Workflow, WorkflowError> {
    let format = FileFormat::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut workflow = parse_workflow(&content, format)?;
    workflow.source.file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    workflow.source.file_path = Some(path.canonicalize().unwrap_or_else(|_| path.to_path_buf()));

    tracing::debug!(
        "Loaded workflow {} with {} step(s)",
        path.display(),
        workflow.steps.len()
    );
    Ok(workflow)
}

/// Parse and validate workflow content. Only step line numbers are filled in
/// `source`; file metadata is left to `load_workflow`.
pub fn parse_workflow(content: &str, format: FileFormat) -> Result<Workflow, WorkflowError> {
    let mut document = parse_document(content, format)?;
    repair_malformed_steps(&mut document);
    let mut workflow = WorkflowBuilder::default().build(&document)?;
    workflow.source.step_lines = step_line_numbers(content, format);
    Ok(workflow)
}

/// Move step-level `message`/`options`/`as`/`default` into a null `choose` or
/// `prompt` key, the shape produced by a common YAML indentation mistake.
pub fn repair_malformed_steps(document: &mut Value) {
    if let Some(Value::Array(steps)) = document.get_mut("steps") {
        for step in steps.iter_mut() {
            repair_step(step);
        }
    }
}

fn repair_step(step: &mut Value) {
    let Some(obj) = step.as_object_mut() else {
        return;
    };

    if matches!(obj.get("choose"), Some(Value::Null))
        && obj.contains_key("message")
        && obj.contains_key("options")
    {
        let nested = take_fields(obj, &["message", "options", "as"]);
        obj.insert("choose".to_string(), Value::Object(nested));
    } else if matches!(obj.get("prompt"), Some(Value::Null))
        && obj.contains_key("message")
        && obj.contains_key("as")
    {
        let nested = take_fields(obj, &["message", "as", "default"]);
        obj.insert("prompt".to_string(), Value::Object(nested));
    } else if let Some(Value::Array(branches)) = obj.get_mut("parallel") {
        for branch in branches.iter_mut() {
            repair_step(branch);
        }
    }
}

fn take_fields(obj: &mut Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    let mut nested = Map::new();
    for field in fields {
        if let Some(value) = obj.remove(*field) {
            nested.insert(field.to_string(), value);
        }
    }
    nested
}

/// Map each top-level step index to the 1-based line it starts on
pub fn step_line_numbers(content: &str, format: FileFormat) -> BTreeMap<usize, usize> {
    match format {
        FileFormat::Yaml => yaml_step_lines(content),
        FileFormat::Json => json_step_lines(content),
    }
}

fn yaml_step_lines(content: &str) -> BTreeMap<usize, usize> {
    let mut lines = BTreeMap::new();
    let mut in_steps = false;
    let mut item_indent: Option<usize> = None;

    for (number, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();

        if !in_steps {
            if trimmed.starts_with("steps:") {
                in_steps = true;
            }
            continue;
        }

        match item_indent {
            None if trimmed.starts_with('-') => {
                item_indent = Some(indent);
                lines.insert(lines.len(), number + 1);
            }
            None => break,
            Some(expected) if indent == expected && trimmed.starts_with('-') => {
                lines.insert(lines.len(), number + 1);
            }
            Some(expected) if indent < expected || (indent == expected && !trimmed.starts_with('-')) => {
                break;
            }
            Some(_) => {}
        }
    }

    lines
}

fn json_step_lines(content: &str) -> BTreeMap<usize, usize> {
    let mut lines = BTreeMap::new();
    let Some(key) = content.find("\"steps\"") else {
        return lines;
    };
    let Some(open) = content[key..].find('[').map(|offset| key + offset) else {
        return lines;
    };

    let mut line = content[..open].matches('\n').count() + 1;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for ch in content[open..].chars() {
        if ch == '\n' {
            line += 1;
        }
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => {
                if ch == '{' && depth == 1 {
                    lines.insert(lines.len(), line);
                }
                depth += 1;
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }

    lines
}

impl Workflow {
    /// Variables of the named profile
    pub fn profile_vars(&self, name: &str) -> Result<BTreeMap<String, String>, WorkflowError> {
        let name = name.trim();
        if self.profiles.is_empty() {
            return Err(WorkflowError::NoProfiles {
                name: name.to_string(),
            });
        }
        self.profiles
            .iter()
            .find(|profile| profile.name == name)
            .map(|profile| profile.vars.clone())
            .ok_or_else(|| WorkflowError::ProfileNotFound {
                name: name.to_string(),
                available: self
                    .profiles
                    .iter()
                    .map(|profile| profile.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Directory commands run in: `baseDir` resolved against the workflow
    /// file, else the workflow file's directory
    pub fn working_dir(&self) -> Option<PathBuf> {
        let file_dir = self
            .source
            .file_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf);

        match (&self.base_dir, file_dir) {
            (Some(base), _) if base.is_absolute() => Some(base.clone()),
            (Some(base), Some(dir)) => Some(dir.join(base)),
            (Some(base), None) => std::env::current_dir()
                .map(|cwd| cwd.join(base))
                .ok()
                .or_else(|| Some(base.clone())),
            (None, dir) => dir,
        }
    }

    pub fn step_line(&self, index: usize) -> Option<usize> {
        self.source.step_lines.get(&index).copied()
    }
}

#[derive(Default)]
struct WorkflowBuilder {
    issues: Vec<ValidationIssue>,
}

fn step_location(index: usize, branch: Option<usize>) -> String {
    match branch {
        Some(branch) => format!("step {} → parallel branch {}", index + 1, branch + 1),
        None => format!("step {}", index + 1),
    }
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

impl WorkflowBuilder {
    fn build(mut self, document: &Value) -> Result<Workflow, WorkflowError> {
        let Some(root) = document.as_object() else {
            return Err(WorkflowError::Validation(vec![ValidationIssue::new(
                "Workflow must be an object with a 'steps' array",
            )]));
        };

        let name = self.optional_string(root.get("name"), "'name' must be a string", None);
        let base_dir = self
            .optional_string(root.get("baseDir"), "'baseDir' must be a string", None)
            .map(PathBuf::from);
        let shell = self.shell(root.get("shell"), None);
        let profiles = self.profiles(root.get("profiles"));

        let steps = match present(root.get("steps")) {
            None => {
                self.issue(
                    ValidationIssue::new("'steps' is required")
                        .because("A workflow must have a 'steps' array with at least one step"),
                );
                Vec::new()
            }
            Some(Value::Array(items)) if items.is_empty() => {
                self.issue(
                    ValidationIssue::new("'steps' cannot be empty")
                        .because("Workflow must have at least one step"),
                );
                Vec::new()
            }
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(index, item)| self.step(item, index, None))
                .collect(),
            Some(_) => {
                self.issue(ValidationIssue::new("'steps' must be an array"));
                Vec::new()
            }
        };

        if !self.issues.is_empty() {
            return Err(WorkflowError::Validation(self.issues));
        }

        Ok(Workflow {
            name,
            base_dir,
            shell,
            profiles,
            steps,
            source: WorkflowSource::default(),
        })
    }

    fn issue(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    fn invalid(&mut self, message: impl Into<String>, location: &str) {
        self.issues.push(ValidationIssue::new(message).at(location));
    }

    fn optional_string(
        &mut self,
        value: Option<&Value>,
        message: &str,
        location: Option<&str>,
    ) -> Option<String> {
        match present(value)? {
            Value::String(text) => Some(text.clone()),
            _ => {
                let mut issue = ValidationIssue::new(message);
                issue.location = location.map(str::to_string);
                self.issue(issue);
                None
            }
        }
    }

    fn shell(&mut self, value: Option<&Value>, location: Option<&str>) -> Option<Vec<String>> {
        let value = present(value)?;
        let at = |issue: ValidationIssue| match location {
            Some(location) => issue.at(location),
            None => issue,
        };

        let Some(items) = value.as_array() else {
            self.issue(at(ValidationIssue::new("'shell' must be an array")));
            return None;
        };
        if items.is_empty() {
            self.issue(at(ValidationIssue::new("'shell' cannot be empty").because(
                "Shell configuration must have at least one element (program name)",
            )));
            return None;
        }

        let mut shell = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item.as_str() {
                Some(part) => shell.push(part.to_string()),
                None => {
                    self.issue(at(ValidationIssue::new(format!("'shell[{}]' must be a string", i))));
                    return None;
                }
            }
        }
        Some(shell)
    }

    fn profiles(&mut self, value: Option<&Value>) -> Vec<Profile> {
        let Some(value) = present(value) else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.issue(ValidationIssue::new("'profiles' must be an array"));
            return Vec::new();
        };

        let mut profiles = Vec::new();
        for (i, item) in items.iter().enumerate() {
            let location = format!("profiles[{}]", i);
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|name| !name.is_empty());
            let Some(name) = name else {
                self.invalid("Profile name must be a non-empty string", &location);
                continue;
            };

            let mut vars = BTreeMap::new();
            match present(item.get("var")) {
                None => {}
                Some(Value::Object(map)) => {
                    for (key, value) in map {
                        match scalar_to_string(value) {
                            Some(text) => {
                                vars.insert(key.clone(), text);
                            }
                            None => self.invalid(
                                format!("Profile variable '{}' must be a string, number or boolean", key),
                                &location,
                            ),
                        }
                    }
                }
                Some(_) => self.invalid("'var' must be a map of variable names to values", &location),
            }

            profiles.push(Profile {
                name: name.to_string(),
                vars,
            });
        }
        profiles
    }

    fn step(&mut self, value: &Value, index: usize, branch: Option<usize>) -> Option<Step> {
        let location = step_location(index, branch);
        let Some(obj) = value.as_object() else {
            self.invalid("Step must be an object", &location);
            return None;
        };

        let kinds: Vec<&str> = STEP_KINDS
            .iter()
            .copied()
            .filter(|kind| obj.contains_key(*kind))
            .collect();
        let kind_name = match kinds.as_slice() {
            [single] => *single,
            [] => {
                let keys: Vec<&str> = obj
                    .keys()
                    .map(String::as_str)
                    .filter(|key| *key != "when")
                    .collect();
                self.invalid(
                    format!(
                        "Unknown step type. Found keys: [{}]. Valid types: {}",
                        keys.join(", "),
                        STEP_KINDS.join(", ")
                    ),
                    &location,
                );
                return None;
            }
            several => {
                self.invalid(
                    format!("Step has more than one type: [{}]", several.join(", ")),
                    &location,
                );
                return None;
            }
        };

        let when = match present(obj.get("when")) {
            Some(condition) => Some(self.condition(condition, &location)?),
            None => None,
        };

        let kind = match kind_name {
            "run" => StepKind::Run(self.run_step(obj, &location)?),
            "choose" if branch.is_some() => {
                self.issue(
                    ValidationIssue::new("'choose' step is not allowed inside 'parallel' block")
                        .at(&location)
                        .because(USER_INPUT_REASON),
                );
                return None;
            }
            "prompt" if branch.is_some() => {
                self.issue(
                    ValidationIssue::new("'prompt' step is not allowed inside 'parallel' block")
                        .at(&location)
                        .because(USER_INPUT_REASON),
                );
                return None;
            }
            "parallel" if branch.is_some() => {
                self.issue(
                    ValidationIssue::new("'parallel' step is not allowed inside 'parallel' block")
                        .at(&location)
                        .because("Parallel blocks cannot be nested"),
                );
                return None;
            }
            "choose" => StepKind::Choose(self.choose_step(obj.get("choose"), &location)?),
            "prompt" => StepKind::Prompt(self.prompt_step(obj.get("prompt"), &location)?),
            "parallel" => StepKind::Parallel(self.parallel_step(obj.get("parallel"), index)?),
            _ => self.fail_step(obj.get("fail"), &location)?,
        };

        Some(Step { when, kind })
    }

    fn run_step(&mut self, obj: &Map<String, Value>, location: &str) -> Option<RunStep> {
        let command = self.command(obj.get("run"), "run", location)?;
        let timeout = self.timeout(obj.get("timeout"), location);
        let retry = self.retry(obj.get("retry"), location);
        let shell = self.shell(obj.get("shell"), Some(location));

        let continue_on_error = match present(obj.get("continue")) {
            None => false,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                self.invalid("'continue' must be a boolean", location);
                false
            }
        };

        let on_error = match present(obj.get("onError")) {
            Some(value) => Some(Box::new(self.on_error(value, location)?)),
            None => None,
        };

        let captures = match present(obj.get("captures")) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| self.capture(item, i, location))
                .collect(),
            Some(_) => {
                self.invalid("'captures' must be an array", location);
                Vec::new()
            }
        };

        Some(RunStep {
            command,
            timeout,
            retry,
            shell,
            continue_on_error,
            on_error,
            captures,
        })
    }

    fn on_error(&mut self, value: &Value, location: &str) -> Option<OnError> {
        let Some(obj) = value.as_object() else {
            self.invalid("'onError' must be an object with a 'run' command", location);
            return None;
        };
        let command = self.command(obj.get("run"), "onError.run", location)?;
        let timeout = self.timeout(obj.get("timeout"), location);
        let retry = self.retry(obj.get("retry"), location);
        let on_error = match present(obj.get("onError")) {
            Some(next) => Some(Box::new(self.on_error(next, location)?)),
            None => None,
        };
        Some(OnError {
            command,
            timeout,
            retry,
            on_error,
        })
    }

    fn command(&mut self, value: Option<&Value>, field: &str, location: &str) -> Option<String> {
        match value {
            Some(Value::String(command)) if command.trim().is_empty() => {
                self.invalid(format!("'{}' command cannot be empty", field), location);
                None
            }
            Some(Value::String(command)) => Some(command.clone()),
            _ => {
                self.invalid(format!("'{}' must be a string command", field), location);
                None
            }
        }
    }

    fn timeout(&mut self, value: Option<&Value>, location: &str) -> Option<Duration> {
        let value = present(value)?;
        match value.as_f64() {
            Some(secs) if secs.is_finite() && secs >= 0.0 => match Duration::try_from_secs_f64(secs) {
                Ok(timeout) => Some(timeout),
                Err(_) => {
                    self.invalid("'timeout' is too large", location);
                    None
                }
            },
            _ => {
                self.invalid("'timeout' must be a non-negative number of seconds", location);
                None
            }
        }
    }

    fn retry(&mut self, value: Option<&Value>, location: &str) -> Retry {
        let Some(value) = present(value) else {
            return Retry::default();
        };
        match value {
            Value::String(text) if text == "Infinity" => Retry::Forever,
            Value::Number(number) => match number.as_f64() {
                Some(count) if count.is_infinite() && count > 0.0 => Retry::Forever,
                Some(count) if count >= 0.0 && count.fract() == 0.0 => {
                    Retry::Count(count.min(u32::MAX as f64) as u32)
                }
                _ => {
                    self.invalid("'retry' must be a non-negative integer or \"Infinity\"", location);
                    Retry::default()
                }
            },
            _ => {
                self.invalid("'retry' must be a non-negative integer or \"Infinity\"", location);
                Retry::default()
            }
        }
    }

    fn capture(&mut self, value: &Value, i: usize, location: &str) -> Option<CaptureRule> {
        let Some(obj) = value.as_object() else {
            self.invalid(format!("'captures[{}]' must be an object", i), location);
            return None;
        };
        let store_as = obj
            .get("as")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let Some(store_as) = store_as else {
            self.issue(
                ValidationIssue::new(format!("'captures[{}].as' is required", i))
                    .at(location)
                    .because("The 'as' field names the variable that receives the value"),
            );
            return None;
        };

        let mut text = |key: &str, this: &mut Self| -> Option<String> {
            match obj.get(key)? {
                Value::String(text) => Some(text.clone()),
                _ => {
                    this.invalid(format!("'captures[{}].{}' must be a string", i, key), location);
                    None
                }
            }
        };

        let capture = if obj.contains_key("regex") {
            Capture::Regex {
                pattern: text("regex", self)?,
            }
        } else if obj.contains_key("json") {
            Capture::JsonPath {
                expr: text("json", self)?,
            }
        } else if obj.contains_key("yaml") || obj.contains_key("yml") {
            let key = if obj.contains_key("yaml") { "yaml" } else { "yml" };
            Capture::YamlPath {
                expr: text(key, self)?,
            }
        } else if obj.contains_key("kv") {
            Capture::KeyValue {
                key: text("kv", self)?,
            }
        } else if obj.contains_key("after") && obj.contains_key("before") {
            Capture::Between {
                after: text("after", self)?,
                before: text("before", self)?,
            }
        } else if obj.contains_key("after") {
            Capture::After {
                marker: text("after", self)?,
            }
        } else if obj.contains_key("before") {
            Capture::Before {
                marker: text("before", self)?,
            }
        } else if let Some(range) = obj.get("line") {
            let bound = |key: &str| range.get(key).and_then(Value::as_f64).map(|n| n as i64);
            match (bound("from"), bound("to")) {
                (Some(from), Some(to)) => Capture::LineRange { from, to },
                _ => {
                    self.invalid(
                        format!("'captures[{}].line' must have numeric 'from' and 'to'", i),
                        location,
                    );
                    return None;
                }
            }
        } else {
            Capture::Full
        };

        Some(CaptureRule {
            store_as: store_as.to_string(),
            capture,
        })
    }

    fn choose_step(&mut self, value: Option<&Value>, location: &str) -> Option<ChooseStep> {
        let Some(obj) = present(value).and_then(Value::as_object) else {
            self.invalid("'choose' must be an object with 'message' and 'options'", location);
            return None;
        };

        let message = non_empty_str(obj.get("message"));
        if message.is_none() {
            self.invalid("'choose.message' is required and must be a string", location);
        }

        let options = match obj.get("options") {
            Some(Value::Array(items)) if items.is_empty() => {
                self.issue(
                    ValidationIssue::new("'choose.options' cannot be empty")
                        .at(location)
                        .because("At least one option is required"),
                );
                None
            }
            Some(Value::Array(items)) => {
                let mut options = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let id = non_empty_str(item.get("id"));
                    let label = non_empty_str(item.get("label"));
                    if id.is_none() {
                        self.invalid(
                            format!("'choose.options[{}].id' is required and must be a string", i),
                            location,
                        );
                    }
                    if label.is_none() {
                        self.invalid(
                            format!("'choose.options[{}].label' is required and must be a string", i),
                            location,
                        );
                    }
                    if let (Some(id), Some(label)) = (id, label) {
                        options.push(ChoiceOption {
                            id: id.to_string(),
                            label: label.to_string(),
                        });
                    }
                }
                (options.len() == items.len()).then_some(options)
            }
            _ => {
                self.invalid("'choose.options' is required and must be an array", location);
                None
            }
        };

        let store_as = self.optional_string(obj.get("as"), "'choose.as' must be a string", Some(location));

        Some(ChooseStep {
            message: message?.to_string(),
            options: options?,
            store_as,
        })
    }

    fn prompt_step(&mut self, value: Option<&Value>, location: &str) -> Option<PromptStep> {
        let Some(obj) = present(value).and_then(Value::as_object) else {
            self.invalid("'prompt' must be an object with 'message' and 'as'", location);
            return None;
        };

        let message = non_empty_str(obj.get("message"));
        if message.is_none() {
            self.invalid("'prompt.message' is required and must be a string", location);
        }
        let store_as = non_empty_str(obj.get("as"));
        if store_as.is_none() {
            self.issue(
                ValidationIssue::new("'prompt.as' is required and must be a string")
                    .at(location)
                    .because("The 'as' field specifies the variable name to store the user's input"),
            );
        }
        let default = match present(obj.get("default")) {
            None => None,
            Some(value) => match scalar_to_string(value) {
                Some(text) => Some(text),
                None => {
                    self.invalid("'prompt.default' must be a string", location);
                    None
                }
            },
        };

        Some(PromptStep {
            message: message?.to_string(),
            store_as: store_as?.to_string(),
            default,
        })
    }

    fn parallel_step(&mut self, value: Option<&Value>, index: usize) -> Option<Vec<Step>> {
        let location = step_location(index, None);
        match value {
            Some(Value::Array(items)) if items.is_empty() => {
                self.issue(
                    ValidationIssue::new("'parallel' cannot be empty")
                        .at(&location)
                        .because("At least one branch is required"),
                );
                None
            }
            Some(Value::Array(items)) => {
                let branches: Vec<Step> = items
                    .iter()
                    .enumerate()
                    .filter_map(|(branch, item)| self.step(item, index, Some(branch)))
                    .collect();
                (branches.len() == items.len()).then_some(branches)
            }
            _ => {
                self.invalid("'parallel' must be an array of steps", &location);
                None
            }
        }
    }

    fn fail_step(&mut self, value: Option<&Value>, location: &str) -> Option<StepKind> {
        let message = match present(value) {
            Some(Value::String(message)) => Some(message.as_str()),
            Some(Value::Object(obj)) => non_empty_str(obj.get("message")),
            _ => None,
        };
        match message {
            Some(message) if !message.trim().is_empty() => Some(StepKind::Fail {
                message: message.to_string(),
            }),
            _ => {
                self.invalid("'fail.message' is required and must be a string", location);
                None
            }
        }
    }

    fn condition(&mut self, value: &Value, location: &str) -> Option<Condition> {
        let Some(obj) = value.as_object() else {
            self.invalid("'when' must be an object", location);
            return None;
        };

        if let Some(items) = obj.get("all") {
            return Some(Condition::All(self.conditions(items, "all", location)?));
        }
        if let Some(items) = obj.get("any") {
            return Some(Condition::Any(self.conditions(items, "any", location)?));
        }
        if let Some(inner) = obj.get("not") {
            return Some(Condition::Not(Box::new(self.condition(inner, location)?)));
        }
        if let Some(path) = obj.get("file") {
            return match path.as_str() {
                Some(path) => Some(Condition::FileExists {
                    path: path.to_string(),
                }),
                None => {
                    self.invalid("'file' condition must be a path string", location);
                    None
                }
            };
        }
        if let Some(var) = present(obj.get("var")) {
            return match var {
                Value::String(name) => Some(Condition::Var(VarCheck::Exists(name.clone()))),
                Value::Object(pairs) => {
                    let mut expected = BTreeMap::new();
                    for (name, value) in pairs {
                        let Some(value) = scalar_to_string(value) else {
                            self.invalid(format!("'var.{}' must be a string value", name), location);
                            return None;
                        };
                        expected.insert(name.clone(), value);
                    }
                    Some(Condition::Var(VarCheck::Equals(expected)))
                }
                _ => {
                    self.invalid("'var' condition must be a name or a map of values", location);
                    None
                }
            };
        }
        if let Some(name) = obj.get("has") {
            return match name.as_str() {
                Some(name) => Some(Condition::HasVar {
                    name: name.to_string(),
                }),
                None => {
                    self.invalid("'has' condition must be a variable name", location);
                    None
                }
            };
        }
        if let Some(status) = obj.get("status") {
            let fact = status.get("fact").and_then(Value::as_str);
            let expected = match status.get("is").and_then(Value::as_str) {
                Some("ready") => Some(FactStatus::Ready),
                Some("failed") => Some(FactStatus::Failed),
                Some("pending") => Some(FactStatus::Pending),
                _ => None,
            };
            return match (fact, expected) {
                (Some(fact), Some(expected)) => Some(Condition::FactStatus {
                    fact: fact.to_string(),
                    expected,
                }),
                _ => {
                    self.invalid(
                        "'status' condition needs 'fact' and 'is' (ready, failed or pending)",
                        location,
                    );
                    None
                }
            };
        }
        if let Some(step) = obj.get("step") {
            return match step.get("success").and_then(Value::as_bool) {
                Some(success) => Some(Condition::LastStep { success }),
                None => {
                    self.invalid("'step' condition needs a boolean 'success'", location);
                    None
                }
            };
        }
        if let Some(outcome) = obj.get("last_step") {
            return match outcome.as_str() {
                Some("success") => Some(Condition::LastStep { success: true }),
                Some("failure") => Some(Condition::LastStep { success: false }),
                _ => {
                    self.invalid("'last_step' must be \"success\" or \"failure\"", location);
                    None
                }
            };
        }
        if let Some(choice) = obj.get("choice") {
            return match choice.as_str() {
                Some(option_id) => Some(Condition::ChoiceMade {
                    option_id: option_id.to_string(),
                }),
                None => {
                    self.invalid("'choice' condition must be an option id", location);
                    None
                }
            };
        }

        let keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        self.invalid(format!("Unknown condition. Found keys: [{}]", keys.join(", ")), location);
        None
    }

    fn conditions(&mut self, value: &Value, key: &str, location: &str) -> Option<Vec<Condition>> {
        let Some(items) = value.as_array() else {
            self.invalid(format!("'{}' must be an array of conditions", key), location);
            return None;
        };
        items
            .iter()
            .map(|item| self.condition(item, location))
            .collect()
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(content: &str) -> Result<Workflow, WorkflowError> {
        parse_workflow(content, FileFormat::Yaml)
    }

    fn validation_message(content: &str) -> String {
        match yaml(content) {
            Err(e @ WorkflowError::Validation(_)) => e.to_string(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(FileFormat::from_path(Path::new("a.yml")).unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path(Path::new("a.YAML")).unwrap(), FileFormat::Yaml);
        assert_eq!(FileFormat::from_path(Path::new("a.json")).unwrap(), FileFormat::Json);
        assert!(matches!(
            FileFormat::from_path(Path::new("a.toml")),
            Err(WorkflowError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_parse_full_workflow() {
        let workflow = yaml(
            r#"
name: Deploy
baseDir: ./app
shell: [bash, -lc]
profiles:
  - name: Prod
    var:
      env: prod
      replicas: 3
steps:
  - run: npm install
    timeout: 1.5
    retry: Infinity
    continue: true
    onError:
      run: npm cache clean --force
      retry: 2
      onError:
        run: echo giving up
    captures:
      - as: all
      - regex: "v(\\d+)"
        as: version
      - kv: TOKEN
        as: token
      - after: START
        before: END
        as: middle
      - line: { from: 2, to: 3 }
        as: lines
  - choose:
      message: Environment?
      options:
        - id: staging
          label: Staging
        - id: prod
          label: Production
      as: env
  - when:
      all:
        - var: { env: prod }
        - not: { file: ./dist }
        - any: [ { has: token }, { last_step: failure }, { status: { fact: env, is: ready } } ]
    prompt:
      message: Version?
      as: version
      default: "1.0.0"
  - parallel:
      - run: echo a
      - when: { choice: prod }
        run: echo b
  - fail:
      message: stop here
"#,
        )
        .unwrap();

        assert_eq!(workflow.name.as_deref(), Some("Deploy"));
        assert_eq!(workflow.base_dir, Some(PathBuf::from("./app")));
        assert_eq!(workflow.shell, Some(vec!["bash".to_string(), "-lc".to_string()]));
        assert_eq!(workflow.profiles[0].vars.get("replicas").map(String::as_str), Some("3"));
        assert_eq!(workflow.steps.len(), 5);

        let StepKind::Run(run) = &workflow.steps[0].kind else {
            panic!("expected run step");
        };
        assert_eq!(run.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(run.retry, Retry::Forever);
        assert!(run.continue_on_error);
        let fallback = run.on_error.as_ref().unwrap();
        assert_eq!(fallback.retry, Retry::Count(2));
        assert_eq!(fallback.on_error.as_ref().unwrap().command, "echo giving up");
        assert_eq!(run.captures.len(), 5);
        assert_eq!(run.captures[0].capture, Capture::Full);
        assert_eq!(
            run.captures[3].capture,
            Capture::Between {
                after: "START".to_string(),
                before: "END".to_string()
            }
        );
        assert_eq!(run.captures[4].capture, Capture::LineRange { from: 2, to: 3 });

        assert!(matches!(&workflow.steps[1].kind, StepKind::Choose(c) if c.variable_name() == "env"));
        assert!(matches!(workflow.steps[2].when, Some(Condition::All(ref items)) if items.len() == 3));
        assert!(matches!(&workflow.steps[3].kind, StepKind::Parallel(branches) if branches.len() == 2));
        assert!(matches!(&workflow.steps[4].kind, StepKind::Fail { message } if message == "stop here"));
    }

    #[test]
    fn test_parse_json_workflow() {
        let workflow = parse_workflow(
            r#"{"steps": [{"run": "echo hi"}, {"when": {"var": "x"}, "run": "echo x"}]}"#,
            FileFormat::Json,
        )
        .unwrap();
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(
            workflow.steps[1].when,
            Some(Condition::Var(VarCheck::Exists("x".to_string())))
        );
    }

    #[test]
    fn test_invalid_format_reported() {
        let err = parse_workflow("{not json", FileFormat::Json).unwrap_err();
        assert!(err.to_string().starts_with("Invalid JSON format:"));
    }

    #[test]
    fn test_missing_and_empty_steps() {
        assert!(validation_message("name: x").contains("'steps' is required"));
        assert!(validation_message("steps: []").contains("'steps' cannot be empty"));
        assert!(validation_message("steps: nope").contains("'steps' must be an array"));
    }

    #[test]
    fn test_step_level_errors_are_located() {
        let message = validation_message(
            r#"
steps:
  - run: ""
  - deploy: now
  - prompt:
      message: Name?
"#,
        );
        assert!(message.contains("'run' command cannot be empty (step 1)"));
        assert!(message.contains("Unknown step type. Found keys: [deploy]"));
        assert!(message.contains("'prompt.as' is required and must be a string (step 3)"));
    }

    #[test]
    fn test_interactive_steps_rejected_in_parallel() {
        let message = validation_message(
            r#"
steps:
  - run: echo first
  - parallel:
      - run: echo ok
      - choose:
          message: pick
          options: [{ id: a, label: A }]
"#,
        );
        assert!(message.contains("'choose' step is not allowed inside 'parallel' block (step 2 → parallel branch 2)"));
        assert!(message.contains("Reason: User input prompts cannot run in parallel"));
    }

    #[test]
    fn test_nested_parallel_rejected() {
        let message = validation_message(
            r#"
steps:
  - parallel:
      - parallel:
          - run: echo deep
"#,
        );
        assert!(message.contains("'parallel' step is not allowed inside 'parallel' block"));
    }

    #[test]
    fn test_choose_option_validation() {
        let message = validation_message(
            r#"
steps:
  - choose:
      message: pick
      options: []
"#,
        );
        assert!(message.contains("'choose.options' cannot be empty"));

        let message = validation_message(
            r#"
steps:
  - choose:
      message: pick
      options:
        - id: a
"#,
        );
        assert!(message.contains("'choose.options[0].label' is required"));
    }

    #[test]
    fn test_shell_must_be_non_empty() {
        assert!(validation_message("shell: []\nsteps:\n  - run: echo").contains("'shell' cannot be empty"));
        assert!(validation_message("shell: bash\nsteps:\n  - run: echo").contains("'shell' must be an array"));
    }

    #[test]
    fn test_malformed_choose_is_repaired() {
        let workflow = yaml(
            r#"
steps:
  - choose:
    message: Pick one
    options:
      - id: a
        label: A
    as: picked
"#,
        )
        .unwrap();

        let StepKind::Choose(choose) = &workflow.steps[0].kind else {
            panic!("expected choose step");
        };
        assert_eq!(choose.message, "Pick one");
        assert_eq!(choose.store_as.as_deref(), Some("picked"));
    }

    #[test]
    fn test_malformed_prompt_is_repaired() {
        let workflow = yaml(
            r#"
steps:
  - prompt:
    message: Name?
    as: name
    default: bob
"#,
        )
        .unwrap();
        assert!(matches!(
            &workflow.steps[0].kind,
            StepKind::Prompt(p) if p.store_as == "name" && p.default.as_deref() == Some("bob")
        ));
    }

    #[test]
    fn test_retry_validation() {
        assert!(validation_message("steps:\n  - run: echo\n    retry: -1").contains("'retry' must be"));
        assert!(validation_message("steps:\n  - run: echo\n    retry: often").contains("'retry' must be"));
    }

    #[test]
    fn test_timeout_validation() {
        let workflow = yaml("steps:\n  - run: echo\n    timeout: 1.5").unwrap();
        let StepKind::Run(run) = &workflow.steps[0].kind else {
            panic!("expected a run step");
        };
        assert_eq!(run.timeout, Some(Duration::from_millis(1500)));

        assert!(validation_message("steps:\n  - run: echo\n    timeout: -2").contains("'timeout' must be"));
        assert!(validation_message("steps:\n  - run: echo\n    timeout: 1e300")
            .contains("'timeout' is too large (step 1)"));
    }

    #[test]
    fn test_parsed_content_carries_step_lines() {
        let workflow = yaml("name: x\nsteps:\n  - run: a\n\n  - run: b\n").unwrap();
        assert_eq!(workflow.step_line(0), Some(3));
        assert_eq!(workflow.step_line(1), Some(5));
        assert!(workflow.source.file_name.is_none());

        let json = parse_workflow("{\n  \"steps\": [\n    {\"run\": \"a\"}\n  ]\n}", FileFormat::Json).unwrap();
        assert_eq!(json.step_line(0), Some(3));
    }

    #[test]
    fn test_yaml_step_lines() {
        let content = "name: x\nsteps:\n  - run: a\n  - choose:\n      message: m\n      options:\n        - id: a\n          label: A\n  # comment\n  - parallel:\n      - run: b\nprofiles: []\n";
        let lines = step_line_numbers(content, FileFormat::Yaml);
        assert_eq!(lines.get(&0), Some(&3));
        assert_eq!(lines.get(&1), Some(&4));
        assert_eq!(lines.get(&2), Some(&10));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_json_step_lines() {
        let content = "{\n  \"name\": \"x {\",\n  \"steps\": [\n    {\n      \"run\": \"echo }\"\n    },\n    { \"parallel\": [ { \"run\": \"a\" } ] }\n  ]\n}\n";
        let lines = step_line_numbers(content, FileFormat::Json);
        assert_eq!(lines.get(&0), Some(&4));
        assert_eq!(lines.get(&1), Some(&7));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_profile_vars() {
        let workflow = yaml("profiles:\n  - name: Prod\n    var: { env: prod }\nsteps:\n  - run: echo").unwrap();
        assert_eq!(workflow.profile_vars("Prod").unwrap().get("env").map(String::as_str), Some("prod"));

        let err = workflow.profile_vars("Dev").unwrap_err();
        assert_eq!(err.to_string(), "Profile \"Dev\" not found. Available profile(s): Prod");

        let bare = yaml("steps:\n  - run: echo").unwrap();
        assert!(matches!(bare.profile_vars("Prod"), Err(WorkflowError::NoProfiles { .. })));
    }

    #[test]
    fn test_load_workflow_sets_source_and_working_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, "baseDir: sub\nsteps:\n  - run: echo hi\n").unwrap();

        let workflow = load_workflow(&path).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(workflow.source.file_name.as_deref(), Some("flow.yaml"));
        assert_eq!(workflow.step_line(0), Some(3));
        assert_eq!(workflow.working_dir(), Some(root.join("sub")));

        let mut no_base = workflow.clone();
        no_base.base_dir = None;
        assert_eq!(no_base.working_dir(), Some(root.clone()));

        let mut absolute = workflow;
        absolute.base_dir = Some(PathBuf::from("/opt/app"));
        assert_eq!(absolute.working_dir(), Some(PathBuf::from("/opt/app")));
    }
}
