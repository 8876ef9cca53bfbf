use crate::types::FactStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value of a fact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Bool(bool),
    Text(String),
}

impl std::fmt::Display for FactValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactValue::Bool(value) => write!(f, "{}", value),
            FactValue::Text(value) => write!(f, "{}", value),
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        FactValue::Bool(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::Text(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::Text(value)
    }
}

/// Outcome recorded for an executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
}

/// Mutable state of one workflow execution.
///
/// `Clone` copies every map, so a branch clone never aliases the state it
/// was taken from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workspace {
    facts: HashMap<String, FactValue>,
    choices: HashMap<String, String>,
    variables: HashMap<String, String>,
    step_results: HashMap<usize, StepOutcome>,
    last_step: Option<usize>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fact(&mut self, name: impl Into<String>, value: impl Into<FactValue>) {
        self.facts.insert(name.into(), value.into());
    }

    pub fn fact(&self, name: &str) -> Option<&FactValue> {
        self.facts.get(name)
    }

    pub fn has_fact(&self, name: &str) -> bool {
        self.facts.contains_key(name)
    }

    /// `Pending` when unset, `Failed` for `false` or `"failed"`, `Ready` otherwise
    pub fn fact_status(&self, name: &str) -> FactStatus {
        match self.facts.get(name) {
            None => FactStatus::Pending,
            Some(FactValue::Bool(false)) => FactStatus::Failed,
            Some(FactValue::Text(text)) if text == "failed" => FactStatus::Failed,
            Some(_) => FactStatus::Ready,
        }
    }

    pub fn set_choice(&mut self, id: impl Into<String>, value: impl Into<String>) {
        self.choices.insert(id.into(), value.into());
    }

    pub fn choice(&self, id: &str) -> Option<&str> {
        self.choices.get(id).map(String::as_str)
    }

    pub fn has_choice(&self, id: &str) -> bool {
        self.choices.contains_key(id)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn facts(&self) -> &HashMap<String, FactValue> {
        &self.facts
    }

    pub fn set_step_result(&mut self, step_index: usize, success: bool, exit_code: Option<i32>) {
        self.step_results
            .insert(step_index, StepOutcome { success, exit_code });
        self.last_step = Some(step_index);
    }

    pub fn step_result(&self, step_index: usize) -> Option<StepOutcome> {
        self.step_results.get(&step_index).copied()
    }

    /// Result of the most recently recorded step
    pub fn last_step_result(&self) -> Option<StepOutcome> {
        self.last_step
            .and_then(|index| self.step_results.get(&index).copied())
    }

    /// Copy facts and variables from a branch workspace, overwriting on collision
    pub fn merge_from(&mut self, branch: &Workspace) {
        for (name, value) in &branch.facts {
            self.facts.insert(name.clone(), value.clone());
        }
        for (name, value) in &branch.variables {
            self.variables.insert(name.clone(), value.clone());
        }
    }
}
