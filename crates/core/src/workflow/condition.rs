// Evaluation of `when` conditions against a workspace

use super::workspace::Workspace;
use crate::ports::FileSystem;
use crate::types::{Condition, VarCheck};

/// Evaluates conditions. File checks go through the injected [`FileSystem`].
pub struct ConditionEvaluator<'a> {
    workspace: &'a Workspace,
    fs: &'a dyn FileSystem,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(workspace: &'a Workspace, fs: &'a dyn FileSystem) -> Self {
        Self { workspace, fs }
    }

    pub fn evaluate(&self, condition: &Condition) -> bool {
        match condition {
            Condition::FileExists { path } => self.fs.exists(path.trim()),
            Condition::Var(check) => self.evaluate_var(check),
            Condition::HasVar { name } => self.is_bound(name),
            Condition::FactStatus { fact, expected } => {
                self.workspace.fact_status(fact) == *expected
            }
            Condition::LastStep { success } => self
                .workspace
                .last_step_result()
                .map(|result| result.success == *success)
                .unwrap_or(false),
            Condition::ChoiceMade { option_id } => self.workspace.has_choice(option_id),
            Condition::All(conditions) => conditions.iter().all(|c| self.evaluate(c)),
            Condition::Any(conditions) => conditions.iter().any(|c| self.evaluate(c)),
            Condition::Not(inner) => !self.evaluate(inner),
        }
    }

    fn evaluate_var(&self, check: &VarCheck) -> bool {
        match check {
            VarCheck::Exists(name) => self.is_bound(name),
            VarCheck::Equals(expected) => expected.iter().all(|(name, value)| {
                self.lookup(name)
                    .map(|actual| actual == *value)
                    .unwrap_or(false)
            }),
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        self.workspace.has_variable(name) || self.workspace.has_fact(name)
    }

    // Variables take precedence over facts of the same name
    fn lookup(&self, name: &str) -> Option<String> {
        self.workspace
            .variable(name)
            .map(str::to_string)
            .or_else(|| self.workspace.fact(name).map(|fact| fact.to_string()))
    }
}
