// `{{name}}` substitution for commands and prompt text

use crate::workflow::workspace::Workspace;
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Replace `{{name}}` and `{{ name }}` placeholders.
///
/// Names are looked up as variables, then facts, then choices. A name that
/// resolves nowhere is left in the text unchanged.
pub fn substitute(text: &str, workspace: &Workspace) -> String {
    placeholder()
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            workspace
                .variable(name)
                .map(str::to_string)
                .or_else(|| workspace.fact(name).map(|fact| fact.to_string()))
                .or_else(|| workspace.choice(name).map(str::to_string))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Extract placeholder names from a template string
pub fn extract_parameters(text: &str) -> Vec<String> {
    let mut params: Vec<String> = placeholder()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    params.sort();
    params.dedup();
    params
}

/// Placeholder names in `text` that the workspace cannot resolve
pub fn unresolved_parameters(text: &str, workspace: &Workspace) -> Vec<String> {
    extract_parameters(text)
        .into_iter()
        .filter(|name| {
            !workspace.has_variable(name) && !workspace.has_fact(name) && !workspace.has_choice(name)
        })
        .collect()
}
