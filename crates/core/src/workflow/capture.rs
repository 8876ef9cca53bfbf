// Value extraction from captured command output

use crate::types::Capture;
use serde_json::Value;
use serde_json_path::JsonPath;

/// Extract a value from stdout lines. Parse failures of any kind yield `None`.
pub fn parse_capture(capture: &Capture, stdout: &[String]) -> Option<String> {
    match capture {
        Capture::Full => Some(stdout.join("\n")),
        Capture::Regex { pattern } => regex_capture(pattern, stdout),
        Capture::JsonPath { expr } => {
            let value: Value = serde_json::from_str(&stdout.join("\n")).ok()?;
            query_path(&value, expr)
        }
        Capture::YamlPath { expr } => {
            let value: Value = serde_yaml::from_str(&stdout.join("\n")).ok()?;
            query_path(&value, expr)
        }
        Capture::KeyValue { key } => key_value_capture(key, stdout),
        Capture::After { marker } => {
            non_empty_marker(marker)?;
            let text = stdout.join("\n");
            let start = text.find(marker.as_str())? + marker.len();
            Some(text[start..].trim().to_string())
        }
        Capture::Before { marker } => {
            non_empty_marker(marker)?;
            let text = stdout.join("\n");
            let end = text.find(marker.as_str())?;
            Some(text[..end].trim().to_string())
        }
        Capture::Between { after, before } => {
            non_empty_marker(after)?;
            non_empty_marker(before)?;
            let text = stdout.join("\n");
            let start = text.find(after.as_str())? + after.len();
            let rest = &text[start..];
            let end = rest.find(before.as_str())?;
            Some(rest[..end].trim().to_string())
        }
        Capture::LineRange { from, to } => line_range_capture(*from, *to, stdout),
    }
}

fn non_empty_marker(marker: &str) -> Option<()> {
    (!marker.is_empty()).then_some(())
}

fn regex_capture(pattern: &str, stdout: &[String]) -> Option<String> {
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::debug!("Invalid capture regex {:?}: {}", pattern, e);
            return None;
        }
    };
    let text = stdout.join("\n");
    let group = re.captures(&text)?.get(1)?;
    let value = group.as_str();
    (!value.is_empty()).then(|| value.to_string())
}

fn query_path(value: &Value, expr: &str) -> Option<String> {
    let expr = expr.trim();
    let normalized = if expr.starts_with('$') {
        expr.to_string()
    } else if expr.starts_with('[') {
        format!("${}", expr)
    } else {
        format!("$.{}", expr)
    };
    let path = JsonPath::parse(&normalized).ok()?;
    match path.query(value).first()? {
        Value::String(text) => Some(text.clone()),
        Value::Null => None,
        other => serde_json::to_string(other).ok(),
    }
}

fn key_value_capture(key: &str, stdout: &[String]) -> Option<String> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    for line in stdout {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        if name.trim_end() != key {
            continue;
        }
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        return Some(strip_quotes(value).to_string());
    }

    None
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' || first == b'\'') && first == last {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// 1-based and inclusive, clamped to the available lines
fn line_range_capture(from: i64, to: i64, stdout: &[String]) -> Option<String> {
    if to < from {
        return None;
    }
    let len = stdout.len() as i64;
    let start = (from - 1).max(0);
    let end = to.min(len);
    if start >= len || end <= start {
        return None;
    }
    Some(stdout[start as usize..end as usize].join("\n"))
}
