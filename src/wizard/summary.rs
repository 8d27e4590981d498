// Plain-text dump of the committed settings, offered for download on the last step.

use chrono::{DateTime, Local};
use serde_json::Value;

pub const SUMMARY_HEADER: &str = "Saved Installation Settings";

pub fn settings_file_name(now: DateTime<Local>) -> String {
    format!(
        "installation_settings_{}.txt",
        now.format("%Y-%m-%d_%H-%M-%S")
    )
}

/// Render `(step_key, payload)` pairs in the given order.
pub fn render_settings<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a Value)>,
{
    let mut out = format!("{}\n{}\n\n", SUMMARY_HEADER, "=".repeat(40));
    for (step, data) in entries {
        out.push_str(&step.to_uppercase());
        out.push_str(":\n");
        format_value(&mut out, data, 1);
        out.push('\n');
    }
    out
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn push_entry(out: &mut String, key: &str, value: &Value, level: usize) {
    let indent = "  ".repeat(level);
    match value {
        Value::Object(_) | Value::Array(_) => {
            out.push_str(&format!("{}{}:\n", indent, key));
            format_value(out, value, level + 1);
        }
        _ => out.push_str(&format!("{}{}: {}\n", indent, key, scalar(value))),
    }
}

fn format_value(out: &mut String, value: &Value, level: usize) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                push_entry(out, k, v, level);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                push_entry(out, &i.to_string(), v, level);
            }
        }
        other => out.push_str(&format!("{}{}\n", "  ".repeat(level), scalar(other))),
    }
}
