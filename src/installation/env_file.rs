// Flat KEY=value configuration file editor
//
// Upserts keep every unrelated line (comments, blank lines, ordering) untouched. Writes go through
// a sibling temp file and a rename so a crash never leaves a half-written file behind.

use crate::error::ProvisionError;
use crate::utils::logging::mask_env_value;
use log::{debug, info};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EnvFileEditor {
    path: PathBuf,
}

impl EnvFileEditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Replace each `KEY=` line in place, or append it when absent.
    ///
    /// A missing file is treated as empty and created.
    pub async fn upsert(&self, pairs: &[(String, String)]) -> Result<(), ProvisionError> {
        if pairs.is_empty() {
            return Ok(());
        }
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(ProvisionError::ConfigFile {
                    detail: format!("Failed to read {}: {}", self.path.display(), e),
                })
            }
        };

        let updated = apply_pairs(&current, pairs);
        if updated == current {
            debug!(
                "[PHASE: provisioning] [STEP: env_file] No changes needed (path={})",
                self.path.display()
            );
            return Ok(());
        }

        self.write_atomic(&updated).await?;

        info!(
            "[PHASE: provisioning] [STEP: env_file] Updated {} key(s) (path={}, keys=[{}])",
            pairs.len(),
            self.path.display(),
            pairs
                .iter()
                .map(|(k, v)| mask_env_value(k, v))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    async fn write_atomic(&self, content: &str) -> Result<(), ProvisionError> {
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| ProvisionError::ConfigFile {
                detail: format!("Failed to write {}: {}", tmp.display(), e),
            })?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ProvisionError::ConfigFile {
                detail: format!("Failed to replace {}: {}", self.path.display(), e),
            });
        }
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".installer-tmp");
    path.with_file_name(name)
}

fn line_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim_end();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key)
}

/// Pure upsert over file content. Output always ends with a newline.
pub fn apply_pairs(content: &str, pairs: &[(String, String)]) -> String {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

    for (key, value) in pairs {
        let rendered = format!("{}={}", key, quote_if_needed(value));
        let mut found = false;
        for line in lines.iter_mut() {
            if line_key(line) == Some(key.as_str()) {
                *line = rendered.clone();
                found = true;
            }
        }
        if !found {
            lines.push(rendered);
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Values with whitespace, control characters or a double quote are wrapped in double quotes.
/// Inside the quotes `\`, `"` and `'` are backslash-escaped, and line breaks are written as `\n` /
/// `\r` so a value always stays on its own line.
pub fn quote_if_needed(value: &str) -> String {
    if !value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '"')
    {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' | '\'' => {
                escaped.push('\\');
                escaped.push(c);
            }
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(c),
        }
    }
    escaped.push('"');
    escaped
}
