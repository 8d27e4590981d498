// Installation side effects
//
// External command execution with timeouts, the flat configuration file editor, the storage
// linker and the provisioner that orchestrates them.
//
// IMPORTANT:
// - Never log secrets (passwords are passed through the environment and never echoed).
// - Destructive commands (fresh migrations) run exactly once per attempt; no automatic retry.

pub mod env_file;
pub mod provisioner;
pub mod storage;

use anyhow::Context;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::utils::logging::mask_sensitive;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty line of stderr (or stdout), for error summaries.
    pub fn last_line(&self) -> String {
        let last = |text: &str| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .map(str::to_string)
        };
        last(&self.stderr)
            .or_else(|| last(&self.stdout))
            .unwrap_or_default()
    }
}

/// Program, arguments and extra environment for one external invocation.
#[derive(Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_names: Vec<&str> = self.envs.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("envs", &env_names)
            .field("cwd", &self.cwd)
            .finish()
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command timed out after {timeout_ms}ms (operation={operation}, program={program})")]
    TimedOut {
        operation: String,
        program: String,
        timeout_ms: u128,
    },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

fn mask_arg_for_log(arg: &str) -> String {
    // Heuristic masking: treat anything that looks like a secret as sensitive.
    let lower = arg.to_ascii_lowercase();
    if lower.contains("password")
        || lower.contains("pwd=")
        || lower.contains("secret")
        || lower.contains("token")
    {
        return "***".to_string();
    }

    if arg.len() > 48 {
        return mask_sensitive(arg);
    }
    arg.to_string()
}

/// Run an external command once with a hard timeout.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success). On
/// timeout the child is killed and reaped before `CommandError::TimedOut` is returned.
pub async fn run_cmd_with_timeout(
    spec: &CommandSpec,
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput, CommandError> {
    let started = Instant::now();

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout entered (operation={}, program={}, args=[{}], env=[{}], timeout_ms={})",
        operation,
        spec.program,
        spec.args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        spec.envs.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            spec.program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)
                .context(format!(
                    "Command wait failed (operation={}, program={})",
                    operation, spec.program
                ))
                .into());
        }
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                spec.program,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, spec.program, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(CommandError::TimedOut {
                operation: operation.to_string(),
                program: spec.program.clone(),
                timeout_ms: timeout_dur.as_millis(),
            });
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        spec.program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_arg_for_log_redacts_passwordish_values() {
        assert_eq!(mask_arg_for_log("--password=PASSWORD_SHOULD_BE_REDACTED"), "***");
        assert_eq!(mask_arg_for_log("pwd=PASSWORD_SHOULD_BE_REDACTED"), "***");
        assert_eq!(mask_arg_for_log("migrate:fresh"), "migrate:fresh");
    }

    #[test]
    fn command_spec_debug_hides_env_values() {
        let spec = CommandSpec::new("php")
            .args(["artisan", "migrate"])
            .envs(vec![("DB_PASSWORD".to_string(), "PASSWORD_SHOULD_BE_REDACTED".to_string())]);
        let rendered = format!("{:?}", spec);
        assert!(rendered.contains("DB_PASSWORD"));
        assert!(!rendered.contains("PASSWORD_SHOULD_BE_REDACTED"));
    }

    #[test]
    fn last_line_prefers_stderr() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "Migrating\n".to_string(),
            stderr: "SQLSTATE[42S01]: table exists\n\n".to_string(),
            duration_ms: 1,
        };
        assert_eq!(out.last_line(), "SQLSTATE[42S01]: table exists");
        let only_out = CommandOutput {
            stderr: String::new(),
            ..out
        };
        assert_eq!(only_out.last_line(), "Migrating");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_cmd_with_timeout_basic_smoke() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "echo \"hello $GREETING_NAME\""])
            .envs(vec![("GREETING_NAME".to_string(), "installer".to_string())]);

        let out = run_cmd_with_timeout(&spec, Duration::from_secs(5), "test_echo")
            .await
            .expect("command should run");
        assert!(out.success());
        assert!(out.stdout.contains("hello installer"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_cmd_with_timeout_kills_slow_commands() {
        let spec = CommandSpec::new("sh").args(["-c", "sleep 5"]);
        let started = Instant::now();
        let err = run_cmd_with_timeout(&spec, Duration::from_millis(200), "test_sleep")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }), "{:?}", err);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_program_is_a_failure_not_a_timeout() {
        let spec = CommandSpec::new("definitely-not-a-real-program-7f3a");
        let err = run_cmd_with_timeout(&spec, Duration::from_secs(2), "test_missing")
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Failed(_)));
    }
}
