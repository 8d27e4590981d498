// Schema runner
//
// Migrations and seeders belong to the application; the installer only invokes its console with
// non-interactive flags and classifies the outcome. Connection parameters are handed over through
// the child environment so the freshly submitted values win over any stale configuration file.

use crate::config::InstallerConfig;
use crate::error::ProvisionError;
use crate::installation::{run_cmd_with_timeout, CommandError, CommandSpec};
use crate::models::requests::DatabaseParams;
use async_trait::async_trait;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// Drop every table and run all migrations from scratch.
    Fresh,
    /// Run outstanding migrations only.
    Incremental,
}

#[async_trait]
pub trait SchemaRunner: Send + Sync {
    async fn migrate(&self, params: &DatabaseParams, mode: MigrationMode)
        -> Result<(), ProvisionError>;

    async fn seed(&self, params: &DatabaseParams) -> Result<(), ProvisionError>;
}

/// Runs `<program> <args...> migrate[:fresh] --force --no-interaction` and `db:seed`.
pub struct CommandSchemaRunner {
    program: String,
    base_args: Vec<String>,
    cwd: PathBuf,
    migration_timeout: Duration,
    seed_timeout: Duration,
}

impl CommandSchemaRunner {
    pub fn new(
        program: impl Into<String>,
        base_args: Vec<String>,
        cwd: impl Into<PathBuf>,
        migration_timeout: Duration,
        seed_timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            base_args,
            cwd: cwd.into(),
            migration_timeout,
            seed_timeout,
        }
    }

    pub fn from_config(config: &InstallerConfig) -> Self {
        let p = &config.provisioning;
        Self::new(
            p.artisan.program.clone(),
            p.artisan.args.clone(),
            config.base_path.clone(),
            p.migration_timeout(),
            p.seed_timeout(),
        )
    }

    fn spec(&self, command: &[&str], params: &DatabaseParams) -> CommandSpec {
        CommandSpec::new(self.program.clone())
            .args(self.base_args.iter().cloned())
            .args(command.iter().copied())
            .envs(params.as_env())
            .cwd(self.cwd.clone())
    }
}

pub fn migration_args(mode: MigrationMode) -> Vec<&'static str> {
    let command = match mode {
        MigrationMode::Fresh => "migrate:fresh",
        MigrationMode::Incremental => "migrate",
    };
    vec![command, "--force", "--no-interaction"]
}

fn classify(
    result: Result<crate::installation::CommandOutput, CommandError>,
    operation: &str,
    on_failure: impl Fn(String) -> ProvisionError,
) -> Result<(), ProvisionError> {
    match result {
        Ok(out) if out.success() => {
            info!(
                "[PHASE: provisioning] [STEP: {}] Completed (duration_ms={})",
                operation, out.duration_ms
            );
            Ok(())
        }
        Ok(out) => {
            let detail = format!(
                "exit code {:?}: {}",
                out.exit_code,
                out.last_line()
            );
            error!("[PHASE: provisioning] [STEP: {}] Failed: {}", operation, detail);
            Err(on_failure(detail))
        }
        Err(CommandError::TimedOut { timeout_ms, .. }) => {
            error!(
                "[PHASE: provisioning] [STEP: {}] Timed out after {}ms",
                operation, timeout_ms
            );
            Err(ProvisionError::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            })
        }
        Err(CommandError::Failed(e)) => {
            error!("[PHASE: provisioning] [STEP: {}] Could not run: {:#}", operation, e);
            Err(on_failure(format!("{:#}", e)))
        }
    }
}

#[async_trait]
impl SchemaRunner for CommandSchemaRunner {
    async fn migrate(
        &self,
        params: &DatabaseParams,
        mode: MigrationMode,
    ) -> Result<(), ProvisionError> {
        info!(
            "[PHASE: provisioning] [STEP: database_migration] Running migrations (mode={:?}, database={})",
            mode, params.database
        );
        let spec = self.spec(&migration_args(mode), params);
        let result = run_cmd_with_timeout(&spec, self.migration_timeout, "database_migration").await;
        classify(result, "database_migration", |detail| {
            ProvisionError::Migration { detail }
        })
    }

    async fn seed(&self, params: &DatabaseParams) -> Result<(), ProvisionError> {
        info!(
            "[PHASE: provisioning] [STEP: database_seed] Seeding database (database={})",
            params.database
        );
        let spec = self.spec(&["db:seed", "--force", "--no-interaction"], params);
        let result = run_cmd_with_timeout(&spec, self.seed_timeout, "database_seed").await;
        classify(result, "database_seed", |detail| ProvisionError::Seed { detail })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DatabaseParams {
        DatabaseParams {
            connection: "mysql".to_string(),
            host: "127.0.0.1".to_string(),
            port: "3306".to_string(),
            database: "shop".to_string(),
            username: "root".to_string(),
            password: "PASSWORD_SHOULD_BE_REDACTED".to_string(),
        }
    }

    #[test]
    fn migration_args_are_non_interactive() {
        assert_eq!(
            migration_args(MigrationMode::Fresh),
            vec!["migrate:fresh", "--force", "--no-interaction"]
        );
        assert_eq!(migration_args(MigrationMode::Incremental)[0], "migrate");
    }

    #[test]
    fn connection_parameters_travel_in_the_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandSchemaRunner::new(
            "php",
            vec!["artisan".to_string()],
            dir.path(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let spec = runner.spec(&migration_args(MigrationMode::Fresh), &params());
        assert_eq!(spec.args[0], "artisan");
        assert_eq!(spec.args[1], "migrate:fresh");
        assert!(spec.args.iter().all(|a| !a.contains("PASSWORD_SHOULD_BE_REDACTED")));
        assert!(spec
            .envs
            .iter()
            .any(|(k, v)| k == "DB_DATABASE" && v == "shop"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_a_migration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandSchemaRunner::new(
            "sh",
            vec!["-c".to_string(), "echo 'SQLSTATE[42S01]' >&2; exit 1".to_string()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let err = runner
            .migrate(&params(), MigrationMode::Fresh)
            .await
            .unwrap_err();
        match err {
            ProvisionError::Migration { detail } => assert!(detail.contains("SQLSTATE"), "{}", detail),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_seeder_is_a_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandSchemaRunner::new(
            "sh",
            vec!["-c".to_string(), "sleep 5".to_string()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_millis(200),
        );
        let err = runner.seed(&params()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_reads_database_from_environment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = CommandSchemaRunner::new(
            "sh",
            vec!["-c".to_string(), "test \"$DB_DATABASE\" = shop".to_string()],
            dir.path(),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        runner
            .migrate(&params(), MigrationMode::Incremental)
            .await
            .expect("migrate");
    }
}
