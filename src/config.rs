// Installer configuration
//
// Loaded once per process from an optional TOML file layered with `INSTALLER__*` environment
// overrides, then threaded into every component as an immutable value.

use crate::error::{InstallerError, InstallerResult};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "installer.toml";

/// Which handler a configured step is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Welcome,
    Requirements,
    Environment,
    Mail,
    Admin,
    Finish,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    pub handler: StepKind,
}

impl StepConfig {
    fn new(key: &str, label: &str, description: &str, handler: StepKind) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            optional: false,
            handler,
        }
    }
}

/// External command invocation (program + fixed leading arguments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter whose version and modules are probed.
    pub program: String,
    pub version_args: Vec<String>,
    pub modules_args: Vec<String>,
    pub minimum: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            program: "php".to_string(),
            version_args: vec!["-r".to_string(), "echo PHP_VERSION;".to_string()],
            modules_args: vec!["-m".to_string()],
            minimum: "8.1.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequirementsConfig {
    pub runtime: RuntimeConfig,
    pub extensions: Vec<String>,
    /// Paths (relative to `base_path`) that must exist and be writable.
    pub permissions: Vec<String>,
}

impl Default for RequirementsConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            extensions: ["openssl", "pdo", "mbstring", "tokenizer", "xml", "ctype", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            permissions: [
                "storage/",
                "storage/app/",
                "storage/framework/",
                "storage/logs/",
                "bootstrap/cache/",
                ".env",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// What the environment step asks for and what it writes as APP_ENV / APP_DEBUG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub production: bool,
    pub debug: bool,
    pub database: bool,
    pub mail: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            production: true,
            debug: false,
            database: true,
            mail: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    pub lock_file: PathBuf,
    pub progress_file: PathBuf,
    pub env_file: PathBuf,
    pub redirect_after_install: String,
    pub log_folder: Option<PathBuf>,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("storage/installed.lock"),
            progress_file: PathBuf::from("storage/install-progress.json"),
            env_file: PathBuf::from(".env"),
            redirect_after_install: "/".to_string(),
            log_folder: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Application console used for migrations, seeding and admin creation.
    pub artisan: CommandConfig,
    /// Drop and recreate the schema (`migrate:fresh`) instead of a plain `migrate`.
    pub fresh_migrations: bool,
    pub admin_command: Vec<String>,
    pub migration_timeout_secs: u64,
    pub seed_timeout_secs: u64,
    pub storage_link_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub connect_retries: usize,
    pub storage_link_target: PathBuf,
    pub storage_link_path: PathBuf,
    /// Cached configuration files removed before the live connection is reconfigured.
    pub config_cache_files: Vec<PathBuf>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            artisan: CommandConfig {
                program: "php".to_string(),
                args: vec!["artisan".to_string()],
            },
            fresh_migrations: true,
            admin_command: vec!["installer:create-admin".to_string()],
            migration_timeout_secs: 300,
            seed_timeout_secs: 300,
            storage_link_timeout_secs: 30,
            connect_timeout_secs: 20,
            connect_retries: 3,
            storage_link_target: PathBuf::from("storage/app/public"),
            storage_link_path: PathBuf::from("public/storage"),
            config_cache_files: vec![PathBuf::from("bootstrap/cache/config.php")],
        }
    }
}

impl ProvisioningConfig {
    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }

    pub fn seed_timeout(&self) -> Duration {
        Duration::from_secs(self.seed_timeout_secs)
    }

    pub fn storage_link_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_link_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub app_name: String,
    /// Master switch; when false the wizard is unreachable.
    pub run_installer: bool,
    /// Verbose error messages (raw detail instead of generic text).
    pub debug: bool,
    /// Root of the application being installed; relative paths resolve against it.
    pub base_path: PathBuf,
    pub steps: Vec<StepConfig>,
    pub requirements: RequirementsConfig,
    pub environment: EnvironmentConfig,
    pub create_admin: bool,
    pub link_storage: bool,
    pub seed_database: bool,
    pub options: OptionsConfig,
    pub provisioning: ProvisioningConfig,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            app_name: "Laravel Installer".to_string(),
            run_installer: true,
            debug: false,
            base_path: PathBuf::from("."),
            steps: default_steps(),
            requirements: RequirementsConfig::default(),
            environment: EnvironmentConfig::default(),
            create_admin: true,
            link_storage: true,
            seed_database: true,
            options: OptionsConfig::default(),
            provisioning: ProvisioningConfig::default(),
        }
    }
}

pub fn default_steps() -> Vec<StepConfig> {
    vec![
        StepConfig::new("welcome", "Welcome", "Getting started", StepKind::Welcome),
        StepConfig::new(
            "requirements",
            "Server Requirements",
            "Check all necessary requirements",
            StepKind::Requirements,
        ),
        StepConfig::new(
            "environment",
            "Environment Settings",
            "Gather environmental settings",
            StepKind::Environment,
        ),
        StepConfig::new("admin", "Create Admin", "Create Admin User", StepKind::Admin),
        StepConfig::new("finish", "Finish", "Finish setup", StepKind::Finish),
    ]
}

impl InstallerConfig {
    /// Load configuration from `path` (or `installer.toml` when present) plus environment
    /// overrides such as `INSTALLER__DEBUG=true` or `INSTALLER__OPTIONS__ENV_FILE=.env.local`.
    pub fn load(path: Option<&Path>) -> InstallerResult<Self> {
        let (file, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        info!(
            "[PHASE: initialization] [STEP: config] Loading installer configuration (file={:?}, required={})",
            file, required
        );

        let settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(
                config::Environment::with_prefix("INSTALLER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: InstallerConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural checks that do not touch the file system.
    pub fn validate(&self) -> InstallerResult<()> {
        if self.steps.is_empty() {
            return Err(InstallerError::Config(
                "at least one step must be configured".to_string(),
            ));
        }
        if self.options.redirect_after_install.trim().is_empty() {
            return Err(InstallerError::Config(
                "options.redirect_after_install must not be empty".to_string(),
            ));
        }
        if self.provisioning.artisan.program.trim().is_empty() {
            return Err(InstallerError::Config(
                "provisioning.artisan.program must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a configured path against `base_path` unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    pub fn progress_path(&self) -> PathBuf {
        self.resolve(&self.options.progress_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(&self.options.lock_file)
    }

    pub fn env_path(&self) -> PathBuf {
        self.resolve(&self.options.env_file)
    }

    /// Effective configuration rendered as TOML.
    pub fn to_toml(&self) -> InstallerResult<String> {
        toml::to_string_pretty(self).map_err(|e| InstallerError::Config(e.to_string()))
    }
}
