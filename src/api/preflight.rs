// Server requirements checks
//
// Read-only probes of the interpreter the application runs on, its loaded extensions and the
// writability of the directories it needs. The aggregate feeds the requirements step's gate.

use crate::config::{InstallerConfig, RuntimeConfig};
use crate::installation::{run_cmd_with_timeout, CommandSpec};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCheck {
    pub current: String,
    pub required: String,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCheck {
    pub exists: bool,
    pub writable: bool,
}

/// Full requirements result; also the requirements step's committed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementsReport {
    #[serde(rename = "php")]
    pub runtime: RuntimeCheck,
    pub extensions: BTreeMap<String, bool>,
    pub permissions: BTreeMap<String, PathCheck>,
}

impl RequirementsReport {
    pub fn all_passed(&self) -> bool {
        self.runtime.passed
            && self.extensions.values().all(|loaded| *loaded)
            && self.permissions.values().all(|p| p.exists && p.writable)
    }
}

/// Source of interpreter facts.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    async fn version(&self) -> Result<String>;
    async fn modules(&self) -> Result<Vec<String>>;
}

/// Asks the configured interpreter binary directly.
pub struct CommandRuntimeProbe {
    runtime: RuntimeConfig,
}

impl CommandRuntimeProbe {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self { runtime }
    }

    async fn run(&self, args: &[String], operation: &str) -> Result<String> {
        let program = which::which(&self.runtime.program)
            .map_err(|e| anyhow!("'{}' not found on PATH: {}", self.runtime.program, e))?;
        let spec = CommandSpec::new(program.to_string_lossy().to_string()).args(args.iter().cloned());
        let out = run_cmd_with_timeout(&spec, PROBE_TIMEOUT, operation).await?;
        if !out.success() {
            return Err(anyhow!(
                "{} exited with {:?}: {}",
                self.runtime.program,
                out.exit_code,
                out.last_line()
            ));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl RuntimeProbe for CommandRuntimeProbe {
    async fn version(&self) -> Result<String> {
        let out = self.run(&self.runtime.version_args, "runtime_version").await?;
        Ok(out.trim().to_string())
    }

    async fn modules(&self) -> Result<Vec<String>> {
        let out = self.run(&self.runtime.modules_args, "runtime_modules").await?;
        Ok(parse_module_list(&out))
    }
}

/// Module names from `php -m` style output; section headers are skipped.
pub fn parse_module_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('['))
        .map(str::to_string)
        .collect()
}

fn version_parts(version: &str) -> Vec<u64> {
    version
        .trim()
        .split('.')
        .map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// `current >= required`, comparing dotted numeric components.
pub fn version_satisfies(current: &str, required: &str) -> bool {
    let mut a = version_parts(current);
    let mut b = version_parts(required);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a >= b
}

/// Directories are probed with a throwaway file; files are opened for append without writing.
fn is_writable(path: &Path) -> bool {
    if path.is_dir() {
        let write_test = path.join(format!(".installer_write_test_{}.tmp", Uuid::new_v4().simple()));
        let ok = std::fs::write(&write_test, b"ok").is_ok();
        let _ = std::fs::remove_file(&write_test);
        return ok;
    }
    std::fs::OpenOptions::new().append(true).open(path).is_ok()
}

pub fn check_path(path: &Path) -> PathCheck {
    let exists = path.exists();
    PathCheck {
        exists,
        writable: exists && is_writable(path),
    }
}

pub struct RequirementsChecker {
    config: Arc<InstallerConfig>,
    probe: Arc<dyn RuntimeProbe>,
}

impl RequirementsChecker {
    pub fn new(config: Arc<InstallerConfig>, probe: Arc<dyn RuntimeProbe>) -> Self {
        Self { config, probe }
    }

    pub async fn check(&self) -> RequirementsReport {
        let reqs = &self.config.requirements;
        info!(
            "[PHASE: preflight] [STEP: requirements] Checking server requirements (minimum={}, extensions={}, paths={})",
            reqs.runtime.minimum,
            reqs.extensions.len(),
            reqs.permissions.len()
        );

        let runtime = match self.probe.version().await {
            Ok(current) => RuntimeCheck {
                passed: version_satisfies(&current, &reqs.runtime.minimum),
                current,
                required: reqs.runtime.minimum.clone(),
            },
            Err(e) => {
                warn!(
                    "[PHASE: preflight] [STEP: runtime_version] Probe failed: {:#}",
                    e
                );
                RuntimeCheck {
                    current: "unavailable".to_string(),
                    required: reqs.runtime.minimum.clone(),
                    passed: false,
                }
            }
        };

        let loaded: HashSet<String> = match self.probe.modules().await {
            Ok(modules) => modules.iter().map(|m| m.to_ascii_lowercase()).collect(),
            Err(e) => {
                warn!(
                    "[PHASE: preflight] [STEP: runtime_modules] Probe failed: {:#}",
                    e
                );
                HashSet::new()
            }
        };
        let extensions = reqs
            .extensions
            .iter()
            .map(|ext| (ext.clone(), loaded.contains(&ext.to_ascii_lowercase())))
            .collect();

        let permissions = reqs
            .permissions
            .iter()
            .map(|p| (p.clone(), check_path(&self.config.resolve(Path::new(p)))))
            .collect();

        let report = RequirementsReport {
            runtime,
            extensions,
            permissions,
        };
        info!(
            "[PHASE: preflight] [STEP: requirements] Requirements checked (runtime={}, passed={})",
            report.runtime.current,
            report.all_passed()
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod stubs {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub struct StubProbe {
        pub version: Option<String>,
        pub modules: Vec<String>,
        pub calls: AtomicU32,
    }

    impl StubProbe {
        pub fn new(version: &str, modules: &[&str]) -> Self {
            Self {
                version: Some(version.to_string()),
                modules: modules.iter().map(|m| m.to_string()).collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RuntimeProbe for StubProbe {
        async fn version(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.version
                .clone()
                .ok_or_else(|| anyhow!("php: command not found"))
        }

        async fn modules(&self) -> Result<Vec<String>> {
            Ok(self.modules.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stubs::StubProbe;
    use super::*;

    fn config_in(dir: &Path) -> Arc<InstallerConfig> {
        let mut config = InstallerConfig {
            base_path: dir.to_path_buf(),
            ..InstallerConfig::default()
        };
        config.requirements.extensions = vec!["pdo".to_string(), "mbstring".to_string()];
        config.requirements.permissions = vec!["storage/".to_string(), ".env".to_string()];
        Arc::new(config)
    }

    #[test]
    fn version_comparison_is_numeric() {
        assert!(version_satisfies("8.2.12", "8.1.0"));
        assert!(version_satisfies("8.1", "8.1.0"));
        assert!(version_satisfies("8.10.0", "8.9.0"));
        assert!(version_satisfies("8.3.4-1ubuntu2", "8.3.4"));
        assert!(!version_satisfies("8.0.30", "8.1.0"));
    }

    #[test]
    fn module_list_skips_section_headers() {
        let out = "[PHP Modules]\nCore\nmbstring\nPDO\n\n[Zend Modules]\nZend OPcache\n";
        assert_eq!(
            parse_module_list(out),
            vec!["Core", "mbstring", "PDO", "Zend OPcache"]
        );
    }

    #[tokio::test]
    async fn all_checks_pass_when_everything_is_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("storage")).expect("mkdir");
        std::fs::write(dir.path().join(".env"), "").expect("env");

        let checker = RequirementsChecker::new(
            config_in(dir.path()),
            Arc::new(StubProbe::new("8.3.1", &["PDO", "mbstring"])),
        );
        let report = checker.check().await;
        assert!(report.runtime.passed);
        assert_eq!(report.extensions["pdo"], true, "extension match ignores case");
        assert!(report.permissions["storage/"].writable);
        assert!(report.all_passed());
    }

    #[tokio::test]
    async fn missing_path_and_extension_fail_the_gate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let checker = RequirementsChecker::new(
            config_in(dir.path()),
            Arc::new(StubProbe::new("8.3.1", &["pdo"])),
        );
        let report = checker.check().await;
        assert!(!report.extensions["mbstring"]);
        assert_eq!(
            report.permissions[".env"],
            PathCheck {
                exists: false,
                writable: false
            }
        );
        assert!(!report.all_passed());
    }

    #[tokio::test]
    async fn unavailable_runtime_fails_without_erroring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let probe = StubProbe {
            version: None,
            ..StubProbe::new("", &[])
        };
        let checker = RequirementsChecker::new(config_in(dir.path()), Arc::new(probe));
        let report = checker.check().await;
        assert_eq!(report.runtime.current, "unavailable");
        assert!(!report.runtime.passed);
    }

    #[test]
    fn path_checks_leave_nothing_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let check = check_path(dir.path());
        assert!(check.exists && check.writable);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);

        let file = dir.path().join("app.log");
        std::fs::write(&file, "line\n").expect("write");
        assert!(check_path(&file).writable);
        assert_eq!(std::fs::read_to_string(&file).expect("read"), "line\n");

        let missing = check_path(&dir.path().join("missing"));
        assert!(!missing.exists && !missing.writable);
    }

    #[test]
    fn report_serializes_with_php_key() {
        let report = RequirementsReport {
            runtime: RuntimeCheck {
                current: "8.3.1".to_string(),
                required: "8.1.0".to_string(),
                passed: true,
            },
            extensions: BTreeMap::new(),
            permissions: BTreeMap::new(),
        };
        let v = serde_json::to_value(&report).expect("json");
        assert_eq!(v["php"]["passed"], true);
    }
}
