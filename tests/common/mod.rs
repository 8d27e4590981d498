// Deterministic collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use first_run_installer::api::preflight::RuntimeProbe;
use first_run_installer::config::InstallerConfig;
use first_run_installer::database::connection::{ConnectError, LiveConnection};
use first_run_installer::database::migrations::{MigrationMode, SchemaRunner};
use first_run_installer::error::ProvisionError;
use first_run_installer::installation::storage::StorageLinker;
use first_run_installer::models::requests::{AdminAccount, DatabaseParams};
use first_run_installer::wizard::controller::{WizardController, WizardDeps};
use first_run_installer::wizard::steps::UserStore;
use first_run_installer::wizard::store::ProgressStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeDatabase {
    pub params: Mutex<Option<DatabaseParams>>,
    pub unreachable: bool,
    pub queries: AtomicU32,
}

#[async_trait]
impl LiveConnection for FakeDatabase {
    async fn reconfigure(&self, params: &DatabaseParams) -> Result<(), ConnectError> {
        *self.params.lock().expect("lock") = Some(params.clone());
        Ok(())
    }

    async fn current_database(&self) -> Result<String, ConnectError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(ConnectError {
                user_message: "Unable to connect.".to_string(),
                internal_details: "SQLSTATE[HY000] [2002] Connection refused".to_string(),
                timed_out: false,
            });
        }
        Ok(self
            .params
            .lock()
            .expect("lock")
            .as_ref()
            .map(|p| p.database.clone())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeSchema {
    pub migrations: AtomicU32,
    pub seeds: AtomicU32,
}

#[async_trait]
impl SchemaRunner for FakeSchema {
    async fn migrate(&self, _params: &DatabaseParams, _mode: MigrationMode) -> Result<(), ProvisionError> {
        self.migrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn seed(&self, _params: &DatabaseParams) -> Result<(), ProvisionError> {
        self.seeds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Storage linker that optionally writes the progress document behind the controller's back.
#[derive(Default)]
pub struct FakeLinker {
    pub calls: AtomicU32,
    pub interfere_with: Option<ProgressStore>,
}

#[async_trait]
impl StorageLinker for FakeLinker {
    async fn link(&self) -> Result<(), ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = &self.interfere_with {
            let mut other = store.load().map_err(|e| ProvisionError::StorageLink {
                detail: e.to_string(),
            })?;
            store.save(&mut other).map_err(|e| ProvisionError::StorageLink {
                detail: e.to_string(),
            })?;
        }
        Ok(())
    }
}

pub struct FakeProbe;

#[async_trait]
impl RuntimeProbe for FakeProbe {
    async fn version(&self) -> anyhow::Result<String> {
        Ok("8.3.4".to_string())
    }

    async fn modules(&self) -> anyhow::Result<Vec<String>> {
        Ok(["openssl", "PDO", "mbstring", "tokenizer", "xml", "ctype", "json"]
            .iter()
            .map(|m| m.to_string())
            .collect())
    }
}

#[derive(Default)]
pub struct FakeUsers {
    pub created: Mutex<Vec<String>>,
}

#[async_trait]
impl UserStore for FakeUsers {
    async fn create_admin(&self, account: &AdminAccount) -> anyhow::Result<()> {
        self.created
            .lock()
            .expect("lock")
            .push(account.email.clone().unwrap_or_default());
        Ok(())
    }
}

pub struct Install {
    pub dir: tempfile::TempDir,
    pub config: Arc<InstallerConfig>,
    pub database: Arc<FakeDatabase>,
    pub schema: Arc<FakeSchema>,
    pub linker: Arc<FakeLinker>,
    pub users: Arc<FakeUsers>,
    pub wizard: WizardController,
}

/// Application tree whose requirements all pass.
pub fn app_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for sub in [
        "storage/app/public",
        "storage/framework",
        "storage/logs",
        "bootstrap/cache",
        "public",
    ] {
        std::fs::create_dir_all(dir.path().join(sub)).expect("mkdir");
    }
    std::fs::write(dir.path().join(".env"), "APP_NAME=Laravel\nAPP_KEY=base64:abc\n").expect("env");
    dir
}

pub fn install(adjust: impl FnOnce(&mut InstallerConfig)) -> Install {
    install_with(adjust, FakeDatabase::default(), |_| FakeLinker::default())
}

pub fn install_with(
    adjust: impl FnOnce(&mut InstallerConfig),
    database: FakeDatabase,
    linker: impl FnOnce(&InstallerConfig) -> FakeLinker,
) -> Install {
    let dir = app_dir();
    let mut config = InstallerConfig {
        base_path: dir.path().to_path_buf(),
        ..InstallerConfig::default()
    };
    config.options.log_folder = Some("storage/logs".into());
    adjust(&mut config);
    let linker = Arc::new(linker(&config));
    let config = Arc::new(config);
    let database = Arc::new(database);
    let schema = Arc::new(FakeSchema::default());
    let users = Arc::new(FakeUsers::default());
    let wizard = WizardController::new(
        Arc::clone(&config),
        WizardDeps {
            connection: database.clone(),
            schema: schema.clone(),
            linker: linker.clone(),
            probe: Arc::new(FakeProbe),
            users: users.clone(),
        },
    )
    .expect("controller");
    Install {
        dir,
        config,
        database,
        schema,
        linker,
        users,
        wizard,
    }
}

pub fn environment(database: &str) -> Value {
    json!({
        "app_url": "https://shop.example.test",
        "db_connection": "mysql",
        "db_host": "127.0.0.1",
        "db_port": "3306",
        "db_database": database,
        "db_username": "shop",
        "db_password": "s3cret pass"
    })
}

pub fn admin() -> Value {
    json!({
        "name": "Ada Lovelace",
        "email": "ada@example.test",
        "password": "analytical",
        "password_confirmation": "analytical"
    })
}

pub fn count(counter: &AtomicU32) -> u32 {
    counter.load(Ordering::SeqCst)
}

impl Install {
    pub fn env_text(&self) -> String {
        std::fs::read_to_string(self.config.env_path()).expect("env file")
    }

    pub fn store(&self) -> &ProgressStore {
        self.wizard.store()
    }
}
