// Step handlers
//
// Each configured step is bound to one handler. A handler prepares the context its page needs on
// mount and turns a submission into events for the controller: either a validated payload to
// commit (`StepCompleted`) or an error that keeps the operator on the page. Handlers never touch
// the progress document directly; the finish handler is the one exception since finalizing ends
// the wizard.

use crate::api::preflight::RequirementsChecker;
use crate::config::{InstallerConfig, StepKind};
use crate::error::ValidationError;
use crate::installation::{run_cmd_with_timeout, CommandError, CommandSpec};
use crate::models::progress::Progress;
use crate::models::requests::{AdminAccount, EnvironmentSettings, MailSettings};
use crate::utils::logging::redact_payload;
use crate::utils::validation::FieldValidator;
use crate::wizard::lock::InstallLock;
use crate::wizard::registry::StepRegistry;
use crate::wizard::store::ProgressStore;
use crate::wizard::summary::{render_settings, settings_file_name};
use anyhow::anyhow;
use async_trait::async_trait;
use log::{error, info};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const ADMIN_TIMEOUT: Duration = Duration::from_secs(60);

const DATABASE_KEYS: [&str; 7] = [
    "app_url",
    "db_connection",
    "db_host",
    "db_port",
    "db_database",
    "db_username",
    "db_password",
];

const MAIL_KEYS: [&str; 7] = [
    "mail_mailer",
    "mail_host",
    "mail_port",
    "mail_username",
    "mail_password",
    "mail_from_address",
    "mail_from_name",
];

/// Signals a step raises towards the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    CanProceed,
    CannotProceed,
    Error(String),
    StepCompleted(Value),
}

/// Read-only view handed to a handler.
pub struct StepContext<'a> {
    pub config: &'a InstallerConfig,
    pub registry: &'a StepRegistry,
    pub step_key: &'a str,
    pub progress: &'a Progress,
    pub store: &'a ProgressStore,
    pub lock: &'a InstallLock,
}

#[derive(Debug, Clone, Default)]
pub struct StepMount {
    pub context: Value,
    pub events: Vec<StepEvent>,
}

impl StepMount {
    fn new(context: Value, event: StepEvent) -> Self {
        Self {
            context,
            events: vec![event],
        }
    }
}

#[async_trait]
pub trait StepLogic: Send + Sync {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount;

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError>;
}

/// Creates the first administrator account in the application.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_admin(&self, account: &AdminAccount) -> anyhow::Result<()>;
}

/// Runs the application's console command; the password travels in the environment only.
pub struct CommandUserStore {
    program: String,
    args: Vec<String>,
    cwd: std::path::PathBuf,
    timeout: Duration,
}

impl CommandUserStore {
    pub fn from_config(config: &InstallerConfig) -> Self {
        let artisan = &config.provisioning.artisan;
        let mut args = artisan.args.clone();
        args.extend(config.provisioning.admin_command.iter().cloned());
        Self {
            program: artisan.program.clone(),
            args,
            cwd: config.base_path.clone(),
            timeout: ADMIN_TIMEOUT,
        }
    }
}

#[async_trait]
impl UserStore for CommandUserStore {
    async fn create_admin(&self, account: &AdminAccount) -> anyhow::Result<()> {
        let spec = CommandSpec::new(self.program.clone())
            .args(self.args.iter().cloned())
            .args([
                format!("--name={}", account.name.as_deref().unwrap_or_default()),
                format!("--email={}", account.email.as_deref().unwrap_or_default()),
                "--no-interaction".to_string(),
            ])
            .envs(vec![(
                "INSTALLER_ADMIN_PASSWORD".to_string(),
                account.password.clone().unwrap_or_default(),
            )])
            .cwd(&self.cwd);

        let out = match run_cmd_with_timeout(&spec, self.timeout, "create_admin").await {
            Ok(out) => out,
            Err(CommandError::TimedOut { timeout_ms, .. }) => {
                return Err(anyhow!("admin creation timed out after {}ms", timeout_ms))
            }
            Err(CommandError::Failed(e)) => return Err(e),
        };
        if !out.success() {
            return Err(anyhow!(
                "exit code {:?}: {}",
                out.exit_code,
                out.last_line()
            ));
        }
        Ok(())
    }
}

fn str_field<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

/// Copy `keys` present in `input`, values untouched.
fn pick(input: &Value, keys: &[&str]) -> Value {
    let mut out = Map::new();
    for key in keys {
        if let Some(v) = input.get(*key) {
            out.insert((*key).to_string(), v.clone());
        }
    }
    Value::Object(out)
}

/// Overlay `saved` onto `defaults`, then hide secrets.
fn prefill(defaults: Value, saved: Option<&Value>) -> Value {
    let mut merged = defaults;
    if let (Some(target), Some(Value::Object(saved))) = (merged.as_object_mut(), saved) {
        for (k, v) in saved {
            target.insert(k.clone(), v.clone());
        }
    }
    redact_payload(&merged)
}

fn mail_defaults() -> Value {
    json!({
        "mail_mailer": "smtp",
        "mail_host": "127.0.0.1",
        "mail_port": "587",
        "mail_username": "",
        "mail_password": "",
        "mail_from_address": "",
        "mail_from_name": "",
    })
}

fn validate_mail(v: &mut FieldValidator, mail: &MailSettings) {
    v.required("mail_mailer", mail.mail_mailer.as_deref())
        .no_whitespace("mail_mailer", mail.mail_mailer.as_deref());
    v.required("mail_host", mail.mail_host.as_deref())
        .no_whitespace("mail_host", mail.mail_host.as_deref());
    v.required("mail_port", mail.mail_port.as_deref())
        .numeric("mail_port", mail.mail_port.as_deref());
    v.required("mail_username", mail.mail_username.as_deref());
    v.required("mail_password", mail.mail_password.as_deref());
    v.required("mail_from_address", mail.mail_from_address.as_deref())
        .email("mail_from_address", mail.mail_from_address.as_deref());
    v.required("mail_from_name", mail.mail_from_name.as_deref());
}

pub struct WelcomeStep;

#[async_trait]
impl StepLogic for WelcomeStep {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount {
        let reqs = &ctx.config.requirements;
        StepMount::new(
            json!({
                "app_name": ctx.config.app_name,
                "minimum_runtime": reqs.runtime.minimum,
                "extensions": reqs.extensions,
                "database_required": ctx.config.environment.database,
                "mail_required": ctx.config.environment.mail,
            }),
            StepEvent::CanProceed,
        )
    }

    async fn complete(
        &self,
        _ctx: &StepContext<'_>,
        _input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        Ok(vec![StepEvent::StepCompleted(Value::Null)])
    }
}

pub struct RequirementsStep {
    checker: Arc<RequirementsChecker>,
}

impl RequirementsStep {
    pub fn new(checker: Arc<RequirementsChecker>) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl StepLogic for RequirementsStep {
    async fn mount(&self, _ctx: &StepContext<'_>) -> StepMount {
        let report = self.checker.check().await;
        let event = if report.all_passed() {
            StepEvent::CanProceed
        } else {
            StepEvent::CannotProceed
        };
        StepMount::new(serde_json::to_value(&report).unwrap_or(Value::Null), event)
    }

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        _input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        let report = self.checker.check().await;
        if !report.all_passed() {
            info!(
                "[PHASE: wizard] [STEP: {}] Requirements not met; staying on step",
                ctx.step_key
            );
            return Ok(vec![
                StepEvent::CannotProceed,
                StepEvent::Error("Server requirements are not met.".to_string()),
            ]);
        }
        let payload = serde_json::to_value(&report).unwrap_or(Value::Null);
        Ok(vec![StepEvent::StepCompleted(payload)])
    }
}

pub struct EnvironmentStep;

impl EnvironmentStep {
    fn validate(config: &InstallerConfig, settings: &EnvironmentSettings) -> Result<(), ValidationError> {
        let mut v = FieldValidator::new();
        v.required("app_url", settings.app_url.as_deref())
            .url("app_url", settings.app_url.as_deref());

        if config.environment.database {
            v.required("db_connection", settings.db_connection.as_deref())
                .no_whitespace("db_connection", settings.db_connection.as_deref());
            v.required("db_host", settings.db_host.as_deref())
                .no_whitespace("db_host", settings.db_host.as_deref());
            v.required("db_port", settings.db_port.as_deref())
                .no_whitespace("db_port", settings.db_port.as_deref())
                .numeric("db_port", settings.db_port.as_deref());
            v.required("db_database", settings.db_database.as_deref())
                .no_whitespace("db_database", settings.db_database.as_deref())
                .database_name("db_database", settings.db_database.as_deref());
            v.required("db_username", settings.db_username.as_deref())
                .no_whitespace("db_username", settings.db_username.as_deref());
        }

        if config.environment.mail {
            validate_mail(&mut v, &settings.mail);
        }
        v.finish()
    }
}

#[async_trait]
impl StepLogic for EnvironmentStep {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount {
        let mut defaults = json!({
            "app_url": "",
            "db_connection": "mysql",
            "db_host": "127.0.0.1",
            "db_port": "3306",
            "db_database": "",
            "db_username": "",
            "db_password": "",
        });
        if ctx.config.environment.mail {
            if let (Some(target), Value::Object(mail)) = (defaults.as_object_mut(), mail_defaults()) {
                target.extend(mail);
            }
        }
        let fields = prefill(defaults, ctx.progress.data.get(ctx.step_key));
        StepMount::new(
            json!({
                "fields": fields,
                "database_required": ctx.config.environment.database,
                "mail_required": ctx.config.environment.mail,
            }),
            StepEvent::CanProceed,
        )
    }

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        let settings = EnvironmentSettings::from_payload(input)?;
        Self::validate(ctx.config, &settings)?;

        let mut keys: Vec<&str> = DATABASE_KEYS.to_vec();
        if ctx.config.environment.mail || settings.mail.is_present() {
            keys.extend(MAIL_KEYS);
        }
        Ok(vec![StepEvent::StepCompleted(pick(input, &keys))])
    }
}

pub struct MailStep;

#[async_trait]
impl StepLogic for MailStep {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount {
        let saved = ctx
            .progress
            .data
            .get(ctx.step_key)
            .or_else(|| ctx.progress.data.get("environment"));
        let fields = prefill(mail_defaults(), saved.map(|s| pick(s, &MAIL_KEYS)).as_ref());
        StepMount::new(
            json!({
                "fields": fields,
                "mail_required": ctx.config.environment.mail,
            }),
            StepEvent::CanProceed,
        )
    }

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        let mail = MailSettings::from_payload(input)?;
        if ctx.config.environment.mail {
            let mut v = FieldValidator::new();
            validate_mail(&mut v, &mail);
            v.finish()?;
        } else {
            let mut v = FieldValidator::new();
            v.numeric("mail_port", mail.mail_port.as_deref())
                .email("mail_from_address", mail.mail_from_address.as_deref());
            v.finish()?;
        }
        Ok(vec![StepEvent::StepCompleted(pick(input, &MAIL_KEYS))])
    }
}

pub struct AdminStep {
    users: Arc<dyn UserStore>,
}

impl AdminStep {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl StepLogic for AdminStep {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount {
        let saved = ctx.progress.data.get(ctx.step_key);
        let name = saved.and_then(|s| str_field(s, "name")).unwrap_or_default();
        let email = saved.and_then(|s| str_field(s, "email")).unwrap_or_default();
        StepMount::new(
            json!({ "fields": { "name": name, "email": email } }),
            StepEvent::CanProceed,
        )
    }

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        let account = AdminAccount::from_payload(input)?;
        let mut v = FieldValidator::new();
        v.required("name", account.name.as_deref())
            .min_len("name", account.name.as_deref(), 2);
        v.required("email", account.email.as_deref())
            .email("email", account.email.as_deref());
        v.required("password", account.password.as_deref())
            .min_len("password", account.password.as_deref(), 6)
            .confirmed(
                "password",
                account.password.as_deref(),
                account.password_confirmation.as_deref(),
            );
        v.finish()?;

        if let Err(e) = self.users.create_admin(&account).await {
            error!(
                "[PHASE: wizard] [STEP: {}] Admin creation failed: {:#}",
                ctx.step_key, e
            );
            return Ok(vec![StepEvent::Error(format!(
                "Failed to create admin user: {:#}",
                e
            ))]);
        }
        info!(
            "[PHASE: wizard] [STEP: {}] Admin account created ({})",
            ctx.step_key,
            account.email.as_deref().unwrap_or_default()
        );
        Ok(vec![StepEvent::StepCompleted(json!({
            "name": account.name,
            "email": account.email,
        }))])
    }
}

/// Committed payloads in wizard order.
pub fn ordered_settings<'a>(
    registry: &'a StepRegistry,
    progress: &'a Progress,
) -> Vec<(&'a str, &'a Value)> {
    registry
        .iter()
        .filter_map(|s| progress.data.get(&s.key).map(|v| (s.key.as_str(), v)))
        .collect()
}

pub struct FinishStep;

#[async_trait]
impl StepLogic for FinishStep {
    async fn mount(&self, ctx: &StepContext<'_>) -> StepMount {
        let redacted: Vec<(String, Value)> = ordered_settings(ctx.registry, ctx.progress)
            .into_iter()
            .map(|(k, v)| (k.to_string(), redact_payload(v)))
            .collect();
        let summary = render_settings(redacted.iter().map(|(k, v)| (k.as_str(), v)));
        StepMount::new(
            json!({
                "summary": summary,
                "file_name": settings_file_name(chrono::Local::now()),
                "redirect": ctx.config.options.redirect_after_install,
            }),
            StepEvent::CanProceed,
        )
    }

    async fn complete(
        &self,
        ctx: &StepContext<'_>,
        _input: &Value,
    ) -> Result<Vec<StepEvent>, ValidationError> {
        let finalize = ctx.lock.write().and_then(|()| ctx.store.delete());
        if let Err(e) = finalize {
            error!(
                "[PHASE: finish] [STEP: {}] Finalization failed: {}",
                ctx.step_key, e
            );
            return Ok(vec![StepEvent::Error(format!(
                "Failed to finalize installation: {}",
                e
            ))]);
        }
        info!(
            "[PHASE: finish] [STEP: {}] Installation finalized",
            ctx.step_key
        );
        Ok(vec![StepEvent::StepCompleted(Value::Null)])
    }
}

/// Handler per step kind.
pub struct StepHandlers {
    handlers: HashMap<StepKind, Arc<dyn StepLogic>>,
}

impl StepHandlers {
    pub fn new(checker: Arc<RequirementsChecker>, users: Arc<dyn UserStore>) -> Self {
        let mut handlers: HashMap<StepKind, Arc<dyn StepLogic>> = HashMap::new();
        handlers.insert(StepKind::Welcome, Arc::new(WelcomeStep));
        handlers.insert(StepKind::Requirements, Arc::new(RequirementsStep::new(checker)));
        handlers.insert(StepKind::Environment, Arc::new(EnvironmentStep));
        handlers.insert(StepKind::Mail, Arc::new(MailStep));
        handlers.insert(StepKind::Admin, Arc::new(AdminStep::new(users)));
        handlers.insert(StepKind::Finish, Arc::new(FinishStep));
        Self { handlers }
    }

    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepLogic>> {
        self.handlers.get(&kind).cloned()
    }
}
