// Wizard controller
//
// Owns the navigation rules: install gating, forward-skip clamping, completion, skipping and the
// reconciliation of a pending provisioning payload left behind by an interrupted attempt.
//
// IMPORTANT:
// - Every mutation goes through `ProgressStore::save`, so a concurrent session surfaces as
//   `InstallerError::Conflict` instead of a silent overwrite.
// - Field validation failures persist nothing.
// - Provisioning failures are persisted into `Progress::error` and flashed; the operator stays on
//   the same step and may resubmit.

use crate::api::preflight::{RequirementsChecker, RequirementsReport, RuntimeProbe};
use crate::config::InstallerConfig;
use crate::database::connection::LiveConnection;
use crate::database::migrations::SchemaRunner;
use crate::error::{InstallerError, InstallerResult, GENERIC_ERROR_MESSAGE};
use crate::installation::provisioner::EnvironmentProvisioner;
use crate::installation::storage::StorageLinker;
use crate::models::progress::Progress;
use crate::models::responses::{
    MountOutcome, RedirectTarget, SettingsExportResponse, StatusResponse, StepState, StepSummary,
    StepView, Transition,
};
use crate::utils::logging::redact_payload;
use crate::wizard::lock::InstallLock;
use crate::wizard::registry::{Step, StepRegistry};
use crate::wizard::steps::{
    ordered_settings, StepContext, StepEvent, StepHandlers, StepLogic, UserStore,
};
use crate::wizard::store::ProgressStore;
use crate::wizard::summary::{render_settings, settings_file_name};
use log::{error, info, warn};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// External collaborators the controller drives.
pub struct WizardDeps {
    pub connection: Arc<dyn LiveConnection>,
    pub schema: Arc<dyn SchemaRunner>,
    pub linker: Arc<dyn StorageLinker>,
    pub probe: Arc<dyn RuntimeProbe>,
    pub users: Arc<dyn UserStore>,
}

/// Clears the working indicator on every exit path.
struct WorkingGuard<'a>(&'a watch::Sender<bool>);

impl<'a> WorkingGuard<'a> {
    fn start(tx: &'a watch::Sender<bool>) -> Self {
        tx.send_replace(true);
        Self(tx)
    }
}

impl Drop for WorkingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

pub struct WizardController {
    config: Arc<InstallerConfig>,
    registry: StepRegistry,
    store: ProgressStore,
    lock: InstallLock,
    checker: Arc<RequirementsChecker>,
    provisioner: EnvironmentProvisioner,
    handlers: StepHandlers,
    working: watch::Sender<bool>,
}

impl WizardController {
    pub fn new(config: Arc<InstallerConfig>, deps: WizardDeps) -> InstallerResult<Self> {
        let registry = StepRegistry::from_config(&config)?;
        let store = ProgressStore::new(config.progress_path(), registry.first().key.clone());
        let lock = InstallLock::new(config.lock_path());
        let checker = Arc::new(RequirementsChecker::new(Arc::clone(&config), deps.probe));
        let handlers = StepHandlers::new(Arc::clone(&checker), deps.users);
        let provisioner = EnvironmentProvisioner::new(
            Arc::clone(&config),
            deps.connection,
            deps.schema,
            deps.linker,
        );
        let (working, _) = watch::channel(false);
        Ok(Self {
            config,
            registry,
            store,
            lock,
            checker,
            provisioner,
            handlers,
            working,
        })
    }

    pub fn config(&self) -> &InstallerConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Run the requirements checks outside the wizard flow.
    pub async fn check_requirements(&self) -> RequirementsReport {
        self.checker.check().await
    }

    /// Observe the working indicator (true while side effects run).
    pub fn subscribe_working(&self) -> watch::Receiver<bool> {
        self.working.subscribe()
    }

    /// Refuse every wizard operation once installed or when the installer is disabled.
    pub fn gate(&self) -> InstallerResult<()> {
        if !self.config.run_installer || self.lock.is_installed() {
            return Err(InstallerError::AlreadyInstalled);
        }
        Ok(())
    }

    /// Resume at the last committed step, or begin a fresh attempt at the first one.
    pub fn start(&self) -> InstallerResult<RedirectTarget> {
        self.gate()?;
        if let Some(mut progress) = self.store.read()? {
            if self.registry.step_index(&progress.current_step).is_ok() {
                info!(
                    "[PHASE: wizard] [STEP: start] Resuming at '{}' (version={})",
                    progress.current_step, progress.version
                );
                return Ok(RedirectTarget::Step(progress.current_step));
            }
            warn!(
                "[PHASE: wizard] [STEP: start] Unknown current step '{}'; restarting at '{}'",
                progress.current_step,
                self.registry.first().key
            );
            let version = progress.version;
            progress = Progress::fresh(&self.registry.first().key);
            progress.version = version;
            self.store.save(&mut progress)?;
            return Ok(RedirectTarget::Step(progress.current_step));
        }

        let progress = self.store.load()?;
        info!(
            "[PHASE: wizard] [STEP: start] Fresh installation started at '{}'",
            progress.current_step
        );
        Ok(RedirectTarget::Step(progress.current_step))
    }

    fn handler(&self, step: &Step) -> InstallerResult<Arc<dyn StepLogic>> {
        self.handlers.get(step.kind).ok_or_else(|| {
            InstallerError::Config(format!("no handler bound for step '{}'", step.key))
        })
    }

    fn ctx<'a>(&'a self, step_key: &'a str, progress: &'a Progress) -> StepContext<'a> {
        StepContext {
            config: &self.config,
            registry: &self.registry,
            step_key,
            progress,
            store: &self.store,
            lock: &self.lock,
        }
    }

    /// Furthest step reachable from the committed pointer, if `index` lies beyond it.
    fn clamp_target(&self, index: usize, progress: &Progress) -> Option<String> {
        let saved = self.registry.step_index(&progress.current_step).ok()?;
        if index > saved + 1 {
            return self.registry.next_key(saved).map(str::to_string);
        }
        None
    }

    fn done_target(&self, index: usize) -> RedirectTarget {
        match self.registry.next_key(index) {
            Some(next) => RedirectTarget::Step(next.to_string()),
            None => RedirectTarget::Destination(self.config.options.redirect_after_install.clone()),
        }
    }

    fn visible_error(&self, message: &str) -> String {
        if self.config.debug {
            message.to_string()
        } else {
            GENERIC_ERROR_MESSAGE.to_string()
        }
    }

    /// Enter `step_key`. `flash` is the one-shot message carried by the redirect that led here.
    pub async fn mount(
        &self,
        step_key: &str,
        flash: Option<String>,
    ) -> InstallerResult<MountOutcome> {
        self.gate()?;
        let index = self.registry.step_index(step_key)?;
        let step = self.registry.step_at(index)?;
        let mut progress = self.store.load()?;
        let mut flash = flash;

        if progress.has_raw() {
            if let Some(outcome) = self.reconcile(step_key, &mut progress, &mut flash).await? {
                return Ok(outcome);
            }
        } else if let Some(err) = progress.take_error() {
            self.store.save(&mut progress)?;
            flash = Some(merge_flash(flash, err));
        }

        if let Some(target) = self.clamp_target(index, &progress) {
            info!(
                "[PHASE: wizard] [STEP: {}] Forward skip blocked; redirecting to '{}'",
                step_key, target
            );
            return Ok(MountOutcome::Redirect {
                target: RedirectTarget::Step(target),
                flash,
            });
        }

        let handler = self.handler(step)?;
        let mounted = handler.mount(&self.ctx(step_key, &progress)).await;

        let mut can_proceed = true;
        for event in mounted.events {
            match event {
                StepEvent::CanProceed => can_proceed = true,
                StepEvent::CannotProceed => can_proceed = false,
                StepEvent::Error(msg) => {
                    can_proceed = false;
                    flash = Some(merge_flash(flash, self.visible_error(&msg)));
                }
                StepEvent::StepCompleted(_) => {}
            }
        }

        let steps = self
            .registry
            .iter()
            .enumerate()
            .map(|(i, s)| StepSummary {
                key: s.key.clone(),
                label: s.label.clone(),
                description: s.description.clone(),
                optional: s.optional,
                state: if i == index {
                    StepState::Current
                } else if i < index {
                    StepState::Completed
                } else {
                    StepState::Upcoming
                },
            })
            .collect();

        Ok(MountOutcome::Render {
            view: StepView {
                key: step.key.clone(),
                label: step.label.clone(),
                description: step.description.clone(),
                index,
                total: self.registry.len(),
                skippable: step.optional && !step.is_terminal(),
                can_proceed,
                working: *self.working.borrow(),
                flash,
                context: mounted.context,
                steps,
            },
        })
    }

    /// Settle a pending payload before rendering. Returns a redirect when navigation must change.
    async fn reconcile(
        &self,
        step_key: &str,
        progress: &mut Progress,
        flash: &mut Option<String>,
    ) -> InstallerResult<Option<MountOutcome>> {
        let raw_step = progress.raw_step().to_string();

        if let Some(err) = progress.take_error() {
            progress.raw_failed = true;
            self.store.save(progress)?;
            let merged = merge_flash(flash.take(), err);
            if raw_step == step_key {
                *flash = Some(merged);
                return Ok(None);
            }
            return Ok(Some(MountOutcome::Redirect {
                target: RedirectTarget::Step(raw_step),
                flash: Some(merged),
            }));
        }

        if !progress.has_promotable_raw() {
            // Held for a resubmission of its step.
            return Ok(None);
        }

        let Some(effect) = self
            .registry
            .get(&raw_step)
            .ok()
            .and_then(|s| s.side_effect())
        else {
            warn!(
                "[PHASE: wizard] [STEP: reconcile] Pending payload owned by unknown step '{}'; discarding",
                raw_step
            );
            progress.clear_raw();
            self.store.save(progress)?;
            return Ok(None);
        };

        let raw = progress.raw_env_data.clone().unwrap_or(Value::Null);
        info!(
            "[PHASE: wizard] [STEP: reconcile] Completing interrupted provisioning for '{}'",
            raw_step
        );
        match self.provisioner.replay_config(effect, &raw).await {
            Ok(()) => {
                let raw_index = self.registry.step_index(&raw_step)?;
                progress.commit(&raw_step, &raw);
                self.store.save(progress)?;
                info!(
                    "[PHASE: wizard] [STEP: reconcile] Pending payload for '{}' committed (version={})",
                    raw_step, progress.version
                );
                Ok(Some(MountOutcome::Redirect {
                    target: self.done_target(raw_index),
                    flash: flash.take(),
                }))
            }
            Err(e) => {
                let message = e.user_message(self.config.debug);
                error!(
                    "[PHASE: wizard] [STEP: reconcile] Replay failed for '{}': {}",
                    raw_step, e
                );
                let merged = merge_flash(flash.take(), message.clone());
                progress.raw_failed = true;
                if raw_step == step_key {
                    self.store.save(progress)?;
                    *flash = Some(merged);
                    return Ok(None);
                }
                progress.error = Some(message);
                self.store.save(progress)?;
                Ok(Some(MountOutcome::Redirect {
                    target: RedirectTarget::Step(raw_step),
                    flash: Some(merged),
                }))
            }
        }
    }

    /// Submit the active step.
    pub async fn complete_step(&self, step_key: &str, input: &Value) -> InstallerResult<Transition> {
        self.gate()?;
        let index = self.registry.step_index(step_key)?;
        let step = self.registry.step_at(index)?;
        let mut progress = self.store.load()?;

        if let Some(target) = self.clamp_target(index, &progress) {
            return Ok(Transition::Redirect {
                target: RedirectTarget::Step(target),
                flash: None,
            });
        }

        let handler = self.handler(step)?;
        let _working = WorkingGuard::start(&self.working);
        let events = match handler.complete(&self.ctx(step_key, &progress), input).await {
            Ok(events) => events,
            Err(v) => {
                info!(
                    "[PHASE: wizard] [STEP: {}] Submission rejected ({} field errors)",
                    step_key,
                    v.errors.len()
                );
                return Ok(Transition::Invalid {
                    field_errors: v.errors,
                });
            }
        };

        for event in events {
            match event {
                StepEvent::CanProceed | StepEvent::CannotProceed => {}
                StepEvent::Error(msg) => {
                    warn!("[PHASE: wizard] [STEP: {}] Step reported: {}", step_key, msg);
                    return Ok(Transition::Rejected {
                        flash: self.visible_error(&msg),
                    });
                }
                StepEvent::StepCompleted(payload) => {
                    return self.on_completed(index, step, payload, &mut progress).await;
                }
            }
        }

        Ok(Transition::Rejected {
            flash: GENERIC_ERROR_MESSAGE.to_string(),
        })
    }

    async fn on_completed(
        &self,
        index: usize,
        step: &Step,
        payload: Value,
        progress: &mut Progress,
    ) -> InstallerResult<Transition> {
        if step.is_terminal() {
            return Ok(Transition::Redirect {
                target: RedirectTarget::Destination(self.config.options.redirect_after_install.clone()),
                flash: None,
            });
        }

        if let Some(effect) = step.side_effect() {
            let attempt = Uuid::new_v4();
            info!(
                "[PHASE: wizard] [STEP: {}] Provisioning attempt {} (payload={})",
                step.key,
                attempt,
                redact_payload(&payload)
            );
            match self
                .provisioner
                .provision(effect, &step.key, &payload, &self.store, progress)
                .await
            {
                Ok(()) => {}
                Err(InstallerError::Validation(v)) => {
                    return Ok(Transition::Invalid {
                        field_errors: v.errors,
                    })
                }
                Err(InstallerError::Provision(p)) => {
                    error!(
                        "[PHASE: wizard] [STEP: {}] Provisioning attempt {} failed (kind={}, {})",
                        step.key,
                        attempt,
                        p.kind(),
                        p
                    );
                    let message = InstallerError::Provision(p).user_message(self.config.debug);
                    progress.error = Some(message.clone());
                    if progress.has_raw() {
                        progress.raw_failed = true;
                    }
                    self.store.save(progress)?;
                    return Ok(Transition::Redirect {
                        target: RedirectTarget::Step(step.key.clone()),
                        flash: Some(message),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        progress.commit(&step.key, &payload);
        self.store.save(progress)?;
        info!(
            "[PHASE: wizard] [STEP: {}] Step committed (version={})",
            step.key, progress.version
        );
        Ok(Transition::Redirect {
            target: self.done_target(index),
            flash: None,
        })
    }

    /// Advance past an optional step without committing a payload or running side effects.
    pub async fn skip_step(&self, step_key: &str) -> InstallerResult<Transition> {
        self.gate()?;
        let index = self.registry.step_index(step_key)?;
        let step = self.registry.step_at(index)?;
        if !step.optional || step.is_terminal() {
            return Err(InstallerError::StepNotSkippable(step_key.to_string()));
        }

        let mut progress = self.store.load()?;
        if let Some(target) = self.clamp_target(index, &progress) {
            return Ok(Transition::Redirect {
                target: RedirectTarget::Step(target),
                flash: None,
            });
        }

        progress.commit(step_key, &Value::Null);
        self.store.save(&mut progress)?;
        info!("[PHASE: wizard] [STEP: {}] Step skipped", step_key);
        Ok(Transition::Redirect {
            target: self.done_target(index),
            flash: None,
        })
    }

    /// Plain-text dump of the committed settings, secrets masked.
    pub fn export_settings(&self) -> InstallerResult<SettingsExportResponse> {
        let progress = self
            .store
            .read()?
            .unwrap_or_else(|| Progress::fresh(&self.registry.first().key));
        let redacted: Vec<(String, Value)> = ordered_settings(&self.registry, &progress)
            .into_iter()
            .map(|(k, v)| (k.to_string(), redact_payload(v)))
            .collect();
        Ok(SettingsExportResponse {
            file_name: settings_file_name(chrono::Local::now()),
            path: None,
            content: render_settings(redacted.iter().map(|(k, v)| (k.as_str(), v))),
        })
    }

    /// Export and write the dump into `dir`.
    pub fn write_settings(&self, dir: &Path) -> InstallerResult<SettingsExportResponse> {
        let mut export = self.export_settings()?;
        std::fs::create_dir_all(dir)
            .map_err(|e| InstallerError::io(format!("Failed to create {}", dir.display()), e))?;
        let path = dir.join(&export.file_name);
        std::fs::write(&path, &export.content)
            .map_err(|e| InstallerError::io(format!("Failed to write {}", path.display()), e))?;
        info!(
            "[PHASE: finish] [STEP: export] Settings written to {}",
            path.display()
        );
        export.path = Some(path.to_string_lossy().to_string());
        Ok(export)
    }

    pub fn status(&self) -> InstallerResult<StatusResponse> {
        let progress = self.store.read()?;
        Ok(StatusResponse {
            installed: self.lock.is_installed(),
            current_step: progress.as_ref().map(|p| p.current_step.clone()),
            completed_steps: progress
                .as_ref()
                .map(|p| {
                    ordered_settings(&self.registry, p)
                        .into_iter()
                        .map(|(k, _)| k.to_string())
                        .collect()
                })
                .unwrap_or_default(),
            pending_raw_step: progress
                .as_ref()
                .filter(|p| p.has_raw())
                .map(|p| p.raw_step().to_string()),
            version: progress.as_ref().map(|p| p.version),
        })
    }
}

/// Join an incoming flash with a persisted message, showing identical text once.
fn merge_flash(incoming: Option<String>, persisted: String) -> String {
    match incoming {
        Some(existing) if existing == persisted => existing,
        Some(existing) => format!("{}\n{}", existing, persisted),
        None => persisted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::preflight::stubs::StubProbe;
    use crate::installation::provisioner::stubs::{count, StubConnection, StubLinker, StubSchema};
    use crate::wizard::steps::stubs::StubUsers;
    use serde_json::json;

    struct Harness {
        _dir: tempfile::TempDir,
        connection: Arc<StubConnection>,
        schema: Arc<StubSchema>,
        linker: Arc<StubLinker>,
        wizard: WizardController,
    }

    fn harness(adjust: impl FnOnce(&mut InstallerConfig)) -> Harness {
        harness_with(adjust, StubSchema::default())
    }

    fn harness_with(adjust: impl FnOnce(&mut InstallerConfig), schema: StubSchema) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = InstallerConfig {
            base_path: dir.path().to_path_buf(),
            ..InstallerConfig::default()
        };
        adjust(&mut config);
        let connection = Arc::new(StubConnection::default());
        let schema = Arc::new(schema);
        let linker = Arc::new(StubLinker::default());
        let wizard = WizardController::new(
            Arc::new(config),
            WizardDeps {
                connection: connection.clone(),
                schema: schema.clone(),
                linker: linker.clone(),
                probe: Arc::new(StubProbe::new("8.3.1", &[])),
                users: Arc::new(StubUsers::default()),
            },
        )
        .expect("controller");
        Harness {
            _dir: dir,
            connection,
            schema,
            linker,
            wizard,
        }
    }

    fn env_payload(database: &str) -> Value {
        json!({
            "app_url": "https://shop.example.test",
            "db_connection": "mysql",
            "db_host": "127.0.0.1",
            "db_port": "3306",
            "db_database": database,
            "db_username": "shop",
            "db_password": "s3cret"
        })
    }

    fn at_step(h: &Harness, step: &str) {
        let mut p = h.wizard.store().load().expect("load");
        p.current_step = step.to_string();
        h.wizard.store().save(&mut p).expect("save");
    }

    fn redirect_step(t: &Transition) -> Option<&str> {
        match t {
            Transition::Redirect {
                target: RedirectTarget::Step(s),
                ..
            } => Some(s.as_str()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn start_creates_fresh_document_at_first_step() {
        let h = harness(|_| {});
        let target = h.wizard.start().expect("start");
        assert_eq!(target, RedirectTarget::Step("welcome".to_string()));
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "welcome");
        assert!(p.data.is_empty());
    }

    #[tokio::test]
    async fn start_resumes_at_committed_step() {
        let h = harness(|_| {});
        at_step(&h, "environment");
        assert_eq!(
            h.wizard.start().expect("start"),
            RedirectTarget::Step("environment".to_string())
        );
    }

    #[tokio::test]
    async fn forward_skip_is_clamped_to_the_next_step() {
        let h = harness(|_| {});
        at_step(&h, "requirements");
        let outcome = h.wizard.mount("finish", None).await.expect("mount");
        match outcome {
            MountOutcome::Redirect { target, .. } => {
                assert_eq!(target, RedirectTarget::Step("environment".to_string()))
            }
            other => panic!("expected redirect, got {:?}", other),
        }

        let outcome = h.wizard.mount("environment", None).await.expect("mount");
        assert!(matches!(outcome, MountOutcome::Render { .. }));
    }

    #[tokio::test]
    async fn environment_submission_provisions_and_advances() {
        let h = harness(|_| {});
        at_step(&h, "requirements");
        let payload = env_payload("shop");
        let t = h
            .wizard
            .complete_step("environment", &payload)
            .await
            .expect("complete");
        assert_eq!(redirect_step(&t), Some("admin"));

        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "environment");
        assert_eq!(p.data["environment"], payload);
        assert!(!p.has_raw());
        assert_eq!(count(&h.schema.fresh_calls), 1);
        assert_eq!(count(&h.linker.calls), 1);
        let env = std::fs::read_to_string(h.wizard.config().env_path()).expect("env");
        assert!(env.contains("DB_DATABASE=shop"));
        assert!(!*h.wizard.subscribe_working().borrow());
    }

    #[tokio::test]
    async fn invalid_submission_persists_nothing() {
        let h = harness(|_| {});
        at_step(&h, "requirements");
        let before = h.wizard.store().read().expect("read").expect("doc");
        let t = h
            .wizard
            .complete_step("environment", &env_payload(""))
            .await
            .expect("complete");
        match t {
            Transition::Invalid { field_errors } => {
                assert!(field_errors.iter().any(|e| e.field == "db_database"))
            }
            other => panic!("expected invalid, got {:?}", other),
        }
        assert_eq!(h.wizard.store().read().expect("read").expect("doc"), before);
        assert!(!h.wizard.config().env_path().exists());
        assert_eq!(count(&h.connection.reconfigure_calls), 0);
    }

    #[tokio::test]
    async fn provisioning_failure_is_persisted_and_flashed_once() {
        let h = harness_with(
            |_| {},
            StubSchema {
                fail_migrate: true,
                ..StubSchema::default()
            },
        );
        at_step(&h, "requirements");
        let t = h
            .wizard
            .complete_step("environment", &env_payload("shop"))
            .await
            .expect("complete");
        let flash = match &t {
            Transition::Redirect {
                target: RedirectTarget::Step(s),
                flash: Some(f),
            } => {
                assert_eq!(s, "environment");
                f.clone()
            }
            other => panic!("expected redirect with flash, got {:?}", other),
        };
        assert!(!flash.contains("SQLSTATE"), "detail leaked: {}", flash);

        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "requirements");
        assert_eq!(p.error.as_deref(), Some(flash.as_str()));

        let outcome = h
            .wizard
            .mount("environment", Some(flash.clone()))
            .await
            .expect("mount");
        match outcome {
            MountOutcome::Render { view } => assert_eq!(view.flash.as_deref(), Some(flash.as_str())),
            other => panic!("expected render, got {:?}", other),
        }
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert!(p.error.is_none(), "error is surfaced once");
    }

    #[tokio::test]
    async fn pending_payload_is_committed_on_next_load() {
        let h = harness(|_| {});
        let mut p = h.wizard.store().load().expect("load");
        p.current_step = "requirements".to_string();
        p.record_raw("environment", &env_payload("shop"));
        h.wizard.store().save(&mut p).expect("save");

        let outcome = h.wizard.mount("requirements", None).await.expect("mount");
        match outcome {
            MountOutcome::Redirect { target, flash } => {
                assert_eq!(target, RedirectTarget::Step("admin".to_string()));
                assert!(flash.is_none());
            }
            other => panic!("expected redirect, got {:?}", other),
        }
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "environment");
        assert_eq!(p.data["environment"]["db_database"], "shop");
        assert!(!p.has_raw());
        assert_eq!(count(&h.schema.migrate_calls), 0, "replay never migrates");
        let env = std::fs::read_to_string(h.wizard.config().env_path()).expect("env");
        assert!(env.contains("DB_DATABASE=shop"));
    }

    #[tokio::test]
    async fn pending_payload_with_error_stays_pending() {
        let h = harness(|_| {});
        let mut p = h.wizard.store().load().expect("load");
        p.current_step = "requirements".to_string();
        p.record_raw("environment", &env_payload("shop"));
        p.error = Some("Unable to write the application configuration file.".to_string());
        h.wizard.store().save(&mut p).expect("save");

        let outcome = h.wizard.mount("welcome", None).await.expect("mount");
        let flash = match outcome {
            MountOutcome::Redirect { target, flash } => {
                assert_eq!(target, RedirectTarget::Step("environment".to_string()));
                let flash = flash.expect("flash");
                assert!(flash.contains("configuration file"));
                flash
            }
            other => panic!("expected redirect, got {:?}", other),
        };
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert!(p.error.is_none());
        assert!(p.has_raw());
        assert!(p.raw_failed);
        assert_eq!(p.current_step, "requirements");

        // Following the redirect renders the owning step instead of promoting the payload.
        match h.wizard.mount("environment", Some(flash.clone())).await.expect("mount") {
            MountOutcome::Render { view } => {
                assert_eq!(view.key, "environment");
                assert_eq!(view.flash.as_deref(), Some(flash.as_str()));
            }
            other => panic!("expected render, got {:?}", other),
        }
        match h.wizard.mount("environment", None).await.expect("mount") {
            MountOutcome::Render { view } => assert!(view.flash.is_none()),
            other => panic!("expected render, got {:?}", other),
        }
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "requirements");
        assert!(!p.data.contains_key("environment"));
        assert!(!h.wizard.config().env_path().exists());

        let t = h
            .wizard
            .complete_step("environment", &env_payload("shop"))
            .await
            .expect("resubmit");
        assert_eq!(redirect_step(&t), Some("admin"));
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "environment");
        assert!(!p.has_raw());
    }

    #[tokio::test]
    async fn working_indicator_covers_step_completion() {
        let h = harness(|_| {});
        let rx = h.wizard.subscribe_working();
        h.wizard
            .complete_step("welcome", &Value::Null)
            .await
            .expect("welcome");
        assert!(!*rx.borrow());
        assert!(rx.has_changed().expect("sender alive"), "indicator toggled during completion");
    }

    #[tokio::test]
    async fn only_optional_steps_can_be_skipped() {
        let h = harness(|c| {
            if let Some(admin) = c.steps.iter_mut().find(|s| s.key == "admin") {
                admin.optional = true;
            }
        });
        at_step(&h, "environment");

        let err = h.wizard.skip_step("environment").await.unwrap_err();
        assert!(matches!(err, InstallerError::StepNotSkippable(_)));

        let t = h.wizard.skip_step("admin").await.expect("skip");
        assert_eq!(redirect_step(&t), Some("finish"));
        let p = h.wizard.store().read().expect("read").expect("doc");
        assert_eq!(p.current_step, "admin");
        assert!(!p.data.contains_key("admin"));
    }

    #[tokio::test]
    async fn finishing_locks_the_wizard() {
        let h = harness(|_| {});
        at_step(&h, "admin");
        let t = h
            .wizard
            .complete_step("finish", &Value::Null)
            .await
            .expect("complete");
        assert!(matches!(
            t,
            Transition::Redirect {
                target: RedirectTarget::Destination(_),
                ..
            }
        ));
        assert!(!h.wizard.store().exists());
        assert!(matches!(h.wizard.start(), Err(InstallerError::AlreadyInstalled)));
        assert!(h.wizard.status().expect("status").installed);
    }

    #[tokio::test]
    async fn disabled_installer_is_gated() {
        let h = harness(|c| c.run_installer = false);
        assert!(matches!(
            h.wizard.mount("welcome", None).await,
            Err(InstallerError::AlreadyInstalled)
        ));
    }

    #[tokio::test]
    async fn export_follows_step_order_and_masks_secrets() {
        let h = harness(|_| {});
        at_step(&h, "requirements");
        h.wizard
            .complete_step("environment", &env_payload("shop"))
            .await
            .expect("complete");
        let export = h.wizard.export_settings().expect("export");
        assert!(export.content.starts_with("Saved Installation Settings\n"));
        assert!(export.content.contains("ENVIRONMENT:\n  app_url: https://shop.example.test\n"));
        assert!(!export.content.contains("s3cret"));
        assert!(export.file_name.starts_with("installation_settings_"));
    }

    #[test]
    fn flashes_are_deduplicated() {
        assert_eq!(merge_flash(Some("a".into()), "a".into()), "a");
        assert_eq!(merge_flash(None, "b".into()), "b");
        assert_eq!(merge_flash(Some("a".into()), "b".into()), "a\nb");
    }
}
