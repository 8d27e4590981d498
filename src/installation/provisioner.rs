// Environment provisioning
//
// Applies a validated environment (or mail) submission to the application: reconfigure and verify
// the live database connection, run migrations and seeders, link storage, record the payload as
// pending in the progress document and finally rewrite the configuration file.
//
// IMPORTANT:
// - The pending payload is persisted only after every destructive operation succeeded, and before
//   the configuration file is touched, so an interrupted attempt can be completed on resume
//   without re-running migrations.
// - The configuration file write is idempotent and is the only part replayed on resume.

use crate::config::InstallerConfig;
use crate::database::connection::LiveConnection;
use crate::database::migrations::{MigrationMode, SchemaRunner};
use crate::error::{InstallerResult, ProvisionError, ValidationError};
use crate::installation::env_file::EnvFileEditor;
use crate::installation::storage::StorageLinker;
use crate::models::progress::Progress;
use crate::models::requests::{EnvironmentSettings, MailSettings};
use crate::wizard::store::ProgressStore;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::Arc;

/// Side effect attached to a step's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    ProvisionEnvironment,
    ProvisionMail,
}

pub struct EnvironmentProvisioner {
    config: Arc<InstallerConfig>,
    connection: Arc<dyn LiveConnection>,
    schema: Arc<dyn SchemaRunner>,
    linker: Arc<dyn StorageLinker>,
    env_file: EnvFileEditor,
}

impl EnvironmentProvisioner {
    pub fn new(
        config: Arc<InstallerConfig>,
        connection: Arc<dyn LiveConnection>,
        schema: Arc<dyn SchemaRunner>,
        linker: Arc<dyn StorageLinker>,
    ) -> Self {
        let env_file = EnvFileEditor::new(config.env_path());
        Self {
            config,
            connection,
            schema,
            linker,
            env_file,
        }
    }

    /// Run the side effects for `step_key`.
    ///
    /// On success `progress` carries the pending payload (already persisted) and the configuration
    /// file holds the submitted values; the caller commits the step. Validation failures leave both
    /// the document and the file untouched.
    pub async fn provision(
        &self,
        effect: SideEffect,
        step_key: &str,
        payload: &Value,
        store: &ProgressStore,
        progress: &mut Progress,
    ) -> InstallerResult<()> {
        info!(
            "[PHASE: provisioning] [STEP: {}] Provisioning started (effect={:?})",
            step_key, effect
        );

        match effect {
            SideEffect::ProvisionEnvironment => {
                let settings = EnvironmentSettings::from_payload(payload)?;
                if self.config.environment.database {
                    let database = settings.db_database.as_deref().unwrap_or("");
                    if database.trim().is_empty() {
                        return Err(ValidationError::field(
                            "db_database",
                            "The database name is required.",
                        )
                        .into());
                    }
                }

                discard_stale_raw(step_key, store, progress)?;

                if self.config.environment.database {
                    self.prepare_database(&settings).await?;
                }
                if self.config.link_storage {
                    self.link_storage().await?;
                }
            }
            SideEffect::ProvisionMail => {
                MailSettings::from_payload(payload)?;
                discard_stale_raw(step_key, store, progress)?;
            }
        }

        progress.record_raw(step_key, payload);
        store.save(progress)?;
        info!(
            "[PHASE: provisioning] [STEP: {}] Pending payload recorded (version={})",
            step_key, progress.version
        );

        self.write_config(effect, payload).await?;

        info!(
            "[PHASE: provisioning] [STEP: {}] Provisioning completed",
            step_key
        );
        Ok(())
    }

    /// Re-apply the configuration file write for a pending payload.
    pub async fn replay_config(&self, effect: SideEffect, payload: &Value) -> InstallerResult<()> {
        info!(
            "[PHASE: provisioning] [STEP: replay] Re-applying configuration for pending payload (effect={:?})",
            effect
        );
        self.write_config(effect, payload).await
    }

    async fn write_config(&self, effect: SideEffect, payload: &Value) -> InstallerResult<()> {
        let pairs = match effect {
            SideEffect::ProvisionEnvironment => {
                environment_pairs(&self.config, &EnvironmentSettings::from_payload(payload)?)
            }
            SideEffect::ProvisionMail => mail_pairs(&MailSettings::from_payload(payload)?),
        };
        self.env_file.upsert(&pairs).await?;
        Ok(())
    }

    async fn prepare_database(&self, settings: &EnvironmentSettings) -> Result<(), ProvisionError> {
        let params = settings.database_params();

        self.clear_config_cache().await?;

        self.connection
            .reconfigure(&params)
            .await
            .map_err(|e| self.connect_failure(e))?;

        let active = self
            .connection
            .current_database()
            .await
            .map_err(|e| self.connect_failure(e))?;

        if active != params.database {
            error!(
                "[PHASE: provisioning] [STEP: connectivity] Connected to '{}' but '{}' was requested",
                active, params.database
            );
            return Err(ProvisionError::Connectivity {
                detail: format!(
                    "Connected to database '{}' instead of '{}'",
                    active, params.database
                ),
            });
        }
        info!(
            "[PHASE: provisioning] [STEP: connectivity] Database reachable (database={})",
            active
        );

        let mode = if self.config.provisioning.fresh_migrations {
            MigrationMode::Fresh
        } else {
            MigrationMode::Incremental
        };
        self.schema.migrate(&params, mode).await?;

        if self.config.seed_database {
            self.schema.seed(&params).await?;
        }
        Ok(())
    }

    async fn link_storage(&self) -> Result<(), ProvisionError> {
        self.linker.link().await.map_err(|e| {
            error!("[PHASE: provisioning] [STEP: storage_link] {}", e);
            match e {
                ProvisionError::Timeout { .. } | ProvisionError::StorageLink { .. } => e,
                other => ProvisionError::StorageLink {
                    detail: other.to_string(),
                },
            }
        })
    }

    async fn clear_config_cache(&self) -> Result<(), ProvisionError> {
        for file in &self.config.provisioning.config_cache_files {
            let path = self.config.resolve(file);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(
                    "[PHASE: provisioning] [STEP: config_cache] Removed cached configuration {}",
                    path.display()
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ProvisionError::ConfigFile {
                        detail: format!("Failed to remove {}: {}", path.display(), e),
                    })
                }
            }
        }
        Ok(())
    }

    fn connect_failure(&self, e: crate::database::connection::ConnectError) -> ProvisionError {
        warn!(
            "[PHASE: provisioning] [STEP: connectivity] {} ({})",
            e.user_message, e.internal_details
        );
        if e.timed_out {
            ProvisionError::Timeout {
                operation: "database_connection".to_string(),
                timeout_ms: self.config.provisioning.connect_timeout().as_millis(),
            }
        } else {
            ProvisionError::Connectivity {
                detail: e.internal_details,
            }
        }
    }
}

fn discard_stale_raw(
    step_key: &str,
    store: &ProgressStore,
    progress: &mut Progress,
) -> InstallerResult<()> {
    if progress.has_raw() {
        warn!(
            "[PHASE: provisioning] [STEP: {}] Discarding stale pending payload from step '{}'",
            step_key,
            progress.raw_step()
        );
        progress.clear_raw();
        store.save(progress)?;
    }
    Ok(())
}

/// Keys written for the environment step.
pub fn environment_pairs(
    config: &InstallerConfig,
    settings: &EnvironmentSettings,
) -> Vec<(String, String)> {
    let mut pairs = vec![
        ("APP_NAME".to_string(), config.app_name.clone()),
        (
            "APP_ENV".to_string(),
            if config.environment.production {
                "production"
            } else {
                "local"
            }
            .to_string(),
        ),
        ("APP_DEBUG".to_string(), config.environment.debug.to_string()),
        (
            "APP_URL".to_string(),
            settings.app_url.clone().unwrap_or_default(),
        ),
    ];

    if config.environment.database {
        let params = settings.database_params();
        pairs.extend(params.as_env());
    }

    if settings.mail.is_present() {
        pairs.extend(mail_pairs(&settings.mail));
    }
    pairs
}

/// Keys written for mail settings.
pub fn mail_pairs(mail: &MailSettings) -> Vec<(String, String)> {
    let value = |v: &Option<String>| v.clone().unwrap_or_default();
    vec![
        (
            "MAIL_MAILER".to_string(),
            mail.mail_mailer
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| "smtp".to_string()),
        ),
        ("MAIL_HOST".to_string(), value(&mail.mail_host)),
        ("MAIL_PORT".to_string(), value(&mail.mail_port)),
        ("MAIL_USERNAME".to_string(), value(&mail.mail_username)),
        ("MAIL_PASSWORD".to_string(), value(&mail.mail_password)),
        ("MAIL_FROM_ADDRESS".to_string(), value(&mail.mail_from_address)),
        ("MAIL_FROM_NAME".to_string(), value(&mail.mail_from_name)),
    ]
}
