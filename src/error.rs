// Installer error taxonomy
//
// Validation errors stay local to a step and are rendered inline. Provisioning errors are caught
// at the controller boundary, persisted into the progress document and surfaced once as a flash.
// Everything that reaches the operator goes through `user_message`, which never leaks driver or
// command output unless verbose mode is enabled.

use std::fmt;
use thiserror::Error;

pub type InstallerResult<T> = std::result::Result<T, InstallerError>;

/// Generic fallback shown for anything we could not classify.
pub const GENERIC_ERROR_MESSAGE: &str =
    "An unexpected error occurred during installation. Please check your input and try again.";

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Field-level validation failure for a single step submission.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError::new(field, message)],
        }
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when no field failed.
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// Failures of the side-effecting provisioning work. All are fatal to the current attempt and
/// recoverable by resubmitting the same step.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("database connectivity check failed: {detail}")]
    Connectivity { detail: String },

    #[error("database migration failed: {detail}")]
    Migration { detail: String },

    #[error("database seeding failed: {detail}")]
    Seed { detail: String },

    #[error("storage link creation failed: {detail}")]
    StorageLink { detail: String },

    #[error("configuration file update failed: {detail}")]
    ConfigFile { detail: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u128 },
}

impl ProvisionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionError::Connectivity { .. } => "connectivity",
            ProvisionError::Migration { .. } => "migration",
            ProvisionError::Seed { .. } => "seed",
            ProvisionError::StorageLink { .. } => "storage_link",
            ProvisionError::ConfigFile { .. } => "config_file",
            ProvisionError::Timeout { .. } => "timeout",
        }
    }

    fn generic_message(&self) -> String {
        match self {
            ProvisionError::Connectivity { .. } => {
                "Unable to connect to the database. Verify host, credentials, and network access."
                    .to_string()
            }
            ProvisionError::Migration { .. } => {
                "Database migration failed. Check the installer log for details.".to_string()
            }
            ProvisionError::Seed { .. } => {
                "Database seeding failed. Check the installer log for details.".to_string()
            }
            ProvisionError::StorageLink { .. } => {
                "Unable to link the public storage directory.".to_string()
            }
            ProvisionError::ConfigFile { .. } => {
                "Unable to write the application configuration file. Check file permissions."
                    .to_string()
            }
            ProvisionError::Timeout { operation, .. } => format!(
                "The {} operation took too long and was stopped. Please retry.",
                operation.replace('_', " ")
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("invalid installer step: {0}")]
    NotFound(String),

    #[error("progress document was modified concurrently (expected version {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },

    #[error("step '{0}' is not optional and cannot be skipped")]
    StepNotSkippable(String),

    #[error("installation has already been completed")]
    AlreadyInstalled,

    #[error("installer configuration is invalid: {0}")]
    Config(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl InstallerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        InstallerError::Io {
            context: context.into(),
            source,
        }
    }

    /// Message safe to show to the operator.
    ///
    /// `verbose` mirrors the application debug flag: raw detail is only shown when it is set.
    /// Storage-link failures are always shown with the generic text.
    pub fn user_message(&self, verbose: bool) -> String {
        match self {
            InstallerError::Validation(v) => v.to_string(),
            InstallerError::Provision(p @ ProvisionError::StorageLink { .. }) => {
                p.generic_message()
            }
            InstallerError::Provision(p) => {
                if verbose {
                    p.to_string()
                } else {
                    p.generic_message()
                }
            }
            InstallerError::NotFound(_) => "Invalid installer step.".to_string(),
            InstallerError::Conflict { .. } => {
                "The installer was updated from another session. Reload and try again.".to_string()
            }
            InstallerError::StepNotSkippable(_) => "This step cannot be skipped.".to_string(),
            InstallerError::AlreadyInstalled => {
                "The application has already been installed.".to_string()
            }
            other => {
                if verbose {
                    other.to_string()
                } else {
                    GENERIC_ERROR_MESSAGE.to_string()
                }
            }
        }
    }
}

impl From<config::ConfigError> for InstallerError {
    fn from(e: config::ConfigError) -> Self {
        InstallerError::Config(e.to_string())
    }
}
