// Installer commands
//
// Thin routing layer used by the binary. Each command maps onto one controller operation and is
// answered with an `ApiResponse` envelope plus the process exit code. Redirects to another step
// are followed immediately so the one-shot flash lands on the render it belongs to.

use crate::error::InstallerError;
use crate::models::responses::{ApiResponse, MountOutcome, RedirectTarget, Transition};
use crate::wizard::controller::WizardController;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::path::PathBuf;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFLICT: i32 = 3;
pub const EXIT_NOT_FOUND: i32 = 4;

const MAX_REDIRECTS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum InstallerCommand {
    Start,
    Show { step: String },
    Submit { step: String, input: Value },
    Skip { step: String },
    Requirements,
    Export { out: Option<PathBuf> },
    Status,
    PrintConfig,
}

impl InstallerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            InstallerCommand::Start => "start",
            InstallerCommand::Show { .. } => "show",
            InstallerCommand::Submit { .. } => "submit",
            InstallerCommand::Skip { .. } => "skip",
            InstallerCommand::Requirements => "requirements",
            InstallerCommand::Export { .. } => "export",
            InstallerCommand::Status => "status",
            InstallerCommand::PrintConfig => "print-config",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub response: ApiResponse<Value>,
    pub exit_code: i32,
}

impl CommandResult {
    fn ok(data: Value) -> Self {
        Self {
            response: ApiResponse::ok(data),
            exit_code: EXIT_OK,
        }
    }

    fn rejected(data: Value, message: impl Into<String>) -> Self {
        Self {
            response: ApiResponse {
                success: false,
                data: Some(data),
                error: Some(message.into()),
                message: None,
            },
            exit_code: EXIT_FAILED,
        }
    }

    fn failed(err: &InstallerError, verbose: bool) -> Self {
        Self {
            response: ApiResponse::fail(err.user_message(verbose)),
            exit_code: exit_code_for(err),
        }
    }
}

pub fn exit_code_for(err: &InstallerError) -> i32 {
    match err {
        InstallerError::NotFound(_) => EXIT_NOT_FOUND,
        InstallerError::Conflict { .. } => EXIT_CONFLICT,
        _ => EXIT_FAILED,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Mount `target` and keep following redirects until something renders or the wizard is left.
async fn follow(
    wizard: &WizardController,
    target: RedirectTarget,
    flash: Option<String>,
) -> Result<Value, InstallerError> {
    let mut target = target;
    let mut flash = flash;
    for _ in 0..MAX_REDIRECTS {
        let key = match target {
            RedirectTarget::Step(key) => key,
            RedirectTarget::Destination(url) => {
                return Ok(json!({ "destination": url, "flash": flash }))
            }
        };
        match wizard.mount(&key, flash.take()).await? {
            MountOutcome::Render { view } => return Ok(to_json(&view)),
            MountOutcome::Redirect {
                target: next,
                flash: carried,
            } => {
                info!(
                    "[PHASE: api] [STEP: follow] '{}' redirected to {:?}",
                    key, next
                );
                target = next;
                flash = carried;
            }
        }
    }
    warn!("[PHASE: api] [STEP: follow] Redirect limit reached");
    Err(InstallerError::Config(
        "step redirects did not settle".to_string(),
    ))
}

async fn transition_result(wizard: &WizardController, transition: Transition) -> CommandResult {
    match &transition {
        Transition::Redirect { target, flash } => {
            let next = match follow(wizard, target.clone(), flash.clone()).await {
                Ok(next) => next,
                Err(e) => return CommandResult::failed(&e, wizard.config().debug),
            };
            let data = json!({ "transition": to_json(&transition), "next": next });
            if matches!(target, RedirectTarget::Step(_)) && flash.is_some() {
                let message = flash.clone().unwrap_or_default();
                return CommandResult::rejected(data, message);
            }
            CommandResult::ok(data)
        }
        Transition::Invalid { field_errors } => CommandResult::rejected(
            json!({ "transition": to_json(&transition) }),
            format!("{} field(s) failed validation", field_errors.len()),
        ),
        Transition::Rejected { flash } => CommandResult::rejected(
            json!({ "transition": to_json(&transition) }),
            flash.clone(),
        ),
    }
}

/// Run one command against the controller.
pub async fn execute(wizard: &WizardController, command: InstallerCommand) -> CommandResult {
    let verbose = wizard.config().debug;
    info!(
        "[PHASE: api] [STEP: {}] Command requested",
        command.name()
    );

    let result = match command {
        InstallerCommand::Start => match wizard.start() {
            Ok(target) => match follow(wizard, target, None).await {
                Ok(view) => CommandResult::ok(view),
                Err(e) => CommandResult::failed(&e, verbose),
            },
            Err(e) => CommandResult::failed(&e, verbose),
        },
        InstallerCommand::Show { step } => match wizard.mount(&step, None).await {
            Ok(MountOutcome::Render { view }) => CommandResult::ok(to_json(&view)),
            Ok(MountOutcome::Redirect { target, flash }) => {
                match follow(wizard, target, flash).await {
                    Ok(view) => CommandResult::ok(view),
                    Err(e) => CommandResult::failed(&e, verbose),
                }
            }
            Err(e) => CommandResult::failed(&e, verbose),
        },
        InstallerCommand::Submit { step, input } => {
            match wizard.complete_step(&step, &input).await {
                Ok(t) => transition_result(wizard, t).await,
                Err(e) => CommandResult::failed(&e, verbose),
            }
        }
        InstallerCommand::Skip { step } => match wizard.skip_step(&step).await {
            Ok(t) => transition_result(wizard, t).await,
            Err(e) => CommandResult::failed(&e, verbose),
        },
        InstallerCommand::Requirements => {
            let report = wizard.check_requirements().await;
            if report.all_passed() {
                CommandResult::ok(to_json(&report))
            } else {
                CommandResult::rejected(to_json(&report), "Server requirements are not met.")
            }
        }
        InstallerCommand::Export { out } => {
            let export = match &out {
                Some(dir) => wizard.write_settings(dir),
                None => wizard.export_settings(),
            };
            match export {
                Ok(export) => CommandResult::ok(to_json(&export)),
                Err(e) => CommandResult::failed(&e, verbose),
            }
        }
        InstallerCommand::Status => match wizard.status() {
            Ok(status) => CommandResult::ok(to_json(&status)),
            Err(e) => CommandResult::failed(&e, verbose),
        },
        InstallerCommand::PrintConfig => match wizard.config().to_toml() {
            Ok(text) => CommandResult::ok(Value::String(text)),
            Err(e) => CommandResult::failed(&e, verbose),
        },
    };

    if result.exit_code != EXIT_OK {
        error!(
            "[PHASE: api] [STEP: result] Command failed (exit_code={}, error={})",
            result.exit_code,
            result.response.error.as_deref().unwrap_or("")
        );
    }
    result
}
