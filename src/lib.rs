// First-run installer
// Library entry point: module tree, logging bootstrap, production wiring and the CLI runner.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod installation;
pub mod models;
pub mod utils;
pub mod wizard;

use crate::api::installer::{execute, InstallerCommand, EXIT_FAILED, EXIT_USAGE};
use crate::api::preflight::CommandRuntimeProbe;
use crate::config::InstallerConfig;
use crate::database::connection::SqlxLiveConnection;
use crate::database::migrations::CommandSchemaRunner;
use crate::error::InstallerResult;
use crate::installation::storage::FsStorageLinker;
use crate::models::responses::ApiResponse;
use crate::wizard::controller::{WizardController, WizardDeps};
use crate::wizard::steps::CommandUserStore;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

/// Initialize logging system with dual format (JSON + human-readable)
pub fn init_logging(
    config: &InstallerConfig,
    with_stdout: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_dir = utils::path_resolver::resolve_log_folder(config)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");

    // JSON log file for structured parsing
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));

    // Human-readable log file (.txt)
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    let level = if config.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let mut dispatch = fern::Dispatch::new().level(level);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stderr()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Controller wired to the real database, console commands and filesystem.
pub fn build_controller(config: Arc<InstallerConfig>) -> InstallerResult<WizardController> {
    let provisioning = &config.provisioning;
    let deps = WizardDeps {
        connection: Arc::new(SqlxLiveConnection::new(
            provisioning.connect_timeout(),
            provisioning.connect_retries,
        )),
        schema: Arc::new(CommandSchemaRunner::from_config(&config)),
        linker: Arc::new(FsStorageLinker::new(
            config.resolve(&provisioning.storage_link_target),
            config.resolve(&provisioning.storage_link_path),
            provisioning.storage_link_timeout(),
        )),
        probe: Arc::new(CommandRuntimeProbe::new(
            config.requirements.runtime.clone(),
        )),
        users: Arc::new(CommandUserStore::from_config(&config)),
    };
    WizardController::new(config, deps)
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
    pub command: InstallerCommand,
}

pub const USAGE: &str = "usage: first-run-installer [--config PATH] [--verbose] <command>

commands:
  start                                  resume or begin the wizard
  show <step>                            render a step
  submit <step> [--data FILE | --json TEXT]
                                         complete a step with a JSON payload
  skip <step>                            skip an optional step
  requirements                           run the server requirements checks
  export [--out DIR]                     dump the committed settings
  status                                 show installation state
  print-config                           print the effective configuration";

fn take_value(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires a value", flag))
}

/// Parse `args` (without the program name).
pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut config_path = None;
    let mut verbose = false;
    let mut data_file: Option<PathBuf> = None;
    let mut json_text: Option<String> = None;
    let mut out: Option<PathBuf> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--config" => config_path = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--data" => data_file = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--json" => json_text = Some(take_value(args, &mut i, arg)?),
            "--out" => out = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--verbose" | "-v" => verbose = true,
            other if other.starts_with("--") => return Err(format!("unknown option {}", other)),
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let step_arg = |name: &str| -> Result<String, String> {
        positional
            .get(1)
            .cloned()
            .ok_or_else(|| format!("{} requires a step key", name))
    };

    let command = match positional.first().map(String::as_str) {
        Some("start") => InstallerCommand::Start,
        Some("show") => InstallerCommand::Show {
            step: step_arg("show")?,
        },
        Some("submit") => {
            let input = match (data_file, json_text) {
                (Some(_), Some(_)) => return Err("use either --data or --json".to_string()),
                (Some(path), None) => {
                    let text = std::fs::read_to_string(&path)
                        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
                    parse_payload(&text)?
                }
                (None, Some(text)) => parse_payload(&text)?,
                (None, None) => Value::Null,
            };
            InstallerCommand::Submit {
                step: step_arg("submit")?,
                input,
            }
        }
        Some("skip") => InstallerCommand::Skip {
            step: step_arg("skip")?,
        },
        Some("requirements") => InstallerCommand::Requirements,
        Some("export") => InstallerCommand::Export { out },
        Some("status") => InstallerCommand::Status,
        Some("print-config") => InstallerCommand::PrintConfig,
        Some(other) => return Err(format!("unknown command '{}'", other)),
        None => return Err("missing command".to_string()),
    };

    Ok(CliArgs {
        config_path,
        verbose,
        command,
    })
}

fn parse_payload(text: &str) -> Result<Value, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("payload is not valid JSON: {}", e))?;
    if !value.is_object() && !value.is_null() {
        return Err("payload must be a JSON object".to_string());
    }
    Ok(value)
}

/// Spinner on stderr that follows the controller's working indicator.
fn spawn_spinner(mut working: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut bar: Option<ProgressBar> = None;
        loop {
            let active = *working.borrow_and_update();
            match (active, bar.is_some()) {
                (true, false) => {
                    let pb = ProgressBar::new_spinner();
                    if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} ({elapsed})") {
                        pb.set_style(style);
                    }
                    pb.set_message("Provisioning, please wait...");
                    pb.enable_steady_tick(Duration::from_millis(120));
                    bar = Some(pb);
                }
                (false, true) => {
                    if let Some(pb) = bar.take() {
                        pb.finish_and_clear();
                    }
                }
                _ => {}
            }
            if working.changed().await.is_err() {
                break;
            }
        }
        if let Some(pb) = bar.take() {
            pb.finish_and_clear();
        }
    })
}

fn print_response(response: &ApiResponse<Value>) {
    match serde_json::to_string_pretty(response) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to render response: {}", e),
    }
}

/// Run one CLI invocation and return the process exit code.
pub fn run_cli(args: Vec<String>) -> i32 {
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("{}\n\n{}", msg, USAGE);
            return EXIT_USAGE;
        }
    };

    let mut config = match InstallerConfig::load(cli.config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            print_response(&ApiResponse::fail(e.to_string()));
            return EXIT_FAILED;
        }
    };
    if cli.verbose {
        config.debug = true;
    }

    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    info!(
        "[PHASE: initialization] Installer starting (command={}, base_path={:?})",
        cli.command.name(),
        config.base_path
    );

    let config = Arc::new(config);
    let wizard = match build_controller(Arc::clone(&config)) {
        Ok(w) => w,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: wiring] {}", e);
            print_response(&ApiResponse::fail(e.user_message(config.debug)));
            return EXIT_FAILED;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return EXIT_FAILED;
        }
    };

    let result = rt.block_on(async {
        let spinner = spawn_spinner(wizard.subscribe_working());
        let result = execute(&wizard, cli.command).await;
        spinner.abort();
        result
    });

    print_response(&result.response);
    result.exit_code
}
