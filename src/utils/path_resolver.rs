use crate::config::InstallerConfig;
use anyhow::Result;
use std::path::PathBuf;

const LOG_DIR_NAME: &str = "installer-logs";

/// Resolve log folder (absolute path)
///
/// Order: explicit `options.log_folder`, the application's `storage/logs/` when it exists, the
/// per-user data directory, and finally `./installer-logs/`.
pub fn resolve_log_folder(config: &InstallerConfig) -> Result<PathBuf> {
    let candidate = if let Some(dir) = &config.options.log_folder {
        config.resolve(dir)
    } else {
        let app_logs = config.resolve(std::path::Path::new("storage/logs"));
        if app_logs.is_dir() {
            app_logs
        } else if let Some(data) = dirs::data_local_dir() {
            data.join("first-run-installer").join("logs")
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(LOG_DIR_NAME)
        }
    };

    std::fs::create_dir_all(&candidate)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", candidate, e))?;
    Ok(candidate)
}
