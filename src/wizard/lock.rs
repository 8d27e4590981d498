// Installation lock marker
//
// Existence is the only signal; the timestamp inside is for humans.

use crate::error::{InstallerError, InstallerResult};
use log::info;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_installed(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self) -> InstallerResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                InstallerError::io(format!("Failed to create {}", parent.display()), e)
            })?;
        }
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        std::fs::write(&self.path, &stamp).map_err(|e| {
            InstallerError::io(
                format!("Failed to write lock file {}", self.path.display()),
                e,
            )
        })?;
        info!(
            "[PHASE: finish] [STEP: lock] Installation marked complete ({} at {})",
            self.path.display(),
            stamp
        );
        Ok(())
    }
}
