// Public storage link
//
// Exposes `storage/app/public` under the web root. An existing link that already points at the
// right target counts as success so a resubmitted step does not fail on its own earlier work.

use crate::error::ProvisionError;
use async_trait::async_trait;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

#[async_trait]
pub trait StorageLinker: Send + Sync {
    async fn link(&self) -> Result<(), ProvisionError>;
}

pub struct FsStorageLinker {
    target: PathBuf,
    link: PathBuf,
    timeout: Duration,
}

impl FsStorageLinker {
    pub fn new(target: impl Into<PathBuf>, link: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            link: link.into(),
            timeout,
        }
    }

    async fn create(&self) -> Result<(), ProvisionError> {
        let link_err = |detail: String| ProvisionError::StorageLink { detail };

        if let Ok(existing) = tokio::fs::read_link(&self.link).await {
            if same_target(&existing, &self.target) {
                info!(
                    "[PHASE: provisioning] [STEP: storage_link] Link already present (link={})",
                    self.link.display()
                );
                return Ok(());
            }
            return Err(link_err(format!(
                "{} already links to {}",
                self.link.display(),
                existing.display()
            )));
        }

        if tokio::fs::symlink_metadata(&self.link).await.is_ok() {
            return Err(link_err(format!(
                "{} already exists and is not a link",
                self.link.display()
            )));
        }

        if let Some(parent) = self.link.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| link_err(format!("create {}: {}", parent.display(), e)))?;
        }
        tokio::fs::create_dir_all(&self.target)
            .await
            .map_err(|e| link_err(format!("create {}: {}", self.target.display(), e)))?;

        make_link(&self.target, &self.link)
            .await
            .map_err(|e| link_err(format!("link {}: {}", self.link.display(), e)))?;

        info!(
            "[PHASE: provisioning] [STEP: storage_link] Linked {} -> {}",
            self.link.display(),
            self.target.display()
        );
        Ok(())
    }
}

fn same_target(existing: &Path, wanted: &Path) -> bool {
    if existing == wanted {
        return true;
    }
    match (std::fs::canonicalize(existing), std::fs::canonicalize(wanted)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
async fn make_link(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn make_link(target: &Path, link: &Path) -> std::io::Result<()> {
    tokio::fs::symlink_dir(target, link).await
}

#[async_trait]
impl StorageLinker for FsStorageLinker {
    async fn link(&self) -> Result<(), ProvisionError> {
        match timeout(self.timeout, self.create()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "[PHASE: provisioning] [STEP: storage_link] Timed out after {}ms",
                    self.timeout.as_millis()
                );
                Err(ProvisionError::Timeout {
                    operation: "storage_link".to_string(),
                    timeout_ms: self.timeout.as_millis(),
                })
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_link_and_accepts_it_on_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("storage/app/public");
        let link = dir.path().join("public/storage");
        let linker = FsStorageLinker::new(&target, &link, Duration::from_secs(5));

        linker.link().await.expect("first link");
        assert_eq!(std::fs::read_link(&link).expect("read_link"), target);
        linker.link().await.expect("second link is a no-op");
    }

    #[tokio::test]
    async fn foreign_directory_in_the_way_is_a_storage_link_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let link = dir.path().join("public/storage");
        std::fs::create_dir_all(&link).expect("mkdir");

        let linker = FsStorageLinker::new(
            dir.path().join("storage/app/public"),
            &link,
            Duration::from_secs(5),
        );
        let err = linker.link().await.unwrap_err();
        assert!(matches!(err, ProvisionError::StorageLink { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn link_to_a_different_target_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let elsewhere = dir.path().join("elsewhere");
        std::fs::create_dir_all(&elsewhere).expect("mkdir");
        let link = dir.path().join("storage-link");
        std::os::unix::fs::symlink(&elsewhere, &link).expect("symlink");

        let linker = FsStorageLinker::new(
            dir.path().join("storage/app/public"),
            &link,
            Duration::from_secs(5),
        );
        assert!(linker.link().await.is_err());
    }
}
