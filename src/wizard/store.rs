// Progress document store
//
// Every read-modify-write holds an advisory lock on `<progress>.lock`. Writes compare the on-disk
// version with the caller's copy, bump it and replace the file through a temp file + rename, so a
// stale writer is rejected with `Conflict` instead of silently overwriting newer progress.

use crate::error::{InstallerError, InstallerResult};
use crate::models::progress::Progress;
use fs2::FileExt;
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
    first_step: String,
}

/// Exclusive lock held for the lifetime of the value.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>, first_step: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            first_step: first_step.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn acquire(&self) -> InstallerResult<LockGuard> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                InstallerError::io(
                    format!("Failed to create progress directory {}", parent.display()),
                    e,
                )
            })?;
        }

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| {
                InstallerError::io(
                    format!("Failed to open progress lock {}", lock_path.display()),
                    e,
                )
            })?;
        FileExt::lock_exclusive(&file).map_err(|e| {
            InstallerError::io(
                format!("Failed to lock progress file {}", lock_path.display()),
                e,
            )
        })?;
        debug!(
            "[PHASE: progress] [STEP: lock] Acquired advisory lock on {}",
            lock_path.display()
        );
        Ok(LockGuard { file })
    }

    fn read_unlocked(&self) -> InstallerResult<Option<Progress>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(InstallerError::io(
                    format!("Failed to read progress file {}", self.path.display()),
                    e,
                ))
            }
        };
        serde_json::from_str(&text).map(Some).map_err(|e| {
            InstallerError::io(
                format!("Progress file {} is not valid", self.path.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    fn write_unlocked(&self, progress: &Progress) -> InstallerResult<()> {
        let json = serde_json::to_string_pretty(progress).map_err(|e| {
            InstallerError::io(
                "Failed to serialize progress",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut f = File::create(&tmp)?;
            f.write_all(json.as_bytes())?;
            f.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            InstallerError::io(
                format!("Failed to write progress file {}", self.path.display()),
                e,
            )
        })
    }

    /// Current document, if one exists.
    pub fn read(&self) -> InstallerResult<Option<Progress>> {
        let _guard = self.acquire()?;
        self.read_unlocked()
    }

    /// Current document, synthesizing and persisting a fresh one when none exists.
    pub fn load(&self) -> InstallerResult<Progress> {
        let _guard = self.acquire()?;
        if let Some(progress) = self.read_unlocked()? {
            return Ok(progress);
        }

        let mut progress = Progress::fresh(&self.first_step);
        progress.version += 1;
        self.write_unlocked(&progress)?;
        info!(
            "[PHASE: progress] [STEP: load] Created progress document {} (current_step={})",
            self.path.display(),
            progress.current_step
        );
        Ok(progress)
    }

    /// Persist `progress` if nobody else wrote since it was read; bumps its version.
    pub fn save(&self, progress: &mut Progress) -> InstallerResult<()> {
        let _guard = self.acquire()?;
        let found = self.read_unlocked()?.map(|p| p.version).unwrap_or(0);
        if found != progress.version {
            warn!(
                "[PHASE: progress] [STEP: save] Rejecting stale write (expected version {}, found {})",
                progress.version, found
            );
            return Err(InstallerError::Conflict {
                expected: progress.version,
                found,
            });
        }

        let mut next = progress.clone();
        next.version += 1;
        self.write_unlocked(&next)?;
        *progress = next;
        debug!(
            "[PHASE: progress] [STEP: save] Saved progress (version={}, current_step={})",
            progress.version, progress.current_step
        );
        Ok(())
    }

    /// Remove the document (and its lock file).
    pub fn delete(&self) -> InstallerResult<()> {
        let guard = self.acquire()?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(InstallerError::io(
                    format!("Failed to delete progress file {}", self.path.display()),
                    e,
                ))
            }
        }
        let _ = std::fs::remove_file(self.lock_path());
        drop(guard);
        info!(
            "[PHASE: progress] [STEP: delete] Progress document removed ({})",
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &tempfile::TempDir) -> ProgressStore {
        ProgressStore::new(dir.path().join("storage/install-progress.json"), "welcome")
    }

    #[test]
    fn load_synthesizes_and_persists_a_fresh_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        assert!(!store.exists());

        let p = store.load().expect("load");
        assert_eq!(p.current_step, "welcome");
        assert!(p.data.is_empty());
        assert_eq!(p.version, 1);
        assert!(store.exists(), "fresh document is observable immediately");

        let again = store.load().expect("load");
        assert_eq!(again, p);
    }

    #[test]
    fn document_is_pretty_printed_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let mut p = store.load().expect("load");
        p.commit("welcome", &json!({ "accepted": true }));
        store.save(&mut p).expect("save");

        let text = std::fs::read_to_string(store.path()).expect("read");
        assert!(text.contains("\n  \"current_step\": \"welcome\""), "{}", text);
        let raw: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(raw["data"]["welcome"]["accepted"], true);
        assert_eq!(raw["version"], 2);
    }

    #[test]
    fn stale_writer_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let mut first = store.load().expect("load");
        let mut second = store.load().expect("load");

        first.commit("welcome", &json!({}));
        store.save(&mut first).expect("first save");

        second.commit("requirements", &json!({ "ok": true }));
        let err = store.save(&mut second).unwrap_err();
        assert!(
            matches!(err, InstallerError::Conflict { expected: 1, found: 2 }),
            "{:?}",
            err
        );
        assert_eq!(second.version, 1, "rejected write leaves the copy untouched");
        assert_eq!(store.load().expect("load").current_step, "welcome");
    }

    #[test]
    fn saving_after_delete_is_a_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let mut p = store.load().expect("load");
        store.delete().expect("delete");
        assert!(!store.exists());
        assert!(matches!(
            store.save(&mut p),
            Err(InstallerError::Conflict { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent_and_leaves_no_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store.load().expect("load");
        store.delete().expect("delete");
        store.delete().expect("delete again");
        assert!(!store.lock_path().exists());
        assert!(store.read().expect("read").is_none());
    }

    #[test]
    fn corrupt_document_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.path(), "{ not json").expect("write");
        assert!(matches!(store.load(), Err(InstallerError::Io { .. })));
    }

    #[test]
    fn legacy_document_without_version_loads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(
            store.path(),
            r#"{ "current_step": "requirements", "data": { "welcome": [] } }"#,
        )
        .expect("write");

        let mut p = store.load().expect("load");
        assert_eq!(p.version, 0);
        assert_eq!(p.current_step, "requirements");
        store.save(&mut p).expect("save");
        assert_eq!(p.version, 1);
    }
}
