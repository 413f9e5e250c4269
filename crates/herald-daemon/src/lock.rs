//! Data directory lock.
//!
//! `session.db` holds ratchet state that a second concurrent writer would
//! corrupt, and the upstream drops the session when it detects concurrent
//! access. One exclusive advisory lock per data directory keeps a second
//! daemon out before it can initialise anything.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use herald_shared::ServiceError;

/// Name of the lock file inside the data directory.
pub const LOCK_FILE: &str = "LOCK";

pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Acquire the exclusive lock for `data_dir`, creating the directory and
    /// the lock file as needed. Contention maps to `AlreadyRunning` and
    /// leaves existing files untouched.
    pub fn acquire(data_dir: &Path) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| ServiceError::Storage(format!("create data dir: {e}")))?;

        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ServiceError::Storage(format!("open lock file: {e}")))?;

        restrict_permissions(&file);

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "acquired data directory lock");
                Ok(Self { file, path })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(ServiceError::AlreadyRunning(
                data_dir.display().to_string(),
            )),
            Err(err) => Err(ServiceError::Storage(format!("lock data dir: {err}"))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock. Dropping the guard does the same.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %err, "failed to release data directory lock");
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &File) {
    use std::os::unix::fs::PermissionsExt;
    let _ = file.set_permissions(std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DataDirLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
        lock.release();

        // Released lock can be re-acquired.
        let _again = DataDirLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn second_acquire_fails_with_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let _held = DataDirLock::acquire(dir.path()).unwrap();

        match DataDirLock::acquire(dir.path()) {
            Err(ServiceError::AlreadyRunning(path)) => {
                assert!(path.contains(dir.path().to_str().unwrap()));
            }
            Err(other) => panic!("expected AlreadyRunning, got {other}"),
            Ok(_) => panic!("second lock unexpectedly acquired"),
        }
    }

    #[test]
    fn contention_does_not_touch_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("app.db");
        std::fs::write(&marker, b"payload").unwrap();

        let _held = DataDirLock::acquire(dir.path()).unwrap();
        assert!(DataDirLock::acquire(dir.path()).is_err());

        assert_eq!(std::fs::read(&marker).unwrap(), b"payload");
    }
}
