//! Advisory lock guarding a collection state file against concurrent runs.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::StateError;

/// Exclusive lock on `<state path>.lock`, released on drop.
#[derive(Debug)]
pub(crate) struct StateFileLock {
    file: File,
    path: PathBuf,
}

impl StateFileLock {
    /// Takes the lock without blocking.
    pub(crate) fn acquire(state_path: &Path) -> Result<Self, StateError> {
        let path = lock_path_for(state_path);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|error| StateError::io(parent, error))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|error| StateError::io(&path, error))?;

        if file.try_lock_exclusive().is_err() {
            return Err(StateError::Locked { path });
        }

        debug!(path = %path.display(), "acquired collection state lock");
        Ok(Self { file, path })
    }
}

impl Drop for StateFileLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), %error, "failed to release collection state lock");
        }
    }
}

fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut name = state_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".lock");
    state_path.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/state/table.json")),
            PathBuf::from("/tmp/state/table.json.lock")
        );
    }

    #[test]
    fn test_second_lock_is_refused_until_first_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("nested").join("table.json");

        let first = StateFileLock::acquire(&state_path).unwrap();
        assert!(matches!(
            StateFileLock::acquire(&state_path),
            Err(StateError::Locked { .. })
        ));

        drop(first);
        assert!(StateFileLock::acquire(&state_path).is_ok());
    }
}
