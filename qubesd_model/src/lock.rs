//! Store file locking and atomic writes.

use nix::fcntl::{Flock, FlockArg};
use qubesd_common::{QubesError, QubesResult};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on `<store>.lock`, held for the lifetime of
/// the daemon. A second process fails fast instead of corrupting the
/// store.
pub struct StoreLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl StoreLock {
    pub fn acquire(store_path: &Path) -> QubesResult<Self> {
        let path = lock_path(store_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| QubesError::io(&path, e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            QubesError::wrong_state(format!(
                "store {} is locked by another process ({})",
                path.display(),
                errno
            ))
        })?;
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Write-temp, fsync, rename. The previous document survives any
/// mid-write failure.
pub fn atomic_save(path: &Path, data: &[u8]) -> QubesResult<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".new");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| QubesError::io(&tmp, e))?;
    file.write_all(data).map_err(|e| QubesError::io(&tmp, e))?;
    file.sync_all().map_err(|e| QubesError::io(&tmp, e))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|e| QubesError::io(path, e))?;
    if let Some(dir) = path.parent() {
        // persist the rename itself
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("qubes.xml");
        let first = StoreLock::acquire(&store).unwrap();
        assert!(first.path().ends_with("qubes.xml.lock"));
        assert!(StoreLock::acquire(&store).is_err());
        drop(first);
        assert!(StoreLock::acquire(&store).is_ok());
    }

    #[test]
    fn atomic_save_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qubes.xml");
        atomic_save(&path, b"first").unwrap();
        atomic_save(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!path.with_file_name("qubes.xml.new").exists());
    }
}
