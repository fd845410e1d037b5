//! Storage pools and volumes.
//!
//! A pool driver turns persisted [`VolumeConfig`]s into live [`Volume`]
//! handles. Drivers declare partial support by failing `init_volume` for
//! axis combinations they cannot provide.

use qubesd_common::{async_trait, QubesError, QubesResult};
use qubesd_model::{PoolConfig, VolumeConfig};
use std::path::PathBuf;
use std::sync::Arc;

mod file;
mod kernels;

pub use file::FilePool;
pub use kernels::KernelPool;

/// Driver tags accepted by `admin.pool.Add`.
pub const DRIVERS: &[&str] = &["file", "linux-kernel"];

pub fn build_pool(config: &PoolConfig) -> QubesResult<Arc<dyn Pool>> {
    match config.driver.as_str() {
        "file" => Ok(Arc::new(FilePool::new(config)?)),
        "linux-kernel" => Ok(Arc::new(KernelPool::new(config)?)),
        other => Err(QubesError::storage(
            &config.name,
            format!("unknown pool driver {:?}", other),
        )),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolUsage {
    /// Total capacity in bytes.
    pub size: u64,
    /// Bytes in use.
    pub usage: u64,
}

/// One committed past state of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub id: String,
}

/// What the hypervisor needs to plug the volume into a domain.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub name: String,
    pub path: PathBuf,
    pub rw: bool,
    pub ephemeral: bool,
}

#[async_trait]
pub trait Pool: Send + Sync {
    fn name(&self) -> &str;

    fn driver(&self) -> &'static str;

    /// Prepare the backend (create directories, activate volume groups).
    async fn setup(&self) -> QubesResult<()>;

    /// Tear down backend state. Volume data referenced by the store must
    /// already be gone.
    async fn destroy(&self) -> QubesResult<()>;

    /// Bind a volume config to this pool. No disk effect.
    fn init_volume(&self, config: &VolumeConfig) -> QubesResult<Arc<dyn Volume>>;

    async fn usage(&self) -> QubesResult<PoolUsage>;
}

#[async_trait]
pub trait Volume: Send + Sync {
    fn config(&self) -> &VolumeConfig;

    /// Allocate on-disk state for a brand new volume.
    async fn create(&self) -> QubesResult<()>;

    /// Delete all on-disk state, revisions included.
    async fn remove(&self) -> QubesResult<()>;

    /// Prepare for domain start: discard a stale working copy, snapshot
    /// the source or allocate scratch space.
    async fn start(&self) -> QubesResult<()>;

    /// Commit or discard the working copy, according to `save_on_stop`.
    async fn stop(&self) -> QubesResult<()>;

    /// Drop the working copy without committing. Used to roll back a
    /// start that failed partway.
    async fn discard(&self) -> QubesResult<()>;

    /// Read side of volume transfer; the returned path carries the
    /// committed state.
    async fn export(&self) -> QubesResult<PathBuf>;

    async fn export_end(&self) -> QubesResult<()>;

    /// Begin an import of `size` bytes; data is written to the returned
    /// staging path.
    async fn import_data(&self, size: u64) -> QubesResult<PathBuf>;

    /// Commit (`success`) or abort the staged import.
    async fn import_data_end(&self, success: bool) -> QubesResult<()>;

    /// Clone the committed state of another volume.
    async fn import_volume(&self, other: &dyn Volume) -> QubesResult<()>;

    /// Grow the volume. Shrinking is refused.
    async fn resize(&self, size: u64) -> QubesResult<()>;

    /// Replace the committed state with a revision. Fails while in use.
    async fn revert(&self, revision: &str) -> QubesResult<()>;

    /// Ordered oldest-first.
    async fn revisions(&self) -> QubesResult<Vec<Revision>>;

    /// Uncommitted changes exist.
    async fn is_dirty(&self) -> bool;

    /// The snapshot source has moved since this volume's working copy
    /// was taken.
    async fn is_outdated(&self) -> bool;

    fn block_device(&self) -> BlockDevice;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn unknown_driver_is_rejected() {
        let err = build_pool(&PoolConfig {
            name: "weird".to_string(),
            driver: "zfs".to_string(),
            options: BTreeMap::new(),
        })
        .err()
        .expect("zfs driver is not shipped");
        assert!(matches!(err, QubesError::Storage { .. }));
    }
}
