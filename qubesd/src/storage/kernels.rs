//! Read-only kernel pool.
//!
//! Each installed kernel version is a directory containing `vmlinuz`,
//! `initramfs` and a modules image; a volume's vid is the version. The
//! pool provides volumes read-only and supports nothing else.

use crate::storage::{BlockDevice, Pool, PoolUsage, Revision, Volume};
use qubesd_common::{async_trait, QubesError, QubesResult};
use qubesd_model::{PoolConfig, VolumeConfig};
use std::path::PathBuf;
use std::sync::Arc;

pub struct KernelPool {
    name: String,
    dir: PathBuf,
}

impl KernelPool {
    pub fn new(config: &PoolConfig) -> QubesResult<Self> {
        let dir = config.options.get("dir_path").ok_or_else(|| {
            QubesError::storage(&config.name, "linux-kernel pool needs a dir_path option")
        })?;
        Ok(Self {
            name: config.name.clone(),
            dir: PathBuf::from(dir),
        })
    }

    /// Installed kernel versions.
    pub async fn kernels(&self) -> QubesResult<Vec<String>> {
        let mut versions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| QubesError::io(&self.dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QubesError::io(&self.dir, e))?
        {
            if entry.path().join("vmlinuz").exists() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        Ok(versions)
    }
}

#[async_trait]
impl Pool for KernelPool {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "linux-kernel"
    }

    async fn setup(&self) -> QubesResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| QubesError::io(&self.dir, e))
    }

    async fn destroy(&self) -> QubesResult<()> {
        Ok(())
    }

    fn init_volume(&self, config: &VolumeConfig) -> QubesResult<Arc<dyn Volume>> {
        if config.rw || config.snap_on_start || config.save_on_stop {
            return Err(QubesError::storage(
                &self.name,
                "linux-kernel pool provides read-only volumes only",
            ));
        }
        Ok(Arc::new(KernelVolume {
            pool: self.name.clone(),
            dir: self.dir.clone(),
            config: config.clone(),
        }))
    }

    async fn usage(&self) -> QubesResult<PoolUsage> {
        Ok(PoolUsage::default())
    }
}

pub struct KernelVolume {
    pool: String,
    dir: PathBuf,
    config: VolumeConfig,
}

impl KernelVolume {
    fn kernel_dir(&self) -> PathBuf {
        self.dir.join(&self.config.vid)
    }

    fn unsupported(&self, what: &str) -> QubesError {
        QubesError::storage(
            &self.pool,
            format!("kernel volumes do not support {}", what),
        )
    }
}

#[async_trait]
impl Volume for KernelVolume {
    fn config(&self) -> &VolumeConfig {
        &self.config
    }

    async fn create(&self) -> QubesResult<()> {
        if !self.kernel_dir().join("vmlinuz").exists() {
            return Err(QubesError::not_found("kernel", self.config.vid.clone()));
        }
        Ok(())
    }

    async fn remove(&self) -> QubesResult<()> {
        // kernels are installed by the package manager, not by us
        Ok(())
    }

    async fn start(&self) -> QubesResult<()> {
        self.create().await
    }

    async fn stop(&self) -> QubesResult<()> {
        Ok(())
    }

    async fn discard(&self) -> QubesResult<()> {
        Ok(())
    }

    async fn export(&self) -> QubesResult<PathBuf> {
        Ok(self.kernel_dir().join("modules.img"))
    }

    async fn export_end(&self) -> QubesResult<()> {
        Ok(())
    }

    async fn import_data(&self, _size: u64) -> QubesResult<PathBuf> {
        Err(self.unsupported("import"))
    }

    async fn import_data_end(&self, _success: bool) -> QubesResult<()> {
        Err(self.unsupported("import"))
    }

    async fn import_volume(&self, _other: &dyn Volume) -> QubesResult<()> {
        Err(self.unsupported("import"))
    }

    async fn resize(&self, _size: u64) -> QubesResult<()> {
        Err(self.unsupported("resize"))
    }

    async fn revert(&self, _revision: &str) -> QubesResult<()> {
        Err(self.unsupported("revert"))
    }

    async fn revisions(&self) -> QubesResult<Vec<Revision>> {
        Ok(Vec::new())
    }

    async fn is_dirty(&self) -> bool {
        false
    }

    async fn is_outdated(&self) -> bool {
        false
    }

    fn block_device(&self) -> BlockDevice {
        BlockDevice {
            name: self.config.name.clone(),
            path: self.kernel_dir().join("vmlinuz"),
            rw: false,
            ephemeral: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn kernel_config(vid: &str) -> VolumeConfig {
        VolumeConfig {
            name: "kernel".to_string(),
            pool: "linux-kernel".to_string(),
            vid: vid.to_string(),
            size: 0,
            rw: false,
            snap_on_start: false,
            save_on_stop: false,
            ephemeral: false,
            revisions_to_keep: 0,
            source: None,
        }
    }

    #[tokio::test]
    async fn lists_installed_kernels() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = KernelPool::new(&PoolConfig {
            name: "linux-kernel".to_string(),
            driver: "linux-kernel".to_string(),
            options: BTreeMap::from([(
                "dir_path".to_string(),
                tmp.path().to_string_lossy().into_owned(),
            )]),
        })
        .unwrap();
        pool.setup().await.unwrap();

        tokio::fs::create_dir_all(tmp.path().join("6.6.1")).await.unwrap();
        tokio::fs::write(tmp.path().join("6.6.1/vmlinuz"), b"elf").await.unwrap();
        tokio::fs::create_dir_all(tmp.path().join("not-a-kernel")).await.unwrap();

        assert_eq!(pool.kernels().await.unwrap(), vec!["6.6.1"]);

        let volume = pool.init_volume(&kernel_config("6.6.1")).unwrap();
        volume.start().await.unwrap();
        assert!(volume.block_device().path.ends_with("6.6.1/vmlinuz"));
        assert!(pool.init_volume(&kernel_config("6.6.1")).is_ok());

        let missing = pool.init_volume(&kernel_config("9.9")).unwrap();
        assert!(missing.start().await.is_err());
    }

    #[tokio::test]
    async fn rejects_writable_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = KernelPool::new(&PoolConfig {
            name: "linux-kernel".to_string(),
            driver: "linux-kernel".to_string(),
            options: BTreeMap::from([(
                "dir_path".to_string(),
                tmp.path().to_string_lossy().into_owned(),
            )]),
        })
        .unwrap();
        let mut config = kernel_config("6.6.1");
        config.rw = true;
        assert!(pool.init_volume(&config).is_err());
    }
}
