//! Directory-backed pool.
//!
//! Layout under the pool directory, with `<vid>` possibly containing
//! slashes:
//!
//! * `<vid>.img` — committed state
//! * `<vid>.img.dirty` — working copy while the domain runs
//! * `<vid>.img.<id>` — revisions, id ascending
//! * `<vid>.img.import` — staged import
//!
//! Snapshots are whole-file copies; commit is a rename. A working copy
//! left behind by a crash is discarded on the next start.

use crate::storage::{BlockDevice, Pool, PoolUsage, Revision, Volume};
use log::{debug, warn};
use qubesd_common::{async_trait, QubesError, QubesResult};
use qubesd_model::{PoolConfig, VolumeConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct FilePool {
    name: String,
    dir: PathBuf,
}

impl FilePool {
    pub fn new(config: &PoolConfig) -> QubesResult<Self> {
        let dir = config.options.get("dir_path").ok_or_else(|| {
            QubesError::storage(&config.name, "file pool needs a dir_path option")
        })?;
        Ok(Self {
            name: config.name.clone(),
            dir: PathBuf::from(dir),
        })
    }
}

#[async_trait]
impl Pool for FilePool {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver(&self) -> &'static str {
        "file"
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
        config.validate()?;
        if !config.rw && config.source.is_none() {
            return Err(QubesError::storage(
                &self.name,
                "file pool cannot provide sourceless read-only volumes",
            ));
        }
        Ok(Arc::new(FileVolume {
            pool: self.name.clone(),
            dir: self.dir.clone(),
            config: config.clone(),
        }))
    }

    async fn usage(&self) -> QubesResult<PoolUsage> {
        let stat = nix::sys::statvfs::statvfs(&self.dir)
            .map_err(|e| QubesError::storage(&self.name, format!("statvfs failed: {}", e)))?;
        let size = stat.blocks() as u64 * stat.fragment_size() as u64;
        let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(PoolUsage {
            size,
            usage: size.saturating_sub(free),
        })
    }
}

static REVISION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing revision ids, even within one millisecond.
fn next_revision_id() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    REVISION_SEQ
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .map(|last| now.max(last + 1))
        .unwrap_or(now)
}

pub struct FileVolume {
    pool: String,
    dir: PathBuf,
    config: VolumeConfig,
}

impl FileVolume {
    fn img(&self) -> PathBuf {
        self.dir.join(format!("{}.img", self.config.vid))
    }

    fn dirty(&self) -> PathBuf {
        self.dir.join(format!("{}.img.dirty", self.config.vid))
    }

    fn import(&self) -> PathBuf {
        self.dir.join(format!("{}.img.import", self.config.vid))
    }

    fn revision_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.img.{}", self.config.vid, id))
    }

    fn source_img(&self) -> QubesResult<PathBuf> {
        let source = self.config.source.as_ref().ok_or_else(|| {
            QubesError::storage(&self.pool, format!("volume {} has no source", self.config.vid))
        })?;
        Ok(self.dir.join(format!("{}.img", source)))
    }

    fn err(&self, message: impl Into<String>) -> QubesError {
        QubesError::storage(&self.pool, message)
    }

    fn io(&self, path: &Path, e: std::io::Error) -> QubesError {
        self.err(format!("{}: {}", path.display(), e))
    }

    async fn ensure_parent(&self, path: &Path) -> QubesResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io(parent, e))?;
        }
        Ok(())
    }

    async fn allocate(&self, path: &Path, size: u64) -> QubesResult<()> {
        self.ensure_parent(path).await?;
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| self.io(path, e))?;
        file.set_len(size).await.map_err(|e| self.io(path, e))?;
        Ok(())
    }

    async fn copy(&self, from: &Path, to: &Path) -> QubesResult<()> {
        self.ensure_parent(to).await?;
        tokio::fs::copy(from, to)
            .await
            .map_err(|e| self.io(from, e))?;
        Ok(())
    }

    async fn remove_if_exists(&self, path: &Path) -> QubesResult<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io(path, e)),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }

    async fn list_revisions(&self) -> QubesResult<Vec<u64>> {
        let img_name = match self.img().file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => return Ok(Vec::new()),
        };
        let dir = match self.img().parent() {
            Some(d) => d.to_path_buf(),
            None => return Ok(Vec::new()),
        };
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io(&dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io(&dir, e))? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = file_name.strip_prefix(&format!("{}.", img_name)) {
                if let Ok(id) = suffix.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn prune_revisions(&self) -> QubesResult<()> {
        let ids = self.list_revisions().await?;
        let keep = self.config.revisions_to_keep;
        if ids.len() <= keep {
            return Ok(());
        }
        for id in &ids[..ids.len() - keep] {
            let path = self.revision_path(&id.to_string());
            debug!("pruning revision {}", path.display());
            self.remove_if_exists(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Volume for FileVolume {
    fn config(&self) -> &VolumeConfig {
        &self.config
    }

    async fn create(&self) -> QubesResult<()> {
        if self.config.save_on_stop {
            self.allocate(&self.img(), self.config.size).await?;
        }
        Ok(())
    }

    async fn remove(&self) -> QubesResult<()> {
        self.remove_if_exists(&self.img()).await?;
        self.remove_if_exists(&self.dirty()).await?;
        self.remove_if_exists(&self.import()).await?;
        for id in self.list_revisions().await? {
            self.remove_if_exists(&self.revision_path(&id.to_string()))
                .await?;
        }
        Ok(())
    }

    async fn start(&self) -> QubesResult<()> {
        if !self.config.rw {
            return Ok(());
        }
        // a leftover working copy means we did not stop cleanly
        if self.remove_if_exists(&self.dirty()).await? {
            warn!(
                "discarding uncommitted changes of {} after unclean stop",
                self.config.vid
            );
        }
        if self.config.snap_on_start {
            let source = self.source_img()?;
            if !self.exists(&source).await {
                return Err(self.err(format!(
                    "snapshot source {} was never committed",
                    source.display()
                )));
            }
            self.copy(&source, &self.dirty()).await?;
        } else if self.config.save_on_stop {
            if !self.exists(&self.img()).await {
                self.allocate(&self.img(), self.config.size).await?;
            }
            self.copy(&self.img(), &self.dirty()).await?;
        } else {
            // volatile scratch space
            self.allocate(&self.dirty(), self.config.size).await?;
        }
        Ok(())
    }

    async fn stop(&self) -> QubesResult<()> {
        if !self.config.rw {
            return Ok(());
        }
        if self.config.save_on_stop && self.exists(&self.dirty()).await {
            if self.config.revisions_to_keep > 0 && self.exists(&self.img()).await {
                let revision = self.revision_path(&next_revision_id().to_string());
                tokio::fs::rename(&self.img(), &revision)
                    .await
                    .map_err(|e| self.io(&revision, e))?;
            }
            tokio::fs::rename(&self.dirty(), &self.img())
                .await
                .map_err(|e| self.io(&self.dirty(), e))?;
            self.prune_revisions().await?;
        } else {
            self.remove_if_exists(&self.dirty()).await?;
        }
        Ok(())
    }

    async fn discard(&self) -> QubesResult<()> {
        self.remove_if_exists(&self.dirty()).await?;
        Ok(())
    }

    async fn export(&self) -> QubesResult<PathBuf> {
        let img = if self.config.rw {
            self.img()
        } else {
            self.source_img()?
        };
        if !self.exists(&img).await {
            return Err(self.err(format!("{} has no committed state", self.config.vid)));
        }
        Ok(img)
    }

    async fn export_end(&self) -> QubesResult<()> {
        Ok(())
    }

    async fn import_data(&self, size: u64) -> QubesResult<PathBuf> {
        if self.is_dirty().await {
            return Err(QubesError::wrong_state(format!(
                "volume {} is in use",
                self.config.vid
            )));
        }
        self.allocate(&self.import(), size).await?;
        Ok(self.import())
    }

    async fn import_data_end(&self, success: bool) -> QubesResult<()> {
        if !success {
            self.remove_if_exists(&self.import()).await?;
            return Ok(());
        }
        let meta = tokio::fs::metadata(&self.import())
            .await
            .map_err(|e| self.io(&self.import(), e))?;
        if meta.len() > self.config.size {
            self.remove_if_exists(&self.import()).await?;
            return Err(self.err(format!(
                "import of {} exceeds the declared size ({} > {})",
                self.config.vid,
                meta.len(),
                self.config.size
            )));
        }
        tokio::fs::rename(&self.import(), &self.img())
            .await
            .map_err(|e| self.io(&self.import(), e))?;
        Ok(())
    }

    async fn import_volume(&self, other: &dyn Volume) -> QubesResult<()> {
        let source = other.export().await?;
        self.copy(&source, &self.img()).await?;
        other.export_end().await?;
        Ok(())
    }

    async fn resize(&self, size: u64) -> QubesResult<()> {
        if size < self.config.size {
            return Err(self.err(format!(
                "shrinking {} is not supported",
                self.config.vid
            )));
        }
        for path in [self.img(), self.dirty()] {
            if self.exists(&path).await {
                let file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&path)
                    .await
                    .map_err(|e| self.io(&path, e))?;
                file.set_len(size).await.map_err(|e| self.io(&path, e))?;
            }
        }
        Ok(())
    }

    async fn revert(&self, revision: &str) -> QubesResult<()> {
        if self.is_dirty().await {
            return Err(QubesError::wrong_state(format!(
                "volume {} is in use",
                self.config.vid
            )));
        }
        let path = self.revision_path(revision);
        if !self.exists(&path).await {
            return Err(QubesError::not_found("revision", revision));
        }
        self.remove_if_exists(&self.img()).await?;
        tokio::fs::rename(&path, &self.img())
            .await
            .map_err(|e| self.io(&path, e))?;
        Ok(())
    }

    async fn revisions(&self) -> QubesResult<Vec<Revision>> {
        Ok(self
            .list_revisions()
            .await?
            .into_iter()
            .map(|id| Revision { id: id.to_string() })
            .collect())
    }

    async fn is_dirty(&self) -> bool {
        self.exists(&self.dirty()).await
    }

    async fn is_outdated(&self) -> bool {
        if !self.config.snap_on_start || !self.is_dirty().await {
            return false;
        }
        let source = match self.source_img() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let newer = |path: &Path| {
            std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
        };
        match (newer(&source), newer(&self.dirty())) {
            (Some(source_time), Some(copy_time)) => source_time > copy_time,
            _ => false,
        }
    }

    fn block_device(&self) -> BlockDevice {
        let path = if self.config.rw {
            self.dirty()
        } else {
            self.source_img().unwrap_or_else(|_| self.img())
        };
        BlockDevice {
            name: self.config.name.clone(),
            path,
            rw: self.config.rw,
            ephemeral: self.config.ephemeral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn pool(dir: &Path) -> FilePool {
        FilePool::new(&PoolConfig {
            name: "default".to_string(),
            driver: "file".to_string(),
            options: BTreeMap::from([(
                "dir_path".to_string(),
                dir.to_string_lossy().into_owned(),
            )]),
        })
        .unwrap()
    }

    fn private_config() -> VolumeConfig {
        VolumeConfig {
            name: "private".to_string(),
            pool: "default".to_string(),
            vid: "appvms/work/private".to_string(),
            size: 4096,
            rw: true,
            snap_on_start: false,
            save_on_stop: true,
            ephemeral: false,
            revisions_to_keep: 2,
            source: None,
        }
    }

    #[tokio::test]
    async fn persistent_volume_commits_on_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();

        volume.start().await.unwrap();
        assert!(volume.is_dirty().await);
        tokio::fs::write(volume.block_device().path, b"changed")
            .await
            .unwrap();
        volume.stop().await.unwrap();
        assert!(!volume.is_dirty().await);
        assert_eq!(
            tokio::fs::read(volume.export().await.unwrap()).await.unwrap(),
            b"changed"
        );
    }

    #[tokio::test]
    async fn revisions_are_pruned_oldest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();

        // k = 2; after 3 stops with changes exactly 2 revisions remain
        for round in 0..3u8 {
            volume.start().await.unwrap();
            tokio::fs::write(volume.block_device().path, [round])
                .await
                .unwrap();
            volume.stop().await.unwrap();
        }
        let revisions = volume.revisions().await.unwrap();
        assert_eq!(revisions.len(), 2);
        // oldest-first ordering
        assert!(revisions[0].id < revisions[1].id);
    }

    #[tokio::test]
    async fn revert_restores_old_state() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();

        volume.start().await.unwrap();
        tokio::fs::write(volume.block_device().path, b"old")
            .await
            .unwrap();
        volume.stop().await.unwrap();
        volume.start().await.unwrap();
        tokio::fs::write(volume.block_device().path, b"new")
            .await
            .unwrap();
        volume.stop().await.unwrap();

        let revisions = volume.revisions().await.unwrap();
        // the newest revision holds the state before the last commit
        let last = revisions.last().unwrap().id.clone();
        volume.revert(&last).await.unwrap();
        assert_eq!(
            tokio::fs::read(volume.export().await.unwrap()).await.unwrap(),
            b"old"
        );
    }

    #[tokio::test]
    async fn revert_fails_while_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();
        volume.start().await.unwrap();
        tokio::fs::write(volume.block_device().path, b"x").await.unwrap();
        volume.stop().await.unwrap();
        volume.start().await.unwrap();
        assert!(matches!(
            volume.revert("123").await,
            Err(QubesError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_volume_copies_source_and_discards() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();

        let mut template_root = private_config();
        template_root.name = "root".to_string();
        template_root.vid = "vm-templates/debian-12/root".to_string();
        template_root.revisions_to_keep = 0;
        let source = pool.init_volume(&template_root).unwrap();
        source.create().await.unwrap();
        source.start().await.unwrap();
        tokio::fs::write(source.block_device().path, b"template root")
            .await
            .unwrap();
        source.stop().await.unwrap();

        let snap = pool
            .init_volume(&VolumeConfig {
                name: "root".to_string(),
                pool: "default".to_string(),
                vid: "appvms/work/root".to_string(),
                size: 4096,
                rw: true,
                snap_on_start: true,
                save_on_stop: false,
                ephemeral: false,
                revisions_to_keep: 0,
                source: Some("vm-templates/debian-12/root".to_string()),
            })
            .unwrap();
        snap.start().await.unwrap();
        assert_eq!(
            tokio::fs::read(snap.block_device().path).await.unwrap(),
            b"template root"
        );
        tokio::fs::write(snap.block_device().path, b"scribbled")
            .await
            .unwrap();
        snap.stop().await.unwrap();
        assert!(!snap.is_dirty().await);

        // template contents unchanged
        assert_eq!(
            tokio::fs::read(source.export().await.unwrap()).await.unwrap(),
            b"template root"
        );
    }

    #[tokio::test]
    async fn snapshot_without_committed_source_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let snap = pool
            .init_volume(&VolumeConfig {
                name: "root".to_string(),
                pool: "default".to_string(),
                vid: "appvms/work/root".to_string(),
                size: 4096,
                rw: true,
                snap_on_start: true,
                save_on_stop: false,
                ephemeral: false,
                revisions_to_keep: 0,
                source: Some("vm-templates/missing/root".to_string()),
            })
            .unwrap();
        assert!(matches!(
            snap.start().await,
            Err(QubesError::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn outdated_after_source_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();

        let mut template_root = private_config();
        template_root.name = "root".to_string();
        template_root.vid = "vm-templates/debian-12/root".to_string();
        let source = pool.init_volume(&template_root).unwrap();
        source.create().await.unwrap();
        source.start().await.unwrap();
        source.stop().await.unwrap();

        let snap = pool
            .init_volume(&VolumeConfig {
                name: "root".to_string(),
                pool: "default".to_string(),
                vid: "appvms/work/root".to_string(),
                size: 4096,
                rw: true,
                snap_on_start: true,
                save_on_stop: false,
                ephemeral: false,
                revisions_to_keep: 0,
                source: Some("vm-templates/debian-12/root".to_string()),
            })
            .unwrap();
        snap.start().await.unwrap();
        assert!(!snap.is_outdated().await);

        // the template runs and commits again
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        source.start().await.unwrap();
        tokio::fs::write(source.block_device().path, b"updated")
            .await
            .unwrap();
        source.stop().await.unwrap();
        assert!(snap.is_outdated().await);
    }

    #[tokio::test]
    async fn crash_leftovers_are_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();

        volume.start().await.unwrap();
        tokio::fs::write(volume.block_device().path, b"uncommitted")
            .await
            .unwrap();
        // no stop() — simulate a daemon crash, then the next start
        volume.start().await.unwrap();
        let content = tokio::fs::read(volume.block_device().path).await.unwrap();
        assert_ne!(content, b"uncommitted");
    }

    #[tokio::test]
    async fn import_size_is_verified() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path());
        pool.setup().await.unwrap();
        let volume = pool.init_volume(&private_config()).unwrap();
        volume.create().await.unwrap();

        let staging = volume.import_data(4096).await.unwrap();
        tokio::fs::write(&staging, vec![0u8; 8192]).await.unwrap();
        assert!(volume.import_data_end(true).await.is_err());

        let staging = volume.import_data(4096).await.unwrap();
        tokio::fs::write(&staging, b"payload").await.unwrap();
        volume.import_data_end(true).await.unwrap();
        assert_eq!(
            tokio::fs::read(volume.export().await.unwrap()).await.unwrap(),
            b"payload"
        );
    }
}
