//! Daemon configuration.
//!
//! Loaded from a YAML file via the `config` crate; a handful of
//! environment variables override single values so tests and recovery
//! shells can redirect the daemon without editing the file.

use anyhow::{Context, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Store path override.
pub const ENV_STORE_PATH: &str = "QUBESD_STORE_PATH";
/// Any non-empty value suppresses hypervisor and guest bus interaction.
pub const ENV_OFFLINE: &str = "QUBESD_OFFLINE";
/// Admin socket path override.
pub const ENV_SOCKET_PATH: &str = "QUBESD_SOCKET_PATH";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Settings {
    /// Path of the persisted store
    pub store_path: PathBuf,

    /// Unix socket the admin API listens on
    pub socket_path: PathBuf,

    /// Directories scanned for qrexec policy files, in order
    pub policy_dirs: Vec<PathBuf>,

    /// Don't talk to the hypervisor or the guest data bus
    pub offline: bool,

    /// Candidate paths for the libvirt domain template, tried in order
    /// before the built-in template
    pub template_paths: Vec<PathBuf>,

    /// Pools created when the daemon bootstraps a fresh store
    pub pools: Vec<PoolSettings>,

    /// Memory balancer socket; absent means every request is granted
    pub qmemman_socket: Option<PathBuf>,

    /// How often the state reconciliation worker runs, humantime format
    pub worker_interval: String,

    /// Per-subscriber admin event queue length
    pub event_queue: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PoolSettings {
    pub name: String,
    pub driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("/var/lib/qubes/qubes.xml"),
            socket_path: PathBuf::from("/var/run/qubesd.sock"),
            policy_dirs: vec![
                PathBuf::from("/etc/qubes/policy.d"),
                PathBuf::from("/etc/qubes-rpc/policy"),
            ],
            offline: false,
            template_paths: vec![
                PathBuf::from("/etc/qubes/templates/libvirt/xen-user.xml"),
                PathBuf::from("/usr/share/qubes/templates/libvirt/xen-dist.xml"),
                PathBuf::from("/usr/share/qubes/templates/libvirt/xen.xml"),
            ],
            pools: vec![PoolSettings {
                name: "default".to_string(),
                driver: "file".to_string(),
                options: [(
                    "dir_path".to_string(),
                    "/var/lib/qubes/storage".to_string(),
                )]
                .into_iter()
                .collect(),
            }],
            qmemman_socket: None,
            worker_interval: "30s".to_string(),
            event_queue: 256,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings: Settings = match path {
            Some(path) => Config::builder()
                .add_source(File::from(path.to_path_buf()))
                .build()
                .with_context(|| format!("reading config {}", path.display()))?
                .try_deserialize()
                .context("parsing config")?,
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(ENV_STORE_PATH) {
            self.store_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(ENV_SOCKET_PATH) {
            self.socket_path = PathBuf::from(path);
        }
        if std::env::var(ENV_OFFLINE).map(|v| !v.is_empty()).unwrap_or(false) {
            self.offline = true;
        }
    }

    pub fn worker_interval(&self) -> Duration {
        humantime::parse_duration(&self.worker_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Per-name template override, searched before [`Self::template_paths`].
    pub fn template_candidates(&self, domain: &str) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(format!(
            "/etc/qubes/templates/libvirt/xen/by-name/{}.xml",
            domain
        ))];
        candidates.extend(self.template_paths.iter().cloned());
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.worker_interval(), Duration::from_secs(30));
        assert_eq!(s.pools.len(), 1);
        assert_eq!(s.pools[0].driver, "file");
    }

    #[test]
    fn by_name_template_comes_first() {
        let s = Settings::default();
        let candidates = s.template_candidates("work");
        assert!(candidates[0]
            .to_string_lossy()
            .ends_with("by-name/work.xml"));
        assert_eq!(candidates.len(), 1 + s.template_paths.len());
    }
}
