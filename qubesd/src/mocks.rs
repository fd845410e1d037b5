//! In-process fakes of the external collaborators, plus the app fixture
//! used by tests across the crate.

use crate::hypervisor::{Hypervisor, VmPowerState};
use crate::memory::MemoryBalancer;
use crate::qdb::QubesDb;
use qubesd_common::{async_trait, QubesError, QubesResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockHypervisor {
    states: Mutex<BTreeMap<String, VmPowerState>>,
    pub fail_start: AtomicBool,
    pub fail_qrexec: AtomicBool,
    attached: Mutex<Vec<(String, String)>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_state(&self, name: &str, state: VmPowerState) {
        self.states
            .lock()
            .expect("mock lock poisoned")
            .insert(name.to_string(), state);
    }

    pub fn attached_devices(&self, name: &str) -> Vec<String> {
        self.attached
            .lock()
            .expect("mock lock poisoned")
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, xml)| xml.clone())
            .collect()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn define_and_start(&self, name: &str, _xml: &str) -> QubesResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(QubesError::Hypervisor {
                code: 1,
                message: "mock start failure".to_string(),
            });
        }
        self.force_state(name, VmPowerState::Running);
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> QubesResult<()> {
        self.force_state(name, VmPowerState::Halted);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> QubesResult<()> {
        self.force_state(name, VmPowerState::Halted);
        Ok(())
    }

    async fn suspend(&self, name: &str) -> QubesResult<()> {
        self.force_state(name, VmPowerState::Paused);
        Ok(())
    }

    async fn resume(&self, name: &str) -> QubesResult<()> {
        self.force_state(name, VmPowerState::Running);
        Ok(())
    }

    async fn state(&self, name: &str) -> QubesResult<VmPowerState> {
        Ok(self
            .states
            .lock()
            .expect("mock lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(VmPowerState::Halted))
    }

    async fn wait_qrexec(&self, name: &str, _timeout: Duration) -> QubesResult<()> {
        if self.fail_qrexec.load(Ordering::SeqCst) {
            return Err(QubesError::wrong_state(format!(
                "timed out waiting for qrexec in domain {}",
                name
            )));
        }
        Ok(())
    }

    async fn attach_device(&self, name: &str, device_xml: &str) -> QubesResult<()> {
        self.attached
            .lock()
            .expect("mock lock poisoned")
            .push((name.to_string(), device_xml.to_string()));
        Ok(())
    }

    async fn detach_device(&self, name: &str, device_xml: &str) -> QubesResult<()> {
        self.attached
            .lock()
            .expect("mock lock poisoned")
            .retain(|(n, xml)| !(n == name && xml == device_xml));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockQubesDb {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl MockQubesDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, domain: &str, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("mock lock poisoned")
            .get(&(domain.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, domain: &str) -> Vec<String> {
        self.entries
            .lock()
            .expect("mock lock poisoned")
            .keys()
            .filter(|(d, _)| d == domain)
            .map(|(_, k)| k.clone())
            .collect()
    }
}

#[async_trait]
impl QubesDb for MockQubesDb {
    async fn write(&self, domain: &str, key: &str, value: &str) -> QubesResult<()> {
        self.entries
            .lock()
            .expect("mock lock poisoned")
            .insert((domain.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, domain: &str, key: &str) -> QubesResult<()> {
        self.entries
            .lock()
            .expect("mock lock poisoned")
            .retain(|(d, k), _| !(d == domain && k.starts_with(key)));
        Ok(())
    }

    async fn remove_all(&self, domain: &str) -> QubesResult<()> {
        self.entries
            .lock()
            .expect("mock lock poisoned")
            .retain(|(d, _), _| d != domain);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockBalancer {
    pub refuse: AtomicBool,
    holds: Mutex<Vec<String>>,
}

impl MockBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held(&self) -> Vec<String> {
        self.holds.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait]
impl MemoryBalancer for MockBalancer {
    async fn request(&self, domain: &str, _mib: u64) -> QubesResult<()> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(QubesError::Memory {
                message: "mock refusal".to_string(),
            });
        }
        self.holds
            .lock()
            .expect("mock lock poisoned")
            .push(domain.to_string());
        Ok(())
    }

    async fn release(&self, domain: &str) -> QubesResult<()> {
        self.holds
            .lock()
            .expect("mock lock poisoned")
            .retain(|d| d != domain);
        Ok(())
    }
}

#[cfg(test)]
pub use fixture::{test_app, TestApp, TestAppOptions};

#[cfg(test)]
mod fixture {
    use super::*;
    use crate::app::{App, Backends};
    use crate::settings::{PoolSettings, Settings};
    use qubesd_model::VmClass;
    use std::sync::Arc;

    pub struct TestAppOptions {
        pub offline: bool,
    }

    impl Default for TestAppOptions {
        fn default() -> Self {
            Self { offline: false }
        }
    }

    pub struct TestApp {
        pub app: Arc<App>,
        pub hypervisor: Arc<MockHypervisor>,
        pub qdb: Arc<MockQubesDb>,
        pub balancer: Arc<MockBalancer>,
        pub dir: tempfile::TempDir,
    }

    impl TestApp {
        /// Template with a committed root volume, ready to back app VMs.
        pub async fn add_template(&self, name: &str) {
            if self.app.store().await.contains(name) {
                return;
            }
            self.app
                .create_domain(name, VmClass::TemplateVM, "black", None, None)
                .await
                .expect("creating template");
        }

        pub async fn add_app_vm(&self, name: &str) {
            self.add_template("debian-12").await;
            self.app
                .create_domain(name, VmClass::AppVM, "red", Some("debian-12"), None)
                .await
                .expect("creating app vm");
        }

        pub async fn add_netvm(&self, name: &str) {
            self.add_app_vm(name).await;
            self.app
                .domain_property_set(name, "provides_network", "True")
                .await
                .expect("marking netvm");
        }
    }

    pub async fn test_app(options: TestAppOptions) -> TestApp {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = dir.path().join("storage");
        let settings = Settings {
            store_path: dir.path().join("qubes.xml"),
            socket_path: dir.path().join("qubesd.sock"),
            policy_dirs: vec![dir.path().join("policy.d")],
            offline: options.offline,
            template_paths: Vec::new(),
            pools: vec![PoolSettings {
                name: "default".to_string(),
                driver: "file".to_string(),
                options: [(
                    "dir_path".to_string(),
                    storage.to_string_lossy().into_owned(),
                )]
                .into_iter()
                .collect(),
            }],
            qmemman_socket: None,
            worker_interval: "30s".to_string(),
            event_queue: 64,
        };

        let hypervisor = Arc::new(MockHypervisor::new());
        let qdb = Arc::new(MockQubesDb::new());
        let balancer = Arc::new(MockBalancer::new());
        let app = App::init(
            settings,
            Backends {
                hypervisor: hypervisor.clone(),
                qdb: qdb.clone(),
                balancer: balancer.clone(),
            },
        )
        .await
        .expect("app init");

        TestApp {
            app,
            hypervisor,
            qdb,
            balancer,
            dir,
        }
    }
}
