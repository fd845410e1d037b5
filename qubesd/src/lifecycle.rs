//! Domain lifecycle: start, shutdown, kill, pause, unpause.
//!
//! Mutating operations hold the per-domain lock; operations spanning
//! several domains (starting a netvm chain) take the locks in strict qid
//! order so no two paths can deadlock each other. A failed start is
//! atomic: volumes are discarded, qubesdb is wiped, the memory hold is
//! released, and the domain reports halted again.

use crate::app::App;
use crate::hypervisor::{render_domain_xml, DiskSpec, DomainSpec, VmPowerState};
use log::{info, warn};
use qubesd_common::{Event, QubesError, QubesResult};
use qubesd_model::{AssignmentMode, VmClass};
use std::fmt;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Secondary DNS advertised to every guest.
pub const SECONDARY_DNS: &str = "10.139.1.2";

/// In-process view of a domain's lifecycle state. The hypervisor is
/// authoritative for running/halted; the transitional states exist only
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Halted,
    Starting,
    Running,
    Paused,
    Transient,
    Halting,
    Dying,
    Crashed,
    Unknown,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "Halted",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Transient => "Transient",
            Self::Halting => "Halting",
            Self::Dying => "Dying",
            Self::Crashed => "Crashed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<VmPowerState> for DomainState {
    fn from(state: VmPowerState) -> Self {
        match state {
            VmPowerState::Halted => Self::Halted,
            VmPowerState::Running => Self::Running,
            VmPowerState::Paused => Self::Paused,
            VmPowerState::Crashed => Self::Crashed,
            VmPowerState::Unknown => Self::Unknown,
        }
    }
}

impl App {
    fn ensure_online(&self) -> QubesResult<()> {
        if self.settings.offline {
            return Err(QubesError::wrong_state(
                "daemon is in offline mode, lifecycle operations are disabled",
            ));
        }
        Ok(())
    }

    /// Start a domain, bringing its whole netvm chain up first.
    pub async fn start_domain(&self, name: &str) -> QubesResult<()> {
        self.ensure_online()?;

        // everything that may need starting, network root first
        let mut to_start: Vec<String> = {
            let store = self.store().await;
            store.domain(name)?;
            store.netvm_chain(name)?.into_iter().rev().collect()
        };
        to_start.push(name.to_string());

        let _guards = self.lock_in_qid_order(&to_start).await?;

        for domain in &to_start {
            if self.power_state(domain) == DomainState::Running {
                continue;
            }
            self.start_locked(domain).await?;
        }
        Ok(())
    }

    /// Acquire the per-domain locks of `names` in ascending qid order.
    async fn lock_in_qid_order(
        &self,
        names: &[String],
    ) -> QubesResult<Vec<OwnedMutexGuard<()>>> {
        let mut by_qid: Vec<(u16, String)> = {
            let store = self.store().await;
            names
                .iter()
                .map(|n| store.domain(n).map(|d| (d.qid, n.clone())))
                .collect::<QubesResult<_>>()?
        };
        by_qid.sort();
        by_qid.dedup();
        let mut guards = Vec::new();
        for (_, name) in by_qid {
            let lock = self.domain_lock(&name).await;
            guards.push(lock.lock_owned().await);
        }
        Ok(guards)
    }

    async fn start_locked(&self, name: &str) -> QubesResult<()> {
        let state = self.power_state(name);
        if state != DomainState::Halted {
            return Err(QubesError::wrong_state(format!(
                "domain {} is {}, not halted",
                name, state
            )));
        }
        let bus = {
            let store = self.store().await;
            let domain = store.domain(name)?;
            if !domain.class.is_startable() {
                return Err(QubesError::wrong_state(format!(
                    "domain {} cannot be started",
                    name
                )));
            }
            domain.bus.clone()
        };

        let pre = Event::new("domain-pre-start").arg("vm", name);
        bus.fire_pre_async(&pre).await?;
        self.fire_pre(name, &pre).await?;

        self.set_power_state(name, DomainState::Starting);
        info!("starting domain {}", name);
        match self.start_inner(name).await {
            Ok(()) => {
                self.set_power_state(name, DomainState::Running);
                let _ = bus.fire_async(&Event::new("domain-start").arg("vm", name)).await;
                self.relay_events(vec![
                    (name.to_string(), Event::new("domain-start").arg("vm", name)),
                    (name.to_string(), Event::new("domain-started").arg("vm", name)),
                ])
                .await;
                Ok(())
            }
            Err(e) => {
                self.set_power_state(name, DomainState::Halted);
                self.relay_events(vec![(
                    name.to_string(),
                    Event::new("domain-start-failed")
                        .arg("vm", name)
                        .arg("reason", e.to_string()),
                )])
                .await;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, name: &str) -> QubesResult<()> {
        self.check_required_devices(name).await?;

        // prepare volumes; on any failure discard what was prepared
        let volumes = self.domain_volumes(name).await?;
        let mut prepared = Vec::new();
        for volume in &volumes {
            if let Err(e) = volume.start().await {
                for volume in &prepared {
                    discard_quietly(volume).await;
                }
                return Err(e);
            }
            prepared.push(volume.clone());
        }

        let memory = {
            let store = self.store().await;
            store.domain_int(name, "memory").unwrap_or(400) as u64
        };
        if let Err(e) = self.balancer.request(name, memory).await {
            for volume in &prepared {
                discard_quietly(volume).await;
            }
            return Err(e);
        }

        let result = self.start_with_memory(name, &volumes).await;
        if result.is_err() {
            for volume in &prepared {
                discard_quietly(volume).await;
            }
            let _ = self.qdb.remove_all(name).await;
        }
        let _ = self.balancer.release(name).await;
        result
    }

    async fn start_with_memory(
        &self,
        name: &str,
        volumes: &[std::sync::Arc<dyn crate::storage::Volume>],
    ) -> QubesResult<()> {
        let spec = self.domain_spec(name, volumes).await?;
        let xml = render_domain_xml(&self.settings, &spec)?;
        self.hypervisor.define_and_start(name, &xml).await?;

        let qrexec_timeout = {
            let store = self.store().await;
            store.domain_int(name, "qrexec_timeout").unwrap_or(60) as u64
        };
        if let Err(e) = self
            .hypervisor
            .wait_qrexec(name, Duration::from_secs(qrexec_timeout))
            .await
        {
            let _ = self.hypervisor.destroy(name).await;
            return Err(e);
        }

        if let Err(e) = self.write_qdb_entries(name).await {
            let _ = self.hypervisor.destroy(name).await;
            return Err(e);
        }
        // extensions add their own keys on top
        self.relay_events(vec![(
            name.to_string(),
            Event::new("domain-qdb-create").arg("vm", name),
        )])
        .await;
        Ok(())
    }

    /// Required PCI devices must be free before start.
    async fn check_required_devices(&self, name: &str) -> QubesResult<()> {
        let store = self.store().await;
        let domain = store.domain(name)?;
        for assignment in &domain.devices {
            if assignment.mode != AssignmentMode::Required {
                continue;
            }
            for other in store.domains() {
                if other.name == name
                    || self.power_state(&other.name) == DomainState::Halted
                {
                    continue;
                }
                if other
                    .devices
                    .iter()
                    .any(|a| a.mode == AssignmentMode::Required && a.device.matches(&assignment.device))
                {
                    return Err(QubesError::in_use(format!(
                        "required device {} is held by running domain {}",
                        assignment.device, other.name
                    )));
                }
            }
        }
        Ok(())
    }

    async fn domain_spec(
        &self,
        name: &str,
        volumes: &[std::sync::Arc<dyn crate::storage::Volume>],
    ) -> QubesResult<DomainSpec> {
        let store = self.store().await;
        let domain = store.domain(name)?;
        let netvm = store.domain_netvm(name)?;
        let kernel_path = match store.domain_property(name, "kernel") {
            Ok(v) if !v.to_wire().is_empty() => volumes
                .iter()
                .find(|vol| vol.config().name == "kernel")
                .map(|vol| vol.block_device().path.to_string_lossy().into_owned()),
            _ => None,
        };

        let mut disks = Vec::new();
        let targets = ["xvda", "xvdb", "xvdc", "xvdd"];
        for (volume, target) in volumes
            .iter()
            .filter(|v| v.config().name != "kernel")
            .zip(targets)
        {
            let device = volume.block_device();
            disks.push(DiskSpec {
                name: device.name,
                path: device.path.to_string_lossy().into_owned(),
                target: target.to_string(),
                rw: device.rw,
                ephemeral: device.ephemeral,
            });
        }

        Ok(DomainSpec {
            name: name.to_string(),
            uuid: domain.uuid.to_string(),
            vcpus: store.domain_int(name, "vcpus").unwrap_or(2),
            memory: store.domain_int(name, "memory").unwrap_or(400),
            maxmem: store.domain_int(name, "maxmem").unwrap_or(4000),
            virt_mode: store.domain_str(name, "virt_mode").unwrap_or_else(|_| "pvh".into()),
            kernel: kernel_path,
            kernelopts: store.domain_str(name, "kernelopts").unwrap_or_default(),
            ip: store.domain_str(name, "ip")?,
            gateway: store.domain_str(name, "gateway").ok().filter(|g| !g.is_empty()),
            netvm,
            mac: format!("00:16:3e:5e:6c:{:02x}", domain.qid & 0xff),
            disks,
        })
    }

    async fn write_qdb_entries(&self, name: &str) -> QubesResult<()> {
        let (ip, netmask, gateway, class, updatable, base_template) = {
            let store = self.store().await;
            let domain = store.domain(name)?;
            (
                store.domain_str(name, "ip")?,
                store.domain_str(name, "netmask").unwrap_or_default(),
                store.domain_str(name, "gateway").unwrap_or_default(),
                domain.class,
                !domain.class.has_template(),
                store
                    .domain_property(name, "template")
                    .ok()
                    .map(|v| v.to_wire())
                    .filter(|t| !t.is_empty()),
            )
        };

        self.qdb.write(name, "/qubes-ip", &ip).await?;
        if !netmask.is_empty() {
            self.qdb.write(name, "/qubes-netmask", &netmask).await?;
        }
        if !gateway.is_empty() {
            self.qdb.write(name, "/qubes-gateway", &gateway).await?;
            self.qdb
                .write(name, "/qubes-secondary-dns", SECONDARY_DNS)
                .await?;
        }
        self.qdb.write(name, "/qubes-vm-type", class.as_str()).await?;
        self.qdb
            .write(
                name,
                "/qubes-vm-updatable",
                if updatable { "True" } else { "False" },
            )
            .await?;
        if let Some(base) = base_template {
            self.qdb.write(name, "/qubes-base-template", &base).await?;
        }
        Ok(())
    }

    /// Orderly shutdown. Waits up to the domain's `shutdown_timeout`;
    /// with `force` the domain is killed on veto or timeout.
    pub async fn shutdown_domain(&self, name: &str, force: bool) -> QubesResult<()> {
        self.ensure_online()?;
        let lock = self.domain_lock(name).await;
        let _guard = lock.lock().await;

        let state = self.power_state(name);
        if !matches!(state, DomainState::Running | DomainState::Paused) {
            return Err(QubesError::wrong_state(format!(
                "domain {} is {}, not running",
                name, state
            )));
        }
        let (bus, timeout) = {
            let store = self.store().await;
            let domain = store.domain(name)?;
            (
                domain.bus.clone(),
                store.domain_int(name, "shutdown_timeout").unwrap_or(60) as u64,
            )
        };
        let pre = Event::new("domain-pre-shutdown").arg("vm", name);
        if let Err(veto) = bus.fire_pre_async(&pre).await {
            if !force {
                return Err(veto);
            }
        }
        if let Err(veto) = self.fire_pre(name, &pre).await {
            if !force {
                return Err(veto);
            }
        }

        self.set_power_state(name, DomainState::Halting);
        self.hypervisor.shutdown(name).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
        loop {
            match self.hypervisor.state(name).await? {
                VmPowerState::Halted | VmPowerState::Crashed => break,
                _ if tokio::time::Instant::now() >= deadline => {
                    if force {
                        warn!("domain {} ignored shutdown, killing", name);
                        self.hypervisor.destroy(name).await?;
                        break;
                    }
                    self.set_power_state(name, DomainState::Running);
                    return Err(QubesError::wrong_state(format!(
                        "domain {} did not shut down within {}s",
                        name, timeout
                    )));
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }

        drop(_guard);
        self.stop_cleanup(name).await
    }

    /// Destroy the domain immediately and run the stop path.
    pub async fn kill_domain(&self, name: &str) -> QubesResult<()> {
        self.ensure_online()?;
        {
            let lock = self.domain_lock(name).await;
            let _guard = lock.lock().await;
            if self.power_state(name) == DomainState::Halted {
                return Err(QubesError::wrong_state(format!(
                    "domain {} is already halted",
                    name
                )));
            }
            self.set_power_state(name, DomainState::Halting);
            self.hypervisor.destroy(name).await?;
        }
        self.stop_cleanup(name).await
    }

    /// Shared tail of shutdown, kill and crash reconciliation: commit or
    /// discard volumes, drop guest bus entries, fire `domain-shutdown`,
    /// and dissolve disposables.
    pub(crate) async fn stop_cleanup(&self, name: &str) -> QubesResult<()> {
        let is_dispvm = {
            let lock = self.domain_lock(name).await;
            let _guard = lock.lock().await;

            for volume in self.domain_volumes(name).await? {
                if let Err(e) = volume.stop().await {
                    warn!("stopping volume of {} failed: {}", name, e);
                }
            }
            let _ = self.qdb.remove_all(name).await;
            self.set_power_state(name, DomainState::Halted);

            let class = {
                let store = self.store().await;
                let domain = store.domain(name)?;
                let _ = domain
                    .bus
                    .fire(&Event::new("domain-shutdown").arg("vm", name));
                domain.class
            };
            self.relay_events(vec![(
                name.to_string(),
                Event::new("domain-shutdown").arg("vm", name),
            )])
            .await;
            class == VmClass::DispVM
        };

        // a disposable dissolves after its first shutdown
        if is_dispvm {
            info!("disposable {} shut down, removing", name);
            self.remove_domain(name).await?;
        }
        Ok(())
    }

    pub async fn pause_domain(&self, name: &str) -> QubesResult<()> {
        self.ensure_online()?;
        let lock = self.domain_lock(name).await;
        let _guard = lock.lock().await;
        if self.power_state(name) != DomainState::Running {
            return Err(QubesError::wrong_state(format!(
                "domain {} is not running",
                name
            )));
        }
        self.hypervisor.suspend(name).await?;
        self.set_power_state(name, DomainState::Paused);
        self.relay_events(vec![(
            name.to_string(),
            Event::new("domain-paused").arg("vm", name),
        )])
        .await;
        Ok(())
    }

    pub async fn unpause_domain(&self, name: &str) -> QubesResult<()> {
        self.ensure_online()?;
        let lock = self.domain_lock(name).await;
        let _guard = lock.lock().await;
        if self.power_state(name) != DomainState::Paused {
            return Err(QubesError::wrong_state(format!(
                "domain {} is not paused",
                name
            )));
        }
        self.hypervisor.resume(name).await?;
        self.set_power_state(name, DomainState::Running);
        self.relay_events(vec![(
            name.to_string(),
            Event::new("domain-unpaused").arg("vm", name),
        )])
        .await;
        Ok(())
    }

    /// Start every domain with `autostart` set. Failures are logged, not
    /// propagated; one broken domain must not block the boot.
    pub async fn autostart_domains(&self) {
        let names: Vec<String> = {
            let store = self.store().await;
            store
                .domains()
                .filter(|d| d.class.is_startable())
                .map(|d| d.name.clone())
                .collect()
        };
        for name in names {
            let autostart = {
                let store = self.store().await;
                store.domain_bool(&name, "autostart").unwrap_or(false)
            };
            if !autostart {
                continue;
            }
            if let Err(e) = self.start_domain(&name).await {
                warn!("autostart of {} failed: {}", name, e);
            }
        }
    }
}

async fn discard_quietly(volume: &std::sync::Arc<dyn crate::storage::Volume>) {
    if let Err(e) = volume.discard().await {
        warn!("discarding volume {} failed: {}", volume.config().vid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::Hypervisor;
    use crate::mocks::{test_app, TestAppOptions};
    use qubesd_model::{AssignmentMode, DeviceAssignment, DeviceClass, VirtualDevice};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn start_brings_domain_up() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;

        fixture.app.start_domain("work").await.unwrap();
        assert_eq!(fixture.app.power_state("work"), DomainState::Running);

        // guest bus is populated
        assert!(fixture.qdb.get("work", "/qubes-ip").is_some());
        assert_eq!(
            fixture.qdb.get("work", "/qubes-vm-type").as_deref(),
            Some("AppVM")
        );
        assert_eq!(
            fixture.qdb.get("work", "/qubes-base-template").as_deref(),
            Some("debian-12")
        );
        // the memory hold is released once the domain is up
        assert!(fixture.balancer.held().is_empty());
    }

    #[tokio::test]
    async fn start_is_rejected_when_not_halted() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        fixture.app.start_domain("work").await.unwrap();
        assert!(matches!(
            fixture.app.start_domain("work").await,
            Err(QubesError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn netvm_chain_starts_root_first() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_netvm("sys-net").await;
        fixture.add_netvm("sys-firewall").await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.domain_property_set("sys-firewall", "netvm", "sys-net")
            .await
            .unwrap();
        app.domain_property_set("work", "netvm", "sys-firewall")
            .await
            .unwrap();

        let mut rx = app.relay.subscribe();
        app.start_domain("work").await.unwrap();

        for name in ["sys-net", "sys-firewall", "work"] {
            assert_eq!(app.power_state(name), DomainState::Running, "{}", name);
        }
        // start events arrive provider-first
        let mut started = Vec::new();
        while let Ok(relayed) = rx.try_recv() {
            if relayed.event.name == "domain-start" {
                started.push(relayed.subject);
            }
        }
        assert_eq!(started, vec!["sys-net", "sys-firewall", "work"]);
    }

    #[tokio::test]
    async fn memory_refusal_rolls_back() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        fixture.balancer.refuse.store(true, Ordering::SeqCst);

        let err = fixture.app.start_domain("work").await.unwrap_err();
        assert!(matches!(err, QubesError::Memory { .. }));
        assert_eq!(fixture.app.power_state("work"), DomainState::Halted);

        // no working copies survive the failed start
        for volume in fixture.app.domain_volumes("work").await.unwrap() {
            assert!(!volume.is_dirty().await, "{}", volume.config().vid);
        }
        assert!(fixture.qdb.keys("work").is_empty());
    }

    #[tokio::test]
    async fn qrexec_timeout_destroys_domain() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        fixture.hypervisor.fail_qrexec.store(true, Ordering::SeqCst);

        assert!(fixture.app.start_domain("work").await.is_err());
        assert_eq!(fixture.app.power_state("work"), DomainState::Halted);
        assert_eq!(
            fixture.hypervisor.state("work").await.unwrap(),
            crate::hypervisor::VmPowerState::Halted
        );
    }

    #[tokio::test]
    async fn admin_domain_cannot_start() {
        let fixture = test_app(TestAppOptions::default()).await;
        assert!(matches!(
            fixture.app.start_domain("dom0").await,
            Err(QubesError::WrongState { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_commits_private_volume() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.start_domain("work").await.unwrap();

        let private = app.volume("work", "private").await.unwrap();
        tokio::fs::write(private.block_device().path, b"user data")
            .await
            .unwrap();

        app.shutdown_domain("work", false).await.unwrap();
        assert_eq!(app.power_state("work"), DomainState::Halted);
        assert!(!private.is_dirty().await);
        assert_eq!(
            tokio::fs::read(private.export().await.unwrap()).await.unwrap(),
            b"user data"
        );
        // guest bus wiped
        assert!(fixture.qdb.keys("work").is_empty());
    }

    #[tokio::test]
    async fn kill_discards_root_changes() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.start_domain("work").await.unwrap();

        let root = app.volume("work", "root").await.unwrap();
        tokio::fs::write(root.block_device().path, b"scribbled")
            .await
            .unwrap();
        app.kill_domain("work").await.unwrap();
        assert!(!root.is_dirty().await);
        // the root snapshot was discarded, nothing was committed
        assert!(root.export().await.is_err());
    }

    #[tokio::test]
    async fn required_pci_device_is_exclusive() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        fixture.add_app_vm("banking").await;
        let app = &fixture.app;

        let device = VirtualDevice::parse("dom0+00_14.0:8086_15bb", DeviceClass::Pci).unwrap();
        for name in ["work", "banking"] {
            app.device_assign(
                name,
                DeviceAssignment::new(device.clone(), AssignmentMode::Required).unwrap(),
            )
            .await
            .unwrap();
        }

        app.start_domain("work").await.unwrap();
        let err = app.start_domain("banking").await.unwrap_err();
        match err {
            QubesError::InUse { message } => assert!(message.contains("work")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn service_features_reach_the_guest_bus() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.feature_set("work", "service.crond", "1").await.unwrap();
        app.start_domain("work").await.unwrap();
        assert_eq!(
            fixture.qdb.get("work", "/qubes-service/crond").as_deref(),
            Some("1")
        );

        // live update while running
        app.feature_set("work", "service.cups", "").await.unwrap();
        assert_eq!(
            fixture.qdb.get("work", "/qubes-service/cups").as_deref(),
            Some("0")
        );
    }

    #[tokio::test]
    async fn pause_and_unpause() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.start_domain("work").await.unwrap();
        app.pause_domain("work").await.unwrap();
        assert_eq!(app.power_state("work"), DomainState::Paused);
        assert!(app.pause_domain("work").await.is_err());
        app.unpause_domain("work").await.unwrap();
        assert_eq!(app.power_state("work"), DomainState::Running);
    }

    #[tokio::test]
    async fn offline_mode_disables_lifecycle() {
        let fixture = test_app(TestAppOptions { offline: true }).await;
        fixture.add_app_vm("work").await;
        assert!(matches!(
            fixture.app.start_domain("work").await,
            Err(QubesError::WrongState { .. })
        ));
    }
}
