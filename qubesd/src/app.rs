//! The application object.
//!
//! Owns the persisted store (behind an async RwLock), the live pool
//! instances, the hypervisor and guest bus clients, the extension
//! registry and the admin event relay. Every mutation goes through a
//! wrapper here that runs extension pre-hooks, applies the change to the
//! store, persists it, and relays the emitted events.

use crate::extensions::{default_extensions, Extension, ExtensionManager};
use crate::hypervisor::Hypervisor;
use crate::lifecycle::DomainState;
use crate::memory::MemoryBalancer;
use crate::qdb::QubesDb;
use crate::settings::Settings;
use crate::storage::{build_pool, Pool, Volume};
use log::{info, warn};
use qubesd_common::{Event, EventRelay, QubesError, QubesResult, GB};
use qubesd_model::{
    atomic_save, store_from_xml, store_to_xml, DeviceAssignment, Domain, EmittedEvents,
    PoolConfig, PropertyValue, QubesStore, Rule, StoreLock, VirtualDevice, VmClass,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};

pub const DEFAULT_ROOT_SIZE: u64 = 10 * GB;
pub const DEFAULT_PRIVATE_SIZE: u64 = 2 * GB;
pub const DEFAULT_VOLATILE_SIZE: u64 = 10 * GB;

/// External collaborators, injectable for tests.
pub struct Backends {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub qdb: Arc<dyn QubesDb>,
    pub balancer: Arc<dyn MemoryBalancer>,
}

pub struct App {
    pub settings: Settings,
    pub(crate) store: RwLock<QubesStore>,
    _lock: StoreLock,
    pools: RwLock<BTreeMap<String, Arc<dyn Pool>>>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub qdb: Arc<dyn QubesDb>,
    pub balancer: Arc<dyn MemoryBalancer>,
    pub relay: EventRelay,
    extensions: ExtensionManager,
    domain_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
    states: std::sync::RwLock<BTreeMap<String, DomainState>>,
}

impl App {
    pub async fn init(settings: Settings, backends: Backends) -> QubesResult<Arc<Self>> {
        if let Some(dir) = settings.store_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| QubesError::io(dir, e))?;
        }
        let lock = StoreLock::acquire(&settings.store_path)?;

        let (store, fresh) = match tokio::fs::read_to_string(&settings.store_path).await {
            Ok(text) => (store_from_xml(&text)?, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "no store at {}, bootstrapping",
                    settings.store_path.display()
                );
                let mut store = QubesStore::new();
                for pool in &settings.pools {
                    store.add_pool(PoolConfig {
                        name: pool.name.clone(),
                        driver: pool.driver.clone(),
                        options: pool.options.clone(),
                    })?;
                }
                (store, true)
            }
            Err(e) => return Err(QubesError::io(&settings.store_path, e)),
        };

        let mut pools: BTreeMap<String, Arc<dyn Pool>> = BTreeMap::new();
        for config in store.pools() {
            let pool = build_pool(config)?;
            pool.setup().await?;
            pools.insert(config.name.clone(), pool);
        }

        let relay = EventRelay::new(settings.event_queue);
        let app = Arc::new(Self {
            settings,
            store: RwLock::new(store),
            _lock: lock,
            pools: RwLock::new(pools),
            hypervisor: backends.hypervisor,
            qdb: backends.qdb,
            balancer: backends.balancer,
            relay,
            extensions: ExtensionManager::new(default_extensions()),
            domain_locks: Mutex::new(BTreeMap::new()),
            states: std::sync::RwLock::new(BTreeMap::new()),
        });
        if fresh {
            app.save().await?;
        }
        Ok(app)
    }

    /// Read access to the object graph. Holding the guard across awaits
    /// is fine for readers; writers go through the mutation wrappers.
    pub async fn store(&self) -> RwLockReadGuard<'_, QubesStore> {
        self.store.read().await
    }

    pub async fn save(&self) -> QubesResult<()> {
        let xml = {
            let store = self.store.read().await;
            store_to_xml(&store)?
        };
        atomic_save(&self.settings.store_path, xml.as_bytes())
    }

    /// Relay post events to extensions and admin subscribers.
    pub async fn relay_events(&self, events: EmittedEvents) {
        for (subject, event) in events {
            self.extensions.fire_post(self, &subject, &event).await;
            self.relay.publish(subject, event);
        }
    }

    /// Extension pre-hooks; the first error vetoes the operation.
    pub async fn fire_pre(&self, subject: &str, event: &Event) -> QubesResult<()> {
        self.extensions.fire_pre(self, subject, event).await
    }

    pub fn extensions(&self) -> &[Arc<dyn Extension>] {
        self.extensions.all()
    }

    // ---- lifecycle bookkeeping ----

    /// Per-domain async mutex serializing mutating lifecycle operations.
    pub async fn domain_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.domain_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn power_state(&self, name: &str) -> DomainState {
        self.states
            .read()
            .expect("state map lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(DomainState::Halted)
    }

    pub fn set_power_state(&self, name: &str, state: DomainState) {
        self.states
            .write()
            .expect("state map lock poisoned")
            .insert(name.to_string(), state);
    }

    pub fn clear_power_state(&self, name: &str) {
        self.states
            .write()
            .expect("state map lock poisoned")
            .remove(name);
    }

    /// Names of domains currently marked running or transitioning.
    pub fn active_domains(&self) -> Vec<String> {
        self.states
            .read()
            .expect("state map lock poisoned")
            .iter()
            .filter(|(_, s)| !matches!(s, DomainState::Halted))
            .map(|(n, _)| n.clone())
            .collect()
    }

    // ---- storage access ----

    pub async fn pool(&self, name: &str) -> QubesResult<Arc<dyn Pool>> {
        self.pools
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| QubesError::not_found("pool", name))
    }

    pub async fn volume(&self, domain: &str, volume: &str) -> QubesResult<Arc<dyn Volume>> {
        let config = {
            let store = self.store.read().await;
            store
                .domain(domain)?
                .volumes
                .get(volume)
                .cloned()
                .ok_or_else(|| QubesError::not_found("volume", volume))?
        };
        let pool = self.pool(&config.pool).await?;
        pool.init_volume(&config)
    }

    pub async fn domain_volumes(&self, domain: &str) -> QubesResult<Vec<Arc<dyn Volume>>> {
        let configs: Vec<_> = {
            let store = self.store.read().await;
            store.domain(domain)?.volumes.values().cloned().collect()
        };
        let mut volumes = Vec::new();
        for config in configs {
            let pool = self.pool(&config.pool).await?;
            volumes.push(pool.init_volume(&config)?);
        }
        Ok(volumes)
    }

    pub async fn add_pool(
        &self,
        name: &str,
        driver: &str,
        options: BTreeMap<String, String>,
    ) -> QubesResult<()> {
        let config = PoolConfig {
            name: name.to_string(),
            driver: driver.to_string(),
            options,
        };
        let pool = build_pool(&config)?;
        pool.setup().await?;
        {
            let mut store = self.store.write().await;
            store.add_pool(config)?;
        }
        self.pools.write().await.insert(name.to_string(), pool);
        self.save().await?;
        self.relay_events(vec![(
            "dom0".to_string(),
            Event::new("pool-add").arg("pool", name),
        )])
        .await;
        Ok(())
    }

    pub async fn remove_pool(&self, name: &str) -> QubesResult<()> {
        let removed = {
            let mut store = self.store.write().await;
            store.remove_pool(name)?
        };
        if let Some(pool) = self.pools.write().await.remove(&removed.name) {
            pool.destroy().await?;
        }
        self.save().await?;
        self.relay_events(vec![(
            "dom0".to_string(),
            Event::new("pool-delete").arg("pool", name),
        )])
        .await;
        Ok(())
    }

    // ---- domain creation / removal / clone ----

    /// Default volume set of a new domain.
    async fn default_volumes(
        &self,
        name: &str,
        class: VmClass,
        template: Option<&str>,
        pool_override: Option<&str>,
    ) -> QubesResult<Vec<qubesd_model::VolumeConfig>> {
        use qubesd_model::VolumeConfig;
        let store = self.store.read().await;
        let pool_for = |kind: &str| -> QubesResult<String> {
            if let Some(pool) = pool_override {
                return Ok(pool.to_string());
            }
            Ok(store
                .global_property(&format!("default_pool_{}", kind))?
                .to_wire())
        };
        let prefix = match class {
            VmClass::TemplateVM => format!("vm-templates/{}", name),
            _ => format!("appvms/{}", name),
        };

        let mut volumes = Vec::new();
        match class {
            VmClass::AppVM | VmClass::DispVM => {
                let template = template.ok_or_else(|| {
                    QubesError::invalid_value(format!("{} needs a template", class))
                })?;
                let template_domain = store.domain(template)?;
                let source_root = template_domain.volumes.get("root").ok_or_else(|| {
                    QubesError::invalid_value(format!("{} has no root volume", template))
                })?;
                volumes.push(VolumeConfig {
                    name: "root".to_string(),
                    pool: source_root.pool.clone(),
                    vid: format!("{}/root", prefix),
                    size: source_root.size,
                    rw: true,
                    snap_on_start: true,
                    save_on_stop: false,
                    ephemeral: false,
                    revisions_to_keep: 0,
                    source: Some(source_root.vid.clone()),
                });
            }
            VmClass::TemplateVM | VmClass::StandaloneVM => {
                volumes.push(VolumeConfig {
                    name: "root".to_string(),
                    pool: pool_for("root")?,
                    vid: format!("{}/root", prefix),
                    size: DEFAULT_ROOT_SIZE,
                    rw: true,
                    snap_on_start: false,
                    save_on_stop: true,
                    ephemeral: false,
                    revisions_to_keep: 1,
                    source: None,
                });
            }
            VmClass::AdminVM => return Ok(volumes),
        }
        volumes.push(VolumeConfig {
            name: "private".to_string(),
            pool: pool_for("private")?,
            vid: format!("{}/private", prefix),
            size: DEFAULT_PRIVATE_SIZE,
            rw: true,
            snap_on_start: false,
            save_on_stop: true,
            ephemeral: false,
            revisions_to_keep: 1,
            source: None,
        });
        volumes.push(VolumeConfig {
            name: "volatile".to_string(),
            pool: pool_for("volatile")?,
            vid: format!("{}/volatile", prefix),
            size: DEFAULT_VOLATILE_SIZE,
            rw: true,
            snap_on_start: false,
            save_on_stop: false,
            ephemeral: false,
            revisions_to_keep: 0,
            source: None,
        });
        Ok(volumes)
    }

    pub async fn create_domain(
        &self,
        name: &str,
        class: VmClass,
        label: &str,
        template: Option<&str>,
        pool_override: Option<&str>,
    ) -> QubesResult<()> {
        if class == VmClass::AdminVM {
            return Err(QubesError::not_allowed("AdminVM exists exactly once"));
        }
        let template = match (template, class) {
            (Some(t), _) => Some(t.to_string()),
            (None, VmClass::AppVM) => {
                let store = self.store.read().await;
                match store.global_property("default_template")? {
                    PropertyValue::VmRef(Some(t)) => Some(t),
                    _ => {
                        return Err(QubesError::invalid_value(
                            "no template given and no default template set",
                        ))
                    }
                }
            }
            _ => None,
        };

        let volumes = self
            .default_volumes(name, class, template.as_deref(), pool_override)
            .await?;

        let events = {
            let mut store = self.store.write().await;
            let qid = store.next_qid()?;
            let mut domain = Domain::new(qid, name, class)?;
            domain.uuid = store.new_uuid();
            store.label(label)?;
            domain
                .properties
                .set("label", PropertyValue::LabelRef(label.to_string()));
            for config in &volumes {
                store.pool(&config.pool)?;
                domain.volumes.insert(config.name.clone(), config.clone());
            }
            let mut events = store.add_domain(domain)?;
            if let Some(template) = &template {
                match store.domain_property_set(name, "template", template) {
                    Ok(more) => events.extend(more),
                    Err(e) => {
                        // creation is atomic; undo the half-made domain
                        let _ = store.remove_domain(name);
                        return Err(e);
                    }
                }
            }
            events
        };

        let mut created: Vec<Arc<dyn Volume>> = Vec::new();
        for config in &volumes {
            let pool = self.pool(&config.pool).await?;
            let volume = pool.init_volume(config)?;
            if let Err(e) = volume.create().await {
                for volume in created {
                    let _ = volume.remove().await;
                }
                let mut store = self.store.write().await;
                let _ = store.remove_domain(name);
                return Err(e);
            }
            created.push(volume);
        }

        self.save().await?;
        self.relay_events(events).await;
        info!("created {} {}", class, name);
        Ok(())
    }

    pub async fn remove_domain(&self, name: &str) -> QubesResult<()> {
        let lock = self.domain_lock(name).await;
        let _guard = lock.lock().await;

        if self.power_state(name) != DomainState::Halted {
            return Err(QubesError::wrong_state(format!(
                "domain {} is not halted",
                name
            )));
        }
        {
            let store = self.store.read().await;
            store.domain(name)?;
            let holders = store.referrers(name);
            if !holders.is_empty() {
                return Err(QubesError::in_use(format!(
                    "domain {} is referenced by {}",
                    name,
                    holders.join(", ")
                )));
            }
        }
        self.fire_pre(name, &Event::new("domain-pre-delete").arg("vm", name))
            .await?;
        self.set_power_state(name, DomainState::Dying);

        // storage first; an error here leaves the domain in the store
        let volumes = self.domain_volumes(name).await?;
        for volume in volumes {
            if let Err(e) = volume.remove().await {
                self.set_power_state(name, DomainState::Halted);
                return Err(e);
            }
        }

        let events = {
            let mut store = self.store.write().await;
            let (_domain, events) = store.remove_domain(name)?;
            events
        };
        self.clear_power_state(name);
        self.domain_locks.lock().await.remove(name);
        self.save().await?;
        self.relay_events(events).await;
        info!("removed domain {}", name);
        Ok(())
    }

    pub async fn clone_domain(&self, source: &str, new_name: &str) -> QubesResult<()> {
        let lock = self.domain_lock(source).await;
        let _guard = lock.lock().await;
        if self.power_state(source) != DomainState::Halted {
            return Err(QubesError::wrong_state(format!(
                "domain {} is not halted",
                source
            )));
        }

        let (volume_pairs, events) = {
            let mut store = self.store.write().await;
            let src = store.domain(source)?;
            let qid = store.next_qid()?;
            let mut copy = src.duplicate(qid, new_name)?;
            copy.uuid = store.new_uuid();

            let src_prefix = match src.class {
                VmClass::TemplateVM => format!("vm-templates/{}", source),
                _ => format!("appvms/{}", source),
            };
            let dst_prefix = match src.class {
                VmClass::TemplateVM => format!("vm-templates/{}", new_name),
                _ => format!("appvms/{}", new_name),
            };

            let mut pairs = Vec::new();
            for config in src.volumes.values() {
                let mut cloned = config.clone();
                cloned.vid = config.vid.replace(&src_prefix, &dst_prefix);
                pairs.push((config.clone(), cloned.clone()));
                copy.volumes.insert(cloned.name.clone(), cloned);
            }
            let events = store.add_domain(copy)?;
            (pairs, events)
        };

        for (src_config, dst_config) in &volume_pairs {
            let src_pool = self.pool(&src_config.pool).await?;
            let dst_pool = self.pool(&dst_config.pool).await?;
            let src_volume = src_pool.init_volume(src_config)?;
            let dst_volume = dst_pool.init_volume(dst_config)?;
            dst_volume.create().await?;
            if src_config.save_on_stop {
                dst_volume.import_volume(src_volume.as_ref()).await?;
            }
        }

        self.save().await?;
        self.relay_events(events).await;
        info!("cloned {} into {}", source, new_name);
        Ok(())
    }

    // ---- property / feature / tag / firewall / device wrappers ----

    pub async fn domain_property_set(
        &self,
        name: &str,
        prop: &str,
        value: &str,
    ) -> QubesResult<()> {
        let pre = Event::new(format!("property-pre-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value);
        self.fire_pre(name, &pre).await?;
        let events = {
            let mut store = self.store.write().await;
            store.domain_property_set(name, prop, value)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn domain_property_reset(&self, name: &str, prop: &str) -> QubesResult<()> {
        let pre = Event::new(format!("property-pre-reset:{}", prop)).arg("name", prop);
        self.fire_pre(name, &pre).await?;
        let events = {
            let mut store = self.store.write().await;
            store.domain_property_reset(name, prop)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn global_property_set(&self, prop: &str, value: &str) -> QubesResult<()> {
        let pre = Event::new(format!("property-pre-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value);
        self.fire_pre("dom0", &pre).await?;
        let events = {
            let mut store = self.store.write().await;
            store.global_property_set(prop, value)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn global_property_reset(&self, prop: &str) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.global_property_reset(prop)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn feature_set(&self, name: &str, feature: &str, value: &str) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.feature_set(name, feature, value)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn feature_remove(&self, name: &str, feature: &str) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.feature_remove(name, feature)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn tag_add(&self, name: &str, tag: &str) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.tag_add(name, tag)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn tag_remove(&self, name: &str, tag: &str) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.tag_remove(name, tag)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn firewall_set(
        &self,
        name: &str,
        rules: Vec<Rule>,
        policy: Option<qubesd_model::Action>,
    ) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.firewall_set(name, rules, policy)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn device_assign(
        &self,
        name: &str,
        assignment: DeviceAssignment,
    ) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.device_assign(name, assignment)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    pub async fn device_unassign(&self, name: &str, device: &VirtualDevice) -> QubesResult<()> {
        let events = {
            let mut store = self.store.write().await;
            store.device_unassign(name, device)?
        };
        self.save().await?;
        self.relay_events(events).await;
        Ok(())
    }

    /// A device appeared on a backend domain. Auto-attach it wherever a
    /// matching auto or required assignment exists.
    pub async fn device_added(&self, device: &VirtualDevice) -> QubesResult<Vec<String>> {
        let candidates: Vec<String> = {
            let store = self.store.read().await;
            store
                .domains()
                .filter(|d| {
                    d.devices.iter().any(|a| {
                        a.device.matches(device)
                            && matches!(
                                a.mode,
                                qubesd_model::AssignmentMode::Auto
                                    | qubesd_model::AssignmentMode::Required
                            )
                    })
                })
                .map(|d| d.name.clone())
                .collect()
        };
        let mut attached = Vec::new();
        for name in candidates {
            if self.power_state(name.as_str()) != DomainState::Running {
                continue;
            }
            match self.attach_device(&name, device).await {
                Ok(()) => attached.push(name),
                Err(e) => warn!("auto-attach of {} to {} failed: {}", device, name, e),
            }
        }
        Ok(attached)
    }

    pub async fn attach_device(&self, name: &str, device: &VirtualDevice) -> QubesResult<()> {
        let xml = device_xml(device);
        self.hypervisor.attach_device(name, &xml).await?;
        self.relay_events(vec![(
            name.to_string(),
            Event::new(format!("device-attach:{}", device.port.devclass))
                .arg("device", device.to_string()),
        )])
        .await;
        Ok(())
    }

    pub async fn detach_device(&self, name: &str, device: &VirtualDevice) -> QubesResult<()> {
        let xml = device_xml(device);
        self.hypervisor.detach_device(name, &xml).await?;
        self.relay_events(vec![(
            name.to_string(),
            Event::new(format!("device-detach:{}", device.port.devclass))
                .arg("device", device.to_string()),
        )])
        .await;
        Ok(())
    }

    /// Entry point for `qubes.FeaturesRequest` from a guest. Data is
    /// untrusted; extensions validate before anything is stored.
    pub async fn features_request(
        &self,
        name: &str,
        untrusted: BTreeMap<String, String>,
    ) -> QubesResult<()> {
        let mut event = Event::new("features-request");
        for (key, value) in untrusted {
            event = event.arg(format!("untrusted_{}", key), value);
        }
        self.extensions.fire_post(self, name, &event).await;
        Ok(())
    }
}

fn device_xml(device: &VirtualDevice) -> String {
    format!(
        "<hostdev mode=\"subsystem\" type=\"{}\"><source backend=\"{}\" id=\"{}\"/></hostdev>",
        device.port.devclass, device.port.backend, device.port.port_id
    )
}
