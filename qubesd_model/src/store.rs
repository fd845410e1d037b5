//! The in-memory object graph behind `qubes.xml`.
//!
//! Domain-to-domain references are stored as names and resolved on
//! access, so the graph holds no strong cycles; back-references
//! (children of a template, clients of a netvm) are computed queries.
//!
//! Mutators validate, fire pre events on the subject's bus (a veto
//! aborts the change), apply, fire post events, and hand the emitted
//! post events back to the caller for relaying onto the admin event
//! stream and to extensions.

use crate::{
    default_labels, domain_property_def, domain_property_defs, global_property_def, validate_name,
    DefaultCtx, DeviceAssignment, Domain, Label, PropertyDef, PropertyDefault, PropertyKind,
    PropertyValue, Rule, VmClass,
};
use qubesd_common::{Event, EventBus, QubesError, QubesResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Events emitted by a mutation, paired with their subject name, in
/// firing order. The caller relays them to the admin stream and to
/// extension post-handlers.
pub type EmittedEvents = Vec<(String, Event)>;

/// Persisted configuration of one storage pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

pub struct QubesStore {
    /// Application-level properties.
    pub global: PropertyMap,
    /// Application-level event handlers.
    pub bus: Arc<EventBus>,
    pub(crate) labels: BTreeMap<u32, Label>,
    pub(crate) pools: BTreeMap<String, PoolConfig>,
    pub(crate) domains: BTreeMap<u16, Domain>,
}

use crate::PropertyMap;

pub const ADMIN_VM_NAME: &str = "dom0";

impl QubesStore {
    /// A fresh store: stock labels and the admin domain, nothing else.
    pub fn new() -> Self {
        let mut store = Self {
            global: PropertyMap::new(),
            bus: Arc::new(EventBus::new()),
            labels: default_labels().into_iter().map(|l| (l.index, l)).collect(),
            pools: BTreeMap::new(),
            domains: BTreeMap::new(),
        };
        let mut dom0 = Domain::new(0, ADMIN_VM_NAME, VmClass::AdminVM)
            .expect("admin domain construction is infallible");
        dom0.properties
            .set("label", PropertyValue::LabelRef("black".to_string()));
        store.domains.insert(0, dom0);
        store
    }

    // ---- labels ----

    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.labels.values()
    }

    pub fn label(&self, name: &str) -> QubesResult<&Label> {
        self.labels
            .values()
            .find(|l| l.name == name)
            .ok_or_else(|| QubesError::not_found("label", name))
    }

    pub fn label_by_index(&self, index: u32) -> QubesResult<&Label> {
        self.labels
            .get(&index)
            .ok_or_else(|| QubesError::not_found("label", index.to_string()))
    }

    pub fn add_label(&mut self, label: Label) -> QubesResult<()> {
        if self.labels.contains_key(&label.index) {
            return Err(QubesError::in_use(format!(
                "label index {} already exists",
                label.index
            )));
        }
        if self.label(&label.name).is_ok() {
            return Err(QubesError::in_use(format!(
                "label {} already exists",
                label.name
            )));
        }
        self.labels.insert(label.index, label);
        Ok(())
    }

    pub fn remove_label(&mut self, name: &str) -> QubesResult<()> {
        let label = self.label(name)?.clone();
        let users: Vec<_> = self
            .domains
            .values()
            .filter(|d| {
                d.properties.get("label") == Some(&PropertyValue::LabelRef(label.name.clone()))
            })
            .map(|d| d.name.clone())
            .collect();
        if !users.is_empty() {
            return Err(QubesError::in_use(format!(
                "label {} is used by {}",
                name,
                users.join(", ")
            )));
        }
        self.labels.remove(&label.index);
        Ok(())
    }

    // ---- pools ----

    pub fn pools(&self) -> impl Iterator<Item = &PoolConfig> {
        self.pools.values()
    }

    pub fn pool(&self, name: &str) -> QubesResult<&PoolConfig> {
        self.pools
            .get(name)
            .ok_or_else(|| QubesError::not_found("pool", name))
    }

    pub fn add_pool(&mut self, config: PoolConfig) -> QubesResult<()> {
        if self.pools.contains_key(&config.name) {
            return Err(QubesError::in_use(format!(
                "pool {} already exists",
                config.name
            )));
        }
        self.pools.insert(config.name.clone(), config);
        Ok(())
    }

    pub fn remove_pool(&mut self, name: &str) -> QubesResult<PoolConfig> {
        self.pool(name)?;
        let users: Vec<_> = self
            .domains
            .values()
            .filter(|d| d.volumes.values().any(|v| v.pool == name))
            .map(|d| d.name.clone())
            .collect();
        if !users.is_empty() {
            return Err(QubesError::in_use(format!(
                "pool {} holds volumes of {}",
                name,
                users.join(", ")
            )));
        }
        Ok(self.pools.remove(name).expect("checked above"))
    }

    // ---- domains ----

    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.domains.values()
    }

    pub fn domain(&self, name: &str) -> QubesResult<&Domain> {
        self.domains
            .values()
            .find(|d| d.name == name)
            .ok_or_else(|| QubesError::not_found("domain", name))
    }

    pub fn domain_by_qid(&self, qid: u16) -> QubesResult<&Domain> {
        self.domains
            .get(&qid)
            .ok_or_else(|| QubesError::not_found("domain", format!("qid {}", qid)))
    }

    pub(crate) fn domain_mut(&mut self, name: &str) -> QubesResult<&mut Domain> {
        self.domains
            .values_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| QubesError::not_found("domain", name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.domains.values().any(|d| d.name == name)
    }

    /// Smallest unused positive qid.
    pub fn next_qid(&self) -> QubesResult<u16> {
        (1..=crate::MAX_QID)
            .find(|qid| !self.domains.contains_key(qid))
            .ok_or_else(|| QubesError::internal("qid space exhausted"))
    }

    pub fn add_domain(&mut self, domain: Domain) -> QubesResult<EmittedEvents> {
        if domain.class == VmClass::AdminVM {
            return Err(QubesError::invalid_value("AdminVM exists exactly once"));
        }
        validate_name(&domain.name)?;
        if self.domains.contains_key(&domain.qid) {
            return Err(QubesError::in_use(format!(
                "qid {} already taken",
                domain.qid
            )));
        }
        if self.contains(&domain.name) {
            return Err(QubesError::in_use(format!(
                "domain name {} already taken",
                domain.name
            )));
        }
        if self.domains.values().any(|d| d.uuid == domain.uuid) {
            return Err(QubesError::in_use(format!(
                "uuid {} already taken",
                domain.uuid
            )));
        }
        match domain.properties.get("label") {
            Some(PropertyValue::LabelRef(name)) => {
                self.label(name)?;
            }
            _ => return Err(QubesError::invalid_value("new domain must carry a label")),
        }
        let event = Event::new("domain-add")
            .arg("vm", domain.name.clone())
            .arg("class", domain.class.as_str());
        self.domains.insert(domain.qid, domain);
        let mut emitted = Vec::new();
        let _ = self.bus.fire(&event);
        emitted.push((ADMIN_VM_NAME.to_string(), event));
        Ok(emitted)
    }

    /// Domains and global properties that keep `name` alive.
    pub fn referrers(&self, name: &str) -> Vec<String> {
        let mut holders = Vec::new();
        for def in crate::GLOBAL_PROPERTIES {
            if def.kind == PropertyKind::VmRef
                && self.global.get(def.name)
                    == Some(&PropertyValue::VmRef(Some(name.to_string())))
            {
                holders.push(format!("global property {}", def.name));
            }
        }
        for d in self.domains.values() {
            if d.name == name {
                continue;
            }
            for (prop, value) in d.properties.iter() {
                if value == &PropertyValue::VmRef(Some(name.to_string())) {
                    holders.push(format!("{} (property {})", d.name, prop));
                }
            }
            for a in &d.devices {
                if a.device.port.backend == name {
                    holders.push(format!("{} (device {})", d.name, a.device));
                }
            }
        }
        holders
    }

    pub fn remove_domain(&mut self, name: &str) -> QubesResult<(Domain, EmittedEvents)> {
        let domain = self.domain(name)?;
        if domain.class == VmClass::AdminVM {
            return Err(QubesError::not_allowed("cannot remove the admin domain"));
        }
        let qid = domain.qid;
        let holders = self.referrers(name);
        if !holders.is_empty() {
            return Err(QubesError::in_use(format!(
                "domain {} is referenced by {}",
                name,
                holders.join(", ")
            )));
        }
        let pre = Event::new("domain-pre-delete").arg("vm", name);
        self.bus.fire_pre(&pre)?;
        let domain = self.domains.remove(&qid).expect("looked up above");
        let event = Event::new("domain-delete").arg("vm", name);
        let _ = self.bus.fire(&event);
        Ok((domain, vec![(ADMIN_VM_NAME.to_string(), event)]))
    }

    // ---- property access ----

    fn resolved_default(
        &self,
        def: &PropertyDef,
        domain: Option<&Domain>,
    ) -> Option<PropertyValue> {
        match def.default {
            PropertyDefault::None => None,
            PropertyDefault::Str(s) => Some(PropertyValue::Str(s.to_string())),
            PropertyDefault::Int(i) => Some(PropertyValue::Int(i)),
            PropertyDefault::Bool(b) => Some(PropertyValue::Bool(b)),
            PropertyDefault::Global(g) => self.global_property(g).ok(),
            PropertyDefault::Computed(f) => f(&DefaultCtx {
                store: self,
                domain,
            }),
        }
    }

    fn finish_get(
        &self,
        def: &PropertyDef,
        set: Option<&PropertyValue>,
        domain: Option<&Domain>,
    ) -> QubesResult<PropertyValue> {
        if let Some(v) = set {
            return Ok(v.clone());
        }
        match self.resolved_default(def, domain) {
            Some(v) => Ok(v),
            None if def.kind == PropertyKind::VmRef => Ok(PropertyValue::VmRef(None)),
            None => Err(QubesError::not_found("property value", def.name)),
        }
    }

    pub fn global_property(&self, prop: &str) -> QubesResult<PropertyValue> {
        let def =
            global_property_def(prop).ok_or_else(|| QubesError::not_found("property", prop))?;
        self.finish_get(def, self.global.get(prop), None)
    }

    pub fn global_property_is_default(&self, prop: &str) -> QubesResult<bool> {
        global_property_def(prop).ok_or_else(|| QubesError::not_found("property", prop))?;
        Ok(!self.global.is_set(prop))
    }

    pub fn domain_property(&self, name: &str, prop: &str) -> QubesResult<PropertyValue> {
        let domain = self.domain(name)?;
        let def = domain_property_def(domain.class, prop)
            .ok_or_else(|| QubesError::not_found("property", prop))?;
        self.finish_get(def, domain.properties.get(prop), Some(domain))
    }

    pub fn domain_property_is_default(&self, name: &str, prop: &str) -> QubesResult<bool> {
        let domain = self.domain(name)?;
        domain_property_def(domain.class, prop)
            .ok_or_else(|| QubesError::not_found("property", prop))?;
        Ok(!domain.properties.is_set(prop))
    }

    pub fn domain_bool(&self, name: &str, prop: &str) -> QubesResult<bool> {
        self.domain_property(name, prop)?
            .as_bool()
            .ok_or_else(|| QubesError::internal(format!("{} is not a bool", prop)))
    }

    pub fn domain_int(&self, name: &str, prop: &str) -> QubesResult<i64> {
        self.domain_property(name, prop)?
            .as_int()
            .ok_or_else(|| QubesError::internal(format!("{} is not an int", prop)))
    }

    pub fn domain_str(&self, name: &str, prop: &str) -> QubesResult<String> {
        Ok(self.domain_property(name, prop)?.to_wire())
    }

    /// Resolved netvm reference of a domain, if any.
    pub fn domain_netvm(&self, name: &str) -> QubesResult<Option<String>> {
        Ok(match self.domain_property(name, "netvm") {
            Ok(PropertyValue::VmRef(r)) => r,
            Ok(_) => None,
            Err(QubesError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        })
    }

    /// The chain `name → netvm → netvm …`, excluding `name` itself.
    pub fn netvm_chain(&self, name: &str) -> QubesResult<Vec<String>> {
        let mut chain = Vec::new();
        let mut cursor = name.to_string();
        loop {
            match self.domain_netvm(&cursor)? {
                Some(next) => {
                    if next == name || chain.contains(&next) {
                        return Err(QubesError::internal(format!(
                            "netvm cycle through {}",
                            next
                        )));
                    }
                    chain.push(next.clone());
                    cursor = next;
                }
                None => return Ok(chain),
            }
        }
    }

    fn check_vm_ref(
        &self,
        holder: Option<&Domain>,
        prop: &str,
        target: &str,
    ) -> QubesResult<()> {
        let target_domain = self.domain(target)?;
        if let Some(holder) = holder {
            if holder.name == target {
                return Err(QubesError::invalid_value(format!(
                    "{} cannot reference the domain itself",
                    prop
                )));
            }
        }
        match prop {
            "template" => {
                let holder = holder.ok_or_else(|| {
                    QubesError::invalid_value("template is not a global property")
                })?;
                if !target_domain.class.can_template_for(holder.class) {
                    return Err(QubesError::invalid_value(format!(
                        "{} ({}) cannot be a template for a {}",
                        target,
                        target_domain.class,
                        holder.class
                    )));
                }
                if holder.class == VmClass::DispVM
                    && !self.domain_bool(target, "template_for_dispvms").unwrap_or(false)
                {
                    return Err(QubesError::invalid_value(format!(
                        "{} does not allow disposables",
                        target
                    )));
                }
            }
            "netvm" | "default_netvm" => {
                if !self.domain_bool(target, "provides_network").unwrap_or(false) {
                    return Err(QubesError::invalid_value(format!(
                        "{} does not provide network",
                        target
                    )));
                }
                if let Some(holder) = holder {
                    // walking from the candidate must never reach the holder
                    let mut chain = self.netvm_chain(target)?;
                    chain.insert(0, target.to_string());
                    if chain.contains(&holder.name) {
                        return Err(QubesError::invalid_value(format!(
                            "setting netvm to {} would create a cycle",
                            target
                        )));
                    }
                }
            }
            "default_dispvm" => {
                if !self
                    .domain_bool(target, "template_for_dispvms")
                    .unwrap_or(false)
                {
                    return Err(QubesError::invalid_value(format!(
                        "{} does not allow disposables",
                        target
                    )));
                }
            }
            "default_template" => {
                if target_domain.class != VmClass::TemplateVM {
                    return Err(QubesError::invalid_value(format!(
                        "{} is not a template",
                        target
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_assignment(
        &self,
        holder: Option<&Domain>,
        def: &PropertyDef,
        value: &PropertyValue,
    ) -> QubesResult<()> {
        match value {
            PropertyValue::LabelRef(name) => {
                self.label(name)?;
            }
            PropertyValue::VmRef(Some(target)) => {
                self.check_vm_ref(holder, def.name, target)?;
            }
            PropertyValue::Int(i) => {
                if matches!(def.name, "memory" | "maxmem" | "vcpus") && *i < 0 {
                    return Err(QubesError::invalid_value(format!(
                        "{} must not be negative",
                        def.name
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn domain_property_set(
        &mut self,
        name: &str,
        prop: &str,
        raw: &str,
    ) -> QubesResult<EmittedEvents> {
        let domain = self.domain(name)?;
        let def = domain_property_def(domain.class, prop)
            .ok_or_else(|| QubesError::not_found("property", prop))?;
        if def.readonly {
            return Err(QubesError::not_allowed(format!("{} is read-only", prop)));
        }
        if def.write_once && domain.properties.is_set(prop) {
            return Err(QubesError::not_allowed(format!(
                "{} is write-once and already set",
                prop
            )));
        }
        let value = def.kind.parse(raw)?;
        self.validate_assignment(Some(domain), def, &value)?;

        let old = domain.properties.get(prop).cloned();
        let mut pre = Event::new(format!("property-pre-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value.to_wire());
        if let Some(old) = &old {
            pre = pre.arg("oldvalue", old.to_wire());
        }
        domain.bus.fire_pre(&pre)?;

        let domain = self.domain_mut(name)?;
        domain.properties.set(prop, value.clone());
        let mut event = Event::new(format!("property-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value.to_wire());
        if let Some(old) = &old {
            event = event.arg("oldvalue", old.to_wire());
        }
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn domain_property_reset(&mut self, name: &str, prop: &str) -> QubesResult<EmittedEvents> {
        let domain = self.domain(name)?;
        let def = domain_property_def(domain.class, prop)
            .ok_or_else(|| QubesError::not_found("property", prop))?;
        if def.write_once && domain.properties.is_set(prop) {
            return Err(QubesError::not_allowed(format!(
                "{} is write-once and already set",
                prop
            )));
        }
        let pre = Event::new(format!("property-pre-reset:{}", prop)).arg("name", prop);
        domain.bus.fire_pre(&pre)?;

        let domain = self.domain_mut(name)?;
        let old = domain.properties.unset(prop);
        let mut event = Event::new(format!("property-reset:{}", prop)).arg("name", prop);
        if let Some(old) = &old {
            event = event.arg("oldvalue", old.to_wire());
        }
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn global_property_set(&mut self, prop: &str, raw: &str) -> QubesResult<EmittedEvents> {
        let def =
            global_property_def(prop).ok_or_else(|| QubesError::not_found("property", prop))?;
        let value = def.kind.parse(raw)?;
        self.validate_assignment(None, def, &value)?;

        let old = self.global.get(prop).cloned();
        let mut pre = Event::new(format!("property-pre-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value.to_wire());
        if let Some(old) = &old {
            pre = pre.arg("oldvalue", old.to_wire());
        }
        self.bus.fire_pre(&pre)?;

        self.global.set(prop, value.clone());
        let mut event = Event::new(format!("property-set:{}", prop))
            .arg("name", prop)
            .arg("newvalue", value.to_wire());
        if let Some(old) = &old {
            event = event.arg("oldvalue", old.to_wire());
        }
        let _ = self.bus.fire(&event);
        Ok(vec![(ADMIN_VM_NAME.to_string(), event)])
    }

    pub fn global_property_reset(&mut self, prop: &str) -> QubesResult<EmittedEvents> {
        global_property_def(prop).ok_or_else(|| QubesError::not_found("property", prop))?;
        let pre = Event::new(format!("property-pre-reset:{}", prop)).arg("name", prop);
        self.bus.fire_pre(&pre)?;

        let old = self.global.unset(prop);
        let mut event = Event::new(format!("property-reset:{}", prop)).arg("name", prop);
        if let Some(old) = &old {
            event = event.arg("oldvalue", old.to_wire());
        }
        let _ = self.bus.fire(&event);
        Ok(vec![(ADMIN_VM_NAME.to_string(), event)])
    }

    /// `(def, is_default, value)` for every property of the domain's class.
    pub fn domain_property_list(
        &self,
        name: &str,
    ) -> QubesResult<Vec<(&'static PropertyDef, bool, Option<PropertyValue>)>> {
        let domain = self.domain(name)?;
        let mut out = Vec::new();
        for def in domain_property_defs(domain.class) {
            let is_default = !domain.properties.is_set(def.name);
            let value = self.domain_property(name, def.name).ok();
            out.push((def, is_default, value));
        }
        Ok(out)
    }

    // ---- features / tags / firewall / devices ----

    pub fn feature_set(
        &mut self,
        name: &str,
        feature: &str,
        value: &str,
    ) -> QubesResult<EmittedEvents> {
        let domain = self.domain(name)?;
        let pre = Event::new(format!("domain-feature-pre-set:{}", feature))
            .arg("feature", feature)
            .arg("value", value);
        domain.bus.fire_pre(&pre)?;

        let domain = self.domain_mut(name)?;
        let old = domain.features.set(feature, value)?;
        let mut event = Event::new(format!("domain-feature-set:{}", feature))
            .arg("feature", feature)
            .arg("value", value);
        if let Some(old) = &old {
            event = event.arg("oldvalue", old);
        }
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn feature_remove(&mut self, name: &str, feature: &str) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        if domain.features.remove(feature).is_none() {
            return Err(QubesError::not_found("feature", feature));
        }
        let event = Event::new(format!("domain-feature-delete:{}", feature)).arg("feature", feature);
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    /// Feature lookup falling back to the domain's template.
    pub fn feature_check_with_template(
        &self,
        name: &str,
        feature: &str,
    ) -> QubesResult<Option<String>> {
        let domain = self.domain(name)?;
        if let Some(v) = domain.features.get(feature) {
            return Ok(Some(v.to_string()));
        }
        if let Some(template) = self
            .domain_property(name, "template")
            .ok()
            .and_then(|v| v.as_vm_ref().flatten().map(str::to_string))
        {
            let template = self.domain(&template)?;
            return Ok(template.features.get(feature).map(str::to_string));
        }
        Ok(None)
    }

    pub fn tag_add(&mut self, name: &str, tag: &str) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        if !domain.tags.insert(tag)? {
            return Ok(Vec::new());
        }
        let event = Event::new(format!("domain-tag-add:{}", tag)).arg("tag", tag);
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn tag_remove(&mut self, name: &str, tag: &str) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        if !domain.tags.remove(tag) {
            return Err(QubesError::not_found("tag", tag));
        }
        let event = Event::new(format!("domain-tag-delete:{}", tag)).arg("tag", tag);
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn firewall_set(
        &mut self,
        name: &str,
        rules: Vec<Rule>,
        policy: Option<crate::Action>,
    ) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        domain.firewall.rules = rules;
        if let Some(policy) = policy {
            domain.firewall.policy = policy;
        }
        let event = Event::new("firewall-changed");
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    /// Grow a volume's declared size. Shrinking is refused; the storage
    /// layer grows the backing file separately.
    pub fn volume_set_size(
        &mut self,
        name: &str,
        volume: &str,
        size: u64,
    ) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        let config = domain
            .volumes
            .get_mut(volume)
            .ok_or_else(|| QubesError::not_found("volume", volume))?;
        if size < config.size {
            return Err(QubesError::invalid_value(format!(
                "shrinking volume {} is not supported",
                volume
            )));
        }
        config.size = size;
        let event = Event::new(format!("domain-volume-resize:{}", volume))
            .arg("volume", volume)
            .arg("size", size.to_string());
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn device_assign(
        &mut self,
        name: &str,
        assignment: DeviceAssignment,
    ) -> QubesResult<EmittedEvents> {
        self.domain(&assignment.device.port.backend)?;
        let domain = self.domain_mut(name)?;
        if domain
            .devices
            .iter()
            .any(|a| a.device == assignment.device)
        {
            return Err(QubesError::in_use(format!(
                "device {} already assigned to {}",
                assignment.device, name
            )));
        }
        let event = Event::new(format!(
            "device-assign:{}",
            assignment.device.port.devclass
        ))
        .arg("device", assignment.device.to_string())
        .arg("mode", assignment.mode.as_str());
        domain.devices.push(assignment);
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    pub fn device_unassign(
        &mut self,
        name: &str,
        device: &crate::VirtualDevice,
    ) -> QubesResult<EmittedEvents> {
        let domain = self.domain_mut(name)?;
        let before = domain.devices.len();
        domain.devices.retain(|a| &a.device != device);
        if domain.devices.len() == before {
            return Err(QubesError::not_found("assignment", device.to_string()));
        }
        let event = Event::new(format!("device-unassign:{}", device.port.devclass))
            .arg("device", device.to_string());
        let _ = domain.bus.fire(&event);
        Ok(vec![(name.to_string(), event)])
    }

    // ---- load-time application, no events, staged validation ----

    pub(crate) fn load_insert_stub(&mut self, domain: Domain) -> QubesResult<()> {
        if domain.class != VmClass::AdminVM {
            validate_name(&domain.name)?;
        }
        if self.domains.contains_key(&domain.qid) && domain.class != VmClass::AdminVM {
            return Err(QubesError::invalid_value(format!(
                "duplicate qid {} in store",
                domain.qid
            )));
        }
        if domain.class == VmClass::AdminVM {
            // the constructed dom0 stub is replaced by the persisted one
            self.domains.remove(&0);
        } else if self.contains(&domain.name) {
            return Err(QubesError::invalid_value(format!(
                "duplicate domain name {} in store",
                domain.name
            )));
        }
        self.domains.insert(domain.qid, domain);
        Ok(())
    }

    pub(crate) fn load_apply_domain_property(
        &mut self,
        name: &str,
        prop: &str,
        value: PropertyValue,
        stage: u8,
    ) -> QubesResult<()> {
        let domain = self.domain(name)?;
        let def = match domain_property_def(domain.class, prop) {
            Some(def) => def,
            // tolerate properties from newer versions
            None => return Ok(()),
        };
        if def.stage != stage {
            return Ok(());
        }
        if stage >= 4 {
            self.validate_assignment(Some(domain), def, &value)?;
        }
        let domain = self.domain_mut(name)?;
        domain.properties.set(prop, value);
        Ok(())
    }

    pub(crate) fn load_apply_global_property(
        &mut self,
        prop: &str,
        value: PropertyValue,
        stage: u8,
    ) -> QubesResult<()> {
        let def = match global_property_def(prop) {
            Some(def) => def,
            None => return Ok(()),
        };
        if def.stage != stage {
            return Ok(());
        }
        if stage >= 4 {
            self.validate_assignment(None, def, &value)?;
        }
        self.global.set(prop, value);
        Ok(())
    }

    pub fn new_uuid(&self) -> Uuid {
        loop {
            let uuid = Uuid::new_v4();
            if !self.domains.values().any(|d| d.uuid == uuid) {
                return uuid;
            }
        }
    }
}

impl Default for QubesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AssignmentMode, DeviceClass, VirtualDevice};

    fn store_with(domains: &[(&str, VmClass)]) -> QubesStore {
        let mut store = QubesStore::new();
        for (name, class) in domains {
            let qid = store.next_qid().unwrap();
            let mut d = Domain::new(qid, name, *class).unwrap();
            d.properties
                .set("label", PropertyValue::LabelRef("red".to_string()));
            store.add_domain(d).unwrap();
        }
        store
    }

    #[test]
    fn fresh_store_has_dom0() {
        let store = QubesStore::new();
        let dom0 = store.domain("dom0").unwrap();
        assert_eq!(dom0.qid, 0);
        assert_eq!(dom0.class, VmClass::AdminVM);
        assert_eq!(store.labels().count(), 8);
    }

    #[test]
    fn qid_allocation_is_dense() {
        let mut store = store_with(&[("a", VmClass::AppVM), ("b", VmClass::AppVM)]);
        assert_eq!(store.domain("a").unwrap().qid, 1);
        assert_eq!(store.domain("b").unwrap().qid, 2);
        store.remove_domain("a").unwrap();
        assert_eq!(store.next_qid().unwrap(), 1);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut store = store_with(&[("work", VmClass::AppVM)]);
        let mut dup = Domain::new(9, "work", VmClass::AppVM).unwrap();
        dup.properties
            .set("label", PropertyValue::LabelRef("red".to_string()));
        assert!(matches!(
            store.add_domain(dup),
            Err(QubesError::InUse { .. })
        ));
    }

    #[test]
    fn dom0_cannot_be_removed() {
        let mut store = QubesStore::new();
        assert!(matches!(
            store.remove_domain("dom0"),
            Err(QubesError::NotAllowed { .. })
        ));
    }

    #[test]
    fn template_reference_blocks_removal() {
        let mut store = store_with(&[("debian-12", VmClass::TemplateVM), ("work", VmClass::AppVM)]);
        store
            .domain_property_set("work", "template", "debian-12")
            .unwrap();
        let err = store.remove_domain("debian-12").unwrap_err();
        match err {
            QubesError::InUse { message } => assert!(message.contains("work")),
            other => panic!("unexpected error: {:?}", other),
        }
        store.remove_domain("work").unwrap();
        store.remove_domain("debian-12").unwrap();
    }

    #[test]
    fn netvm_requires_provider() {
        let mut store = store_with(&[("sys-net", VmClass::AppVM), ("work", VmClass::AppVM)]);
        assert!(store.domain_property_set("work", "netvm", "sys-net").is_err());
        store
            .domain_property_set("sys-net", "provides_network", "True")
            .unwrap();
        store.domain_property_set("work", "netvm", "sys-net").unwrap();
        assert_eq!(store.netvm_chain("work").unwrap(), vec!["sys-net"]);
    }

    #[test]
    fn netvm_cycle_rejected() {
        let mut store = store_with(&[("a", VmClass::AppVM), ("b", VmClass::AppVM)]);
        for name in ["a", "b"] {
            store
                .domain_property_set(name, "provides_network", "True")
                .unwrap();
        }
        store.domain_property_set("a", "netvm", "b").unwrap();
        let err = store.domain_property_set("b", "netvm", "a").unwrap_err();
        assert!(matches!(err, QubesError::InvalidValue { .. }));
        // self-reference is a cycle too
        assert!(store.domain_property_set("a", "netvm", "a").is_err());
    }

    #[test]
    fn default_netvm_inherited() {
        let mut store = store_with(&[("sys-net", VmClass::AppVM), ("work", VmClass::AppVM)]);
        store
            .domain_property_set("sys-net", "provides_network", "True")
            .unwrap();
        store.global_property_set("default_netvm", "sys-net").unwrap();

        assert!(store.domain_property_is_default("work", "netvm").unwrap());
        assert_eq!(
            store.domain_property("work", "netvm").unwrap(),
            PropertyValue::VmRef(Some("sys-net".to_string()))
        );

        store.domain_property_set("work", "netvm", "none").unwrap();
        assert!(!store.domain_property_is_default("work", "netvm").unwrap());
        assert_eq!(
            store.domain_property("work", "netvm").unwrap(),
            PropertyValue::VmRef(None)
        );

        store.domain_property_reset("work", "netvm").unwrap();
        assert!(store.domain_property_is_default("work", "netvm").unwrap());
    }

    #[test]
    fn set_then_get_returns_coerced_value() {
        let mut store = store_with(&[("work", VmClass::AppVM)]);
        store.domain_property_set("work", "memory", "800").unwrap();
        assert_eq!(store.domain_int("work", "memory").unwrap(), 800);
        assert!(store.domain_property_set("work", "memory", "lots").is_err());
        assert!(store.domain_property_set("work", "memory", "-5").is_err());
    }

    #[test]
    fn computed_ip_and_gateway() {
        let mut store = store_with(&[("sys-net", VmClass::AppVM), ("work", VmClass::AppVM)]);
        store
            .domain_property_set("sys-net", "provides_network", "True")
            .unwrap();
        store.domain_property_set("work", "netvm", "sys-net").unwrap();

        let qid = store.domain("sys-net").unwrap().qid;
        assert_eq!(
            store.domain_str("work", "gateway").unwrap(),
            format!("10.137.0.{}", qid)
        );
        assert!(store.domain_property_set("work", "gateway", "1.2.3.4").is_err());
    }

    #[test]
    fn property_events_fire_in_order() {
        use std::sync::{Arc, Mutex};
        let mut store = store_with(&[("work", VmClass::AppVM)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let domain = store.domain("work").unwrap();
            let s = seen.clone();
            domain.bus.on("property-set:*", move |e| {
                s.lock().unwrap().push(e.name.clone());
                Ok(vec![])
            });
        }
        store.domain_property_set("work", "memory", "700").unwrap();
        store.domain_property_set("work", "vcpus", "4").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["property-set:memory", "property-set:vcpus"]
        );
    }

    #[test]
    fn pre_set_veto_blocks_assignment() {
        let mut store = store_with(&[("work", VmClass::AppVM)]);
        {
            let domain = store.domain("work").unwrap();
            domain.bus.on("property-pre-set:memory", |_| {
                Err(QubesError::not_allowed("memory is pinned"))
            });
        }
        assert!(store.domain_property_set("work", "memory", "700").is_err());
        assert!(store.domain_property_is_default("work", "memory").unwrap());
    }

    #[test]
    fn write_once_template() {
        let mut store = store_with(&[
            ("debian-dvm", VmClass::AppVM),
            // the disposable is created by hand here
        ]);
        store
            .domain_property_set("debian-dvm", "template_for_dispvms", "True")
            .unwrap();
        let qid = store.next_qid().unwrap();
        let mut disp = Domain::new(qid, "disp1", VmClass::DispVM).unwrap();
        disp.properties
            .set("label", PropertyValue::LabelRef("red".to_string()));
        store.add_domain(disp).unwrap();
        store
            .domain_property_set("disp1", "template", "debian-dvm")
            .unwrap();
        let err = store
            .domain_property_set("disp1", "template", "debian-dvm")
            .unwrap_err();
        assert!(matches!(err, QubesError::NotAllowed { .. }));
    }

    #[test]
    fn feature_with_template_fallback() {
        let mut store = store_with(&[("debian-12", VmClass::TemplateVM), ("work", VmClass::AppVM)]);
        store
            .domain_property_set("work", "template", "debian-12")
            .unwrap();
        store
            .feature_set("debian-12", "supported-service.cups", "1")
            .unwrap();
        assert_eq!(
            store
                .feature_check_with_template("work", "supported-service.cups")
                .unwrap(),
            Some("1".to_string())
        );
        assert_eq!(
            store.feature_check_with_template("work", "absent").unwrap(),
            None
        );
    }

    #[test]
    fn device_assignment_lifecycle() {
        let mut store = store_with(&[("sys-usb", VmClass::AppVM), ("work", VmClass::AppVM)]);
        let dev = VirtualDevice::parse("sys-usb+1-1.2:046d_c52b", DeviceClass::Usb).unwrap();
        let assignment = DeviceAssignment::new(dev.clone(), AssignmentMode::Auto).unwrap();
        store.device_assign("work", assignment.clone()).unwrap();
        assert!(matches!(
            store.device_assign("work", assignment),
            Err(QubesError::InUse { .. })
        ));
        // backend is now referenced
        assert!(store.remove_domain("sys-usb").is_err());
        store.device_unassign("work", &dev).unwrap();
        store.remove_domain("sys-usb").unwrap();
    }

    #[test]
    fn pool_removal_blocked_by_volumes() {
        use crate::VolumeConfig;
        let mut store = store_with(&[("work", VmClass::AppVM)]);
        store
            .add_pool(PoolConfig {
                name: "ssd".to_string(),
                driver: "file".to_string(),
                options: BTreeMap::new(),
            })
            .unwrap();
        let domain = store.domain_mut("work").unwrap();
        domain.volumes.insert(
            "private".to_string(),
            VolumeConfig {
                name: "private".to_string(),
                pool: "ssd".to_string(),
                vid: "appvms/work/private".to_string(),
                size: 1024,
                rw: true,
                snap_on_start: false,
                save_on_stop: true,
                ephemeral: false,
                revisions_to_keep: 2,
                source: None,
            },
        );
        assert!(store.remove_pool("ssd").is_err());
    }
}
