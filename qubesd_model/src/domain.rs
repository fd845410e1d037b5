//! The domain object as persisted in the store.
//!
//! Class-specific behaviour is expressed through the [`VmClass`] variant
//! and its capability queries rather than subclassing; the class name is
//! persisted and selects property applicability on load.

use crate::{DeviceAssignment, Features, Firewall, PropertyMap, Tags, VolumeConfig};
use qubesd_common::{EventBus, QubesError, QubesResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Highest qid the allocator will hand out.
pub const MAX_QID: u16 = 32767;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmClass {
    AdminVM,
    AppVM,
    TemplateVM,
    DispVM,
    StandaloneVM,
}

impl VmClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdminVM => "AdminVM",
            Self::AppVM => "AppVM",
            Self::TemplateVM => "TemplateVM",
            Self::DispVM => "DispVM",
            Self::StandaloneVM => "StandaloneVM",
        }
    }

    pub fn parse(raw: &str) -> QubesResult<Self> {
        match raw {
            "AdminVM" => Ok(Self::AdminVM),
            "AppVM" => Ok(Self::AppVM),
            "TemplateVM" => Ok(Self::TemplateVM),
            "DispVM" => Ok(Self::DispVM),
            "StandaloneVM" => Ok(Self::StandaloneVM),
            _ => Err(QubesError::invalid_value(format!(
                "unknown domain class: {:?}",
                raw
            ))),
        }
    }

    /// Whether instances of this class boot from another domain's root.
    pub fn has_template(&self) -> bool {
        matches!(self, Self::AppVM | Self::DispVM)
    }

    /// Whether this class may serve as a template for the given class.
    pub fn can_template_for(&self, child: VmClass) -> bool {
        match child {
            VmClass::AppVM => matches!(self, Self::TemplateVM),
            // disposables derive from approved template-based domains
            VmClass::DispVM => matches!(self, Self::AppVM | Self::TemplateVM | Self::StandaloneVM),
            _ => false,
        }
    }

    pub fn is_startable(&self) -> bool {
        !matches!(self, Self::AdminVM)
    }
}

impl std::fmt::Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `[A-Za-z][A-Za-z0-9_.-]{0,30}`, minus a few reserved words.
pub fn validate_name(name: &str) -> QubesResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {
            name.len() <= 31
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        }
        _ => false,
    };
    if !valid {
        return Err(QubesError::invalid_value(format!(
            "invalid domain name: {:?}",
            name
        )));
    }
    if matches!(name, "none" | "default" | "new" | "dom0") {
        return Err(QubesError::invalid_value(format!(
            "domain name {:?} is reserved",
            name
        )));
    }
    Ok(())
}

pub struct Domain {
    pub qid: u16,
    pub uuid: Uuid,
    pub name: String,
    pub class: VmClass,
    pub properties: PropertyMap,
    pub features: Features,
    pub tags: Tags,
    pub firewall: Firewall,
    pub volumes: BTreeMap<String, VolumeConfig>,
    pub devices: Vec<DeviceAssignment>,
    /// Per-instance event handlers.
    pub bus: Arc<EventBus>,
}

impl Domain {
    pub fn new(qid: u16, name: &str, class: VmClass) -> QubesResult<Self> {
        if class == VmClass::AdminVM {
            if qid != 0 {
                return Err(QubesError::invalid_value("AdminVM must have qid 0"));
            }
        } else {
            validate_name(name)?;
            if qid == 0 || qid > MAX_QID {
                return Err(QubesError::invalid_value(format!(
                    "qid {} out of range",
                    qid
                )));
            }
        }
        Ok(Self {
            qid,
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            class,
            properties: PropertyMap::new(),
            features: Features::new(),
            tags: Tags::new(),
            firewall: Firewall::default(),
            volumes: BTreeMap::new(),
            devices: Vec::new(),
            bus: Arc::new(EventBus::new()),
        })
    }

    /// Deep copy of the persisted state under a new identity. Used by
    /// clone; event handlers do not carry over.
    pub fn duplicate(&self, qid: u16, name: &str) -> QubesResult<Self> {
        let mut copy = Self::new(qid, name, self.class)?;
        copy.properties = self.properties.clone();
        copy.features = self.features.clone();
        copy.tags = self.tags.clone();
        copy.firewall = self.firewall.clone();
        copy.devices = self.devices.clone();
        Ok(copy)
    }

    pub fn assignments_for(
        &self,
        devclass: crate::DeviceClass,
    ) -> impl Iterator<Item = &DeviceAssignment> {
        self.devices
            .iter()
            .filter(move |a| a.device.port.devclass == devclass)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("qid", &self.qid)
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert!(validate_name("work").is_ok());
        assert!(validate_name("sys-net").is_ok());
        assert!(validate_name("a.b_c-d1").is_ok());
        assert!(validate_name("1work").is_err());
        assert!(validate_name("-work").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name("none").is_err());
        assert!(validate_name("default").is_err());
        assert!(validate_name(&"x".repeat(32)).is_err());
        assert!(validate_name(&"x".repeat(31)).is_ok());
    }

    #[test]
    fn adminvm_qid_zero() {
        assert!(Domain::new(0, "dom0", VmClass::AdminVM).is_ok());
        assert!(Domain::new(1, "dom0", VmClass::AdminVM).is_err());
        assert!(Domain::new(0, "work", VmClass::AppVM).is_err());
    }

    #[test]
    fn template_compatibility() {
        assert!(VmClass::TemplateVM.can_template_for(VmClass::AppVM));
        assert!(!VmClass::AppVM.can_template_for(VmClass::AppVM));
        assert!(VmClass::AppVM.can_template_for(VmClass::DispVM));
        assert!(!VmClass::DispVM.can_template_for(VmClass::DispVM));
    }

    #[test]
    fn duplicate_copies_state() {
        let mut d = Domain::new(1, "work", VmClass::AppVM).unwrap();
        d.features.set("service.crond", "1").unwrap();
        d.tags.insert("prod").unwrap();
        let copy = d.duplicate(2, "work-clone").unwrap();
        assert_eq!(copy.qid, 2);
        assert_ne!(copy.uuid, d.uuid);
        assert_eq!(copy.features.get("service.crond"), Some("1"));
        assert!(copy.tags.contains("prod"));
        assert!(copy.volumes.is_empty());
    }
}
