//! Typed property framework.
//!
//! Every holder (the application and each domain) stores only the values
//! that were explicitly set; everything else resolves through a static
//! property table carrying the type, default, write-once flag, load stage
//! and documentation of each property. The table replaces per-class
//! attribute descriptors with one generic getter/setter, which keeps
//! `admin.vm.property.List`/`Help` possible without reflection.

use crate::{Domain, QubesStore, VmClass};
use qubesd_common::{QubesError, QubesResult};
use std::collections::BTreeMap;
use std::fmt;

/// A property value after coercion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Reference to another domain by name; `None` is the explicit "no
    /// domain" value.
    VmRef(Option<String>),
    /// Reference to a label by name.
    LabelRef(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::LabelRef(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_vm_ref(&self) -> Option<Option<&str>> {
        match self {
            Self::VmRef(r) => Some(r.as_deref()),
            _ => None,
        }
    }

    /// Wire representation used by the admin API and the XML store.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Bool(true) => "True".to_string(),
            Self::Bool(false) => "False".to_string(),
            Self::VmRef(Some(name)) => name.clone(),
            Self::VmRef(None) => String::new(),
            Self::LabelRef(name) => name.clone(),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Semantic type of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    Str,
    Int,
    Bool,
    VmRef,
    LabelRef,
    Enum(&'static [&'static str]),
}

impl PropertyKind {
    /// Type name reported by `admin.vm.property.Get`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Str | Self::Enum(_) => "str",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::VmRef => "vm",
            Self::LabelRef => "label",
        }
    }

    /// Coerce a raw string into a typed value. Referential validity (the
    /// named domain or label actually existing) is checked by the store.
    pub fn parse(&self, raw: &str) -> QubesResult<PropertyValue> {
        match self {
            Self::Str => Ok(PropertyValue::Str(raw.to_string())),
            Self::Int => raw
                .parse::<i64>()
                .map(PropertyValue::Int)
                .map_err(|_| QubesError::invalid_value(format!("not an integer: {:?}", raw))),
            Self::Bool => match raw {
                "True" | "true" | "1" => Ok(PropertyValue::Bool(true)),
                "False" | "false" | "0" => Ok(PropertyValue::Bool(false)),
                _ => Err(QubesError::invalid_value(format!(
                    "not a boolean: {:?}",
                    raw
                ))),
            },
            Self::VmRef => {
                if raw.is_empty() || raw == "none" {
                    Ok(PropertyValue::VmRef(None))
                } else {
                    Ok(PropertyValue::VmRef(Some(raw.to_string())))
                }
            }
            Self::LabelRef => {
                if raw.is_empty() {
                    Err(QubesError::invalid_value("label name must not be empty"))
                } else {
                    Ok(PropertyValue::LabelRef(raw.to_string()))
                }
            }
            Self::Enum(variants) => {
                if variants.contains(&raw) {
                    Ok(PropertyValue::Str(raw.to_string()))
                } else {
                    Err(QubesError::invalid_value(format!(
                        "{:?} is not one of {}",
                        raw,
                        variants.join(", ")
                    )))
                }
            }
        }
    }
}

/// Context handed to computed defaults.
pub struct DefaultCtx<'a> {
    pub store: &'a QubesStore,
    pub domain: Option<&'a Domain>,
}

pub type ComputedDefault = fn(&DefaultCtx) -> Option<PropertyValue>;

/// Default of a property when it was never set.
#[derive(Clone, Copy)]
pub enum PropertyDefault {
    /// No default; reading an unset vm reference yields the explicit
    /// "none", any other kind fails with NotFound.
    None,
    Str(&'static str),
    Int(i64),
    Bool(bool),
    /// Inherit the value of a global property of the application.
    Global(&'static str),
    Computed(ComputedDefault),
}

#[derive(Clone, Copy)]
pub struct PropertyDef {
    pub name: &'static str,
    pub kind: PropertyKind,
    pub default: PropertyDefault,
    pub write_once: bool,
    /// Computed-only; assignment is rejected.
    pub readonly: bool,
    /// Stage of the store load protocol at which this property is applied.
    pub stage: u8,
    /// Domain classes this property exists on; empty means all classes.
    /// Unused for global properties.
    pub classes: &'static [VmClass],
    pub doc: &'static str,
}

impl PropertyDef {
    pub fn applies_to(&self, class: VmClass) -> bool {
        self.classes.is_empty() || self.classes.contains(&class)
    }
}

impl fmt::Debug for PropertyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDef")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

fn default_ip(ctx: &DefaultCtx) -> Option<PropertyValue> {
    let domain = ctx.domain?;
    Some(PropertyValue::Str(format!("10.137.0.{}", domain.qid)))
}

fn default_gateway(ctx: &DefaultCtx) -> Option<PropertyValue> {
    let domain = ctx.domain?;
    let netvm = ctx
        .store
        .domain_property(&domain.name, "netvm")
        .ok()?
        .as_vm_ref()??
        .to_string();
    let ip = ctx.store.domain_property(&netvm, "ip").ok()?;
    Some(PropertyValue::Str(ip.to_wire()))
}

const NETWORKED: &[VmClass] = &[
    VmClass::AppVM,
    VmClass::TemplateVM,
    VmClass::DispVM,
    VmClass::StandaloneVM,
];
const TEMPLATE_BASED: &[VmClass] = &[VmClass::AppVM];
const DISP_ONLY: &[VmClass] = &[VmClass::DispVM];
const DISP_CAPABLE: &[VmClass] = &[VmClass::AppVM, VmClass::TemplateVM, VmClass::StandaloneVM];

/// Properties of the application itself.
pub const GLOBAL_PROPERTIES: &[PropertyDef] = &[
    PropertyDef {
        name: "default_netvm",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 4,
        classes: &[],
        doc: "Domain used as the network provider for domains that do not \
              set their own netvm.",
    },
    PropertyDef {
        name: "default_template",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 4,
        classes: &[],
        doc: "Template used when a new domain is created without one.",
    },
    PropertyDef {
        name: "default_dispvm",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 4,
        classes: &[],
        doc: "Template for disposables started on behalf of domains that do \
              not set their own.",
    },
    PropertyDef {
        name: "default_kernel",
        kind: PropertyKind::Str,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Kernel version booted by domains that do not set their own.",
    },
    PropertyDef {
        name: "default_pool",
        kind: PropertyKind::Str,
        default: PropertyDefault::Str("default"),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Storage pool used for new volumes unless overridden per kind.",
    },
    PropertyDef {
        name: "default_pool_root",
        kind: PropertyKind::Str,
        default: PropertyDefault::Global("default_pool"),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Storage pool for new root volumes.",
    },
    PropertyDef {
        name: "default_pool_private",
        kind: PropertyKind::Str,
        default: PropertyDefault::Global("default_pool"),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Storage pool for new private volumes.",
    },
    PropertyDef {
        name: "default_pool_volatile",
        kind: PropertyKind::Str,
        default: PropertyDefault::Global("default_pool"),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Storage pool for new volatile volumes.",
    },
    PropertyDef {
        name: "default_pool_kernel",
        kind: PropertyKind::Str,
        default: PropertyDefault::Str("linux-kernel"),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Storage pool for kernel volumes.",
    },
    PropertyDef {
        name: "default_qrexec_timeout",
        kind: PropertyKind::Int,
        default: PropertyDefault::Int(60),
        write_once: false,
        readonly: false,
        stage: 1,
        classes: &[],
        doc: "Seconds to wait for the qrexec channel of a starting domain.",
    },
];

/// Properties a domain may carry, filtered per class.
pub const DOMAIN_PROPERTIES: &[PropertyDef] = &[
    PropertyDef {
        name: "label",
        kind: PropertyKind::LabelRef,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 2,
        classes: &[],
        doc: "Colour label of this domain.",
    },
    PropertyDef {
        name: "template",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::None,
        write_once: false,
        readonly: false,
        stage: 4,
        classes: TEMPLATE_BASED,
        doc: "Template this domain boots its root volume from.",
    },
    PropertyDef {
        name: "template",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::None,
        write_once: true,
        readonly: false,
        stage: 4,
        classes: DISP_ONLY,
        doc: "Disposable template this domain was derived from.",
    },
    PropertyDef {
        name: "netvm",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::Global("default_netvm"),
        write_once: false,
        readonly: false,
        stage: 4,
        classes: NETWORKED,
        doc: "Domain providing network access to this domain.",
    },
    PropertyDef {
        name: "default_dispvm",
        kind: PropertyKind::VmRef,
        default: PropertyDefault::Global("default_dispvm"),
        write_once: false,
        readonly: false,
        stage: 4,
        classes: NETWORKED,
        doc: "Template for disposables started on behalf of this domain.",
    },
    PropertyDef {
        name: "provides_network",
        kind: PropertyKind::Bool,
        default: PropertyDefault::Bool(false),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Whether this domain can act as a netvm for other domains.",
    },
    PropertyDef {
        name: "kernel",
        kind: PropertyKind::Str,
        default: PropertyDefault::Global("default_kernel"),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Kernel version this domain boots.",
    },
    PropertyDef {
        name: "kernelopts",
        kind: PropertyKind::Str,
        default: PropertyDefault::Str(""),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Extra kernel command line.",
    },
    PropertyDef {
        name: "memory",
        kind: PropertyKind::Int,
        default: PropertyDefault::Int(400),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Initial memory in MiB.",
    },
    PropertyDef {
        name: "maxmem",
        kind: PropertyKind::Int,
        default: PropertyDefault::Int(4000),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Upper memory balancing bound in MiB; 0 disables ballooning.",
    },
    PropertyDef {
        name: "vcpus",
        kind: PropertyKind::Int,
        default: PropertyDefault::Int(2),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Number of virtual CPUs.",
    },
    PropertyDef {
        name: "virt_mode",
        kind: PropertyKind::Enum(&["pv", "pvh", "hvm"]),
        default: PropertyDefault::Str("pvh"),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Virtualisation mode.",
    },
    PropertyDef {
        name: "include_in_backups",
        kind: PropertyKind::Bool,
        default: PropertyDefault::Bool(true),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: &[],
        doc: "Whether this domain is picked up by default backups.",
    },
    PropertyDef {
        name: "autostart",
        kind: PropertyKind::Bool,
        default: PropertyDefault::Bool(false),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Start this domain when the daemon starts.",
    },
    PropertyDef {
        name: "template_for_dispvms",
        kind: PropertyKind::Bool,
        default: PropertyDefault::Bool(false),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: DISP_CAPABLE,
        doc: "Allow disposables to be derived from this domain.",
    },
    PropertyDef {
        name: "qrexec_timeout",
        kind: PropertyKind::Int,
        default: PropertyDefault::Global("default_qrexec_timeout"),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Seconds to wait for the qrexec channel at start.",
    },
    PropertyDef {
        name: "shutdown_timeout",
        kind: PropertyKind::Int,
        default: PropertyDefault::Int(60),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "Seconds to wait for an orderly shutdown before killing.",
    },
    PropertyDef {
        name: "ip",
        kind: PropertyKind::Str,
        default: PropertyDefault::Computed(default_ip),
        write_once: false,
        readonly: false,
        stage: 3,
        classes: NETWORKED,
        doc: "IP address assigned to this domain.",
    },
    PropertyDef {
        name: "gateway",
        kind: PropertyKind::Str,
        default: PropertyDefault::Computed(default_gateway),
        write_once: false,
        readonly: true,
        stage: 3,
        classes: NETWORKED,
        doc: "Gateway address, taken from the netvm.",
    },
    PropertyDef {
        name: "netmask",
        kind: PropertyKind::Str,
        default: PropertyDefault::Str("255.255.255.255"),
        write_once: false,
        readonly: true,
        stage: 3,
        classes: NETWORKED,
        doc: "Netmask written to the guest data bus.",
    },
];

pub fn global_property_def(name: &str) -> Option<&'static PropertyDef> {
    GLOBAL_PROPERTIES.iter().find(|d| d.name == name)
}

pub fn domain_property_def(class: VmClass, name: &str) -> Option<&'static PropertyDef> {
    DOMAIN_PROPERTIES
        .iter()
        .find(|d| d.name == name && d.applies_to(class))
}

pub fn domain_property_defs(class: VmClass) -> impl Iterator<Item = &'static PropertyDef> {
    DOMAIN_PROPERTIES.iter().filter(move |d| d.applies_to(class))
}

/// Explicitly-set values of one holder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    values: BTreeMap<String, PropertyValue>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: PropertyValue) -> Option<PropertyValue> {
        self.values.insert(name.into(), value)
    }

    pub fn unset(&mut self, name: &str) -> Option<PropertyValue> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_int() {
        assert_eq!(
            PropertyKind::Int.parse("42").unwrap(),
            PropertyValue::Int(42)
        );
        assert!(PropertyKind::Int.parse("x").is_err());
    }

    #[test]
    fn parse_bool() {
        assert_eq!(
            PropertyKind::Bool.parse("True").unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            PropertyKind::Bool.parse("0").unwrap(),
            PropertyValue::Bool(false)
        );
        assert!(PropertyKind::Bool.parse("maybe").is_err());
    }

    #[test]
    fn parse_vm_ref_none() {
        assert_eq!(
            PropertyKind::VmRef.parse("").unwrap(),
            PropertyValue::VmRef(None)
        );
        assert_eq!(
            PropertyKind::VmRef.parse("none").unwrap(),
            PropertyValue::VmRef(None)
        );
        assert_eq!(
            PropertyKind::VmRef.parse("sys-net").unwrap(),
            PropertyValue::VmRef(Some("sys-net".to_string()))
        );
    }

    #[test]
    fn parse_enum() {
        let kind = PropertyKind::Enum(&["pv", "pvh", "hvm"]);
        assert!(kind.parse("pvh").is_ok());
        assert!(kind.parse("emulated").is_err());
    }

    #[test]
    fn wire_repr() {
        assert_eq!(PropertyValue::Bool(true).to_wire(), "True");
        assert_eq!(PropertyValue::VmRef(None).to_wire(), "");
        assert_eq!(PropertyValue::Int(-1).to_wire(), "-1");
    }

    #[test]
    fn class_filtering() {
        assert!(domain_property_def(VmClass::AppVM, "template").is_some());
        assert!(domain_property_def(VmClass::StandaloneVM, "template").is_none());
        assert!(domain_property_def(VmClass::AdminVM, "netvm").is_none());
        assert!(domain_property_def(VmClass::AdminVM, "label").is_some());

        let disp = domain_property_def(VmClass::DispVM, "template").unwrap();
        assert!(disp.write_once);
        let app = domain_property_def(VmClass::AppVM, "template").unwrap();
        assert!(!app.write_once);
    }

    #[test]
    fn property_map_set_and_unset() {
        let mut map = PropertyMap::new();
        assert!(!map.is_set("memory"));
        map.set("memory", PropertyValue::Int(800));
        assert_eq!(map.get("memory"), Some(&PropertyValue::Int(800)));
        assert_eq!(map.unset("memory"), Some(PropertyValue::Int(800)));
        assert!(!map.is_set("memory"));
    }
}
