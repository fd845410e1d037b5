//! XML (de)serialization of the store.
//!
//! One document holds everything. Loading happens in five stages so that
//! cross-references resolve against objects that already exist:
//!
//! 1. global properties that do not reference domains
//! 2. labels, pools and domain stubs (qid, class, uuid, name, label)
//! 3. per-domain intrinsic properties
//! 4. domain-to-domain references, with referential validation
//! 5. features, tags, firewall, volumes and device assignments

use crate::{
    Action, AssignmentMode, DeviceAssignment, Domain, Firewall, Label, PoolConfig, Port,
    PropertyValue, QubesStore, Rule, VirtualDevice, VmClass, VolumeConfig, DeviceClass,
    domain_property_def, global_property_def,
};
use qubesd_common::{QubesError, QubesResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const STORE_VERSION: &str = "4.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "qubes")]
struct XmlQubes {
    #[serde(rename = "@version")]
    version: String,
    #[serde(default)]
    properties: XmlProperties,
    #[serde(default)]
    labels: XmlLabels,
    #[serde(default)]
    pools: XmlPools,
    #[serde(default)]
    domains: XmlDomains,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlProperties {
    #[serde(rename = "property", default)]
    properties: Vec<XmlProperty>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlProperty {
    #[serde(rename = "@name")]
    name: String,
    /// `ref="none"` marks an unset domain reference.
    #[serde(rename = "@ref", skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlLabels {
    #[serde(rename = "label", default)]
    labels: Vec<XmlLabel>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlLabel {
    #[serde(rename = "@id")]
    id: u32,
    #[serde(rename = "@color")]
    color: String,
    #[serde(rename = "$text")]
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlPools {
    #[serde(rename = "pool", default)]
    pools: Vec<XmlPool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlPool {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@driver")]
    driver: String,
    #[serde(rename = "option", default)]
    options: Vec<XmlOption>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlOption {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@value")]
    value: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlDomains {
    #[serde(rename = "domain", default)]
    domains: Vec<XmlDomain>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlDomain {
    #[serde(rename = "@id")]
    id: u16,
    #[serde(rename = "@class")]
    class: String,
    #[serde(rename = "@uuid")]
    uuid: String,
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    properties: XmlProperties,
    #[serde(default)]
    features: XmlFeatures,
    #[serde(default)]
    tags: XmlTags,
    #[serde(default)]
    firewall: XmlFirewall,
    #[serde(default)]
    volumes: XmlVolumes,
    #[serde(rename = "devices", default)]
    devices: Vec<XmlDevices>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlFeatures {
    #[serde(rename = "feature", default)]
    features: Vec<XmlFeature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlFeature {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlTags {
    #[serde(rename = "tag", default)]
    tags: Vec<XmlTag>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlTag {
    #[serde(rename = "@name")]
    name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlFirewall {
    #[serde(rename = "@policy", skip_serializing_if = "Option::is_none")]
    policy: Option<String>,
    #[serde(rename = "rule", default)]
    rules: Vec<XmlRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlRule {
    #[serde(rename = "$text")]
    line: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct XmlVolumes {
    #[serde(rename = "volume", default)]
    volumes: Vec<XmlVolume>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlVolume {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@pool")]
    pool: String,
    #[serde(rename = "@vid")]
    vid: String,
    #[serde(rename = "@size")]
    size: u64,
    #[serde(rename = "@rw")]
    rw: String,
    #[serde(rename = "@snap_on_start")]
    snap_on_start: String,
    #[serde(rename = "@save_on_stop")]
    save_on_stop: String,
    #[serde(rename = "@ephemeral")]
    ephemeral: String,
    #[serde(rename = "@revisions_to_keep")]
    revisions_to_keep: usize,
    #[serde(rename = "@source", skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlDevices {
    #[serde(rename = "@class")]
    class: String,
    #[serde(rename = "device", default)]
    devices: Vec<XmlDevice>,
}

#[derive(Debug, Serialize, Deserialize)]
struct XmlDevice {
    #[serde(rename = "@backend-domain")]
    backend: String,
    #[serde(rename = "@id")]
    port_id: String,
    #[serde(rename = "@device-id", skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(rename = "@mode")]
    mode: String,
    #[serde(rename = "option", default)]
    options: Vec<XmlOption>,
}

fn xml_bool(v: bool) -> String {
    if v { "True".to_string() } else { "False".to_string() }
}

fn parse_bool(raw: &str, what: &str) -> QubesResult<bool> {
    match raw {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" => Ok(false),
        _ => Err(QubesError::invalid_value(format!(
            "invalid boolean for {}: {:?}",
            what, raw
        ))),
    }
}

fn property_to_xml(name: &str, value: &PropertyValue) -> XmlProperty {
    match value {
        PropertyValue::VmRef(None) => XmlProperty {
            name: name.to_string(),
            reference: Some("none".to_string()),
            value: None,
        },
        other => XmlProperty {
            name: name.to_string(),
            reference: None,
            value: Some(other.to_wire()),
        },
    }
}

// ---- store → document ----

pub fn store_to_xml(store: &QubesStore) -> QubesResult<String> {
    let doc = XmlQubes {
        version: STORE_VERSION.to_string(),
        properties: XmlProperties {
            properties: store
                .global
                .iter()
                .map(|(name, value)| property_to_xml(name, value))
                .collect(),
        },
        labels: XmlLabels {
            labels: store
                .labels
                .values()
                .map(|l| XmlLabel {
                    id: l.index,
                    color: l.color.clone(),
                    name: l.name.clone(),
                })
                .collect(),
        },
        pools: XmlPools {
            pools: store
                .pools
                .values()
                .map(|p| XmlPool {
                    name: p.name.clone(),
                    driver: p.driver.clone(),
                    options: p
                        .options
                        .iter()
                        .map(|(name, value)| XmlOption {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                })
                .collect(),
        },
        domains: XmlDomains {
            domains: store.domains.values().map(domain_to_xml).collect(),
        },
    };

    let body = quick_xml::se::to_string(&doc)
        .map_err(|e| QubesError::internal(format!("store serialization failed: {}", e)))?;
    Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\" ?>\n{}", body))
}

fn domain_to_xml(domain: &Domain) -> XmlDomain {
    let mut devices_by_class: Vec<XmlDevices> = Vec::new();
    for assignment in &domain.devices {
        let class = assignment.device.port.devclass.as_str().to_string();
        let device = XmlDevice {
            backend: assignment.device.port.backend.clone(),
            port_id: assignment.device.port.port_id.clone(),
            device_id: Some(assignment.device.device_id.clone()),
            mode: assignment.mode.as_str().to_string(),
            options: assignment
                .options
                .iter()
                .map(|(name, value)| XmlOption {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        };
        match devices_by_class.iter_mut().find(|d| d.class == class) {
            Some(group) => group.devices.push(device),
            None => devices_by_class.push(XmlDevices {
                class,
                devices: vec![device],
            }),
        }
    }

    XmlDomain {
        id: domain.qid,
        class: domain.class.as_str().to_string(),
        uuid: domain.uuid.to_string(),
        name: domain.name.clone(),
        properties: XmlProperties {
            properties: domain
                .properties
                .iter()
                .map(|(name, value)| property_to_xml(name, value))
                .collect(),
        },
        features: XmlFeatures {
            features: domain
                .features
                .iter()
                .map(|(name, value)| XmlFeature {
                    name: name.to_string(),
                    value: if value.is_empty() {
                        None
                    } else {
                        Some(value.to_string())
                    },
                })
                .collect(),
        },
        tags: XmlTags {
            tags: domain
                .tags
                .iter()
                .map(|t| XmlTag {
                    name: t.to_string(),
                })
                .collect(),
        },
        firewall: XmlFirewall {
            policy: Some(domain.firewall.policy.as_str().to_string()),
            rules: domain
                .firewall
                .rules
                .iter()
                .map(|r| XmlRule { line: r.to_line() })
                .collect(),
        },
        volumes: XmlVolumes {
            volumes: domain
                .volumes
                .values()
                .map(|v| XmlVolume {
                    name: v.name.clone(),
                    pool: v.pool.clone(),
                    vid: v.vid.clone(),
                    size: v.size,
                    rw: xml_bool(v.rw),
                    snap_on_start: xml_bool(v.snap_on_start),
                    save_on_stop: xml_bool(v.save_on_stop),
                    ephemeral: xml_bool(v.ephemeral),
                    revisions_to_keep: v.revisions_to_keep,
                    source: v.source.clone(),
                })
                .collect(),
        },
        devices: devices_by_class,
    }
}

// ---- document → store ----

fn parse_property(raw: &XmlProperty, def_kind: crate::PropertyKind) -> QubesResult<PropertyValue> {
    if raw.reference.as_deref() == Some("none") {
        return Ok(PropertyValue::VmRef(None));
    }
    def_kind.parse(raw.value.as_deref().unwrap_or(""))
}

pub fn store_from_xml(text: &str) -> QubesResult<QubesStore> {
    let doc: XmlQubes = quick_xml::de::from_str(text)
        .map_err(|e| QubesError::invalid_value(format!("malformed store document: {}", e)))?;

    let mut store = QubesStore::new();

    // stage 1: global properties without domain references
    load_global_properties(&mut store, &doc, 1)?;

    // stage 2: labels, pools, domain stubs with their label
    store.labels.clear();
    for label in &doc.labels.labels {
        store.add_label(Label::new(label.id, &label.color, &label.name)?)?;
    }
    for pool in &doc.pools.pools {
        store.add_pool(PoolConfig {
            name: pool.name.clone(),
            driver: pool.driver.clone(),
            options: pool
                .options
                .iter()
                .map(|o| (o.name.clone(), o.value.clone()))
                .collect(),
        })?;
    }
    for raw in &doc.domains.domains {
        load_stub(&mut store, raw)?;
    }

    // stage 3: intrinsic domain properties
    for raw in &doc.domains.domains {
        load_domain_properties(&mut store, raw, 3)?;
    }

    // stage 4: domain-to-domain references, now that every stub exists
    load_global_properties(&mut store, &doc, 4)?;
    for raw in &doc.domains.domains {
        load_domain_properties(&mut store, raw, 4)?;
    }
    for raw in &doc.domains.domains {
        load_devices(&mut store, raw)?;
    }

    // stage 5: features, tags, firewall, volumes
    for raw in &doc.domains.domains {
        load_collections(&mut store, raw)?;
    }

    Ok(store)
}

fn load_global_properties(store: &mut QubesStore, doc: &XmlQubes, stage: u8) -> QubesResult<()> {
    for raw in &doc.properties.properties {
        let def = match global_property_def(&raw.name) {
            Some(def) => def,
            None => continue,
        };
        if def.stage != stage {
            continue;
        }
        let value = parse_property(raw, def.kind)?;
        store.load_apply_global_property(&raw.name, value, stage)?;
    }
    Ok(())
}

fn load_stub(store: &mut QubesStore, raw: &XmlDomain) -> QubesResult<()> {
    let class = VmClass::parse(&raw.class)?;
    let mut domain = Domain::new(raw.id, &raw.name, class)?;
    domain.uuid = Uuid::parse_str(&raw.uuid)
        .map_err(|_| QubesError::invalid_value(format!("invalid uuid: {:?}", raw.uuid)))?;
    store.load_insert_stub(domain)?;
    // label rides with the stub so later stages can rely on it
    for prop in &raw.properties.properties {
        if prop.name == "label" {
            let value = PropertyValue::LabelRef(prop.value.clone().unwrap_or_default());
            if let PropertyValue::LabelRef(name) = &value {
                store.label(name)?;
            }
            store.load_apply_domain_property(&raw.name, "label", value, 2)?;
        }
    }
    Ok(())
}

fn load_domain_properties(store: &mut QubesStore, raw: &XmlDomain, stage: u8) -> QubesResult<()> {
    let class = VmClass::parse(&raw.class)?;
    for prop in &raw.properties.properties {
        let def = match domain_property_def(class, &prop.name) {
            Some(def) => def,
            None => continue,
        };
        if def.stage != stage {
            continue;
        }
        let value = parse_property(prop, def.kind)?;
        store.load_apply_domain_property(&raw.name, &prop.name, value, stage)?;
    }
    Ok(())
}

fn load_devices(store: &mut QubesStore, raw: &XmlDomain) -> QubesResult<()> {
    for group in &raw.devices {
        let devclass = DeviceClass::parse(&group.class)?;
        for device in &group.devices {
            let port = Port::new(device.backend.clone(), device.port_id.clone(), devclass);
            let virtual_device = VirtualDevice::new(
                port,
                device.device_id.clone().unwrap_or_else(|| "*".to_string()),
            );
            let mut assignment =
                DeviceAssignment::new(virtual_device, AssignmentMode::parse(&device.mode)?)?;
            assignment.options = device
                .options
                .iter()
                .map(|o| (o.name.clone(), o.value.clone()))
                .collect();
            let domain = store.domain_mut(&raw.name)?;
            domain.devices.push(assignment);
        }
    }
    Ok(())
}

fn load_collections(store: &mut QubesStore, raw: &XmlDomain) -> QubesResult<()> {
    let rules = raw
        .firewall
        .rules
        .iter()
        .map(|r| Rule::parse(&r.line))
        .collect::<QubesResult<Vec<_>>>()?;
    let policy = match raw.firewall.policy.as_deref() {
        Some(p) => Action::parse(p)?,
        None => Action::Accept,
    };

    let mut volumes = Vec::new();
    for v in &raw.volumes.volumes {
        let config = VolumeConfig {
            name: v.name.clone(),
            pool: v.pool.clone(),
            vid: v.vid.clone(),
            size: v.size,
            rw: parse_bool(&v.rw, "rw")?,
            snap_on_start: parse_bool(&v.snap_on_start, "snap_on_start")?,
            save_on_stop: parse_bool(&v.save_on_stop, "save_on_stop")?,
            ephemeral: parse_bool(&v.ephemeral, "ephemeral")?,
            revisions_to_keep: v.revisions_to_keep,
            source: v.source.clone(),
        };
        config.validate()?;
        store.pool(&config.pool)?;
        volumes.push(config);
    }

    let domain = store.domain_mut(&raw.name)?;
    domain.firewall = Firewall {
        policy,
        rules,
    };
    for config in volumes {
        domain.volumes.insert(config.name.clone(), config);
    }
    for feature in &raw.features.features {
        domain
            .features
            .set(&feature.name, feature.value.as_deref().unwrap_or(""))?;
    }
    for tag in &raw.tags.tags {
        domain.tags.insert(&tag.name)?;
    }
    Ok(())
}
