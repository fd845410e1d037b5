//! Hypervisor mediation.
//!
//! The daemon drives domains through the narrow [`Hypervisor`] trait;
//! everything behind it (libvirt, the test mock, the offline stub) is
//! interchangeable. Domain XML is rendered from a mustache template with
//! an overridable search path: per-domain override, then the
//! administrator's paths, then the built-in template.

use crate::settings::Settings;
use qubesd_common::{async_trait, QubesError, QubesResult};
use serde::Serialize;
use std::time::Duration;

#[cfg(feature = "libvirt")]
pub mod libvirt;

/// Power state as observed from the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPowerState {
    Halted,
    Running,
    Paused,
    Crashed,
    Unknown,
}

impl VmPowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halted => "Halted",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Crashed => "Crashed",
            Self::Unknown => "Unknown",
        }
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Define the domain from its XML and start it.
    async fn define_and_start(&self, name: &str, xml: &str) -> QubesResult<()>;

    /// Ask the guest for an orderly shutdown; returns immediately.
    async fn shutdown(&self, name: &str) -> QubesResult<()>;

    /// Pull the plug.
    async fn destroy(&self, name: &str) -> QubesResult<()>;

    async fn suspend(&self, name: &str) -> QubesResult<()>;

    async fn resume(&self, name: &str) -> QubesResult<()>;

    async fn state(&self, name: &str) -> QubesResult<VmPowerState>;

    /// Block until the guest's qrexec channel answers, or time out.
    async fn wait_qrexec(&self, name: &str, timeout: Duration) -> QubesResult<()>;

    async fn attach_device(&self, name: &str, device_xml: &str) -> QubesResult<()>;

    async fn detach_device(&self, name: &str, device_xml: &str) -> QubesResult<()>;
}

/// Used when the daemon runs store-only, without a hypervisor.
pub struct OfflineHypervisor;

#[async_trait]
impl Hypervisor for OfflineHypervisor {
    async fn define_and_start(&self, name: &str, _xml: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn shutdown(&self, name: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn destroy(&self, name: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn suspend(&self, name: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn resume(&self, name: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn state(&self, _name: &str) -> QubesResult<VmPowerState> {
        Ok(VmPowerState::Halted)
    }

    async fn wait_qrexec(&self, name: &str, _timeout: Duration) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn attach_device(&self, name: &str, _device_xml: &str) -> QubesResult<()> {
        Err(offline(name))
    }

    async fn detach_device(&self, name: &str, _device_xml: &str) -> QubesResult<()> {
        Err(offline(name))
    }
}

fn offline(name: &str) -> QubesError {
    QubesError::wrong_state(format!(
        "daemon is in offline mode, cannot manage domain {}",
        name
    ))
}

/// Everything the domain template needs to render.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: String,
    pub vcpus: i64,
    /// MiB
    pub memory: i64,
    /// MiB
    pub maxmem: i64,
    pub virt_mode: String,
    pub kernel: Option<String>,
    pub kernelopts: String,
    pub ip: String,
    pub gateway: Option<String>,
    /// Backend domain of the network frontend, if any.
    pub netvm: Option<String>,
    pub mac: String,
    pub disks: Vec<DiskSpec>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSpec {
    pub name: String,
    pub path: String,
    pub target: String,
    pub rw: bool,
    pub ephemeral: bool,
}

const BUILTIN_TEMPLATE: &str = include_str!("../../templates/xen.xml");

/// Render the domain XML, honouring the override search order.
pub fn render_domain_xml(settings: &Settings, spec: &DomainSpec) -> QubesResult<String> {
    let template = settings
        .template_candidates(&spec.name)
        .iter()
        .find_map(|path| mustache::compile_path(path).ok())
        .unwrap_or_else(|| {
            mustache::compile_str(BUILTIN_TEMPLATE).expect("built-in template is valid")
        });

    let mut out = Vec::new();
    template
        .render(&mut out, spec)
        .map_err(|e| QubesError::internal(format!("domain template render failed: {}", e)))?;
    String::from_utf8(out)
        .map_err(|e| QubesError::internal(format!("domain template produced invalid utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DomainSpec {
        DomainSpec {
            name: "work".to_string(),
            uuid: "cafebabe-0000-0000-0000-000000000001".to_string(),
            vcpus: 2,
            memory: 400,
            maxmem: 4000,
            virt_mode: "pvh".to_string(),
            kernel: Some("/var/lib/qubes/vm-kernels/6.6/vmlinuz".to_string()),
            kernelopts: "nopat".to_string(),
            ip: "10.137.0.3".to_string(),
            gateway: Some("10.137.0.2".to_string()),
            netvm: Some("sys-firewall".to_string()),
            mac: "00:16:3e:5e:6c:03".to_string(),
            disks: vec![DiskSpec {
                name: "root".to_string(),
                path: "/var/lib/qubes/storage/appvms/work/root.img.dirty".to_string(),
                target: "xvda".to_string(),
                rw: true,
                ephemeral: false,
            }],
        }
    }

    #[test]
    fn builtin_template_renders() {
        let settings = Settings::default();
        let xml = render_domain_xml(&settings, &spec()).unwrap();
        assert!(xml.contains("<name>work</name>"));
        assert!(xml.contains("<vcpu"));
        assert!(xml.contains("xvda"));
        assert!(xml.contains("sys-firewall"));
        assert!(xml.contains("00:16:3e:5e:6c:03"));
    }

    #[test]
    fn netvm_section_is_optional() {
        let settings = Settings::default();
        let mut s = spec();
        s.netvm = None;
        s.gateway = None;
        let xml = render_domain_xml(&settings, &s).unwrap();
        assert!(!xml.contains("interface"));
    }
}
