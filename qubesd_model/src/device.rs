//! Device identities and assignments.
//!
//! A port names a physical socket on a backend domain
//! (`sys-usb+1-1.2`, devclass `usb`); a virtual device narrows that to a
//! specific piece of hardware via its device id, either side may be the
//! `*` wildcard. An assignment binds a virtual device to a frontend
//! domain with a mode.

use qubesd_common::{QubesError, QubesResult};
use std::collections::BTreeMap;
use std::fmt;

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceClass {
    Pci,
    Usb,
    Block,
    Mic,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pci => "pci",
            Self::Usb => "usb",
            Self::Block => "block",
            Self::Mic => "mic",
        }
    }

    pub fn parse(raw: &str) -> QubesResult<Self> {
        match raw {
            "pci" => Ok(Self::Pci),
            "usb" => Ok(Self::Usb),
            "block" => Ok(Self::Block),
            "mic" => Ok(Self::Mic),
            _ => Err(QubesError::invalid_value(format!(
                "unknown device class: {:?}",
                raw
            ))),
        }
    }

    /// Only PCI devices may be required at start; the others appear and
    /// disappear at runtime.
    pub fn supports_required(&self) -> bool {
        matches!(self, Self::Pci)
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub backend: String,
    pub port_id: String,
    pub devclass: DeviceClass,
}

impl Port {
    pub fn new(backend: impl Into<String>, port_id: impl Into<String>, devclass: DeviceClass) -> Self {
        Self {
            backend: backend.into(),
            port_id: port_id.into(),
            devclass,
        }
    }

    pub fn matches(&self, other: &Port) -> bool {
        self.devclass == other.devclass
            && self.backend == other.backend
            && (self.port_id == WILDCARD
                || other.port_id == WILDCARD
                || self.port_id == other.port_id)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.backend, self.port_id)
    }
}

/// A port plus the identity of the device plugged into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDevice {
    pub port: Port,
    pub device_id: String,
}

impl VirtualDevice {
    pub fn new(port: Port, device_id: impl Into<String>) -> Self {
        Self {
            port,
            device_id: device_id.into(),
        }
    }

    /// `<backend>+<port_id>:<device_id>`, the admin argument form.
    pub fn parse(raw: &str, devclass: DeviceClass) -> QubesResult<Self> {
        let (port_part, device_id) = match raw.split_once(':') {
            Some((p, d)) => (p, d),
            None => (raw, WILDCARD),
        };
        let (backend, port_id) = port_part.split_once('+').ok_or_else(|| {
            QubesError::invalid_value(format!("malformed device identity: {:?}", raw))
        })?;
        if backend.is_empty() || port_id.is_empty() || device_id.is_empty() {
            return Err(QubesError::invalid_value(format!(
                "malformed device identity: {:?}",
                raw
            )));
        }
        Ok(Self {
            port: Port::new(backend, port_id, devclass),
            device_id: device_id.to_string(),
        })
    }

    pub fn matches(&self, other: &VirtualDevice) -> bool {
        self.port.matches(&other.port)
            && (self.device_id == WILDCARD
                || other.device_id == WILDCARD
                || self.device_id == other.device_id)
    }
}

impl fmt::Display for VirtualDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.port, self.device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentMode {
    /// Attached once, by hand; not persisted across domain restarts.
    Manual,
    /// Attached automatically whenever the device appears.
    Auto,
    /// Attachment requires interactive confirmation.
    Ask,
    /// Must be attached before the domain may start.
    Required,
}

impl AssignmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto-attach",
            Self::Ask => "ask-to-attach",
            Self::Required => "required",
        }
    }

    pub fn parse(raw: &str) -> QubesResult<Self> {
        match raw {
            "manual" => Ok(Self::Manual),
            "auto-attach" | "auto" => Ok(Self::Auto),
            "ask-to-attach" | "ask" => Ok(Self::Ask),
            "required" => Ok(Self::Required),
            _ => Err(QubesError::invalid_value(format!(
                "unknown assignment mode: {:?}",
                raw
            ))),
        }
    }
}

impl fmt::Display for AssignmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persistent binding of a device to the owning (frontend) domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    pub device: VirtualDevice,
    pub mode: AssignmentMode,
    pub options: BTreeMap<String, String>,
}

impl DeviceAssignment {
    pub fn new(device: VirtualDevice, mode: AssignmentMode) -> QubesResult<Self> {
        if mode == AssignmentMode::Required && !device.port.devclass.supports_required() {
            return Err(QubesError::invalid_value(format!(
                "{} devices cannot be required",
                device.port.devclass
            )));
        }
        Ok(Self {
            device,
            mode,
            options: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_identity() {
        let dev = VirtualDevice::parse("sys-usb+1-1.2:046d_c52b", DeviceClass::Usb).unwrap();
        assert_eq!(dev.port.backend, "sys-usb");
        assert_eq!(dev.port.port_id, "1-1.2");
        assert_eq!(dev.device_id, "046d_c52b");
        assert_eq!(dev.to_string(), "sys-usb+1-1.2:046d_c52b");
    }

    #[test]
    fn parse_without_device_id() {
        let dev = VirtualDevice::parse("dom0+00_14.0", DeviceClass::Pci).unwrap();
        assert_eq!(dev.device_id, WILDCARD);
    }

    #[test]
    fn wildcard_matching() {
        let assigned = VirtualDevice::parse("sys-usb+*:046d_c52b", DeviceClass::Usb).unwrap();
        let seen = VirtualDevice::parse("sys-usb+1-1.2:046d_c52b", DeviceClass::Usb).unwrap();
        let other = VirtualDevice::parse("sys-usb+1-1.2:dead_beef", DeviceClass::Usb).unwrap();
        assert!(assigned.matches(&seen));
        assert!(!assigned.matches(&other));
    }

    #[test]
    fn required_is_pci_only() {
        let usb = VirtualDevice::parse("sys-usb+1-1.2", DeviceClass::Usb).unwrap();
        assert!(DeviceAssignment::new(usb.clone(), AssignmentMode::Required).is_err());
        assert!(DeviceAssignment::new(usb, AssignmentMode::Auto).is_ok());

        let pci = VirtualDevice::parse("dom0+00_14.0", DeviceClass::Pci).unwrap();
        assert!(DeviceAssignment::new(pci, AssignmentMode::Required).is_ok());
    }
}
