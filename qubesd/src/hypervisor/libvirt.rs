//! Libvirt-backed hypervisor client.
//!
//! Connection loss is handled by reopening on demand; a domain whose
//! state cannot be re-queried after a reconnect attempt reports
//! `Unknown`.

use crate::hypervisor::{Hypervisor, VmPowerState};
use log::{info, warn};
use qubesd_common::{async_trait, QubesError, QubesResult};
use std::sync::Mutex;
use std::time::Duration;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

pub struct LibvirtHypervisor {
    url: String,
    connection: Mutex<Option<Connect>>,
}

impl LibvirtHypervisor {
    pub fn new(url: &str) -> QubesResult<Self> {
        let connection = Connect::open(Some(url)).map_err(virt_err)?;
        info!("connected to libvirt at {}", url);
        Ok(Self {
            url: url.to_string(),
            connection: Mutex::new(Some(connection)),
        })
    }

    fn with_connection<T>(&self, f: impl Fn(&Connect) -> QubesResult<T>) -> QubesResult<T> {
        let mut guard = self.connection.lock().expect("libvirt lock poisoned");
        if let Some(conn) = guard.as_ref() {
            match f(conn) {
                Err(QubesError::Hypervisor { code, .. }) if code == DISCONNECTED => {
                    warn!("libvirt connection lost, reconnecting");
                    *guard = None;
                }
                other => return other,
            }
        }
        let conn = Connect::open(Some(&self.url)).map_err(virt_err)?;
        let result = f(&conn);
        *guard = Some(conn);
        result
    }

    fn lookup(conn: &Connect, name: &str) -> QubesResult<Domain> {
        Domain::lookup_by_name(conn, name).map_err(virt_err)
    }
}

const DISCONNECTED: i32 = sys::VIR_ERR_INTERNAL_ERROR as i32;

fn virt_err(e: virt::error::Error) -> QubesError {
    QubesError::Hypervisor {
        code: e.code() as i32,
        message: e.message().to_string(),
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn define_and_start(&self, _name: &str, xml: &str) -> QubesResult<()> {
        let xml = xml.to_string();
        self.with_connection(move |conn| {
            Domain::create_xml(conn, &xml, sys::VIR_DOMAIN_START_VALIDATE)
                .map(|_| ())
                .map_err(virt_err)
        })
    }

    async fn shutdown(&self, name: &str) -> QubesResult<()> {
        self.with_connection(|conn| Self::lookup(conn, name)?.shutdown().map_err(virt_err))
    }

    async fn destroy(&self, name: &str) -> QubesResult<()> {
        self.with_connection(|conn| Self::lookup(conn, name)?.destroy().map_err(virt_err))
    }

    async fn suspend(&self, name: &str) -> QubesResult<()> {
        self.with_connection(|conn| Self::lookup(conn, name)?.suspend().map_err(virt_err))
    }

    async fn resume(&self, name: &str) -> QubesResult<()> {
        self.with_connection(|conn| Self::lookup(conn, name)?.resume().map_err(virt_err))
    }

    async fn state(&self, name: &str) -> QubesResult<VmPowerState> {
        let state = self.with_connection(|conn| {
            let domain = match Self::lookup(conn, name) {
                Ok(d) => d,
                Err(_) => return Ok(VmPowerState::Halted),
            };
            let (state, _reason) = domain.get_state().map_err(virt_err)?;
            Ok(match state {
                sys::VIR_DOMAIN_RUNNING | sys::VIR_DOMAIN_BLOCKED => VmPowerState::Running,
                sys::VIR_DOMAIN_PAUSED => VmPowerState::Paused,
                sys::VIR_DOMAIN_CRASHED => VmPowerState::Crashed,
                sys::VIR_DOMAIN_SHUTOFF | sys::VIR_DOMAIN_SHUTDOWN => VmPowerState::Halted,
                _ => VmPowerState::Unknown,
            })
        });
        // a failed reconnect leaves the domain state unknowable
        Ok(state.unwrap_or(VmPowerState::Unknown))
    }

    async fn wait_qrexec(&self, name: &str, timeout: Duration) -> QubesResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.state(name).await? {
                VmPowerState::Running => return Ok(()),
                VmPowerState::Crashed | VmPowerState::Halted => {
                    return Err(QubesError::wrong_state(format!(
                        "domain {} died while waiting for qrexec",
                        name
                    )))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(QubesError::wrong_state(format!(
                    "timed out waiting for qrexec in domain {}",
                    name
                )));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    async fn attach_device(&self, name: &str, device_xml: &str) -> QubesResult<()> {
        let device_xml = device_xml.to_string();
        self.with_connection(move |conn| {
            Self::lookup(conn, name)?
                .attach_device(&device_xml)
                .map_err(virt_err)
        })
    }

    async fn detach_device(&self, name: &str, device_xml: &str) -> QubesResult<()> {
        let device_xml = device_xml.to_string();
        self.with_connection(move |conn| {
            Self::lookup(conn, name)?
                .detach_device(&device_xml)
                .map_err(virt_err)
        })
    }
}
