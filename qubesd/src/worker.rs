//! Background reconciliation worker.
//!
//! Periodically compares the in-process power states with what the
//! hypervisor reports. A domain that died behind our back gets the full
//! stop path (volume commit/discard, qubesdb wipe, `domain-shutdown`),
//! so crashes are indistinguishable from orderly shutdowns for every
//! consumer downstream.

use crate::app::App;
use crate::hypervisor::VmPowerState;
use crate::lifecycle::DomainState;
use anyhow::Result;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub enum WorkJob {
    /// Reconcile hypervisor state with the in-process view
    CheckDomains,
    /// Start a domain (used for autostart and admin escalations)
    StartDomain { name: String },
    /// Shut a domain down
    ShutdownDomain { name: String, force: bool },
}

impl fmt::Display for WorkJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkJob::CheckDomains => write!(f, "CheckDomains"),
            WorkJob::StartDomain { .. } => write!(f, "StartDomain"),
            WorkJob::ShutdownDomain { .. } => write!(f, "ShutdownDomain"),
        }
    }
}

pub struct Worker {
    app: Arc<App>,
    tx: UnboundedSender<WorkJob>,
    rx: UnboundedReceiver<WorkJob>,
}

impl Worker {
    pub fn new(app: Arc<App>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self { app, tx, rx }
    }

    pub fn sender(&self) -> UnboundedSender<WorkJob> {
        self.tx.clone()
    }

    /// Enqueue a state check every worker interval.
    pub fn spawn_check_loop(&self) {
        let tx = self.tx.clone();
        let interval = self.app.settings.worker_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.send(WorkJob::CheckDomains).is_err() {
                    break;
                }
            }
        });
    }

    pub async fn handle(&mut self) -> Result<()> {
        while let Some(job) = self.rx.recv().await {
            debug!("processing job: {}", job);
            if let Err(e) = self.process(&job).await {
                error!("job {} failed: {}", job, e);
            }
        }
        Ok(())
    }

    async fn process(&self, job: &WorkJob) -> Result<()> {
        match job {
            WorkJob::CheckDomains => self.check_domains().await,
            WorkJob::StartDomain { name } => {
                self.app.start_domain(name).await?;
                Ok(())
            }
            WorkJob::ShutdownDomain { name, force } => {
                self.app.shutdown_domain(name, *force).await?;
                Ok(())
            }
        }
    }

    async fn check_domains(&self) -> Result<()> {
        if self.app.settings.offline {
            return Ok(());
        }
        for name in self.app.active_domains() {
            let marked = self.app.power_state(&name);
            if !matches!(marked, DomainState::Running | DomainState::Paused) {
                // mid-transition; the owner of the lock will settle it
                continue;
            }
            let observed = match self.app.hypervisor.state(&name).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot query state of {}: {}", name, e);
                    self.app.set_power_state(&name, DomainState::Unknown);
                    continue;
                }
            };
            match observed {
                VmPowerState::Halted | VmPowerState::Crashed => {
                    info!("domain {} is gone from the hypervisor, cleaning up", name);
                    if let Err(e) = self.app.stop_cleanup(&name).await {
                        error!("cleanup of {} failed: {}", name, e);
                    }
                }
                VmPowerState::Paused if marked == DomainState::Running => {
                    self.app.set_power_state(&name, DomainState::Paused);
                }
                VmPowerState::Running if marked == DomainState::Paused => {
                    self.app.set_power_state(&name, DomainState::Running);
                }
                VmPowerState::Unknown => {
                    self.app.set_power_state(&name, DomainState::Unknown);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
