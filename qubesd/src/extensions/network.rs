//! Pushes network configuration changes to running domains.
//!
//! Firewall edits are written into the netvm's side of the guest bus so
//! the provider can reprogram its filter; a netvm change on a running
//! domain updates the routing keys of the domain itself.

use crate::app::App;
use crate::extensions::Extension;
use crate::lifecycle::DomainState;
use qubesd_common::{async_trait, Event, QubesResult};

pub struct NetworkExtension;

impl NetworkExtension {
    async fn push_firewall(&self, app: &App, subject: &str) -> QubesResult<()> {
        let (netvm, ip, lines) = {
            let store = app.store().await;
            let netvm = store.domain_netvm(subject)?;
            let ip = store.domain_str(subject, "ip")?;
            let domain = store.domain(subject)?;
            let mut lines = domain.firewall.rule_lines();
            lines.push(format!("policy={}", domain.firewall.policy.as_str()));
            (netvm, ip, lines)
        };
        let netvm = match netvm {
            Some(n) => n,
            None => return Ok(()),
        };
        if app.power_state(&netvm) != DomainState::Running {
            return Ok(());
        }
        let prefix = format!("/qubes-firewall/{}", ip);
        app.qdb.remove(&netvm, &prefix).await?;
        for (index, line) in lines.iter().enumerate() {
            app.qdb
                .write(&netvm, &format!("{}/{:04}", prefix, index), line)
                .await?;
        }
        Ok(())
    }

    async fn update_routing(&self, app: &App, subject: &str) -> QubesResult<()> {
        if app.power_state(subject) != DomainState::Running {
            return Ok(());
        }
        let gateway = {
            let store = app.store().await;
            store.domain_str(subject, "gateway").unwrap_or_default()
        };
        if gateway.is_empty() {
            app.qdb.remove(subject, "/qubes-gateway").await
        } else {
            app.qdb.write(subject, "/qubes-gateway", &gateway).await
        }
    }
}

#[async_trait]
impl Extension for NetworkExtension {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn handle_event(&self, app: &App, subject: &str, event: &Event) -> QubesResult<()> {
        match event.name.as_str() {
            "firewall-changed" => self.push_firewall(app, subject).await,
            "property-set:netvm" => self.update_routing(app, subject).await,
            "domain-qdb-create" => self.push_firewall(app, subject).await,
            _ => Ok(()),
        }
    }
}
