//! Maps `service.*` features onto guest data bus keys.
//!
//! At domain start (`domain-qdb-create`) every service feature is
//! published as `/qubes-service/<name>` with `1` or `0`; later feature
//! changes on a running domain are pushed immediately.

use crate::app::App;
use crate::extensions::Extension;
use crate::lifecycle::DomainState;
use qubesd_common::{async_trait, Event, QubesResult};

pub struct ServicesExtension;

impl ServicesExtension {
    async fn publish_all(&self, app: &App, domain: &str) -> QubesResult<()> {
        let services: Vec<(String, bool)> = {
            let store = app.store().await;
            store
                .domain(domain)?
                .features
                .services()
                .map(|(name, enabled)| (name.to_string(), enabled))
                .collect()
        };
        for (name, enabled) in services {
            app.qdb
                .write(
                    domain,
                    &format!("/qubes-service/{}", name),
                    if enabled { "1" } else { "0" },
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Extension for ServicesExtension {
    fn name(&self) -> &'static str {
        "services"
    }

    async fn handle_event(&self, app: &App, subject: &str, event: &Event) -> QubesResult<()> {
        if event.name == "domain-qdb-create" {
            return self.publish_all(app, subject).await;
        }

        if let Some(feature) = event
            .name
            .strip_prefix("domain-feature-set:")
            .and_then(|f| f.strip_prefix("service."))
        {
            if app.power_state(subject) == DomainState::Running {
                let enabled = event.get("value").map(|v| !v.is_empty()).unwrap_or(false);
                app.qdb
                    .write(
                        subject,
                        &format!("/qubes-service/{}", feature),
                        if enabled { "1" } else { "0" },
                    )
                    .await?;
            }
        }
        if let Some(feature) = event
            .name
            .strip_prefix("domain-feature-delete:")
            .and_then(|f| f.strip_prefix("service."))
        {
            if app.power_state(subject) == DomainState::Running {
                app.qdb
                    .remove(subject, &format!("/qubes-service/{}", feature))
                    .await?;
            }
        }
        Ok(())
    }
}
