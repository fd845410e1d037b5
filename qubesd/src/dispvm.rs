//! Disposable domains.
//!
//! A disposable is derived from an approved template at creation time,
//! boots from snapshots of the template's volumes, and dissolves —
//! volumes discarded, name released — after its first shutdown.

use crate::app::App;
use log::info;
use qubesd_common::{QubesError, QubesResult};
use qubesd_model::{Domain, PropertyValue, VmClass, VolumeConfig};
use rand::Rng;

/// Upper bound of the disposable name space (`disp1` … `disp9999`).
const DISP_NAME_SPACE: u16 = 10000;
const NAME_ATTEMPTS: usize = 64;

impl App {
    /// Derive a disposable from `template`, falling back to the global
    /// default disposable template. Returns the allocated name.
    pub async fn create_dispvm(&self, template: Option<&str>) -> QubesResult<String> {
        let template = match template {
            Some(t) => t.to_string(),
            None => {
                let store = self.store().await;
                match store.global_property("default_dispvm")? {
                    PropertyValue::VmRef(Some(t)) => t,
                    _ => {
                        return Err(QubesError::invalid_value(
                            "no disposable template given and no default set",
                        ))
                    }
                }
            }
        };

        let (name, events) = {
            let mut guard = self.store.write().await;
            let store = &mut *guard;
            if !store.domain_bool(&template, "template_for_dispvms").unwrap_or(false) {
                return Err(QubesError::invalid_value(format!(
                    "{} does not allow disposables",
                    template
                )));
            }
            let template_domain = store.domain(&template)?;
            let label = match template_domain.properties.get("label") {
                Some(PropertyValue::LabelRef(l)) => l.clone(),
                _ => "red".to_string(),
            };

            // the template's root may itself be a snapshot; follow it to
            // the committed image
            let root = template_domain.volumes.get("root").ok_or_else(|| {
                QubesError::invalid_value(format!("{} has no root volume", template))
            })?;
            let root_source = if root.snap_on_start {
                root.source.clone().ok_or_else(|| {
                    QubesError::invalid_value(format!("{} root has no source", template))
                })?
            } else {
                root.vid.clone()
            };
            let private = template_domain.volumes.get("private").ok_or_else(|| {
                QubesError::invalid_value(format!("{} has no private volume", template))
            })?;
            let root = root.clone();
            let private = private.clone();
            let volatile_ephemeral = template_domain
                .volumes
                .get("volatile")
                .map(|v| v.ephemeral)
                .unwrap_or(false);

            let name = allocate_disp_name(store)?;
            let qid = store.next_qid()?;
            let mut domain = Domain::new(qid, &name, VmClass::DispVM)?;
            domain.uuid = store.new_uuid();
            domain
                .properties
                .set("label", PropertyValue::LabelRef(label));

            let prefix = format!("appvms/{}", name);
            domain.volumes.insert(
                "root".to_string(),
                VolumeConfig {
                    name: "root".to_string(),
                    pool: root.pool.clone(),
                    vid: format!("{}/root", prefix),
                    size: root.size,
                    rw: true,
                    snap_on_start: true,
                    save_on_stop: false,
                    ephemeral: false,
                    revisions_to_keep: 0,
                    source: Some(root_source),
                },
            );
            domain.volumes.insert(
                "private".to_string(),
                VolumeConfig {
                    name: "private".to_string(),
                    pool: private.pool.clone(),
                    vid: format!("{}/private", prefix),
                    size: private.size,
                    rw: true,
                    snap_on_start: true,
                    save_on_stop: false,
                    ephemeral: false,
                    revisions_to_keep: 0,
                    source: Some(private.vid.clone()),
                },
            );
            domain.volumes.insert(
                "volatile".to_string(),
                VolumeConfig {
                    name: "volatile".to_string(),
                    pool: private.pool.clone(),
                    vid: format!("{}/volatile", prefix),
                    size: crate::app::DEFAULT_VOLATILE_SIZE,
                    rw: true,
                    snap_on_start: false,
                    save_on_stop: false,
                    // disposables inherit ephemeral volatile storage
                    ephemeral: volatile_ephemeral,
                    revisions_to_keep: 0,
                    source: None,
                },
            );

            let mut events = store.add_domain(domain)?;
            match store.domain_property_set(&name, "template", &template) {
                Ok(more) => events.extend(more),
                Err(e) => {
                    let _ = store.remove_domain(&name);
                    return Err(e);
                }
            }
            (name, events)
        };

        self.save().await?;
        self.relay_events(events).await;
        info!("created disposable {} from {}", name, template);
        Ok(name)
    }
}

fn allocate_disp_name(store: &qubesd_model::QubesStore) -> QubesResult<String> {
    let mut rng = rand::rng();
    for _ in 0..NAME_ATTEMPTS {
        let candidate = format!("disp{}", rng.random_range(1..DISP_NAME_SPACE));
        if !store.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(QubesError::internal(
        "could not allocate a free disposable name",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::DomainState;
    use crate::mocks::{test_app, TestAppOptions};

    #[tokio::test]
    async fn rejects_templates_without_approval() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        assert!(fixture.app.create_dispvm(Some("work")).await.is_err());
    }

    #[tokio::test]
    async fn disposable_lifecycle_discards_everything() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("debian-dvm").await;
        let app = &fixture.app;
        app.domain_property_set("debian-dvm", "template_for_dispvms", "True")
            .await
            .unwrap();

        // give the dvm template committed private data to inherit
        let tpl_private = app.volume("debian-dvm", "private").await.unwrap();
        tokio::fs::write(tpl_private.export().await.unwrap(), b"dvm config")
            .await
            .unwrap();

        let name = app.create_dispvm(Some("debian-dvm")).await.unwrap();
        assert!(name.starts_with("disp"));
        {
            let store = app.store().await;
            let disp = store.domain(&name).unwrap();
            assert_eq!(disp.class, VmClass::DispVM);
            assert!(disp.volumes.values().all(|v| !v.save_on_stop));
        }

        app.start_domain(&name).await.unwrap();
        assert_eq!(app.power_state(&name), DomainState::Running);
        // the disposable sees the template's private data
        let disp_private = app.volume(&name, "private").await.unwrap();
        assert_eq!(
            tokio::fs::read(disp_private.block_device().path).await.unwrap(),
            b"dvm config"
        );

        app.shutdown_domain(&name, false).await.unwrap();
        // the disposable dissolved: store entry gone, name free again
        assert!(!app.store().await.contains(&name));
        assert!(!disp_private.is_dirty().await);
        assert!(disp_private.export().await.is_err());
    }

    #[tokio::test]
    async fn default_dispvm_is_used_when_no_template_given() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("debian-dvm").await;
        let app = &fixture.app;
        app.domain_property_set("debian-dvm", "template_for_dispvms", "True")
            .await
            .unwrap();
        assert!(app.create_dispvm(None).await.is_err());

        app.global_property_set("default_dispvm", "debian-dvm")
            .await
            .unwrap();
        let name = app.create_dispvm(None).await.unwrap();
        assert_eq!(
            app.store().await.domain_property(&name, "template").unwrap(),
            qubesd_model::PropertyValue::VmRef(Some("debian-dvm".to_string()))
        );
    }
}
