//! Admin API method dispatch.
//!
//! Every call is policy-checked, then routed by exact method name. The
//! returned bytes are the success payload; errors bubble up as
//! [`QubesError`] and are encoded by the server.

use crate::app::App;
use crate::lifecycle::DomainState;
use log::debug;
use qubesd_common::{AdminRequest, QubesError, QubesResult};
use qubesd_model::{AssignmentMode, DeviceAssignment, DeviceClass, Firewall, VirtualDevice};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod policy;
pub mod server;

/// Method name of the streaming endpoint, handled by the server rather
/// than the dispatcher.
pub const EVENTS_METHOD: &str = "admin.Events";

fn parse_kv(payload: &[u8]) -> QubesResult<BTreeMap<String, String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| QubesError::protocol("payload is not valid utf-8"))?;
    let mut map = BTreeMap::new();
    for token in text.split_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| QubesError::protocol(format!("malformed token {:?}", token)))?;
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn payload_str(payload: &[u8]) -> QubesResult<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| QubesError::protocol("payload is not valid utf-8"))
}

fn require_dom0(req: &AdminRequest) -> QubesResult<()> {
    if req.dest != "dom0" {
        return Err(QubesError::not_allowed(format!(
            "{} targets dom0 only",
            req.method
        )));
    }
    Ok(())
}

fn require_argument(req: &AdminRequest) -> QubesResult<&str> {
    if req.argument.is_empty() {
        return Err(QubesError::protocol(format!(
            "{} needs an argument",
            req.method
        )));
    }
    Ok(&req.argument)
}

fn property_line(def: &qubesd_model::PropertyDef, is_default: bool, value: &str) -> String {
    format!(
        "default={} type={} {}",
        if is_default { "True" } else { "False" },
        def.kind.name(),
        value
    )
}

pub async fn dispatch(app: &Arc<App>, req: &AdminRequest) -> QubesResult<Vec<u8>> {
    {
        let store = app.store().await;
        policy::check(
            &store,
            &app.settings.policy_dirs,
            &req.method,
            &req.argument,
            &req.source,
            &req.dest,
        )?;
    }
    debug!(
        "admin call {} dest={} argument={:?} from {}",
        req.method, req.dest, req.argument, req.source
    );

    let dest = req.dest.as_str();
    match req.method.as_str() {
        // ---- domains ----
        "admin.vm.List" => {
            let store = app.store().await;
            let mut out = String::new();
            let mut domains: Vec<_> = if dest == "dom0" {
                store.domains().collect()
            } else {
                vec![store.domain(dest)?]
            };
            domains.sort_by_key(|d| d.qid);
            for domain in domains {
                out.push_str(&format!(
                    "{} class={} state={}\n",
                    domain.name,
                    domain.class,
                    app.power_state(&domain.name)
                ));
            }
            Ok(out.into_bytes())
        }
        "admin.vm.CurrentState" => {
            let store = app.store().await;
            store.domain(dest)?;
            drop(store);
            Ok(format!("power_state={}", app.power_state(dest)).into_bytes())
        }
        "admin.vm.Create" | "admin.vm.CreateInPool" => {
            require_dom0(req)?;
            let class = qubesd_model::VmClass::parse(require_argument(req)?)?;
            let params = parse_kv(&req.payload)?;
            let name = params
                .get("name")
                .ok_or_else(|| QubesError::protocol("missing name"))?;
            let label = params
                .get("label")
                .ok_or_else(|| QubesError::protocol("missing label"))?;
            app.create_domain(
                name,
                class,
                label,
                params.get("template").map(|s| s.as_str()),
                params.get("pool").map(|s| s.as_str()),
            )
            .await?;
            Ok(Vec::new())
        }
        "admin.vm.CreateDisposable" => {
            let template = if dest == "dom0" { None } else { Some(dest) };
            let name = app.create_dispvm(template).await?;
            Ok(name.into_bytes())
        }
        "admin.vm.Remove" => {
            app.remove_domain(dest).await?;
            Ok(Vec::new())
        }
        "admin.vm.Clone" => {
            let params = parse_kv(&req.payload)?;
            let new_name = params
                .get("name")
                .ok_or_else(|| QubesError::protocol("missing name"))?;
            app.clone_domain(dest, new_name).await?;
            Ok(Vec::new())
        }
        "admin.vm.Start" => {
            app.start_domain(dest).await?;
            Ok(Vec::new())
        }
        "admin.vm.Shutdown" => {
            let params = parse_kv(&req.payload)?;
            let force = params.get("force").map(|v| v == "True").unwrap_or(false);
            app.shutdown_domain(dest, force).await?;
            Ok(Vec::new())
        }
        "admin.vm.Kill" => {
            app.kill_domain(dest).await?;
            Ok(Vec::new())
        }
        "admin.vm.Pause" => {
            app.pause_domain(dest).await?;
            Ok(Vec::new())
        }
        "admin.vm.Unpause" => {
            app.unpause_domain(dest).await?;
            Ok(Vec::new())
        }

        // ---- domain properties ----
        "admin.vm.property.List" => {
            let store = app.store().await;
            let names: Vec<&str> = store
                .domain_property_list(dest)?
                .into_iter()
                .map(|(def, _, _)| def.name)
                .collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.vm.property.Get" => {
            let prop = require_argument(req)?;
            let store = app.store().await;
            let domain = store.domain(dest)?;
            let def = qubesd_model::domain_property_def(domain.class, prop)
                .ok_or_else(|| QubesError::not_found("property", prop))?;
            let is_default = store.domain_property_is_default(dest, prop)?;
            let value = store
                .domain_property(dest, prop)
                .map(|v| v.to_wire())
                .unwrap_or_default();
            Ok(property_line(def, is_default, &value).into_bytes())
        }
        "admin.vm.property.GetAll" => {
            let store = app.store().await;
            let mut out = String::new();
            for (def, is_default, value) in store.domain_property_list(dest)? {
                let value = value.map(|v| v.to_wire()).unwrap_or_default();
                out.push_str(&format!(
                    "{} {}\n",
                    def.name,
                    property_line(def, is_default, &value)
                ));
            }
            Ok(out.into_bytes())
        }
        "admin.vm.property.Set" => {
            let prop = require_argument(req)?;
            let value = payload_str(&req.payload)?;
            app.domain_property_set(dest, prop, &value).await?;
            Ok(Vec::new())
        }
        "admin.vm.property.Reset" => {
            let prop = require_argument(req)?;
            app.domain_property_reset(dest, prop).await?;
            Ok(Vec::new())
        }
        "admin.vm.property.Help" => {
            let prop = require_argument(req)?;
            let store = app.store().await;
            let domain = store.domain(dest)?;
            let def = qubesd_model::domain_property_def(domain.class, prop)
                .ok_or_else(|| QubesError::not_found("property", prop))?;
            Ok(def.doc.as_bytes().to_vec())
        }

        // ---- global properties ----
        "admin.property.List" => {
            require_dom0(req)?;
            let names: Vec<&str> = qubesd_model::GLOBAL_PROPERTIES
                .iter()
                .map(|d| d.name)
                .collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.property.Get" => {
            require_dom0(req)?;
            let prop = require_argument(req)?;
            let store = app.store().await;
            let def = qubesd_model::global_property_def(prop)
                .ok_or_else(|| QubesError::not_found("property", prop))?;
            let is_default = store.global_property_is_default(prop)?;
            let value = store
                .global_property(prop)
                .map(|v| v.to_wire())
                .unwrap_or_default();
            Ok(property_line(def, is_default, &value).into_bytes())
        }
        "admin.property.Set" => {
            require_dom0(req)?;
            let prop = require_argument(req)?;
            let value = payload_str(&req.payload)?;
            app.global_property_set(prop, &value).await?;
            Ok(Vec::new())
        }
        "admin.property.Reset" => {
            require_dom0(req)?;
            let prop = require_argument(req)?;
            app.global_property_reset(prop).await?;
            Ok(Vec::new())
        }
        "admin.property.Help" => {
            require_dom0(req)?;
            let prop = require_argument(req)?;
            let def = qubesd_model::global_property_def(prop)
                .ok_or_else(|| QubesError::not_found("property", prop))?;
            Ok(def.doc.as_bytes().to_vec())
        }

        // ---- features ----
        "admin.vm.feature.List" => {
            let store = app.store().await;
            let names: Vec<String> = store
                .domain(dest)?
                .features
                .iter()
                .map(|(k, _)| k.to_string())
                .collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.vm.feature.Get" => {
            let feature = require_argument(req)?;
            let store = app.store().await;
            let value = store
                .domain(dest)?
                .features
                .get(feature)
                .ok_or_else(|| QubesError::not_found("feature", feature))?;
            Ok(value.as_bytes().to_vec())
        }
        "admin.vm.feature.CheckWithTemplate" => {
            let feature = require_argument(req)?;
            let store = app.store().await;
            let value = store
                .feature_check_with_template(dest, feature)?
                .ok_or_else(|| QubesError::not_found("feature", feature))?;
            Ok(value.into_bytes())
        }
        "admin.vm.feature.Set" => {
            let feature = require_argument(req)?;
            let value = payload_str(&req.payload)?;
            app.feature_set(dest, feature, &value).await?;
            Ok(Vec::new())
        }
        "admin.vm.feature.Remove" => {
            let feature = require_argument(req)?;
            app.feature_remove(dest, feature).await?;
            Ok(Vec::new())
        }

        // ---- tags ----
        "admin.vm.tag.List" => {
            let store = app.store().await;
            let tags: Vec<String> = store
                .domain(dest)?
                .tags
                .iter()
                .map(str::to_string)
                .collect();
            Ok((tags.join("\n") + "\n").into_bytes())
        }
        "admin.vm.tag.Get" => {
            let tag = require_argument(req)?;
            let store = app.store().await;
            let present = store.domain(dest)?.tags.contains(tag);
            Ok(if present { b"1".to_vec() } else { b"0".to_vec() })
        }
        "admin.vm.tag.Set" => {
            let tag = require_argument(req)?;
            app.tag_add(dest, tag).await?;
            Ok(Vec::new())
        }
        "admin.vm.tag.Remove" => {
            let tag = require_argument(req)?;
            app.tag_remove(dest, tag).await?;
            Ok(Vec::new())
        }

        // ---- firewall ----
        "admin.vm.firewall.Get" => {
            let store = app.store().await;
            let firewall = &store.domain(dest)?.firewall;
            let mut out = String::new();
            for line in firewall.rule_lines() {
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str(&format!("policy={}\n", firewall.policy.as_str()));
            Ok(out.into_bytes())
        }
        "admin.vm.firewall.Set" => {
            let text = payload_str(&req.payload)?;
            let mut policy = None;
            let mut rule_lines = Vec::new();
            for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
                match line.strip_prefix("policy=") {
                    Some(p) => policy = Some(qubesd_model::Action::parse(p)?),
                    None => rule_lines.push(line),
                }
            }
            let rules = Firewall::parse_rules(rule_lines.into_iter())?;
            app.firewall_set(dest, rules, policy).await?;
            Ok(Vec::new())
        }

        // ---- volumes ----
        "admin.vm.volume.List" => {
            let store = app.store().await;
            let names: Vec<String> = store
                .domain(dest)?
                .volumes
                .keys()
                .cloned()
                .collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.vm.volume.Info" => {
            let name = require_argument(req)?;
            let volume = app.volume(dest, name).await?;
            let config = volume.config().clone();
            let mut out = String::new();
            out.push_str(&format!("pool={}\n", config.pool));
            out.push_str(&format!("vid={}\n", config.vid));
            out.push_str(&format!("size={}\n", config.size));
            out.push_str(&format!("rw={}\n", config.rw));
            out.push_str(&format!("snap_on_start={}\n", config.snap_on_start));
            out.push_str(&format!("save_on_stop={}\n", config.save_on_stop));
            out.push_str(&format!("ephemeral={}\n", config.ephemeral));
            out.push_str(&format!("revisions_to_keep={}\n", config.revisions_to_keep));
            if let Some(source) = &config.source {
                out.push_str(&format!("source={}\n", source));
            }
            out.push_str(&format!("is_dirty={}\n", volume.is_dirty().await));
            out.push_str(&format!("is_outdated={}\n", volume.is_outdated().await));
            Ok(out.into_bytes())
        }
        "admin.vm.volume.ListSnapshots" => {
            let name = require_argument(req)?;
            let volume = app.volume(dest, name).await?;
            let ids: Vec<String> = volume
                .revisions()
                .await?
                .into_iter()
                .map(|r| r.id)
                .collect();
            Ok((ids.join("\n") + "\n").into_bytes())
        }
        "admin.vm.volume.Resize" => {
            let name = require_argument(req)?;
            let size: u64 = payload_str(&req.payload)?
                .trim()
                .parse()
                .map_err(|_| QubesError::protocol("payload must be a size in bytes"))?;
            let volume = app.volume(dest, name).await?;
            volume.resize(size).await?;
            let events = {
                let mut store = app.store.write().await;
                store.volume_set_size(dest, name, size)?
            };
            app.save().await?;
            app.relay_events(events).await;
            Ok(Vec::new())
        }
        "admin.vm.volume.Revert" => {
            let name = require_argument(req)?;
            let revision = payload_str(&req.payload)?;
            let volume = app.volume(dest, name).await?;
            volume.revert(revision.trim()).await?;
            Ok(Vec::new())
        }
        "admin.vm.volume.Clear" => {
            let name = require_argument(req)?;
            let volume = app.volume(dest, name).await?;
            if volume.is_dirty().await {
                return Err(QubesError::wrong_state(format!(
                    "volume {} is in use",
                    name
                )));
            }
            volume.remove().await?;
            volume.create().await?;
            Ok(Vec::new())
        }
        "admin.vm.volume.Import" => {
            let name = require_argument(req)?;
            let volume = app.volume(dest, name).await?;
            let staging = volume.import_data(req.payload.len() as u64).await?;
            if let Err(e) = tokio::fs::write(&staging, &req.payload)
                .await
                .map_err(|e| QubesError::io(&staging, e))
            {
                let _ = volume.import_data_end(false).await;
                return Err(e);
            }
            volume.import_data_end(true).await?;
            Ok(Vec::new())
        }

        // ---- devices ----
        method if method.starts_with("admin.vm.device.") => {
            device_dispatch(app, req, method).await
        }

        // ---- pools ----
        "admin.pool.List" => {
            require_dom0(req)?;
            let store = app.store().await;
            let names: Vec<String> = store.pools().map(|p| p.name.clone()).collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.pool.ListDrivers" => {
            require_dom0(req)?;
            Ok((crate::storage::DRIVERS.join("\n") + "\n").into_bytes())
        }
        "admin.pool.Info" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            let (driver, options) = {
                let store = app.store().await;
                let config = store.pool(name)?;
                (config.driver.clone(), config.options.clone())
            };
            let usage = app.pool(name).await?.usage().await?;
            let mut out = String::new();
            out.push_str(&format!("driver={}\n", driver));
            for (key, value) in options {
                out.push_str(&format!("{}={}\n", key, value));
            }
            out.push_str(&format!("size={}\n", usage.size));
            out.push_str(&format!("usage={}\n", usage.usage));
            Ok(out.into_bytes())
        }
        "admin.pool.Add" => {
            require_dom0(req)?;
            let driver = require_argument(req)?;
            let mut params = parse_kv(&req.payload)?;
            let name = params
                .remove("name")
                .ok_or_else(|| QubesError::protocol("missing name"))?;
            app.add_pool(&name, driver, params).await?;
            Ok(Vec::new())
        }
        "admin.pool.Remove" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            app.remove_pool(name).await?;
            Ok(Vec::new())
        }

        // ---- labels ----
        "admin.label.List" => {
            require_dom0(req)?;
            let store = app.store().await;
            let names: Vec<String> = store.labels().map(|l| l.name.clone()).collect();
            Ok((names.join("\n") + "\n").into_bytes())
        }
        "admin.label.Get" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            let store = app.store().await;
            Ok(store.label(name)?.color.clone().into_bytes())
        }
        "admin.label.Index" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            let store = app.store().await;
            Ok(store.label(name)?.index.to_string().into_bytes())
        }
        "admin.label.Create" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            let color = payload_str(&req.payload)?;
            let index = {
                let store = app.store().await;
                store.labels().map(|l| l.index).max().unwrap_or(0) + 1
            };
            let label = qubesd_model::Label::new(index, color.trim(), name)?;
            {
                let mut store = app.store.write().await;
                store.add_label(label)?;
            }
            app.save().await?;
            Ok(Vec::new())
        }
        "admin.label.Remove" => {
            require_dom0(req)?;
            let name = require_argument(req)?;
            {
                let mut store = app.store.write().await;
                store.remove_label(name)?;
            }
            app.save().await?;
            Ok(Vec::new())
        }

        other => Err(QubesError::not_found("method", other)),
    }
}

async fn device_dispatch(
    app: &Arc<App>,
    req: &AdminRequest,
    method: &str,
) -> QubesResult<Vec<u8>> {
    // admin.vm.device.<class>.<Operation>
    let rest = method.trim_start_matches("admin.vm.device.");
    let (class, operation) = rest
        .split_once('.')
        .ok_or_else(|| QubesError::not_found("method", method))?;
    let devclass = DeviceClass::parse(class)?;
    let dest = req.dest.as_str();

    match operation {
        "List" => {
            let store = app.store().await;
            let mut out = String::new();
            for assignment in store.domain(dest)?.assignments_for(devclass) {
                out.push_str(&format!(
                    "{} mode={}",
                    assignment.device, assignment.mode
                ));
                for (key, value) in &assignment.options {
                    out.push_str(&format!(" _{}={}", key, value));
                }
                out.push('\n');
            }
            Ok(out.into_bytes())
        }
        "Assign" => {
            let identity = require_argument(req)?;
            let device = VirtualDevice::parse(identity, devclass)?;
            let mut params = parse_kv(&req.payload)?;
            let mode = AssignmentMode::parse(
                params
                    .remove("mode")
                    .as_deref()
                    .unwrap_or("manual"),
            )?;
            let mut assignment = DeviceAssignment::new(device, mode)?;
            assignment.options = params
                .into_iter()
                .filter_map(|(k, v)| k.strip_prefix('_').map(|k| (k.to_string(), v)))
                .collect();
            app.device_assign(dest, assignment).await?;
            Ok(Vec::new())
        }
        "Unassign" => {
            let identity = require_argument(req)?;
            let device = VirtualDevice::parse(identity, devclass)?;
            app.device_unassign(dest, &device).await?;
            Ok(Vec::new())
        }
        "Attach" => {
            let identity = require_argument(req)?;
            if app.power_state(dest) != DomainState::Running {
                return Err(QubesError::wrong_state(format!(
                    "domain {} is not running",
                    dest
                )));
            }
            let device = VirtualDevice::parse(identity, devclass)?;
            app.attach_device(dest, &device).await?;
            Ok(Vec::new())
        }
        "Detach" => {
            let identity = require_argument(req)?;
            let device = VirtualDevice::parse(identity, devclass)?;
            app.detach_device(dest, &device).await?;
            Ok(Vec::new())
        }
        _ => Err(QubesError::not_found("method", method)),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_app, TestApp, TestAppOptions};
    use qubesd_common::encode_event;

    fn call(method: &str, dest: &str) -> AdminRequest {
        AdminRequest {
            source: "dom0".to_string(),
            method: method.to_string(),
            dest: dest.to_string(),
            argument: String::new(),
            payload: Vec::new(),
        }
    }

    fn call_arg(method: &str, dest: &str, argument: &str, payload: &[u8]) -> AdminRequest {
        AdminRequest {
            source: "dom0".to_string(),
            method: method.to_string(),
            dest: dest.to_string(),
            argument: argument.to_string(),
            payload: payload.to_vec(),
        }
    }

    async fn text(fixture: &TestApp, req: AdminRequest) -> String {
        let out = dispatch(&fixture.app, &req).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn list_reports_class_and_state() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        fixture.app.start_domain("work").await.unwrap();

        let out = text(&fixture, call("admin.vm.List", "dom0")).await;
        assert!(out.contains("dom0 class=AdminVM state=Halted\n"));
        assert!(out.contains("work class=AppVM state=Running\n"));

        let single = text(&fixture, call("admin.vm.List", "work")).await;
        assert_eq!(single, "work class=AppVM state=Running\n");
    }

    #[tokio::test]
    async fn create_through_the_api() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_template("debian-12").await;
        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.Create",
                "dom0",
                "AppVM",
                b"name=work label=blue template=debian-12",
            ),
        )
        .await
        .unwrap();

        let out = text(&fixture, call("admin.vm.List", "work")).await;
        assert_eq!(out, "work class=AppVM state=Halted\n");
    }

    #[tokio::test]
    async fn property_get_reports_default_and_type() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_netvm("sys-firewall").await;
        fixture.add_app_vm("work").await;
        let app = &fixture.app;
        app.global_property_set("default_netvm", "sys-firewall")
            .await
            .unwrap();

        let out = text(&fixture, call_arg("admin.vm.property.Get", "work", "netvm", b"")).await;
        assert_eq!(out, "default=True type=vm sys-firewall");

        dispatch(
            &fixture.app,
            &call_arg("admin.vm.property.Set", "work", "netvm", b"none"),
        )
        .await
        .unwrap();
        let out = text(&fixture, call_arg("admin.vm.property.Get", "work", "netvm", b"")).await;
        assert_eq!(out, "default=False type=vm ");

        dispatch(
            &fixture.app,
            &call_arg("admin.vm.property.Reset", "work", "netvm", b""),
        )
        .await
        .unwrap();
        let out = text(&fixture, call_arg("admin.vm.property.Get", "work", "netvm", b"")).await;
        assert_eq!(out, "default=True type=vm sys-firewall");
    }

    #[tokio::test]
    async fn remove_in_use_reports_the_holder() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let err = dispatch(&fixture.app, &call("admin.vm.Remove", "debian-12"))
            .await
            .unwrap_err();
        match err {
            QubesError::InUse { message } => assert!(message.contains("work")),
            other => panic!("unexpected error: {:?}", other),
        }
        dispatch(&fixture.app, &call("admin.vm.Remove", "work"))
            .await
            .unwrap();
        dispatch(&fixture.app, &call("admin.vm.Remove", "debian-12"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn features_and_template_fallback() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.feature.Set",
                "debian-12",
                "supported-service.cups",
                b"1",
            ),
        )
        .await
        .unwrap();

        let out = text(
            &fixture,
            call_arg(
                "admin.vm.feature.CheckWithTemplate",
                "work",
                "supported-service.cups",
                b"",
            ),
        )
        .await;
        assert_eq!(out, "1");

        let err = dispatch(
            &fixture.app,
            &call_arg("admin.vm.feature.Get", "work", "supported-service.cups", b""),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QubesError::NotFound { .. }));
    }

    #[tokio::test]
    async fn firewall_roundtrip() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.firewall.Set",
                "work",
                "",
                b"action=accept proto=tcp dstports=443\naction=drop\npolicy=drop\n",
            ),
        )
        .await
        .unwrap();

        let out = text(&fixture, call("admin.vm.firewall.Get", "work")).await;
        assert_eq!(
            out,
            "action=accept proto=tcp dstports=443-443\naction=drop\npolicy=drop\n"
        );
    }

    #[tokio::test]
    async fn volume_info_and_resize() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;

        let names = text(&fixture, call("admin.vm.volume.List", "work")).await;
        assert_eq!(names, "private\nroot\nvolatile\n");

        let info = text(
            &fixture,
            call_arg("admin.vm.volume.Info", "work", "root", b""),
        )
        .await;
        assert!(info.contains("snap_on_start=true"));
        assert!(info.contains("source=vm-templates/debian-12/root"));

        let new_size = (crate::app::DEFAULT_PRIVATE_SIZE * 2).to_string();
        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.volume.Resize",
                "work",
                "private",
                new_size.as_bytes(),
            ),
        )
        .await
        .unwrap();
        let info = text(
            &fixture,
            call_arg("admin.vm.volume.Info", "work", "private", b""),
        )
        .await;
        assert!(info.contains(&format!("size={}\n", new_size)));

        // shrinking is refused
        let err = dispatch(
            &fixture.app,
            &call_arg("admin.vm.volume.Resize", "work", "private", b"1024"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QubesError::Storage { .. }));
    }

    #[tokio::test]
    async fn volume_import_roundtrip() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        dispatch(
            &fixture.app,
            &call_arg("admin.vm.volume.Import", "work", "private", b"imported bytes"),
        )
        .await
        .unwrap();
        let volume = fixture.app.volume("work", "private").await.unwrap();
        assert_eq!(
            tokio::fs::read(volume.export().await.unwrap()).await.unwrap(),
            b"imported bytes"
        );
    }

    #[tokio::test]
    async fn labels_and_pools() {
        let fixture = test_app(TestAppOptions::default()).await;
        let labels = text(&fixture, call("admin.label.List", "dom0")).await;
        assert!(labels.contains("red\n"));

        dispatch(
            &fixture.app,
            &call_arg("admin.label.Create", "dom0", "cyan", b"0x00ffff"),
        )
        .await
        .unwrap();
        let color = text(&fixture, call_arg("admin.label.Get", "dom0", "cyan", b"")).await;
        assert_eq!(color, "0x00ffff");
        dispatch(&fixture.app, &call_arg("admin.label.Remove", "dom0", "cyan", b""))
            .await
            .unwrap();

        let pools = text(&fixture, call("admin.pool.List", "dom0")).await;
        assert_eq!(pools, "default\n");
        let drivers = text(&fixture, call("admin.pool.ListDrivers", "dom0")).await;
        assert!(drivers.contains("file\n"));
        let info = text(&fixture, call_arg("admin.pool.Info", "dom0", "default", b"")).await;
        assert!(info.contains("driver=file\n"));
    }

    #[tokio::test]
    async fn device_assignment_through_the_api() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("sys-usb").await;
        fixture.add_app_vm("work").await;

        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.device.usb.Assign",
                "work",
                "sys-usb+1-1.2:046d_c52b",
                b"mode=auto-attach _read-only=True",
            ),
        )
        .await
        .unwrap();

        let out = text(&fixture, call("admin.vm.device.usb.List", "work")).await;
        assert_eq!(
            out,
            "sys-usb+1-1.2:046d_c52b mode=auto-attach _read-only=True\n"
        );
        // required mode on usb is refused at parse level
        let err = dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.device.usb.Assign",
                "work",
                "sys-usb+1-1.3",
                b"mode=required",
            ),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QubesError::InvalidValue { .. }));

        dispatch(
            &fixture.app,
            &call_arg(
                "admin.vm.device.usb.Unassign",
                "work",
                "sys-usb+1-1.2:046d_c52b",
                b"",
            ),
        )
        .await
        .unwrap();
        let out = text(&fixture, call("admin.vm.device.usb.List", "work")).await;
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn unknown_method_and_policy_denial() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;

        let err = dispatch(&fixture.app, &call("admin.vm.Nonsense", "work"))
            .await
            .unwrap_err();
        assert!(matches!(err, QubesError::NotFound { .. }));

        // a non-dom0 source with no policy on disk is denied
        let mut req = call("admin.vm.List", "dom0");
        req.source = "work".to_string();
        let err = dispatch(&fixture.app, &req).await.unwrap_err();
        assert!(matches!(err, QubesError::NotAllowed { .. }));
    }

    #[tokio::test]
    async fn events_are_relayed_in_order() {
        let fixture = test_app(TestAppOptions::default()).await;
        fixture.add_app_vm("work").await;
        let mut rx = fixture.app.relay.subscribe();

        fixture
            .app
            .domain_property_set("work", "memory", "800")
            .await
            .unwrap();
        fixture.app.tag_add("work", "prod").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.subject, "work");
        assert_eq!(first.event.name, "property-set:memory");
        let frame = encode_event(&first.subject, &first.event);
        assert!(frame.starts_with(b"work\0property-set:memory\0"));
        assert!(frame.ends_with(b"\n"));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.event.name, "domain-tag-add:prod");
    }
}
