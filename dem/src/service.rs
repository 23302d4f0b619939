//! Mutation orchestration. Every administrative operation runs the
//! same sequence: validate, mutate the model, persist the JSON
//! projection, propagate to the owning target, then notify subscribed
//! hosts. Persisting before propagation keeps a dispatcher failure
//! recoverable; a propagation failure surfaces to the caller but never
//! rolls the model back.

use std::sync::Arc;

use nvmf::page;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{
    config::{
        store,
        Access,
        FabricIface,
        Interface,
        MgmtMode,
        Namespace,
        NsDev,
        PageState,
        Portid,
        NULLB_DEVID,
    },
    dispatch::{SubsysSnapshot, TargetSnapshot, TargetView},
    error::ModelError,
    state::ManagerState,
};

/* request bodies; unknown fields are ignored, spelled-out and
 * persisted-layout key forms are both accepted */

#[derive(Debug, Default, Deserialize)]
pub struct TargetBody {
    #[serde(rename = "Alias", alias = "alias")]
    pub alias: Option<String>,
    #[serde(rename = "MgmtMode", alias = "mgmt_mode")]
    pub mgmt_mode: Option<MgmtMode>,
    #[serde(rename = "Refresh", alias = "refresh")]
    pub refresh: Option<u32>,
    #[serde(rename = "Interface", alias = "interface")]
    pub interface: Option<store::JsonIface>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortidBody {
    #[serde(rename = "PORTID", alias = "portid")]
    pub portid: Option<u16>,
    #[serde(rename = "TRTYPE", alias = "type", alias = "trtype")]
    pub trtype: Option<String>,
    #[serde(rename = "ADRFAM", alias = "family", alias = "adrfam")]
    pub adrfam: Option<String>,
    #[serde(rename = "TRADDR", alias = "address", alias = "traddr")]
    pub traddr: Option<String>,
    #[serde(rename = "TRSVCID", alias = "trsvcid")]
    pub trsvcid: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubsysBody {
    #[serde(rename = "SUBNQN", alias = "subnqn")]
    pub subnqn: Option<String>,
    #[serde(rename = "AllowAnyHost", alias = "allow_any", alias = "allow_any_host")]
    pub allow_any: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NsBody {
    #[serde(rename = "NSID", alias = "nsid")]
    pub nsid: Option<u32>,
    #[serde(rename = "DeviceID", alias = "devid")]
    pub devid: Option<i32>,
    #[serde(rename = "DeviceNSID", alias = "devnsid")]
    pub devnsid: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostBody {
    #[serde(rename = "Alias", alias = "alias")]
    pub alias: Option<String>,
    #[serde(rename = "HOSTNQN", alias = "hostnqn")]
    pub hostnqn: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GroupBody {
    #[serde(rename = "Name", alias = "name")]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SignatureBody {
    #[serde(rename = "OLD", alias = "old")]
    pub old: Option<String>,
    #[serde(rename = "NEW", alias = "new")]
    pub new: Option<String>,
}

pub fn parse_body<T: Default + for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, ModelError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/* snapshots for the dispatcher */

fn target_view(state: &ManagerState, alias: &str) -> Result<TargetView, ModelError> {
    let cfg = state.config.read();
    let target = cfg.target(alias)?;
    Ok(TargetView {
        alias: target.alias.clone(),
        mgmt_mode: target.mgmt_mode,
        iface: target.iface.clone(),
    })
}

fn subsys_snapshot(state: &ManagerState, alias: &str, subnqn: &str) -> Result<SubsysSnapshot, ModelError> {
    let cfg = state.config.read();
    let target = cfg.target(alias)?;
    let subsys = target
        .subsys(subnqn)
        .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
    Ok(SubsysSnapshot {
        subnqn: subsys.subnqn.clone(),
        allow_any: subsys.access.allows_any(),
        acl_nqns: subsys
            .acl
            .iter()
            .filter_map(|&id| cfg.hosts.get(id))
            .map(|h| h.hostnqn.clone())
            .collect(),
        namespaces: subsys.namespaces.clone(),
    })
}

fn target_snapshot(state: &ManagerState, alias: &str) -> Result<TargetSnapshot, ModelError> {
    let view = target_view(state, alias)?;
    let cfg = state.config.read();
    let target = cfg.target(alias)?;
    Ok(TargetSnapshot {
        view,
        portids: target.portids.clone(),
        subsystems: target
            .subsystems
            .iter()
            .map(|s| SubsysSnapshot {
                subnqn: s.subnqn.clone(),
                allow_any: s.access.allows_any(),
                acl_nqns: s
                    .acl
                    .iter()
                    .filter_map(|&id| cfg.hosts.get(id))
                    .map(|h| h.hostnqn.clone())
                    .collect(),
                namespaces: s.namespaces.clone(),
            })
            .collect(),
    })
}

/* dem resource */

pub fn list_interfaces(state: &ManagerState) -> String {
    let list: Vec<serde_json::Value> = state
        .interfaces
        .iter()
        .enumerate()
        .map(|(i, iface)| {
            json!({
                "ID": i,
                "TRTYPE": iface.trtype,
                "ADRFAM": iface.adrfam,
                "TRADDR": iface.traddr,
                "TRSVCID": iface.trsvcid,
            })
        })
        .collect();
    json!({ "Interfaces": list }).to_string()
}

pub fn update_signature(state: &ManagerState, body: SignatureBody) -> Result<String, ModelError> {
    let new = body
        .new
        .ok_or_else(|| ModelError::invalid("missing new signature"))?;
    {
        let current = state.signature.read();
        if let Some(current) = current.as_ref() {
            let old = body
                .old
                .ok_or_else(|| ModelError::invalid("missing old signature"))?;
            if *current != format!("Basic {}", old) && *current != old {
                return Err(ModelError::invalid("signature mismatch"));
            }
        }
    }
    if let Some(path) = &state.signature_path {
        if let Err(e) = std::fs::write(path, &new) {
            return Err(ModelError::Internal {
                reason: format!("writing signature file: {}", e),
            });
        }
    }
    *state.signature.write() = Some(format!("Basic {}", new));
    Ok("signature updated".to_string())
}

/* target operations */

pub fn list_targets(state: &ManagerState, mode: Option<&str>, fabric: Option<&str>) -> String {
    let cfg = state.config.read();
    let list: Vec<String> = cfg
        .targets
        .iter()
        .filter(|(_, t)| {
            mode.map(|m| {
                serde_json::to_value(t.mgmt_mode)
                    .ok()
                    .and_then(|v| v.as_str().map(|s| s == m))
                    .unwrap_or(false)
            })
            .unwrap_or(true)
        })
        .filter(|(_, t)| {
            fabric
                .map(|f| t.portids.iter().any(|p| p.trtype == f))
                .unwrap_or(true)
        })
        .map(|(_, t)| t.alias.clone())
        .collect();
    json!({ "Targets": list }).to_string()
}

pub fn show_target(state: &ManagerState, alias: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    cfg.target(alias)?;
    let root = store::to_json(&cfg);
    let target = root
        .targets
        .iter()
        .find(|t| t.alias == alias)
        .ok_or_else(|| ModelError::not_found("Target", alias))?;
    serde_json::to_string_pretty(target).map_err(|e| ModelError::Internal {
        reason: e.to_string(),
    })
}

pub fn add_target(state: &Arc<ManagerState>, alias: &str) -> Result<String, ModelError> {
    state.config.write().add_target(alias)?;
    state.persist();
    Ok(format!("Target '{}' added", alias))
}

pub fn update_target(
    state: &Arc<ManagerState>,
    alias: Option<&str>,
    body: TargetBody,
) -> Result<String, ModelError> {
    let iface = body.interface.as_ref().map(|j| match body.mgmt_mode {
        Some(MgmtMode::OutOfBand) => Interface::Oob {
            address: j
                .ifaddress
                .clone()
                .or_else(|| j.traddr.clone())
                .unwrap_or_default(),
            port: j.ifport.or(j.trsvcid).unwrap_or(0),
        },
        Some(MgmtMode::InBand) => Interface::Inband(Portid {
            portid: 0,
            trtype: j.trtype.clone().unwrap_or_default(),
            adrfam: j.adrfam.clone().unwrap_or_default(),
            traddr: j.traddr.clone().unwrap_or_default(),
            trsvcid: j.trsvcid.unwrap_or(4420),
        }),
        _ => Interface::None,
    });

    let name = {
        let mut cfg = state.config.write();
        let id = cfg.update_target(
            alias,
            body.alias.as_deref(),
            body.mgmt_mode,
            body.refresh,
            iface,
        )?;
        cfg.targets
            .get(id)
            .map(|t| t.alias.clone())
            .unwrap_or_default()
    };
    state.persist();

    if let Some(old) = alias {
        if old != name {
            state.dispatch.forget(old);
            let mut aggr = state.aggregator.lock();
            aggr.drop_target(old);
        }
    }

    if body.mgmt_mode.is_some() && body.mgmt_mode != Some(MgmtMode::Local) {
        refresh_inventory(state, &name);
    }

    let hosts = {
        let cfg = state.config.read();
        match cfg.find_target(&name) {
            Some((_, t)) => cfg.hosts_for_target(t),
            None => Vec::new(),
        }
    };
    state.publish_aen(hosts);

    Ok(format!("Target '{}' updated", name))
}

pub fn del_target(state: &Arc<ManagerState>, alias: &str) -> Result<String, ModelError> {
    let view = target_view(state, alias)?;
    let hosts = {
        let cfg = state.config.read();
        match cfg.find_target(alias) {
            Some((_, t)) => cfg.hosts_for_target(t),
            None => Vec::new(),
        }
    };

    // the remote side is wiped once; the model delete follows even if
    // the target is unreachable
    if let Err(e) = state.dispatch.reset_target(&view) {
        warn!("reset of '{}' failed: {}", alias, e);
    }
    state.dispatch.forget(alias);

    state.config.write().del_target(alias)?;
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.drop_target(alias);
    }

    state.publish_aen(hosts);
    Ok(format!("Target '{}' deleted", alias))
}

pub fn target_refresh(state: &Arc<ManagerState>, alias: &str) -> Result<String, ModelError> {
    state.config.read().target(alias)?;
    let mut aggr = state.aggregator.lock();
    aggr.refresh_target(state, alias);
    Ok(format!("Target '{}' refreshed", alias))
}

pub fn target_reconfig(state: &Arc<ManagerState>, alias: &str) -> Result<String, ModelError> {
    let view = target_view(state, alias)?;
    state.dispatch.reset_target(&view)?;
    program_target(state, alias)?;
    Ok(format!("Target '{}' reconfigured", alias))
}

pub fn target_usage(state: &ManagerState, alias: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    let target = cfg.target(alias)?;
    let mut used = Vec::new();
    for subsys in &target.subsystems {
        for ns in &subsys.namespaces {
            used.push(json!({
                "SUBNQN": subsys.subnqn,
                "NSID": ns.nsid,
                "DeviceID": ns.devid,
                "DeviceNSID": ns.devnsid,
            }));
        }
    }
    let free: Vec<serde_json::Value> = target
        .nsdevs
        .iter()
        .filter(|d| d.valid)
        .filter(|d| {
            !target.subsystems.iter().any(|s| {
                s.namespaces
                    .iter()
                    .any(|ns| ns.devid == d.devid && ns.devnsid == d.nsid)
            })
        })
        .map(|d| {
            json!({
                "DeviceID": d.devid,
                "NSID": d.nsid,
            })
        })
        .collect();
    Ok(json!({ "Used": used, "Available": free }).to_string())
}

fn format_page(entry: &page::DiscLogEntry) -> String {
    format!(
        "subnqn \"{}\" subtype \"{}\" portid {} trtype \"{}\" adrfam \"{}\" traddr {} trsvcid {}\n",
        entry.subnqn,
        page::subtype_str(entry.subtype),
        entry.portid,
        page::trtype_str(entry.trtype),
        page::adrfam_str(entry.adrfam),
        entry.traddr,
        entry.trsvcid
    )
}

pub fn target_logpage(state: &ManagerState, alias: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    let target = cfg.target(alias)?;
    let mut out = String::new();
    for subsys in &target.subsystems {
        for page in &subsys.logpages {
            if page.state != PageState::Deleted {
                out.push_str(&format_page(&page.entry));
            }
        }
    }
    if !target.unattached.is_empty() {
        out.push_str("Unattached Log Pages\n");
        for page in &target.unattached {
            out.push_str(&format_page(&page.entry));
        }
    }
    if out.is_empty() {
        out.push_str("No valid Log Pages");
    }
    Ok(out)
}

pub fn host_logpage(state: &ManagerState, alias: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    let (_, host) = cfg
        .find_host(alias)
        .ok_or_else(|| ModelError::not_found("Host", alias))?;
    let mut out = String::new();
    for entry in cfg.visible_entries(&host.hostnqn) {
        out.push_str(&format_page(&entry));
    }
    if out.is_empty() {
        out.push_str("No valid Log Pages");
    }
    Ok(out)
}

/// Pull the target's inventories and mark-sweep them into the model.
pub fn refresh_inventory(state: &Arc<ManagerState>, alias: &str) {
    let view = match target_view(state, alias) {
        Ok(view) => view,
        Err(_) => return,
    };
    let (devs, xports) = match state.dispatch.get_config(&view) {
        Ok(result) => result,
        Err(e) => {
            warn!("inventory fetch for '{}' failed: {}", alias, e);
            return;
        }
    };

    let mut cfg = state.config.write();
    let target = match cfg.find_target_mut(alias) {
        Some((_, t)) => t,
        None => return,
    };

    for dev in target.nsdevs.iter_mut() {
        dev.valid = false;
    }
    for entry in devs {
        let devid = if entry.devid == page::NULLB_ONWIRE_DEVID {
            NULLB_DEVID
        } else {
            entry.devid as i32
        };
        match target
            .nsdevs
            .iter_mut()
            .find(|d| d.devid == devid && d.nsid == entry.nsid)
        {
            Some(dev) => dev.valid = true,
            None => target.nsdevs.push(NsDev {
                devid,
                nsid: entry.nsid,
                valid: true,
            }),
        }
    }
    target.nsdevs.retain(|d| d.valid);

    for iface in target.fabric_ifaces.iter_mut() {
        iface.valid = false;
    }
    for entry in xports {
        let trtype = page::trtype_str(entry.trtype).to_string();
        let adrfam = page::adrfam_str(entry.adrfam).to_string();
        match target.fabric_ifaces.iter_mut().find(|i| {
            i.trtype == trtype && i.adrfam == adrfam && i.traddr == entry.traddr
        }) {
            Some(iface) => iface.valid = true,
            None => target.fabric_ifaces.push(FabricIface {
                trtype,
                adrfam,
                traddr: entry.traddr,
                valid: true,
            }),
        }
    }
    target.fabric_ifaces.retain(|i| i.valid);
    drop(cfg);
    state.persist();
}

/// Push the whole configuration of one target (startup / reconfigure).
pub fn program_target(state: &Arc<ManagerState>, alias: &str) -> Result<(), ModelError> {
    let snap = target_snapshot(state, alias)?;
    state.dispatch.config_target(&snap)
}

/* subsystems */

pub fn set_subsys(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: Option<&str>,
    body: SubsysBody,
) -> Result<String, ModelError> {
    let access = body.allow_any.map(|v| {
        if v != 0 {
            Access::AllowAny
        } else {
            Access::Restricted
        }
    });

    let hosts_before = match subnqn {
        Some(nqn) => {
            let cfg = state.config.read();
            match cfg.find_target(alias).and_then(|(_, t)| t.subsys(nqn)) {
                Some(subsys) => cfg.hosts_for_subsys(subsys),
                None => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    let name = {
        let mut cfg = state.config.write();
        cfg.set_subsys(alias, subnqn, body.subnqn.as_deref(), access)?;
        let wanted = body.subnqn.clone().or_else(|| subnqn.map(String::from));
        let target = cfg.target_mut(alias)?;
        target.synthesize_pages();
        wanted.unwrap_or_default()
    };
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    let mut hosts = hosts_before;
    {
        let cfg = state.config.read();
        if let Some(subsys) = cfg.find_target(alias).and_then(|(_, t)| t.subsys(&name)) {
            hosts.extend(cfg.hosts_for_subsys(subsys));
        }
    }

    let view = target_view(state, alias)?;
    let result = if view.mgmt_mode == MgmtMode::Local {
        Ok(())
    } else {
        let snap = subsys_snapshot(state, alias, &name)?;
        let portids = state.config.read().target(alias)?.portids.clone();
        state.dispatch.config_subsys(&view, &snap, &portids)
    };

    state.publish_aen(hosts);
    result.map(|_| format!("Subsystem '{}' updated in Target '{}'", name, alias))
}

pub fn del_subsys(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: &str,
) -> Result<String, ModelError> {
    let hosts = {
        let cfg = state.config.read();
        match cfg.find_target(alias).and_then(|(_, t)| t.subsys(subnqn)) {
            Some(subsys) => cfg.hosts_for_subsys(subsys),
            None => Vec::new(),
        }
    };
    let view = target_view(state, alias)?;

    state.config.write().del_subsys(alias, subnqn)?;
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    if let Err(e) = state.dispatch.del_subsys(&view, subnqn) {
        warn!("remote delete of subsystem '{}' failed: {}", subnqn, e);
    }

    state.publish_aen(hosts);
    Ok(format!("Subsystem '{}' deleted from Target '{}'", subnqn, alias))
}

/* portids */

pub fn set_portid(
    state: &Arc<ManagerState>,
    alias: &str,
    id: u16,
    body: PortidBody,
) -> Result<String, ModelError> {
    let portid = Portid {
        portid: body.portid.unwrap_or(id),
        trtype: body
            .trtype
            .ok_or_else(|| ModelError::invalid("missing transport type"))?,
        adrfam: body
            .adrfam
            .ok_or_else(|| ModelError::invalid("missing address family"))?,
        traddr: body
            .traddr
            .ok_or_else(|| ModelError::invalid("missing transport address"))?,
        trsvcid: body.trsvcid.unwrap_or(4420),
    };

    let view = target_view(state, alias)?;
    let subnqns: Vec<String> = {
        let cfg = state.config.read();
        cfg.target(alias)?
            .subsystems
            .iter()
            .map(|s| s.subnqn.clone())
            .collect()
    };
    let replacing = {
        let cfg = state.config.read();
        cfg.target(alias)?.portid(id).is_some()
    };

    // a replaced port is unlinked everywhere before it changes
    if replacing && view.mgmt_mode != MgmtMode::Local {
        for subnqn in &subnqns {
            if let Err(e) = state.dispatch.unlink_portid(&view, subnqn, id) {
                warn!("unlink port {} failed: {}", id, e);
            }
        }
        if portid.portid != id {
            if let Err(e) = state.dispatch.del_portid(&view, id) {
                warn!("delete port {} failed: {}", id, e);
            }
        }
    }

    {
        let mut cfg = state.config.write();
        cfg.set_portid(alias, portid.clone())?;
        let target = cfg.target_mut(alias)?;
        target.synthesize_pages();
    }
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    let result = if view.mgmt_mode == MgmtMode::Local {
        Ok(())
    } else {
        state.dispatch.config_portid(&view, &portid).and_then(|_| {
            for subnqn in &subnqns {
                state.dispatch.link_portid(&view, subnqn, portid.portid)?;
            }
            Ok(())
        })
    };

    let hosts = {
        let cfg = state.config.read();
        match cfg.find_target(alias) {
            Some((_, t)) => cfg.hosts_for_target(t),
            None => Vec::new(),
        }
    };
    state.publish_aen(hosts);

    result.map(|_| format!("PortID '{}' updated in Target '{}'", portid.portid, alias))
}

pub fn del_portid(state: &Arc<ManagerState>, alias: &str, id: u16) -> Result<String, ModelError> {
    let view = target_view(state, alias)?;
    state.config.write().del_portid(alias, id)?;
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    if let Err(e) = state.dispatch.del_portid(&view, id) {
        warn!("remote delete of port {} failed: {}", id, e);
    }

    let hosts = {
        let cfg = state.config.read();
        match cfg.find_target(alias) {
            Some((_, t)) => cfg.hosts_for_target(t),
            None => Vec::new(),
        }
    };
    state.publish_aen(hosts);
    Ok(format!("PortID '{}' deleted from Target '{}'", id, alias))
}

/* namespaces */

pub fn set_ns(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: &str,
    body: NsBody,
) -> Result<String, ModelError> {
    let nsid = body.nsid.ok_or_else(|| ModelError::invalid("missing NSID"))?;
    let devid = body.devid.ok_or_else(|| ModelError::invalid("missing DeviceID"))?;
    let ns = Namespace {
        nsid,
        devid,
        devnsid: if devid == NULLB_DEVID {
            0
        } else {
            body.devnsid.unwrap_or(0)
        },
    };

    let view = target_view(state, alias)?;
    if view.mgmt_mode != MgmtMode::Local && devid != NULLB_DEVID {
        let cfg = state.config.read();
        let target = cfg.target(alias)?;
        let known = target
            .nsdevs
            .iter()
            .any(|d| d.devid == ns.devid && d.nsid == ns.devnsid);
        if !known {
            return Err(ModelError::invalid("invalid ns device"));
        }
    }

    state.config.write().set_ns(alias, subnqn, ns)?;
    state.persist();

    state.dispatch.set_ns(&view, subnqn, &ns)?;
    Ok(format!("NSID '{}' updated in Subsystem '{}'", nsid, subnqn))
}

pub fn del_ns(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: &str,
    nsid: u32,
) -> Result<String, ModelError> {
    let view = target_view(state, alias)?;
    state.config.write().del_ns(alias, subnqn, nsid)?;
    state.persist();

    if let Err(e) = state.dispatch.del_ns(&view, subnqn, nsid) {
        warn!("remote delete of nsid {} failed: {}", nsid, e);
    }
    Ok(format!("NSID '{}' deleted from Subsystem '{}'", nsid, subnqn))
}

/* host links (subsystem ACLs) */

pub fn link_host(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: &str,
    host_alias: &str,
) -> Result<String, ModelError> {
    let hostnqn = {
        let mut cfg = state.config.write();
        let id = cfg.link_host(alias, subnqn, host_alias)?;
        cfg.hosts.get(id).map(|h| h.hostnqn.clone()).unwrap_or_default()
    };
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    let view = target_view(state, alias)?;
    let result = state.dispatch.link_host(&view, subnqn, &hostnqn);

    state.publish_aen(vec![hostnqn]);
    result.map(|_| format!("Host '{}' linked to Subsystem '{}'", host_alias, subnqn))
}

pub fn unlink_host(
    state: &Arc<ManagerState>,
    alias: &str,
    subnqn: &str,
    host_alias: &str,
) -> Result<String, ModelError> {
    let hostnqn = {
        let mut cfg = state.config.write();
        let id = cfg.unlink_host(alias, subnqn, host_alias)?;
        cfg.hosts.get(id).map(|h| h.hostnqn.clone()).unwrap_or_default()
    };
    state.persist();

    {
        let mut aggr = state.aggregator.lock();
        aggr.sync_target(state, alias);
    }

    let view = target_view(state, alias)?;
    if let Err(e) = state.dispatch.unlink_host(&view, subnqn, &hostnqn) {
        warn!("remote unlink of '{}' failed: {}", host_alias, e);
    }

    // drop the host from the target entirely once no ACL needs it
    let still_used = {
        let cfg = state.config.read();
        let host_id = cfg.find_host(host_alias).map(|(id, _)| id);
        match (cfg.find_target(alias), host_id) {
            (Some((_, target)), Some(hid)) => target
                .subsystems
                .iter()
                .any(|s| s.acl.contains(&hid)),
            _ => false,
        }
    };
    if !still_used {
        if let Err(e) = state.dispatch.del_host(&view, &hostnqn) {
            warn!("remote host delete of '{}' failed: {}", host_alias, e);
        }
    }

    state.publish_aen(vec![hostnqn]);
    Ok(format!("Host '{}' unlinked from Subsystem '{}'", host_alias, subnqn))
}

/* hosts */

pub fn list_hosts(state: &ManagerState) -> String {
    let cfg = state.config.read();
    let list: Vec<String> = cfg.hosts.iter().map(|(_, h)| h.alias.clone()).collect();
    json!({ "Hosts": list }).to_string()
}

pub fn show_host(state: &ManagerState, alias: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    let (_, host) = cfg
        .find_host(alias)
        .ok_or_else(|| ModelError::not_found("Host", alias))?;
    Ok(json!({ "Alias": host.alias, "HOSTNQN": host.hostnqn }).to_string())
}

pub fn add_host(state: &Arc<ManagerState>, alias: &str, body: HostBody) -> Result<String, ModelError> {
    let hostnqn = body
        .hostnqn
        .ok_or_else(|| ModelError::invalid("missing HOSTNQN"))?;
    state.config.write().add_host(alias, &hostnqn)?;
    state.persist();
    Ok(format!("Host '{}' added", alias))
}

pub fn update_host(
    state: &Arc<ManagerState>,
    alias: Option<&str>,
    body: HostBody,
) -> Result<String, ModelError> {
    let old_nqn = alias
        .and_then(|a| {
            let cfg = state.config.read();
            cfg.find_host(a).map(|(_, h)| h.hostnqn.clone())
        });

    let (name, new_nqn) = {
        let mut cfg = state.config.write();
        let id = cfg.update_host(alias, body.alias.as_deref(), body.hostnqn.as_deref())?;
        let host = cfg.hosts.get(id).cloned().unwrap_or_default();
        (host.alias, host.hostnqn)
    };
    state.persist();

    // an NQN change has to be replayed on every target the host is
    // linked to; alias changes are pure bookkeeping
    if let (Some(old), true) = (old_nqn.clone(), old_nqn.as_deref() != Some(new_nqn.as_str())) {
        let linked: Vec<(String, String)> = {
            let cfg = state.config.read();
            let hid = cfg.find_host(&name).map(|(id, _)| id);
            match hid {
                Some(hid) => cfg
                    .targets
                    .iter()
                    .flat_map(|(_, t)| {
                        t.subsystems
                            .iter()
                            .filter(|s| s.acl.contains(&hid))
                            .map(move |s| (t.alias.clone(), s.subnqn.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        for (target_alias, subnqn) in linked {
            if let Ok(view) = target_view(state, &target_alias) {
                if let Err(e) = state.dispatch.unlink_host(&view, &subnqn, &old) {
                    warn!("remote unlink of old nqn failed: {}", e);
                }
                if let Err(e) = state.dispatch.link_host(&view, &subnqn, &new_nqn) {
                    warn!("remote link of new nqn failed: {}", e);
                }
            }
        }
    }

    Ok(format!("Host '{}' updated", name))
}

pub fn del_host(state: &Arc<ManagerState>, alias: &str) -> Result<String, ModelError> {
    // collect the targets that knew this host before it goes away
    let linked: Vec<(String, String, String)> = {
        let cfg = state.config.read();
        match cfg.find_host(alias) {
            Some((hid, host)) => cfg
                .targets
                .iter()
                .flat_map(|(_, t)| {
                    let nqn = host.hostnqn.clone();
                    t.subsystems
                        .iter()
                        .filter(|s| s.acl.contains(&hid))
                        .map(move |s| (t.alias.clone(), s.subnqn.clone(), nqn.clone()))
                })
                .collect(),
            None => return Err(ModelError::not_found("Host", alias)),
        }
    };

    state.config.write().del_host(alias)?;
    state.persist();

    let mut cleaned: Vec<String> = Vec::new();
    for (target_alias, subnqn, hostnqn) in linked {
        if let Ok(view) = target_view(state, &target_alias) {
            if let Err(e) = state.dispatch.unlink_host(&view, &subnqn, &hostnqn) {
                warn!("remote unlink of '{}' failed: {}", alias, e);
            }
            if !cleaned.contains(&target_alias) {
                if let Err(e) = state.dispatch.del_host(&view, &hostnqn) {
                    warn!("remote host delete of '{}' failed: {}", alias, e);
                }
                cleaned.push(target_alias);
            }
        }
    }

    Ok(format!("Host '{}' deleted", alias))
}

/* groups */

pub fn list_groups(state: &ManagerState) -> String {
    let cfg = state.config.read();
    let list: Vec<String> = cfg.groups.iter().map(|(_, g)| g.name.clone()).collect();
    json!({ "Groups": list }).to_string()
}

pub fn show_group(state: &ManagerState, name: &str) -> Result<String, ModelError> {
    let cfg = state.config.read();
    let (_, group) = cfg
        .find_group(name)
        .ok_or_else(|| ModelError::not_found("Group", name))?;
    let targets: Vec<String> = group
        .targets
        .iter()
        .filter_map(|&id| cfg.targets.get(id))
        .map(|t| t.alias.clone())
        .collect();
    let hosts: Vec<String> = group
        .hosts
        .iter()
        .filter_map(|&id| cfg.hosts.get(id))
        .map(|h| h.alias.clone())
        .collect();
    Ok(json!({ "Name": group.name, "Targets": targets, "Hosts": hosts }).to_string())
}

pub fn add_group(state: &Arc<ManagerState>, name: &str) -> Result<String, ModelError> {
    state.config.write().add_group(name)?;
    state.persist();
    Ok(format!("Group '{}' added", name))
}

pub fn update_group(
    state: &Arc<ManagerState>,
    name: &str,
    body: GroupBody,
) -> Result<String, ModelError> {
    let new = body.name.ok_or_else(|| ModelError::invalid("missing group name"))?;
    {
        let mut cfg = state.config.write();
        if cfg.find_group(name).is_none() {
            cfg.add_group(&new)?;
        } else {
            cfg.rename_group(name, &new)?;
        }
    }
    state.persist();
    Ok(format!("Group '{}' updated", new))
}

pub fn del_group(state: &Arc<ManagerState>, name: &str) -> Result<String, ModelError> {
    state.config.write().del_group(name)?;
    state.persist();
    Ok(format!("Group '{}' deleted", name))
}

pub fn group_member(
    state: &Arc<ManagerState>,
    name: &str,
    target: Option<&str>,
    host: Option<&str>,
    link: bool,
) -> Result<String, ModelError> {
    {
        let mut cfg = state.config.write();
        match (target, host, link) {
            (Some(alias), _, true) => cfg.link_group_target(name, alias)?,
            (Some(alias), _, false) => cfg.unlink_group_target(name, alias)?,
            (_, Some(alias), true) => cfg.link_group_host(name, alias)?,
            (_, Some(alias), false) => cfg.unlink_group_host(name, alias)?,
            _ => return Err(ModelError::invalid("missing group member")),
        }
    }
    state.persist();

    let hosts = {
        let cfg = state.config.read();
        match target {
            Some(alias) => cfg.hosts_for_group(name, alias),
            None => {
                // host membership changed: that host's view changed
                host.and_then(|a| cfg.find_host(a).map(|(_, h)| vec![h.hostnqn.clone()]))
                    .unwrap_or_default()
            }
        }
    };
    state.publish_aen(hosts);

    let member = target.or(host).unwrap_or_default();
    Ok(if link {
        format!("'{}' added to Group '{}'", member, name)
    } else {
        format!("'{}' removed from Group '{}'", member, name)
    })
}
