//! Propagation dispatcher: reflects every model mutation onto the
//! owning target, either through its out-of-band REST agent or through
//! an in-band admin connection to its self-config controller. Locally
//! managed targets take no propagation at all.
//!
//! Failures here never roll the model back; the model is the intent,
//! and reconciliation happens on the next inventory refresh.

use std::collections::HashMap;
use std::time::Duration;

use nvmf::{
    ctrl::{CtrlQueue, PortRef},
    error::NvmeError,
    page::{
        self,
        HostConfigEntry,
        LinkHostEntry,
        LinkPortEntry,
        NsConfigEntry,
        NsDeviceEntry,
        PortConfigEntry,
        SubsysConfigEntry,
        XportEntry,
    },
    types::resource,
    PAGE_SIZE,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    config::{Interface, MgmtMode, Namespace, Portid, NULLB_DEVID},
    error::ModelError,
};

/// Host NQN the manager presents on self-config admin connections.
const MGMT_HOSTNQN: &str = "nqn.2014-08.org.nvmexpress:dem-mgmt";

const OOB_TIMEOUT: u64 = 10;

/// The slice of a target the dispatcher needs for routing.
#[derive(Debug, Clone)]
pub struct TargetView {
    pub alias: String,
    pub mgmt_mode: MgmtMode,
    pub iface: Interface,
}

/// A subsystem flattened for remote programming.
#[derive(Debug, Clone)]
pub struct SubsysSnapshot {
    pub subnqn: String,
    pub allow_any: bool,
    pub acl_nqns: Vec<String>,
    pub namespaces: Vec<Namespace>,
}

/// A full target flattened for initial programming.
#[derive(Debug, Clone)]
pub struct TargetSnapshot {
    pub view: TargetView,
    pub portids: Vec<Portid>,
    pub subsystems: Vec<SubsysSnapshot>,
}

fn remote(e: impl std::fmt::Display) -> ModelError {
    ModelError::Remote {
        reason: e.to_string(),
    }
}

fn onwire_devid(devid: i32) -> u32 {
    if devid == NULLB_DEVID {
        page::NULLB_ONWIRE_DEVID
    } else {
        devid as u32
    }
}

#[derive(Default)]
pub struct Dispatcher {
    // built lazily on a worker thread; the blocking client must not be
    // touched from the async executor
    client: OnceCell<reqwest::blocking::Client>,
    inband: Mutex<HashMap<String, CtrlQueue>>,
}

impl Dispatcher {
    fn client(&self) -> &reqwest::blocking::Client {
        self.client.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(OOB_TIMEOUT))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new())
        })
    }

    /* out of band primitives */

    fn oob_base(view: &TargetView) -> Result<String, ModelError> {
        match &view.iface {
            Interface::Oob {
                address,
                port,
            } => Ok(format!("http://{}:{}", address, port)),
            _ => Err(ModelError::invalid(format!(
                "target '{}' has no out of band interface",
                view.alias
            ))),
        }
    }

    fn exec_post(&self, url: &str, body: serde_json::Value) -> Result<(), ModelError> {
        debug!("POST {}", url);
        let rsp = self.client().post(url).json(&body).send().map_err(remote)?;
        if !rsp.status().is_success() {
            return Err(remote(format!("{} returned {}", url, rsp.status())));
        }
        Ok(())
    }

    fn exec_delete(&self, url: &str) -> Result<(), ModelError> {
        debug!("DELETE {}", url);
        let rsp = self.client().delete(url).send().map_err(remote)?;
        if !rsp.status().is_success() {
            return Err(remote(format!("{} returned {}", url, rsp.status())));
        }
        Ok(())
    }

    fn exec_get(&self, url: &str) -> Result<String, ModelError> {
        debug!("GET {}", url);
        let rsp = self.client().get(url).send().map_err(remote)?;
        if !rsp.status().is_success() {
            return Err(remote(format!("{} returned {}", url, rsp.status())));
        }
        rsp.text().map_err(remote)
    }

    /* in band primitives */

    fn inband_portref(view: &TargetView) -> Result<PortRef, ModelError> {
        match &view.iface {
            Interface::Inband(p) => Ok(PortRef {
                portid: p.portid,
                trtype: p.trtype.clone(),
                adrfam: p.adrfam.clone(),
                traddr: p.traddr.clone(),
                trsvcid: p.trsvcid,
            }),
            _ => Err(ModelError::invalid(format!(
                "target '{}' has no in band interface",
                view.alias
            ))),
        }
    }

    /// Run an op on the target's admin queue, reconnecting and
    /// retrying once when the cached connection went stale.
    fn with_inband<T>(
        &self,
        view: &TargetView,
        op: impl Fn(&mut CtrlQueue) -> Result<T, NvmeError>,
    ) -> Result<T, ModelError> {
        let portref = Self::inband_portref(view)?;
        let mut map = self.inband.lock();
        let queue = map
            .entry(view.alias.clone())
            .or_insert_with(|| CtrlQueue::new(portref, MGMT_HOSTNQN));

        if queue.connected {
            match op(queue) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!("in-band op to '{}' failed ({}), reconnecting", view.alias, e);
                    queue.disconnect(false);
                }
            }
        }
        queue.connect().map_err(remote)?;
        op(queue).map_err(remote)
    }

    /// Drop a cached admin connection (target deleted or address
    /// changed).
    pub fn forget(&self, alias: &str) {
        if let Some(mut queue) = self.inband.lock().remove(alias) {
            queue.disconnect(true);
        }
    }

    /// Periodic keep-alive on a cached admin connection; a failure
    /// marks it disconnected so the next op reconnects.
    pub fn keep_alive(&self, alias: &str) {
        let mut map = self.inband.lock();
        if let Some(queue) = map.get_mut(alias) {
            if queue.connected {
                if let Err(e) = queue.keep_alive() {
                    warn!("management keep alive failed for '{}': {}", alias, e);
                    queue.disconnect(false);
                }
            }
        }
    }

    /* per-mutation operations */

    pub fn config_portid(&self, view: &TargetView, portid: &Portid) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_post(
                    &format!("{}/portid/{}", base, portid.portid),
                    json!({
                        "TRTYPE": portid.trtype,
                        "ADRFAM": portid.adrfam,
                        "TRADDR": portid.traddr,
                        "TRSVCID": portid.trsvcid,
                    }),
                )
            }
            MgmtMode::InBand => {
                let entry = PortConfigEntry {
                    portid: portid.portid as u32,
                    treq: page::TREQ_NOT_REQUIRED,
                    trtype: page::trtype_of(&portid.trtype).unwrap_or(page::TRTYPE_TCP),
                    adrfam: page::adrfam_of(&portid.adrfam).unwrap_or(page::ADRFAM_IPV4),
                    traddr: portid.traddr.clone(),
                    trsvcid: portid.trsvcid.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::PORT_CONFIG, &entry.to_bytes())
                })
            }
        }
    }

    pub fn del_portid(&self, view: &TargetView, portid: u16) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/portid/{}", base, portid))
            }
            MgmtMode::InBand => {
                let entry = LinkPortEntry {
                    subnqn: String::new(),
                    portid: portid as u32,
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::DEL_PORT, &entry.to_bytes())
                })
            }
        }
    }

    pub fn config_subsys(
        &self,
        view: &TargetView,
        subsys: &SubsysSnapshot,
        portids: &[Portid],
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_post(
                    &format!("{}/subsystem", base),
                    json!({
                        "SUBNQN": subsys.subnqn,
                        "AllowAnyHost": subsys.allow_any as i32,
                    }),
                )?;
                for ns in &subsys.namespaces {
                    self.set_ns(view, &subsys.subnqn, ns)?;
                }
                for nqn in &subsys.acl_nqns {
                    self.link_host(view, &subsys.subnqn, nqn)?;
                }
                for portid in portids {
                    self.link_portid(view, &subsys.subnqn, portid.portid)?;
                }
                Ok(())
            }
            MgmtMode::InBand => {
                let entry = SubsysConfigEntry {
                    allowanyhost: subsys.allow_any as u32,
                    subnqn: subsys.subnqn.clone(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::SUBSYS_CONFIG, &entry.to_bytes())
                })?;
                for ns in &subsys.namespaces {
                    self.set_ns(view, &subsys.subnqn, ns)?;
                }
                for nqn in &subsys.acl_nqns {
                    self.link_host(view, &subsys.subnqn, nqn)?;
                }
                for portid in portids {
                    self.link_portid(view, &subsys.subnqn, portid.portid)?;
                }
                Ok(())
            }
        }
    }

    pub fn del_subsys(&self, view: &TargetView, subnqn: &str) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/subsystem/{}", base, subnqn))
            }
            MgmtMode::InBand => {
                let entry = SubsysConfigEntry {
                    allowanyhost: 0,
                    subnqn: subnqn.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::DEL_SUBSYS, &entry.to_bytes())
                })
            }
        }
    }

    pub fn link_host(
        &self,
        view: &TargetView,
        subnqn: &str,
        hostnqn: &str,
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                let body = json!({ "HOSTNQN": hostnqn });
                self.exec_post(&format!("{}/host", base), body.clone())?;
                self.exec_post(&format!("{}/subsystem/{}/host", base, subnqn), body)
            }
            MgmtMode::InBand => {
                let host = HostConfigEntry {
                    hostnqn: hostnqn.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::HOST_CONFIG, &host.to_bytes())
                })?;
                let link = LinkHostEntry {
                    subnqn: subnqn.to_string(),
                    hostnqn: hostnqn.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::LINK_HOST, &link.to_bytes())
                })
            }
        }
    }

    pub fn unlink_host(
        &self,
        view: &TargetView,
        subnqn: &str,
        hostnqn: &str,
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/subsystem/{}/host/{}", base, subnqn, hostnqn))
            }
            MgmtMode::InBand => {
                let link = LinkHostEntry {
                    subnqn: subnqn.to_string(),
                    hostnqn: hostnqn.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::UNLINK_HOST, &link.to_bytes())
                })
            }
        }
    }

    pub fn del_host(&self, view: &TargetView, hostnqn: &str) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/host/{}", base, hostnqn))
            }
            MgmtMode::InBand => {
                let entry = HostConfigEntry {
                    hostnqn: hostnqn.to_string(),
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::DEL_HOST, &entry.to_bytes())
                })
            }
        }
    }

    pub fn set_ns(
        &self,
        view: &TargetView,
        subnqn: &str,
        ns: &Namespace,
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_post(
                    &format!("{}/subsystem/{}/ns/{}", base, subnqn, ns.nsid),
                    json!({
                        "NSID": ns.nsid,
                        "DeviceID": ns.devid,
                        "DeviceNSID": ns.devnsid,
                    }),
                )
            }
            MgmtMode::InBand => {
                let entry = NsConfigEntry {
                    subnqn: subnqn.to_string(),
                    nsid: ns.nsid,
                    deviceid: onwire_devid(ns.devid),
                    devicensid: ns.devnsid,
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::NS_CONFIG, &entry.to_bytes())
                })
            }
        }
    }

    pub fn del_ns(&self, view: &TargetView, subnqn: &str, nsid: u32) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/subsystem/{}/ns/{}", base, subnqn, nsid))
            }
            MgmtMode::InBand => {
                let entry = NsConfigEntry {
                    subnqn: subnqn.to_string(),
                    nsid,
                    deviceid: 0,
                    devicensid: 0,
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::DEL_NS, &entry.to_bytes())
                })
            }
        }
    }

    pub fn link_portid(
        &self,
        view: &TargetView,
        subnqn: &str,
        portid: u16,
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_post(
                    &format!("{}/subsystem/{}/portid", base, subnqn),
                    json!({ "PORTID": portid }),
                )
            }
            MgmtMode::InBand => {
                let entry = LinkPortEntry {
                    subnqn: subnqn.to_string(),
                    portid: portid as u32,
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::LINK_PORT, &entry.to_bytes())
                })
            }
        }
    }

    pub fn unlink_portid(
        &self,
        view: &TargetView,
        subnqn: &str,
        portid: u16,
    ) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/subsystem/{}/portid/{}", base, subnqn, portid))
            }
            MgmtMode::InBand => {
                let entry = LinkPortEntry {
                    subnqn: subnqn.to_string(),
                    portid: portid as u32,
                };
                self.with_inband(view, |q| {
                    q.resource_config_set(resource::UNLINK_PORT, &entry.to_bytes())
                })
            }
        }
    }

    /// Program a whole target (first contact, or reconfigure).
    pub fn config_target(&self, snap: &TargetSnapshot) -> Result<(), ModelError> {
        if snap.view.mgmt_mode == MgmtMode::Local {
            return Ok(());
        }
        info!("programming target '{}'", snap.view.alias);
        for portid in &snap.portids {
            self.config_portid(&snap.view, portid)?;
        }
        for subsys in &snap.subsystems {
            self.config_subsys(&snap.view, subsys, &snap.portids)?;
        }
        Ok(())
    }

    /// Pull the target's NS device and fabric interface inventories.
    pub fn get_config(
        &self,
        view: &TargetView,
    ) -> Result<(Vec<NsDeviceEntry>, Vec<XportEntry>), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok((Vec::new(), Vec::new())),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                let devs: serde_json::Value =
                    serde_json::from_str(&self.exec_get(&format!("{}/nsdev", base))?)?;
                let xports: serde_json::Value =
                    serde_json::from_str(&self.exec_get(&format!("{}/interface", base))?)?;

                let devs = devs["NSDevices"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .map(|d| NsDeviceEntry {
                                devid: d["DeviceID"].as_u64().unwrap_or(0) as u32,
                                nsid: d["NSID"].as_u64().unwrap_or(0) as u32,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let xports = xports["Interfaces"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .map(|x| XportEntry {
                                trtype: page::trtype_of(
                                    x["TRTYPE"].as_str().unwrap_or(""),
                                )
                                .unwrap_or(0),
                                adrfam: page::adrfam_of(
                                    x["ADRFAM"].as_str().unwrap_or(""),
                                )
                                .unwrap_or(0),
                                traddr: x["TRADDR"].as_str().unwrap_or("").to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((devs, xports))
            }
            MgmtMode::InBand => {
                let devs = self.with_inband(view, |q| {
                    q.resource_config_get(resource::GET_NS_CONFIG, PAGE_SIZE)
                })?;
                let xports = self.with_inband(view, |q| {
                    q.resource_config_get(resource::GET_XPORT_CONFIG, PAGE_SIZE)
                })?;
                Ok((page::parse_ns_devices(&devs), page::parse_xports(&xports)))
            }
        }
    }

    /// Wipe the remote configuration (target delete / reconfigure).
    pub fn reset_target(&self, view: &TargetView) -> Result<(), ModelError> {
        match view.mgmt_mode {
            MgmtMode::Local => Ok(()),
            MgmtMode::OutOfBand => {
                let base = Self::oob_base(view)?;
                self.exec_delete(&format!("{}/config", base))
            }
            MgmtMode::InBand => self.with_inband(view, |q| q.resource_config_reset()),
        }
    }
}
