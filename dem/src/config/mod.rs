//! The configuration model: the in-memory graph of targets, hosts and
//! groups the manager owns. Hosts, targets and groups live in arenas
//! with stable ids; cross references (ACLs, group membership) are id
//! vectors, so renames propagate without rewriting and cycles never
//! form. Everything here is pure data manipulation; persistence,
//! remote propagation and notifications happen in the layers above.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use nvmf::page::DiscLogEntry;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

pub mod store;

pub type Id = u32;
pub type HostId = Id;
pub type TargetId = Id;
pub type GroupId = Id;

/// Arena with stable ids and tombstone reuse.
#[derive(Debug, Default)]
pub struct Registry<T> {
    slots: Vec<Option<T>>,
}

impl<T> Registry<T> {
    pub fn insert(&mut self, value: T) -> Id {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return i as Id;
            }
        }
        self.slots.push(Some(value));
        (self.slots.len() - 1) as Id
    }

    pub fn get(&self, id: Id) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    pub fn remove(&mut self, id: Id) -> Option<T> {
        self.slots.get_mut(id as usize).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as Id, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as Id, v)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a target is managed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MgmtMode {
    #[serde(rename = "local", alias = "LocalMgmt")]
    Local,
    #[serde(rename = "inband", alias = "InBandMgmt")]
    InBand,
    #[serde(rename = "outofband", alias = "OutOfBandMgmt")]
    OutOfBand,
}

impl Default for MgmtMode {
    fn default() -> Self {
        MgmtMode::Local
    }
}

/// Subsystem access policy; undefined until the administrator sets it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Access {
    Undefined,
    Restricted,
    AllowAny,
}

impl Default for Access {
    fn default() -> Self {
        Access::Undefined
    }
}

impl Access {
    pub fn allows_any(self) -> bool {
        self == Access::AllowAny
    }
}

pub const PORTID_MIN: u16 = 1;
pub const PORTID_MAX: u16 = 65534;

/// Sentinel device id selecting the null block device.
pub const NULLB_DEVID: i32 = -1;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Portid {
    pub portid: u16,
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
    pub trsvcid: u16,
}

impl Portid {
    /// The declared family must parse the declared address.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.portid < PORTID_MIN {
            return Err(ModelError::invalid("portid out of range"));
        }
        if nvmf::page::trtype_of(&self.trtype).is_none() {
            return Err(ModelError::invalid(format!(
                "bad transport type '{}'",
                self.trtype
            )));
        }
        validate_address(&self.adrfam, &self.traddr)
    }
}

pub fn validate_address(adrfam: &str, traddr: &str) -> Result<(), ModelError> {
    let ok = match adrfam {
        "ipv4" => Ipv4Addr::from_str(traddr).is_ok(),
        "ipv6" => Ipv6Addr::from_str(traddr).is_ok(),
        "fc" => {
            !traddr.is_empty()
                && traddr
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '-')
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ModelError::invalid(format!(
            "bad {} address '{}'",
            adrfam, traddr
        )))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Namespace {
    pub nsid: u32,
    pub devid: i32,
    pub devnsid: u32,
}

/// Lifecycle of a cached log page entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PageState {
    New,
    Valid,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct LogPage {
    pub portid: u16,
    pub entry: DiscLogEntry,
    pub state: PageState,
}

#[derive(Debug, Default)]
pub struct Subsystem {
    pub subnqn: String,
    pub access: Access,
    pub acl: Vec<HostId>,
    pub namespaces: Vec<Namespace>,
    pub logpages: Vec<LogPage>,
}

/// A device the target reported; the valid bit is the diff mark of the
/// last inventory fetch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NsDev {
    pub devid: i32,
    pub nsid: u32,
    pub valid: bool,
}

/// A fabric interface the target reported.
#[derive(Debug, Clone, PartialEq)]
pub struct FabricIface {
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
    pub valid: bool,
}

/// Management interface of a target, mandated by its mode.
#[derive(Debug, Clone, PartialEq)]
pub enum Interface {
    None,
    Oob { address: String, port: u16 },
    Inband(Portid),
}

impl Default for Interface {
    fn default() -> Self {
        Interface::None
    }
}

/// Bound on unattached log pages kept per target; targets announcing
/// subsystems the model does not know cannot grow this without limit.
pub const UNATTACHED_CAP: usize = 64;

#[derive(Debug, Default)]
pub struct Target {
    pub alias: String,
    pub mgmt_mode: MgmtMode,
    /// log page refresh period in minutes; zero disables
    pub refresh: u32,
    pub iface: Interface,
    pub portids: Vec<Portid>,
    pub subsystems: Vec<Subsystem>,
    pub nsdevs: Vec<NsDev>,
    pub fabric_ifaces: Vec<FabricIface>,
    pub unattached: Vec<LogPage>,
}

impl Target {
    pub fn subsys(&self, subnqn: &str) -> Option<&Subsystem> {
        self.subsystems.iter().find(|s| s.subnqn == subnqn)
    }

    /// The manager's own knowledge of a target doubles as its log
    /// page: every (subsystem, portid) pair is announced even before a
    /// fetch confirms it, and locally managed targets are never
    /// fetched at all. Fetched pages take precedence by key.
    pub fn synthesize_pages(&mut self) {
        let entries: Vec<(u16, DiscLogEntry)> = self
            .portids
            .iter()
            .flat_map(|port| {
                let port = port.clone();
                self.subsystems.iter().map(move |subsys| {
                    (
                        port.portid,
                        DiscLogEntry {
                            trtype: nvmf::page::trtype_of(&port.trtype)
                                .unwrap_or(nvmf::page::TRTYPE_TCP),
                            adrfam: nvmf::page::adrfam_of(&port.adrfam)
                                .unwrap_or(nvmf::page::ADRFAM_IPV4),
                            subtype: nvmf::page::SUBTYPE_NVME,
                            portid: port.portid,
                            trsvcid: port.trsvcid.to_string(),
                            traddr: port.traddr.clone(),
                            subnqn: subsys.subnqn.clone(),
                            ..Default::default()
                        },
                    )
                })
            })
            .collect();

        for (portid, entry) in entries {
            if let Some(subsys) = self.subsys_mut(&entry.subnqn) {
                if !subsys.logpages.iter().any(|p| p.entry.same_endpoint(&entry)) {
                    subsys.logpages.push(LogPage {
                        portid,
                        entry,
                        state: PageState::Valid,
                    });
                }
            }
        }
    }

    pub fn subsys_mut(&mut self, subnqn: &str) -> Option<&mut Subsystem> {
        self.subsystems.iter_mut().find(|s| s.subnqn == subnqn)
    }

    pub fn portid(&self, id: u16) -> Option<&Portid> {
        self.portids.iter().find(|p| p.portid == id)
    }

    /// Whether any subsystem is open to every host.
    pub fn any_unrestricted(&self) -> bool {
        self.subsystems.iter().any(|s| s.access.allows_any())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostDef {
    pub alias: String,
    pub hostnqn: String,
}

#[derive(Debug, Default)]
pub struct Group {
    pub name: String,
    pub targets: Vec<TargetId>,
    pub hosts: Vec<HostId>,
}

/// The whole configuration graph.
#[derive(Debug, Default)]
pub struct Config {
    pub targets: Registry<Target>,
    pub hosts: Registry<HostDef>,
    pub groups: Registry<Group>,
}

impl Config {
    /* lookups */

    pub fn find_target(&self, alias: &str) -> Option<(TargetId, &Target)> {
        self.targets.iter().find(|(_, t)| t.alias == alias)
    }

    pub fn find_target_mut(&mut self, alias: &str) -> Option<(TargetId, &mut Target)> {
        self.targets.iter_mut().find(|(_, t)| t.alias == alias)
    }

    pub fn target(&self, alias: &str) -> Result<&Target, ModelError> {
        self.find_target(alias)
            .map(|(_, t)| t)
            .ok_or_else(|| ModelError::not_found("Target", alias))
    }

    pub fn target_mut(&mut self, alias: &str) -> Result<&mut Target, ModelError> {
        self.find_target_mut(alias)
            .map(|(_, t)| t)
            .ok_or_else(|| ModelError::not_found("Target", alias))
    }

    pub fn find_host(&self, alias: &str) -> Option<(HostId, &HostDef)> {
        self.hosts.iter().find(|(_, h)| h.alias == alias)
    }

    pub fn find_host_by_nqn(&self, nqn: &str) -> Option<(HostId, &HostDef)> {
        self.hosts.iter().find(|(_, h)| h.hostnqn == nqn)
    }

    pub fn find_group(&self, name: &str) -> Option<(GroupId, &Group)> {
        self.groups.iter().find(|(_, g)| g.name == name)
    }

    /* targets */

    pub fn add_target(&mut self, alias: &str) -> Result<TargetId, ModelError> {
        if self.find_target(alias).is_some() {
            return Err(ModelError::exists("Target", alias));
        }
        Ok(self.targets.insert(Target {
            alias: alias.to_string(),
            ..Default::default()
        }))
    }

    /// Update (or create) a target. A rename keeps every group link
    /// intact since membership is by id. Switching management mode
    /// clears or requires the interface per policy.
    pub fn update_target(
        &mut self,
        alias: Option<&str>,
        new_alias: Option<&str>,
        mgmt_mode: Option<MgmtMode>,
        refresh: Option<u32>,
        iface: Option<Interface>,
    ) -> Result<TargetId, ModelError> {
        let id = match alias {
            Some(alias) => {
                if let Some(new) = new_alias {
                    if new != alias && self.find_target(new).is_some() {
                        return Err(ModelError::exists("Target", new));
                    }
                }
                self.find_target(alias)
                    .map(|(id, _)| id)
                    .ok_or_else(|| ModelError::not_found("Target", alias))?
            }
            None => {
                let new = new_alias
                    .ok_or_else(|| ModelError::invalid("missing target alias"))?;
                self.add_target(new)?
            }
        };

        if let Some(Interface::Inband(portid)) = &iface {
            validate_address(&portid.adrfam, &portid.traddr)?;
        }

        let target = self.targets.get_mut(id).ok_or_else(|| {
            ModelError::Internal {
                reason: "target vanished".to_string(),
            }
        })?;

        if let Some(new) = new_alias {
            target.alias = new.to_string();
        }
        if let Some(refresh) = refresh {
            target.refresh = refresh;
        }
        if let Some(mode) = mgmt_mode {
            target.mgmt_mode = mode;
            match mode {
                MgmtMode::Local => target.iface = Interface::None,
                MgmtMode::OutOfBand => {
                    match &iface {
                        Some(Interface::Oob {
                            ..
                        }) => {}
                        _ => {
                            return Err(ModelError::invalid(
                                "out of band management needs an interface",
                            ))
                        }
                    }
                }
                MgmtMode::InBand => {
                    match &iface {
                        Some(Interface::Inband(_)) => {}
                        _ => {
                            return Err(ModelError::invalid(
                                "in band management needs an interface",
                            ))
                        }
                    }
                }
            }
        }
        if let Some(iface) = iface {
            if target.mgmt_mode != MgmtMode::Local {
                target.iface = iface;
            }
        }
        Ok(id)
    }

    /// Remove a target and every reference to it. The removed node is
    /// returned so the caller can run the remote reset and compute
    /// notification targets before it is dropped.
    pub fn del_target(&mut self, alias: &str) -> Result<Target, ModelError> {
        let (id, _) = self
            .find_target(alias)
            .ok_or_else(|| ModelError::not_found("Target", alias))?;
        for (_, group) in self.groups.iter_mut() {
            group.targets.retain(|&t| t != id);
        }
        self.targets
            .remove(id)
            .ok_or_else(|| ModelError::not_found("Target", alias))
    }

    /* subsystems */

    pub fn set_subsys(
        &mut self,
        alias: &str,
        subnqn: Option<&str>,
        new_nqn: Option<&str>,
        access: Option<Access>,
    ) -> Result<(), ModelError> {
        let target = self.target_mut(alias)?;
        match subnqn {
            None => {
                let nqn = new_nqn.ok_or_else(|| ModelError::invalid("missing subnqn"))?;
                if target.subsys(nqn).is_some() {
                    return Err(ModelError::exists("Subsystem", nqn));
                }
                target.subsystems.push(Subsystem {
                    subnqn: nqn.to_string(),
                    access: access.unwrap_or(Access::Undefined),
                    ..Default::default()
                });
            }
            Some(nqn) => {
                if let Some(new) = new_nqn {
                    if new != nqn && target.subsys(new).is_some() {
                        return Err(ModelError::exists("Subsystem", new));
                    }
                }
                let subsys = target
                    .subsys_mut(nqn)
                    .ok_or_else(|| ModelError::not_found("Subsystem", nqn))?;
                if let Some(new) = new_nqn {
                    subsys.subnqn = new.to_string();
                }
                if let Some(access) = access {
                    subsys.access = access;
                }
            }
        }
        Ok(())
    }

    pub fn del_subsys(&mut self, alias: &str, subnqn: &str) -> Result<Subsystem, ModelError> {
        let target = self.target_mut(alias)?;
        let idx = target
            .subsystems
            .iter()
            .position(|s| s.subnqn == subnqn)
            .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
        Ok(target.subsystems.remove(idx))
    }

    /* portids */

    /// Install or replace a port. Replacement drops the log pages the
    /// old port produced; the dispatcher relinks subsystems around the
    /// change.
    pub fn set_portid(&mut self, alias: &str, portid: Portid) -> Result<(), ModelError> {
        portid.validate()?;
        let target = self.target_mut(alias)?;
        if let Some(existing) = target
            .portids
            .iter_mut()
            .find(|p| p.portid == portid.portid)
        {
            *existing = portid.clone();
            let id = portid.portid;
            for subsys in target.subsystems.iter_mut() {
                subsys.logpages.retain(|lp| lp.portid != id);
            }
        } else {
            target.portids.push(portid);
        }
        Ok(())
    }

    pub fn del_portid(&mut self, alias: &str, id: u16) -> Result<Portid, ModelError> {
        let target = self.target_mut(alias)?;
        let idx = target
            .portids
            .iter()
            .position(|p| p.portid == id)
            .ok_or_else(|| ModelError::not_found("PortID", &id.to_string()))?;
        for subsys in target.subsystems.iter_mut() {
            subsys.logpages.retain(|lp| lp.portid != id);
        }
        target.unattached.retain(|lp| lp.portid != id);
        Ok(target.portids.remove(idx))
    }

    /* namespaces */

    pub fn set_ns(
        &mut self,
        alias: &str,
        subnqn: &str,
        ns: Namespace,
    ) -> Result<(), ModelError> {
        if ns.nsid < 1 {
            return Err(ModelError::invalid("nsid out of range"));
        }
        let target = self.target_mut(alias)?;
        let subsys = target
            .subsys_mut(subnqn)
            .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
        match subsys.namespaces.iter_mut().find(|n| n.nsid == ns.nsid) {
            Some(existing) => *existing = ns,
            None => subsys.namespaces.push(ns),
        }
        Ok(())
    }

    pub fn del_ns(&mut self, alias: &str, subnqn: &str, nsid: u32) -> Result<Namespace, ModelError> {
        let target = self.target_mut(alias)?;
        let subsys = target
            .subsys_mut(subnqn)
            .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
        let idx = subsys
            .namespaces
            .iter()
            .position(|n| n.nsid == nsid)
            .ok_or_else(|| ModelError::not_found("NSID", &nsid.to_string()))?;
        Ok(subsys.namespaces.remove(idx))
    }

    /* hosts */

    pub fn add_host(&mut self, alias: &str, hostnqn: &str) -> Result<HostId, ModelError> {
        if self.find_host(alias).is_some() {
            return Err(ModelError::exists("Host", alias));
        }
        Ok(self.hosts.insert(HostDef {
            alias: alias.to_string(),
            hostnqn: hostnqn.to_string(),
        }))
    }

    /// Rename and/or change the NQN of a host. ACL and group
    /// references follow automatically (they hold the id).
    pub fn update_host(
        &mut self,
        alias: Option<&str>,
        new_alias: Option<&str>,
        hostnqn: Option<&str>,
    ) -> Result<HostId, ModelError> {
        match alias {
            None => {
                let alias = new_alias.ok_or_else(|| ModelError::invalid("missing host alias"))?;
                let nqn = hostnqn.ok_or_else(|| ModelError::invalid("missing hostnqn"))?;
                self.add_host(alias, nqn)
            }
            Some(alias) => {
                if let Some(new) = new_alias {
                    if new != alias && self.find_host(new).is_some() {
                        return Err(ModelError::exists("Host", new));
                    }
                }
                let (id, _) = self
                    .find_host(alias)
                    .ok_or_else(|| ModelError::not_found("Host", alias))?;
                let host = self.hosts.get_mut(id).ok_or_else(|| ModelError::Internal {
                    reason: "host vanished".to_string(),
                })?;
                if let Some(new) = new_alias {
                    host.alias = new.to_string();
                }
                if let Some(nqn) = hostnqn {
                    host.hostnqn = nqn.to_string();
                }
                Ok(id)
            }
        }
    }

    /// Drop a host and scrub it from every subsystem ACL and group.
    pub fn del_host(&mut self, alias: &str) -> Result<HostDef, ModelError> {
        let (id, _) = self
            .find_host(alias)
            .ok_or_else(|| ModelError::not_found("Host", alias))?;
        for (_, target) in self.targets.iter_mut() {
            for subsys in target.subsystems.iter_mut() {
                subsys.acl.retain(|&h| h != id);
            }
        }
        for (_, group) in self.groups.iter_mut() {
            group.hosts.retain(|&h| h != id);
        }
        self.hosts
            .remove(id)
            .ok_or_else(|| ModelError::not_found("Host", alias))
    }

    /* acl */

    /// Put a host on a subsystem ACL. Duplicate links fold to a single
    /// entry.
    pub fn link_host(
        &mut self,
        alias: &str,
        subnqn: &str,
        host_alias: &str,
    ) -> Result<HostId, ModelError> {
        let host_id = self
            .find_host(host_alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Host", host_alias))?;
        let target = self.target_mut(alias)?;
        let subsys = target
            .subsys_mut(subnqn)
            .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
        if !subsys.acl.contains(&host_id) {
            subsys.acl.push(host_id);
        }
        Ok(host_id)
    }

    pub fn unlink_host(
        &mut self,
        alias: &str,
        subnqn: &str,
        host_alias: &str,
    ) -> Result<HostId, ModelError> {
        let host_id = self
            .find_host(host_alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Host", host_alias))?;
        let target = self.target_mut(alias)?;
        let subsys = target
            .subsys_mut(subnqn)
            .ok_or_else(|| ModelError::not_found("Subsystem", subnqn))?;
        subsys.acl.retain(|&h| h != host_id);
        Ok(host_id)
    }

    /* groups */

    pub fn add_group(&mut self, name: &str) -> Result<GroupId, ModelError> {
        if self.find_group(name).is_some() {
            return Err(ModelError::exists("Group", name));
        }
        Ok(self.groups.insert(Group {
            name: name.to_string(),
            ..Default::default()
        }))
    }

    pub fn rename_group(&mut self, name: &str, new_name: &str) -> Result<GroupId, ModelError> {
        if new_name != name && self.find_group(new_name).is_some() {
            return Err(ModelError::exists("Group", new_name));
        }
        let (id, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        if let Some(group) = self.groups.get_mut(id) {
            group.name = new_name.to_string();
        }
        Ok(id)
    }

    pub fn del_group(&mut self, name: &str) -> Result<Group, ModelError> {
        let (id, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        self.groups
            .remove(id)
            .ok_or_else(|| ModelError::not_found("Group", name))
    }

    pub fn link_group_target(&mut self, name: &str, alias: &str) -> Result<(), ModelError> {
        let target_id = self
            .find_target(alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Target", alias))?;
        let (gid, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        let group = self.groups.get_mut(gid).ok_or_else(|| ModelError::Internal {
            reason: "group vanished".to_string(),
        })?;
        if !group.targets.contains(&target_id) {
            group.targets.push(target_id);
        }
        Ok(())
    }

    pub fn unlink_group_target(&mut self, name: &str, alias: &str) -> Result<(), ModelError> {
        let target_id = self
            .find_target(alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Target", alias))?;
        let (gid, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        if let Some(group) = self.groups.get_mut(gid) {
            group.targets.retain(|&t| t != target_id);
        }
        Ok(())
    }

    pub fn link_group_host(&mut self, name: &str, alias: &str) -> Result<(), ModelError> {
        let host_id = self
            .find_host(alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Host", alias))?;
        let (gid, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        let group = self.groups.get_mut(gid).ok_or_else(|| ModelError::Internal {
            reason: "group vanished".to_string(),
        })?;
        if !group.hosts.contains(&host_id) {
            group.hosts.push(host_id);
        }
        Ok(())
    }

    pub fn unlink_group_host(&mut self, name: &str, alias: &str) -> Result<(), ModelError> {
        let host_id = self
            .find_host(alias)
            .map(|(id, _)| id)
            .ok_or_else(|| ModelError::not_found("Host", alias))?;
        let (gid, _) = self
            .find_group(name)
            .ok_or_else(|| ModelError::not_found("Group", name))?;
        if let Some(group) = self.groups.get_mut(gid) {
            group.hosts.retain(|&h| h != host_id);
        }
        Ok(())
    }

    /* filtering */

    /// Does this host (by id) share a group with this target?
    pub fn shared_group(&self, target_id: TargetId, host_id: HostId) -> bool {
        self.groups
            .iter()
            .any(|(_, g)| g.hosts.contains(&host_id) && g.targets.contains(&target_id))
    }

    /// The log page entries a connecting host may see: an entry shows
    /// if its subsystem allows any host, if the host NQN is on the
    /// ACL, or if the host shares a group with the target.
    pub fn visible_entries(&self, hostnqn: &str) -> Vec<DiscLogEntry> {
        let host = self.find_host_by_nqn(hostnqn).map(|(id, _)| id);
        let mut out = Vec::new();
        for (tid, target) in self.targets.iter() {
            for subsys in &target.subsystems {
                let visible = subsys.access.allows_any()
                    || host
                        .map(|hid| {
                            subsys.acl.contains(&hid) || self.shared_group(tid, hid)
                        })
                        .unwrap_or(false);
                if !visible {
                    continue;
                }
                for page in &subsys.logpages {
                    if page.state != PageState::Deleted {
                        out.push(page.entry.clone());
                    }
                }
            }
        }
        out
    }

    /* notification scopes */

    fn all_host_nqns(&self) -> Vec<String> {
        self.hosts.iter().map(|(_, h)| h.hostnqn.clone()).collect()
    }

    fn acl_nqns(&self, subsys: &Subsystem) -> Vec<String> {
        subsys
            .acl
            .iter()
            .filter_map(|&id| self.hosts.get(id))
            .map(|h| h.hostnqn.clone())
            .collect()
    }

    /// Hosts whose view changes with this subsystem.
    pub fn hosts_for_subsys(&self, subsys: &Subsystem) -> Vec<String> {
        if subsys.access.allows_any() {
            self.all_host_nqns()
        } else {
            self.acl_nqns(subsys)
        }
    }

    /// Hosts whose view changes with this target.
    pub fn hosts_for_target(&self, target: &Target) -> Vec<String> {
        if target.any_unrestricted() {
            return self.all_host_nqns();
        }
        let mut out = Vec::new();
        for subsys in &target.subsystems {
            for nqn in self.acl_nqns(subsys) {
                if !out.contains(&nqn) {
                    out.push(nqn);
                }
            }
        }
        out
    }

    /// Hosts whose view changes when group membership around this
    /// target changes: group members, widened to everyone the target
    /// exposes unrestricted subsystems to.
    pub fn hosts_for_group(&self, name: &str, target_alias: &str) -> Vec<String> {
        let group = match self.find_group(name) {
            Some((_, g)) => g,
            None => return Vec::new(),
        };
        let members: Vec<String> = group
            .hosts
            .iter()
            .filter_map(|&id| self.hosts.get(id))
            .map(|h| h.hostnqn.clone())
            .collect();
        if members.is_empty() {
            return members;
        }
        let target = match self.find_target(target_alias) {
            Some((_, t)) => t,
            None => return members,
        };
        if target.any_unrestricted() {
            return members;
        }
        let mut out = Vec::new();
        for subsys in &target.subsystems {
            for nqn in self.acl_nqns(subsys) {
                if members.contains(&nqn) && !out.contains(&nqn) {
                    out.push(nqn);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_target() -> Config {
        let mut cfg = Config::default();
        cfg.add_target("t1").unwrap();
        cfg.set_subsys("t1", None, Some("nqn.x"), Some(Access::Restricted))
            .unwrap();
        cfg.set_portid(
            "t1",
            Portid {
                portid: 1,
                trtype: "tcp".to_string(),
                adrfam: "ipv4".to_string(),
                traddr: "10.0.0.1".to_string(),
                trsvcid: 4420,
            },
        )
        .unwrap();
        cfg
    }

    fn page(portid: u16) -> LogPage {
        LogPage {
            portid,
            entry: DiscLogEntry {
                portid,
                subnqn: "nqn.x".to_string(),
                traddr: "10.0.0.1".to_string(),
                trsvcid: "4420".to_string(),
                ..Default::default()
            },
            state: PageState::Valid,
        }
    }

    #[test]
    fn duplicate_create_does_not_mutate() {
        let mut cfg = cfg_with_target();
        assert!(matches!(
            cfg.add_target("t1"),
            Err(ModelError::Exists { .. })
        ));
        assert_eq!(cfg.targets.len(), 1);

        assert!(matches!(
            cfg.set_subsys("t1", None, Some("nqn.x"), None),
            Err(ModelError::Exists { .. })
        ));
        assert_eq!(cfg.target("t1").unwrap().subsystems.len(), 1);
    }

    #[test]
    fn portid_boundaries() {
        let mut cfg = cfg_with_target();
        let bad = Portid {
            portid: 0,
            trtype: "tcp".to_string(),
            adrfam: "ipv4".to_string(),
            traddr: "10.0.0.1".to_string(),
            trsvcid: 4420,
        };
        assert!(cfg.set_portid("t1", bad).is_err());

        let bad_addr = Portid {
            portid: 2,
            trtype: "tcp".to_string(),
            adrfam: "ipv4".to_string(),
            traddr: "not-an-ip".to_string(),
            trsvcid: 4420,
        };
        assert!(cfg.set_portid("t1", bad_addr).is_err());

        let v6_as_v4 = Portid {
            portid: 2,
            trtype: "tcp".to_string(),
            adrfam: "ipv4".to_string(),
            traddr: "::1".to_string(),
            trsvcid: 4420,
        };
        assert!(cfg.set_portid("t1", v6_as_v4).is_err());
    }

    #[test]
    fn nsid_boundaries() {
        let mut cfg = cfg_with_target();
        assert!(cfg
            .set_ns(
                "t1",
                "nqn.x",
                Namespace {
                    nsid: 0,
                    devid: 0,
                    devnsid: 0,
                }
            )
            .is_err());
        assert!(cfg
            .set_ns(
                "t1",
                "nqn.x",
                Namespace {
                    nsid: 1,
                    devid: NULLB_DEVID,
                    devnsid: 0,
                }
            )
            .is_ok());
    }

    #[test]
    fn link_host_is_idempotent() {
        let mut cfg = cfg_with_target();
        cfg.add_host("h1", "nqn.h1").unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        assert_eq!(cfg.target("t1").unwrap().subsys("nqn.x").unwrap().acl.len(), 1);
    }

    #[test]
    fn host_delete_cascades() {
        let mut cfg = cfg_with_target();
        cfg.add_host("h1", "nqn.h1").unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        cfg.add_group("g1").unwrap();
        cfg.link_group_host("g1", "h1").unwrap();

        cfg.del_host("h1").unwrap();
        assert!(cfg.target("t1").unwrap().subsys("nqn.x").unwrap().acl.is_empty());
        assert!(cfg.find_group("g1").unwrap().1.hosts.is_empty());
    }

    #[test]
    fn target_delete_cascades() {
        let mut cfg = cfg_with_target();
        cfg.add_group("g1").unwrap();
        cfg.link_group_target("g1", "t1").unwrap();

        let gone = cfg.del_target("t1").unwrap();
        assert_eq!(gone.subsystems.len(), 1);
        assert!(cfg.find_target("t1").is_none());
        assert!(cfg.find_group("g1").unwrap().1.targets.is_empty());
    }

    #[test]
    fn host_rename_follows_references() {
        let mut cfg = cfg_with_target();
        cfg.add_host("h1", "nqn.h1").unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        cfg.add_group("g1").unwrap();
        cfg.link_group_host("g1", "h1").unwrap();

        cfg.update_host(Some("h1"), Some("h2"), None).unwrap();

        // references hold the id, so resolution yields the new alias
        let (hid, host) = cfg.find_host("h2").unwrap();
        assert_eq!(host.hostnqn, "nqn.h1");
        assert!(cfg
            .target("t1")
            .unwrap()
            .subsys("nqn.x")
            .unwrap()
            .acl
            .contains(&hid));
        assert!(cfg.find_group("g1").unwrap().1.hosts.contains(&hid));
        assert!(cfg.find_host("h1").is_none());
    }

    #[test]
    fn filter_allow_any_acl_and_group() {
        let mut cfg = cfg_with_target();
        cfg.target_mut("t1").unwrap().subsys_mut("nqn.x").unwrap().logpages
            .push(page(1));
        cfg.add_host("h1", "nqn.h1").unwrap();

        // restricted, no ACL entry: nothing visible
        assert!(cfg.visible_entries("nqn.h1").is_empty());

        // on the ACL: visible
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        assert_eq!(cfg.visible_entries("nqn.h1").len(), 1);

        // off the ACL but sharing a group: still visible
        cfg.unlink_host("t1", "nqn.x", "h1").unwrap();
        assert!(cfg.visible_entries("nqn.h1").is_empty());
        cfg.add_group("g1").unwrap();
        cfg.link_group_host("g1", "h1").unwrap();
        cfg.link_group_target("g1", "t1").unwrap();
        assert_eq!(cfg.visible_entries("nqn.h1").len(), 1);

        // allow-any beats everything, even for unknown hosts
        cfg.set_subsys("t1", Some("nqn.x"), None, Some(Access::AllowAny))
            .unwrap();
        assert_eq!(cfg.visible_entries("nqn.unknown").len(), 1);
    }

    #[test]
    fn notification_scopes() {
        let mut cfg = cfg_with_target();
        cfg.add_host("h1", "nqn.h1").unwrap();
        cfg.add_host("h2", "nqn.h2").unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();

        let subsys_hosts = {
            let target = cfg.target("t1").unwrap();
            cfg.hosts_for_subsys(target.subsys("nqn.x").unwrap())
        };
        assert_eq!(subsys_hosts, vec!["nqn.h1".to_string()]);

        cfg.set_subsys("t1", Some("nqn.x"), None, Some(Access::AllowAny))
            .unwrap();
        let subsys_hosts = {
            let target = cfg.target("t1").unwrap();
            cfg.hosts_for_subsys(target.subsys("nqn.x").unwrap())
        };
        assert_eq!(subsys_hosts.len(), 2);
    }

    #[test]
    fn portid_replacement_drops_stale_pages() {
        let mut cfg = cfg_with_target();
        cfg.target_mut("t1").unwrap().subsys_mut("nqn.x").unwrap().logpages
            .push(page(1));
        cfg.set_portid(
            "t1",
            Portid {
                portid: 1,
                trtype: "tcp".to_string(),
                adrfam: "ipv4".to_string(),
                traddr: "10.0.0.9".to_string(),
                trsvcid: 4420,
            },
        )
        .unwrap();
        assert!(cfg
            .target("t1")
            .unwrap()
            .subsys("nqn.x")
            .unwrap()
            .logpages
            .is_empty());
    }
}
