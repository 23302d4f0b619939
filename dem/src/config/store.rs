//! Persistence of the configuration graph: one JSON file whose layout
//! is the external contract. The in-memory model is authoritative; the
//! file is rewritten whole (write to a temp file, atomic rename) after
//! every successful mutation, and a failed dump never rolls the model
//! back.

use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    Access,
    Config,
    FabricIface,
    Interface,
    MgmtMode,
    Namespace,
    NsDev,
    Portid,
    Subsystem,
};
use crate::error::ModelError;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonRoot {
    #[serde(rename = "Targets", default)]
    pub targets: Vec<JsonTarget>,
    #[serde(rename = "Hosts", default)]
    pub hosts: Vec<JsonHost>,
    #[serde(rename = "Groups", default)]
    pub groups: Vec<JsonGroup>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonHost {
    #[serde(rename = "Alias", alias = "alias")]
    pub alias: String,
    #[serde(rename = "HOSTNQN", alias = "hostnqn", default)]
    pub hostnqn: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonGroup {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    #[serde(rename = "Targets", default)]
    pub targets: Vec<String>,
    #[serde(rename = "Hosts", default)]
    pub hosts: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonTarget {
    #[serde(rename = "Alias", alias = "alias")]
    pub alias: String,
    #[serde(rename = "MgmtMode", alias = "mgmt_mode", default)]
    pub mgmt_mode: MgmtMode,
    #[serde(rename = "Refresh", alias = "refresh", default)]
    pub refresh: u32,
    #[serde(rename = "Interface", alias = "interface", skip_serializing_if = "Option::is_none")]
    pub interface: Option<JsonIface>,
    #[serde(rename = "PortIDs", default)]
    pub portids: Vec<JsonPortid>,
    #[serde(rename = "Subsystems", default)]
    pub subsystems: Vec<JsonSubsys>,
    #[serde(rename = "NSDevices", default)]
    pub nsdevices: Vec<JsonNsDev>,
    #[serde(rename = "Interfaces", default)]
    pub interfaces: Vec<JsonXport>,
}

/// Management interface; which fields apply depends on the mode.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonIface {
    #[serde(rename = "IFADDRESS", alias = "ifaddress", skip_serializing_if = "Option::is_none")]
    pub ifaddress: Option<String>,
    #[serde(rename = "IFPORT", alias = "ifport", skip_serializing_if = "Option::is_none")]
    pub ifport: Option<u16>,
    #[serde(rename = "TRTYPE", alias = "type", skip_serializing_if = "Option::is_none")]
    pub trtype: Option<String>,
    #[serde(rename = "ADRFAM", alias = "family", skip_serializing_if = "Option::is_none")]
    pub adrfam: Option<String>,
    #[serde(rename = "TRADDR", alias = "address", skip_serializing_if = "Option::is_none")]
    pub traddr: Option<String>,
    #[serde(rename = "TRSVCID", alias = "trsvcid", skip_serializing_if = "Option::is_none")]
    pub trsvcid: Option<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonPortid {
    #[serde(rename = "PORTID", alias = "portid")]
    pub portid: u16,
    #[serde(rename = "TRTYPE", alias = "type", default)]
    pub trtype: String,
    #[serde(rename = "ADRFAM", alias = "family", default)]
    pub adrfam: String,
    #[serde(rename = "TRADDR", alias = "address", default)]
    pub traddr: String,
    #[serde(rename = "TRSVCID", alias = "trsvcid", default)]
    pub trsvcid: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonSubsys {
    #[serde(rename = "SUBNQN", alias = "subnqn")]
    pub subnqn: String,
    #[serde(rename = "AllowAnyHost", alias = "allow_any", skip_serializing_if = "Option::is_none")]
    pub allow_any: Option<i32>,
    #[serde(rename = "Hosts", default)]
    pub hosts: Vec<String>,
    #[serde(rename = "NSIDs", default)]
    pub nsids: Vec<JsonNs>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonNs {
    #[serde(rename = "NSID", alias = "nsid")]
    pub nsid: u32,
    #[serde(rename = "DeviceID", alias = "devid", default)]
    pub devid: i32,
    #[serde(rename = "DeviceNSID", alias = "devnsid", default)]
    pub devnsid: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonNsDev {
    #[serde(rename = "DeviceID")]
    pub devid: i32,
    #[serde(rename = "NSID")]
    pub nsid: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JsonXport {
    #[serde(rename = "TRTYPE", default)]
    pub trtype: String,
    #[serde(rename = "ADRFAM", default)]
    pub adrfam: String,
    #[serde(rename = "TRADDR", default)]
    pub traddr: String,
}

fn iface_to_json(iface: &Interface) -> Option<JsonIface> {
    match iface {
        Interface::None => None,
        Interface::Oob {
            address,
            port,
        } => Some(JsonIface {
            ifaddress: Some(address.clone()),
            ifport: Some(*port),
            ..Default::default()
        }),
        Interface::Inband(portid) => Some(JsonIface {
            trtype: Some(portid.trtype.clone()),
            adrfam: Some(portid.adrfam.clone()),
            traddr: Some(portid.traddr.clone()),
            trsvcid: Some(portid.trsvcid),
            ..Default::default()
        }),
    }
}

fn iface_from_json(mode: MgmtMode, iface: Option<&JsonIface>) -> Interface {
    match (mode, iface) {
        (MgmtMode::OutOfBand, Some(j)) => match (&j.ifaddress, j.ifport) {
            (Some(addr), Some(port)) => Interface::Oob {
                address: addr.clone(),
                port,
            },
            _ => Interface::None,
        },
        (MgmtMode::InBand, Some(j)) => Interface::Inband(Portid {
            portid: 0,
            trtype: j.trtype.clone().unwrap_or_default(),
            adrfam: j.adrfam.clone().unwrap_or_default(),
            traddr: j.traddr.clone().unwrap_or_default(),
            trsvcid: j.trsvcid.unwrap_or(4420),
        }),
        _ => Interface::None,
    }
}

/// Project the model onto the persisted layout.
pub fn to_json(cfg: &Config) -> JsonRoot {
    let mut root = JsonRoot::default();

    for (_, host) in cfg.hosts.iter() {
        root.hosts.push(JsonHost {
            alias: host.alias.clone(),
            hostnqn: host.hostnqn.clone(),
        });
    }

    for (_, group) in cfg.groups.iter() {
        root.groups.push(JsonGroup {
            name: group.name.clone(),
            targets: group
                .targets
                .iter()
                .filter_map(|&id| cfg.targets.get(id))
                .map(|t| t.alias.clone())
                .collect(),
            hosts: group
                .hosts
                .iter()
                .filter_map(|&id| cfg.hosts.get(id))
                .map(|h| h.alias.clone())
                .collect(),
        });
    }

    for (_, target) in cfg.targets.iter() {
        let mut jt = JsonTarget {
            alias: target.alias.clone(),
            mgmt_mode: target.mgmt_mode,
            refresh: target.refresh,
            interface: iface_to_json(&target.iface),
            ..Default::default()
        };
        for portid in &target.portids {
            jt.portids.push(JsonPortid {
                portid: portid.portid,
                trtype: portid.trtype.clone(),
                adrfam: portid.adrfam.clone(),
                traddr: portid.traddr.clone(),
                trsvcid: portid.trsvcid,
            });
        }
        for subsys in &target.subsystems {
            jt.subsystems.push(JsonSubsys {
                subnqn: subsys.subnqn.clone(),
                allow_any: match subsys.access {
                    Access::Undefined => None,
                    Access::Restricted => Some(0),
                    Access::AllowAny => Some(1),
                },
                hosts: subsys
                    .acl
                    .iter()
                    .filter_map(|&id| cfg.hosts.get(id))
                    .map(|h| h.alias.clone())
                    .collect(),
                nsids: subsys
                    .namespaces
                    .iter()
                    .map(|ns| JsonNs {
                        nsid: ns.nsid,
                        devid: ns.devid,
                        devnsid: ns.devnsid,
                    })
                    .collect(),
            });
        }
        for dev in &target.nsdevs {
            jt.nsdevices.push(JsonNsDev {
                devid: dev.devid,
                nsid: dev.nsid,
            });
        }
        for xport in &target.fabric_ifaces {
            jt.interfaces.push(JsonXport {
                trtype: xport.trtype.clone(),
                adrfam: xport.adrfam.clone(),
                traddr: xport.traddr.clone(),
            });
        }
        root.targets.push(jt);
    }
    root
}

/// Rebuild the model from the persisted layout. Hosts load first so
/// ACL and group references resolve; unknown aliases are dropped with
/// a warning rather than failing the whole load.
pub fn from_json(root: &JsonRoot) -> Config {
    let mut cfg = Config::default();

    for host in &root.hosts {
        if cfg.add_host(&host.alias, &host.hostnqn).is_err() {
            warn!("duplicate host '{}' in config file", host.alias);
        }
    }

    for jt in &root.targets {
        let id = match cfg.add_target(&jt.alias) {
            Ok(id) => id,
            Err(_) => {
                warn!("duplicate target '{}' in config file", jt.alias);
                continue;
            }
        };
        let iface = iface_from_json(jt.mgmt_mode, jt.interface.as_ref());
        let acl_ids: Vec<Vec<super::HostId>> = jt
            .subsystems
            .iter()
            .map(|s| {
                s.hosts
                    .iter()
                    .filter_map(|alias| match cfg.find_host(alias) {
                        Some((id, _)) => Some(id),
                        None => {
                            warn!("unknown host '{}' on acl of '{}'", alias, s.subnqn);
                            None
                        }
                    })
                    .collect()
            })
            .collect();

        let target = match cfg.targets.get_mut(id) {
            Some(target) => target,
            None => continue,
        };
        target.mgmt_mode = jt.mgmt_mode;
        target.refresh = jt.refresh;
        target.iface = iface;
        for port in &jt.portids {
            target.portids.push(Portid {
                portid: port.portid,
                trtype: port.trtype.clone(),
                adrfam: port.adrfam.clone(),
                traddr: port.traddr.clone(),
                trsvcid: port.trsvcid,
            });
        }
        for (subsys, acl) in jt.subsystems.iter().zip(acl_ids) {
            target.subsystems.push(Subsystem {
                subnqn: subsys.subnqn.clone(),
                access: match subsys.allow_any {
                    None => Access::Undefined,
                    Some(0) => Access::Restricted,
                    Some(_) => Access::AllowAny,
                },
                acl,
                namespaces: subsys
                    .nsids
                    .iter()
                    .map(|ns| Namespace {
                        nsid: ns.nsid,
                        devid: ns.devid,
                        devnsid: if ns.devid == super::NULLB_DEVID {
                            0
                        } else {
                            ns.devnsid
                        },
                    })
                    .collect(),
                logpages: Vec::new(),
            });
        }
        for dev in &jt.nsdevices {
            target.nsdevs.push(NsDev {
                devid: dev.devid,
                nsid: dev.nsid,
                valid: true,
            });
        }
        for xport in &jt.interfaces {
            target.fabric_ifaces.push(FabricIface {
                trtype: xport.trtype.clone(),
                adrfam: xport.adrfam.clone(),
                traddr: xport.traddr.clone(),
                valid: true,
            });
        }
    }

    for jg in &root.groups {
        if cfg.add_group(&jg.name).is_err() {
            warn!("duplicate group '{}' in config file", jg.name);
            continue;
        }
        for alias in &jg.targets {
            if cfg.link_group_target(&jg.name, alias).is_err() {
                warn!("unknown target '{}' in group '{}'", alias, jg.name);
            }
        }
        for alias in &jg.hosts {
            if cfg.link_group_host(&jg.name, alias).is_err() {
                warn!("unknown host '{}' in group '{}'", alias, jg.name);
            }
        }
    }

    cfg
}

/// The file-backed store.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Store {
            path: path.into(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the config; a missing file is an empty config, a corrupt
    /// file is an error so the operator notices before the daemon
    /// serves an empty view.
    pub fn load(&self) -> Result<Config, ModelError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no config file at {:?}, starting empty", self.path);
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ModelError::Internal {
                    reason: format!("reading {:?}: {}", self.path, e),
                })
            }
        };
        let root: JsonRoot = serde_json::from_str(&text)?;
        Ok(from_json(&root))
    }

    /// Serialize and atomically replace the file. Errors are reported
    /// to the caller for logging but never unwind a mutation.
    pub fn save(&self, cfg: &Config) -> Result<(), ModelError> {
        let root = to_json(cfg);
        let text = serde_json::to_string_pretty(&root).map_err(|e| ModelError::Internal {
            reason: format!("serializing config: {}", e),
        })?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|e| ModelError::Internal {
            reason: format!("writing {:?}: {}", tmp, e),
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| ModelError::Internal {
            reason: format!("renaming {:?}: {}", tmp, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Access;

    fn sample() -> Config {
        let mut cfg = Config::default();
        cfg.add_host("h1", "nqn.h1").unwrap();
        cfg.add_host("h2", "nqn.h2").unwrap();
        cfg.add_target("t1").unwrap();
        cfg.update_target(
            Some("t1"),
            None,
            Some(MgmtMode::OutOfBand),
            Some(5),
            Some(Interface::Oob {
                address: "192.168.1.10".to_string(),
                port: 22334,
            }),
        )
        .unwrap();
        cfg.set_portid(
            "t1",
            Portid {
                portid: 2,
                trtype: "tcp".to_string(),
                adrfam: "ipv4".to_string(),
                traddr: "10.0.0.1".to_string(),
                trsvcid: 4420,
            },
        )
        .unwrap();
        cfg.set_subsys("t1", None, Some("nqn.x"), Some(Access::Restricted))
            .unwrap();
        cfg.link_host("t1", "nqn.x", "h1").unwrap();
        cfg.set_ns(
            "t1",
            "nqn.x",
            Namespace {
                nsid: 1,
                devid: 0,
                devnsid: 1,
            },
        )
        .unwrap();
        cfg.add_group("g1").unwrap();
        cfg.link_group_target("g1", "t1").unwrap();
        cfg.link_group_host("g1", "h2").unwrap();
        cfg
    }

    fn canonical(root: &JsonRoot) -> serde_json::Value {
        let mut v = serde_json::to_value(root).unwrap();
        // entity order is not significant; compare sorted
        for key in &["Targets", "Hosts", "Groups"] {
            if let Some(arr) = v.get_mut(*key).and_then(|a| a.as_array_mut()) {
                arr.sort_by_key(|e| e.to_string());
            }
        }
        v
    }

    #[test]
    fn round_trip_is_identity() {
        let cfg = sample();
        let json = to_json(&cfg);
        let back = from_json(&json);
        assert_eq!(canonical(&json), canonical(&to_json(&back)));
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = std::env::temp_dir().join(format!("dem-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = Store::new(dir.join("config.json"));

        let cfg = sample();
        store.save(&cfg).unwrap();
        let back = store.load().unwrap();
        assert_eq!(canonical(&to_json(&cfg)), canonical(&to_json(&back)));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_empty_config() {
        let store = Store::new("/nonexistent/dem/config.json");
        let cfg = store.load().unwrap();
        assert!(cfg.targets.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let text = r#"{
            "Targets": [{"Alias": "t1", "MgmtMode": "local", "Bogus": 1}],
            "Hosts": [{"Alias": "h1", "HOSTNQN": "nqn.h1", "Extra": "x"}],
            "FutureSection": []
        }"#;
        let root: JsonRoot = serde_json::from_str(text).unwrap();
        let cfg = from_json(&root);
        assert!(cfg.find_target("t1").is_some());
        assert!(cfg.find_host("h1").is_some());
    }

    #[test]
    fn acl_resolves_by_alias() {
        let cfg = sample();
        let json = to_json(&cfg);
        let subsys = &json.targets[0].subsystems[0];
        assert_eq!(subsys.hosts, vec!["h1".to_string()]);

        let back = from_json(&json);
        let (hid, _) = back.find_host("h1").unwrap();
        assert!(back
            .target("t1")
            .unwrap()
            .subsys("nqn.x")
            .unwrap()
            .acl
            .contains(&hid));
    }
}
