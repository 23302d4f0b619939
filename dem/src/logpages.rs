//! Log-page aggregation: per target, a set of discovery queues (one
//! per portid, scoped by subsystem access), fetched periodically and on
//! demand, diffed mark-and-sweep against the cached pages in the
//! model. The aggregator never holds the model lock while a transport
//! operation is in flight: it snapshots what it needs, fetches, then
//! merges.

use std::collections::HashMap;
use std::sync::{atomic::Ordering, Arc};

use nvmf::{
    ctrl::{CtrlQueue, PortRef},
    page::DiscLogEntry,
    uuid_hostnqn,
};
use tracing::{debug, info, warn};

use crate::{
    config::{Access, LogPage, MgmtMode, PageState, UNATTACHED_CAP},
    state::ManagerState,
};

/// Main loop tick, milliseconds.
pub const IDLE_TIMEOUT: u64 = 100;
/// Keep-alive cadence on discovery and management queues (ms).
pub const KEEP_ALIVE_TIMER: i64 = 120_000;
/// Ticks to back off after a failed connect before retrying the fetch.
pub const LOG_PAGE_RETRY: u32 = 100;

const MINUTE_TICKS: i64 = 60_000 / IDLE_TIMEOUT as i64;
const KATO_TICKS: i64 = KEEP_ALIVE_TIMER / IDLE_TIMEOUT as i64 / 2;

/// One admin connection used to pull a target's log page through a
/// particular portid, optionally scoped to a restricted subsystem.
pub struct DiscoveryQueue {
    pub subsys: Option<String>,
    pub portid: u16,
    pub dq: CtrlQueue,
}

#[derive(Default)]
pub struct TargetRuntime {
    pub queues: Vec<DiscoveryQueue>,
    pub refresh_countdown: i64,
    pub kato_countdown: i64,
    pub log_page_retry: u32,
}

#[derive(Default)]
pub struct Aggregator {
    pub targets: HashMap<String, TargetRuntime>,
}

/// What a queue needs to exist, captured under the model lock.
struct QueueSpec {
    subsys: Option<String>,
    portref: PortRef,
    hostnqn: String,
    available: bool,
}

fn queue_specs(state: &ManagerState, alias: &str) -> Vec<QueueSpec> {
    let cfg = state.config.read();
    let target = match cfg.find_target(alias) {
        Some((_, t)) => t,
        None => return Vec::new(),
    };
    let any_open = target.any_unrestricted();
    let mut specs = Vec::new();
    for portid in &target.portids {
        let portref = PortRef {
            portid: portid.portid,
            trtype: portid.trtype.clone(),
            adrfam: portid.adrfam.clone(),
            traddr: portid.traddr.clone(),
            trsvcid: portid.trsvcid,
        };
        // one anonymous queue per port covers every allow-any subsystem
        specs.push(QueueSpec {
            subsys: None,
            portref: portref.clone(),
            hostnqn: uuid_hostnqn(),
            available: any_open,
        });
        for subsys in &target.subsystems {
            if subsys.access != Access::Restricted {
                continue;
            }
            let first_host = subsys
                .acl
                .first()
                .and_then(|&id| cfg.hosts.get(id))
                .map(|h| h.hostnqn.clone());
            specs.push(QueueSpec {
                subsys: Some(subsys.subnqn.clone()),
                portref: portref.clone(),
                hostnqn: first_host.clone().unwrap_or_else(uuid_hostnqn),
                available: first_host.is_some(),
            });
        }
    }
    specs
}

impl Aggregator {
    /// Reconcile a target's discovery queues with the model: keep
    /// matching queues (and their connections), drop stale ones,
    /// create the missing.
    pub fn sync_target(&mut self, state: &ManagerState, alias: &str) {
        let specs = queue_specs(state, alias);
        if specs.is_empty() && state.config.read().find_target(alias).is_none() {
            self.drop_target(alias);
            return;
        }
        let rt = self.targets.entry(alias.to_string()).or_default();
        rt.queues.retain_mut(|q| {
            let keep = specs.iter().any(|s| {
                s.subsys == q.subsys
                    && s.portref.portid == q.portid
                    && s.portref.traddr == q.dq.portid.traddr
                    && s.portref.trsvcid == q.dq.portid.trsvcid
                    && s.portref.trtype == q.dq.portid.trtype
            });
            if !keep && q.dq.connected {
                q.dq.disconnect(false);
            }
            keep
        });
        for spec in specs {
            let exists = rt
                .queues
                .iter()
                .any(|q| q.subsys == spec.subsys && q.portid == spec.portref.portid);
            if !exists {
                debug!(
                    "discovery queue for '{}' port {} ({})",
                    alias,
                    spec.portref.portid,
                    spec.subsys.as_deref().unwrap_or("any")
                );
                rt.queues.push(DiscoveryQueue {
                    subsys: spec.subsys,
                    portid: spec.portref.portid,
                    dq: CtrlQueue::new(spec.portref, &spec.hostnqn),
                });
            }
        }
    }

    pub fn drop_target(&mut self, alias: &str) {
        if let Some(mut rt) = self.targets.remove(alias) {
            for queue in rt.queues.iter_mut() {
                if queue.dq.connected {
                    queue.dq.disconnect(false);
                }
            }
        }
    }

    /// Fetch every available queue of one target and merge the result.
    /// Locally managed targets have nothing to fetch: their announced
    /// endpoints are the model itself.
    pub fn refresh_target(&mut self, state: &ManagerState, alias: &str) {
        let local = {
            let cfg = state.config.read();
            match cfg.find_target(alias) {
                Some((_, t)) => t.mgmt_mode == MgmtMode::Local,
                None => {
                    self.drop_target(alias);
                    return;
                }
            }
        };
        if local {
            let mut cfg = state.config.write();
            if let Some((_, target)) = cfg.find_target_mut(alias) {
                target.synthesize_pages();
            }
            return;
        }

        self.sync_target(state, alias);
        let specs = queue_specs(state, alias);
        let rt = match self.targets.get_mut(alias) {
            Some(rt) => rt,
            None => return,
        };

        invalidate_pages(state, alias);

        for queue in rt.queues.iter_mut() {
            let available = specs
                .iter()
                .find(|s| s.subsys == queue.subsys && s.portref.portid == queue.portid)
                .map(|s| s.available)
                .unwrap_or(false);
            if !available {
                continue;
            }
            if !queue.dq.connected {
                if let Err(e) = queue.dq.connect() {
                    warn!("could not connect to target '{}': {}", alias, e);
                    rt.log_page_retry = LOG_PAGE_RETRY;
                    continue;
                }
            }
            match queue.dq.get_log_pages() {
                Ok((_, entries)) => {
                    debug!("target '{}' port {}: {} record(s)", alias, queue.portid, entries.len());
                    merge_pages(state, alias, queue.portid, &entries);
                }
                Err(e) => {
                    warn!("get log pages for target '{}' failed: {}", alias, e);
                    queue.dq.disconnect(false);
                }
            }
            if queue.dq.failed_kato && queue.dq.connected {
                queue.dq.disconnect(false);
            }
        }

        sweep_pages(state, alias);
    }

    /// One 100 ms tick of keep-alive and refresh bookkeeping across
    /// all targets.
    pub fn periodic_work(&mut self, state: &Arc<ManagerState>) {
        let roster: Vec<(String, u32, MgmtMode)> = {
            let cfg = state.config.read();
            cfg.targets
                .iter()
                .map(|(_, t)| (t.alias.clone(), t.refresh, t.mgmt_mode))
                .collect()
        };

        for (alias, refresh, mode) in roster {
            if state.stopped.load(Ordering::Relaxed) {
                return;
            }
            self.targets.entry(alias.clone()).or_default();

            let due_keep_alive = {
                let rt = self.targets.get_mut(&alias).map(|rt| {
                    rt.kato_countdown -= 1;
                    rt.kato_countdown <= 0
                });
                rt.unwrap_or(false)
            };
            if due_keep_alive {
                self.keep_alive_work(state, &alias, mode);
                if let Some(rt) = self.targets.get_mut(&alias) {
                    rt.kato_countdown = KATO_TICKS;
                }
            }

            let due_refresh = {
                let rt = match self.targets.get_mut(&alias) {
                    Some(rt) => rt,
                    None => continue,
                };
                if rt.log_page_retry > 0 {
                    rt.log_page_retry -= 1;
                    continue;
                }
                if refresh == 0 {
                    continue;
                }
                rt.refresh_countdown -= 1;
                if rt.refresh_countdown > 0 {
                    continue;
                }
                rt.refresh_countdown = refresh as i64 * MINUTE_TICKS;
                true
            };
            if due_refresh {
                if mode != MgmtMode::Local {
                    crate::service::refresh_inventory(state, &alias);
                }
                self.refresh_target(state, &alias);
            }
        }
    }

    fn keep_alive_work(&mut self, state: &Arc<ManagerState>, alias: &str, mode: MgmtMode) {
        if let Some(rt) = self.targets.get_mut(alias) {
            for queue in rt.queues.iter_mut() {
                if !queue.dq.connected || queue.dq.failed_kato {
                    continue;
                }
                if let Err(e) = queue.dq.keep_alive() {
                    warn!("keep alive failed for '{}': {}", alias, e);
                    queue.dq.disconnect(false);
                    rt.log_page_retry = LOG_PAGE_RETRY;
                    return;
                }
            }
        }
        if mode == MgmtMode::InBand {
            state.dispatch.keep_alive(alias);
        }
    }

    /// First contact with the configured targets at daemon start.
    pub fn init_targets(&mut self, state: &Arc<ManagerState>) {
        let roster: Vec<(String, u32, MgmtMode)> = {
            let cfg = state.config.read();
            cfg.targets
                .iter()
                .map(|(_, t)| (t.alias.clone(), t.refresh, t.mgmt_mode))
                .collect()
        };
        for (alias, refresh, mode) in roster {
            if mode != MgmtMode::Local {
                crate::service::refresh_inventory(state, &alias);
                if let Err(e) = crate::service::program_target(state, &alias) {
                    warn!("initial programming of '{}' failed: {}", alias, e);
                }
            }
            self.refresh_target(state, &alias);
            if let Some(rt) = self.targets.get_mut(&alias) {
                rt.refresh_countdown = refresh as i64 * MINUTE_TICKS;
                rt.kato_countdown = KATO_TICKS;
                info!("target '{}' initialized", alias);
            }
        }
    }
}

/// Mark every cached page of the target as pending deletion; fetched
/// entries revalidate them.
fn invalidate_pages(state: &ManagerState, alias: &str) {
    let mut cfg = state.config.write();
    if let Some((_, target)) = cfg.find_target_mut(alias) {
        for subsys in target.subsystems.iter_mut() {
            for page in subsys.logpages.iter_mut() {
                page.state = PageState::Deleted;
            }
        }
        target.unattached.clear();
    }
}

/// Merge one queue's fetch into the model.
fn merge_pages(state: &ManagerState, alias: &str, portid: u16, entries: &[DiscLogEntry]) {
    let mut cfg = state.config.write();
    let target = match cfg.find_target_mut(alias) {
        Some((_, t)) => t,
        None => return,
    };
    for entry in entries {
        let mut owned = false;
        for subsys in target.subsystems.iter_mut() {
            if subsys.subnqn != entry.subnqn {
                continue;
            }
            owned = true;
            match subsys
                .logpages
                .iter_mut()
                .find(|p| p.entry.same_endpoint(entry))
            {
                Some(page) => {
                    page.entry = entry.clone();
                    page.portid = portid;
                    page.state = PageState::Valid;
                }
                None => subsys.logpages.push(LogPage {
                    portid,
                    entry: entry.clone(),
                    state: PageState::New,
                }),
            }
            break;
        }
        if !owned {
            // announced subnqn the model does not know; keep a bounded
            // number of them for the operator to inspect
            if !target
                .unattached
                .iter()
                .any(|p| p.entry.subnqn == entry.subnqn && p.entry.same_endpoint(entry))
            {
                if target.unattached.len() >= UNATTACHED_CAP {
                    target.unattached.remove(0);
                }
                warn!("unknown subsystem {} on target '{}'", entry.subnqn, alias);
                target.unattached.push(LogPage {
                    portid,
                    entry: entry.clone(),
                    state: PageState::New,
                });
            }
        }
    }
}

/// Finish a refresh pass: report adds/removes, then settle states.
fn sweep_pages(state: &ManagerState, alias: &str) {
    let mut changed = false;
    {
        let mut cfg = state.config.write();
        if let Some((_, target)) = cfg.find_target_mut(alias) {
            for subsys in target.subsystems.iter_mut() {
                for page in subsys.logpages.iter() {
                    if page.state != PageState::Valid {
                        changed = true;
                    }
                }
                subsys.logpages.retain(|p| p.state != PageState::Deleted);
                for page in subsys.logpages.iter_mut() {
                    page.state = PageState::Valid;
                }
            }
        }
    }
    if changed {
        let hosts = {
            let cfg = state.config.read();
            match cfg.find_target(alias) {
                Some((_, target)) => cfg.hosts_for_target(target),
                None => Vec::new(),
            }
        };
        state.publish_aen(hosts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{store::Store, Portid};
    use crate::interfaces::HostIface;

    fn test_state() -> Arc<ManagerState> {
        static SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "dem-aggr-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let state =
            ManagerState::build(Store::new(dir.join("config.json")), Vec::<HostIface>::new(), None)
                .unwrap();
        {
            let mut cfg = state.config.write();
            cfg.add_target("t1").unwrap();
            cfg.set_portid(
                "t1",
                Portid {
                    portid: 1,
                    trtype: "tcp".to_string(),
                    adrfam: "ipv4".to_string(),
                    traddr: "127.0.0.1".to_string(),
                    trsvcid: 4420,
                },
            )
            .unwrap();
            cfg.set_subsys("t1", None, Some("nqn.x"), Some(Access::Restricted))
                .unwrap();
            cfg.add_host("h1", "nqn.h1").unwrap();
            cfg.link_host("t1", "nqn.x", "h1").unwrap();
        }
        state
    }

    fn entry(subnqn: &str, addr: &str) -> DiscLogEntry {
        DiscLogEntry {
            portid: 1,
            subnqn: subnqn.to_string(),
            traddr: addr.to_string(),
            trsvcid: "4420".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn queues_are_scoped_by_access() {
        let state = test_state();
        let mut aggr = Aggregator::default();
        aggr.sync_target(&state, "t1");
        let rt = aggr.targets.get("t1").unwrap();
        // one anonymous queue plus one for the restricted subsystem
        assert_eq!(rt.queues.len(), 2);
        assert!(rt.queues.iter().any(|q| q.subsys.is_none()));
        assert!(rt
            .queues
            .iter()
            .any(|q| q.subsys.as_deref() == Some("nqn.x")));
        // the restricted queue borrows the first ACL host's identity
        let scoped = rt
            .queues
            .iter()
            .find(|q| q.subsys.is_some())
            .unwrap();
        assert_eq!(scoped.dq.hostnqn, "nqn.h1");
    }

    #[test]
    fn merge_then_sweep_tracks_lifecycle() {
        let state = test_state();

        // first fetch: two entries appear
        invalidate_pages(&state, "t1");
        merge_pages(
            &state,
            "t1",
            1,
            &[entry("nqn.x", "10.0.0.1"), entry("nqn.x", "10.0.0.2")],
        );
        sweep_pages(&state, "t1");
        {
            let cfg = state.config.read();
            let subsys = cfg.target("t1").unwrap().subsys("nqn.x").unwrap();
            assert_eq!(subsys.logpages.len(), 2);
            assert!(subsys.logpages.iter().all(|p| p.state == PageState::Valid));
        }

        // second fetch: one endpoint gone, transitions out
        invalidate_pages(&state, "t1");
        merge_pages(&state, "t1", 1, &[entry("nqn.x", "10.0.0.1")]);
        sweep_pages(&state, "t1");
        {
            let cfg = state.config.read();
            let subsys = cfg.target("t1").unwrap().subsys("nqn.x").unwrap();
            assert_eq!(subsys.logpages.len(), 1);
            assert_eq!(subsys.logpages[0].entry.traddr, "10.0.0.1");
        }
    }

    #[test]
    fn unknown_subsystems_land_unattached_and_bounded() {
        let state = test_state();
        invalidate_pages(&state, "t1");
        for i in 0..(UNATTACHED_CAP + 8) {
            merge_pages(
                &state,
                "t1",
                1,
                &[entry(&format!("nqn.stray{}", i), "10.0.0.9")],
            );
        }
        let cfg = state.config.read();
        let target = cfg.target("t1").unwrap();
        assert_eq!(target.unattached.len(), UNATTACHED_CAP);
    }
}
