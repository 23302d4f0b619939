//! Stand-alone discovery monitor: connects to a discovery controller,
//! subscribes to log page change events and prints the differences as
//! they happen.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use nvmf::{
    ctrl::{CtrlQueue, PortRef},
    page::{adrfam_str, subtype_str, trtype_str, DiscLogEntry},
    types,
    uuid_hostnqn,
    CONNECT_RETRY_COUNT,
};
use structopt::StructOpt;
use tracing::{debug, error, info};

/// Poll iterations between keep-alives; at a 100 ms poll timeout this
/// is roughly every 50 seconds.
const KEEP_ALIVE_COUNTER: u32 = 500;

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, StructOpt)]
#[structopt(name = "dem-monitor", about = "NVMe-oF discovery monitor")]
struct CliArgs {
    /// Enable debug prints
    #[structopt(short, long)]
    debug: bool,
    /// HostNQN used to connect to the discovery controller
    #[structopt(short = "h", long)]
    hostnqn: Option<String>,
    /// Transport type [tcp, rdma]
    #[structopt(short = "t", long, default_value = "tcp")]
    trtype: String,
    /// Address family [ipv4, ipv6]
    #[structopt(short = "f", long, default_value = "ipv4")]
    adrfam: String,
    /// Transport address (e.g. 192.168.1.1)
    #[structopt(short = "a", long)]
    traddr: String,
    /// Transport service id (e.g. 4420)
    #[structopt(short = "s", long, default_value = "4420")]
    trsvcid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PageState {
    New,
    Valid,
    Deleted,
}

/// Local cache of the controller's log page, keyed by subsystem.
#[derive(Default)]
struct PageCache {
    subsystems: HashMap<String, Vec<(DiscLogEntry, PageState)>>,
}

impl PageCache {
    fn invalidate(&mut self) {
        for pages in self.subsystems.values_mut() {
            for (_, state) in pages.iter_mut() {
                *state = PageState::Deleted;
            }
        }
    }

    fn store(&mut self, entries: Vec<DiscLogEntry>) {
        for entry in entries {
            if !self.subsystems.contains_key(&entry.subnqn) {
                info!("added subsystem '{}'", entry.subnqn);
            }
            let pages = self.subsystems.entry(entry.subnqn.clone()).or_default();
            match pages.iter_mut().find(|(e, _)| e.same_endpoint(&entry)) {
                Some((cached, state)) => {
                    *cached = entry;
                    *state = PageState::Valid;
                }
                None => pages.push((entry, PageState::New)),
            }
        }
    }

    /// Print what changed since the previous fetch, then settle the
    /// cache (drop deleted entries and emptied subsystems).
    fn report(&mut self) {
        for (subnqn, pages) in self.subsystems.iter_mut() {
            for (entry, state) in pages.iter_mut() {
                match state {
                    PageState::New => {
                        println!("--------------------------------");
                        print_entry(entry);
                        *state = PageState::Valid;
                    }
                    PageState::Deleted => {
                        println!(
                            "subsys '{}' on {} {} {} deleted",
                            subnqn,
                            trtype_str(entry.trtype),
                            entry.traddr,
                            entry.trsvcid
                        );
                    }
                    PageState::Valid => {}
                }
            }
            pages.retain(|(_, state)| *state != PageState::Deleted);
        }
        self.subsystems.retain(|subnqn, pages| {
            if pages.is_empty() {
                println!("deleted subsystem '{}', no log pages", subnqn);
                false
            } else {
                true
            }
        });
    }
}

fn print_entry(e: &DiscLogEntry) {
    println!(
        "subnqn {} subtype {} portid {} trtype {} adrfam {} traddr {} trsvcid {}",
        e.subnqn,
        subtype_str(e.subtype),
        e.portid,
        trtype_str(e.trtype),
        adrfam_str(e.adrfam),
        e.traddr,
        e.trsvcid
    );
}

fn enable_aens(dq: &mut CtrlQueue) -> Result<(), nvmf::NvmeError> {
    let supported = dq.get_features(types::FEAT_ASYNC_EVENT)?;
    if supported == 0 {
        error!("async events not supported");
    }
    dq.set_features(types::FEAT_ASYNC_EVENT, types::AEN_CFG_DISC_LOG_CHG)?;
    dq.send_async_event_request()
}

fn report_updates(dq: &mut CtrlQueue, cache: &mut PageCache) -> Result<(), nvmf::NvmeError> {
    let (_, entries) = dq.get_log_pages()?;
    cache.invalidate();
    cache.store(entries);
    cache.report();
    if !dq.failed_kato {
        dq.send_async_event_request()?;
    }
    Ok(())
}

fn complete_connection(dq: &mut CtrlQueue, cache: &mut PageCache) -> bool {
    if let Err(e) = enable_aens(dq) {
        error!("enabling async events failed: {}", e);
        return false;
    }
    if let Err(e) = report_updates(dq, cache) {
        error!("initial log page fetch failed: {}", e);
        return false;
    }
    if dq.failed_kato {
        // target cannot keep us alive; poll with reconnect cycles
        dq.disconnect(false);
    }
    true
}

fn main() {
    let args = CliArgs::from_args();

    let filter = if args.debug { "debug" } else { "info" };
    if let Ok(env) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(env).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let hostnqn = args.hostnqn.clone().unwrap_or_else(uuid_hostnqn);
    debug!("using hostnqn {}", hostnqn);

    let portref = PortRef {
        portid: 0,
        trtype: args.trtype.clone(),
        adrfam: args.adrfam.clone(),
        traddr: args.traddr.clone(),
        trsvcid: args.trsvcid,
    };
    let mut dq = CtrlQueue::new(portref, &hostnqn);

    let stopped = Arc::new(AtomicBool::new(false));
    for sig in &[signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let _ = signal_hook::flag::register(*sig, stopped.clone());
    }

    let mut cache = PageCache::default();
    let mut retries = 0u32;
    let mut ka_counter = 0u32;

    if dq.connect().is_err() {
        info!("unable to connect to discovery controller, retrying");
    } else if !complete_connection(&mut dq, &mut cache) {
        dq.disconnect(false);
    }

    while !stopped.load(Ordering::Relaxed) {
        if !dq.connected {
            std::thread::sleep(RECONNECT_DELAY);
            retries += 1;
            if retries < CONNECT_RETRY_COUNT {
                continue;
            }
            retries = 0;
            match dq.connect() {
                Ok(()) => {
                    if !complete_connection(&mut dq, &mut cache) {
                        dq.disconnect(false);
                    }
                }
                Err(e) => debug!("reconnect failed: {}", e),
            }
            continue;
        }

        match dq.poll_event() {
            Ok(rsp) => {
                if rsp.result as u32 == types::AEN_LOG_PAGE_CHANGE_NOTICE {
                    println!("--------------------------------");
                    println!("received discovery log change event");
                    if let Err(e) = report_updates(&mut dq, &mut cache) {
                        error!("log page refresh failed: {}", e);
                        dq.disconnect(false);
                    }
                    ka_counter = 0;
                }
                // anything else is a keep-alive acknowledgement
            }
            Err(e) if e.is_try_again() => {
                ka_counter += 1;
                if ka_counter > KEEP_ALIVE_COUNTER {
                    ka_counter = 0;
                    if let Err(e) = dq.post_keep_alive() {
                        error!("lost connection to discovery controller: {}", e);
                        dq.disconnect(false);
                    }
                }
            }
            Err(e) => {
                error!("connection error: {}", e);
                dq.disconnect(false);
            }
        }
    }

    dq.disconnect(true);
    info!("shutting down");
}
