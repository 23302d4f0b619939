//! End to end discovery over loopback TCP: the real pseudo controller
//! worker on one side, the real nvmf client engine on the other.

use std::sync::{atomic::Ordering, Arc};
use std::time::{Duration, Instant};

use dem::{
    aen,
    config::store::Store,
    interfaces::HostIface,
    pseudo,
    service::{self, HostBody, PortidBody, SubsysBody, TargetBody},
    state::ManagerState,
};
use nvmf::{
    ctrl::{CtrlQueue, PortRef},
    transport::tcp::TcpEndpoint,
    types,
    NVMF_DQ_DEPTH,
};

fn test_state(tag: &str) -> Arc<ManagerState> {
    let dir = std::env::temp_dir().join(format!("dem-e2e-{}-{}", std::process::id(), tag));
    std::fs::create_dir_all(&dir).unwrap();
    ManagerState::build(
        Store::new(dir.join("config.json")),
        Vec::<HostIface>::new(),
        None,
    )
    .unwrap()
}

/// Stand up a listener accepting `conns` connections, each serviced by
/// its own host worker, and connect client queues to it.
struct Harness {
    state: Arc<ManagerState>,
    accept: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn start(state: Arc<ManagerState>, conns: usize) -> (Self, std::net::SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_state = state.clone();
        let accept = std::thread::spawn(move || {
            let mut workers = Vec::new();
            for _ in 0..conns {
                let (stream, _) = match listener.accept() {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let xport = TcpEndpoint::from_accepted(stream, NVMF_DQ_DEPTH).unwrap();
                match pseudo::accept_endpoint(Box::new(xport)) {
                    Ok(ep) => {
                        workers.push(pseudo::spawn_host(accept_state.clone(), ep).unwrap())
                    }
                    Err(e) => panic!("accept failed: {}", e),
                }
            }
            for worker in workers {
                let _ = worker.join();
            }
        });

        (
            Harness {
                state,
                accept: Some(accept),
            },
            addr,
        )
    }

    fn connect(&self, addr: std::net::SocketAddr, hostnqn: &str) -> CtrlQueue {
        let mut dq = CtrlQueue::new(
            PortRef {
                portid: 0,
                trtype: "tcp".to_string(),
                adrfam: "ipv4".to_string(),
                traddr: "127.0.0.1".to_string(),
                trsvcid: addr.port(),
            },
            hostnqn,
        );
        dq.connect().unwrap();
        dq
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.state.stopped.store(true, Ordering::Relaxed);
        if let Some(accept) = self.accept.take() {
            let _ = accept.join();
        }
    }
}

fn configure_target(state: &Arc<ManagerState>) {
    service::update_target(
        state,
        None,
        TargetBody {
            alias: Some("T1".to_string()),
            refresh: Some(0),
            ..Default::default()
        },
    )
    .unwrap();
    service::set_portid(
        state,
        "T1",
        1,
        PortidBody {
            portid: Some(1),
            trtype: Some("tcp".to_string()),
            adrfam: Some("ipv4".to_string()),
            traddr: Some("10.0.0.1".to_string()),
            trsvcid: Some(4420),
        },
    )
    .unwrap();
    service::set_subsys(
        state,
        "T1",
        None,
        SubsysBody {
            subnqn: Some("nqn.x".to_string()),
            allow_any: Some(1),
        },
    )
    .unwrap();
}

#[test]
fn add_and_discover() {
    let state = test_state("discover");
    configure_target(&state);

    let (harness, addr) = Harness::start(state.clone(), 1);
    let mut dq = harness.connect(addr, "nqn.host");

    let id = dq.identify().unwrap();
    assert_eq!(id.maxcmd, NVMF_DQ_DEPTH);
    assert_eq!(id.subnqn, nvmf::NVME_DISC_SUBSYS_NAME);

    let cap = dq.get_property(types::reg::CAP).unwrap();
    assert_eq!(cap, types::DISC_CAP);
    let vs = dq.get_property(types::reg::VS).unwrap();
    assert_eq!(vs as u32, types::NVME_VER);

    let (hdr, entries) = dq.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 1);
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.trtype, nvmf::page::TRTYPE_TCP);
    assert_eq!(entry.adrfam, nvmf::page::ADRFAM_IPV4);
    assert_eq!(entry.traddr, "10.0.0.1");
    assert_eq!(entry.trsvcid, "4420");
    assert_eq!(entry.subnqn, "nqn.x");

    dq.disconnect(true);
}

#[test]
fn acl_restricts_and_group_shares() {
    let state = test_state("acl");
    configure_target(&state);

    // restrict the subsystem: unknown hosts see an empty page
    service::set_subsys(
        &state,
        "T1",
        Some("nqn.x"),
        SubsysBody {
            subnqn: None,
            allow_any: Some(0),
        },
    )
    .unwrap();

    let (harness, addr) = Harness::start(state.clone(), 3);
    let mut dq = harness.connect(addr, "nqn.h");
    let (hdr, entries) = dq.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 0);
    assert!(entries.is_empty());
    dq.disconnect(true);

    // on the ACL the host sees the entry
    service::add_host(
        &state,
        "H1",
        HostBody {
            alias: Some("H1".to_string()),
            hostnqn: Some("nqn.h".to_string()),
        },
    )
    .unwrap();
    service::link_host(&state, "T1", "nqn.x", "H1").unwrap();

    let mut dq = harness.connect(addr, "nqn.h");
    let (hdr, _) = dq.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 1);
    dq.disconnect(true);

    // off the ACL but sharing a group with the target: still visible
    service::unlink_host(&state, "T1", "nqn.x", "H1").unwrap();
    service::add_group(&state, "G1").unwrap();
    service::group_member(&state, "G1", Some("T1"), None, true).unwrap();
    service::group_member(&state, "G1", None, Some("H1"), true).unwrap();

    let mut dq = harness.connect(addr, "nqn.h");
    let (hdr, _) = dq.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 1);
    dq.disconnect(true);
}

#[test]
fn concurrent_hosts_are_serviced_independently() {
    let state = test_state("concurrent");
    configure_target(&state);
    service::add_host(
        &state,
        "H1",
        HostBody {
            alias: Some("H1".to_string()),
            hostnqn: Some("nqn.h".to_string()),
        },
    )
    .unwrap();

    let notifier = aen::spawn_notifier(state.aen.clone(), state.stopped.clone());
    let (harness, addr) = Harness::start(state.clone(), 3);

    // three live connections at once, each owned by its own worker
    let mut dq1 = harness.connect(addr, "nqn.h");
    let mut dq2 = harness.connect(addr, "nqn.other");
    let mut dq3 = harness.connect(addr, "nqn.third");

    dq1.set_features(types::FEAT_ASYNC_EVENT, types::AEN_CFG_DISC_LOG_CHG)
        .unwrap();
    dq1.send_async_event_request().unwrap();
    std::thread::sleep(Duration::from_millis(200));

    service::set_subsys(
        &state,
        "T1",
        None,
        SubsysBody {
            subnqn: Some("nqn.y".to_string()),
            allow_any: Some(1),
        },
    )
    .unwrap();

    // delivery must not queue behind the two idle connections
    let deadline = Instant::now() + Duration::from_secs(1);
    let event = loop {
        match dq1.poll_event() {
            Ok(rsp) => break rsp,
            Err(e) if e.is_try_again() => {
                if Instant::now() > deadline {
                    panic!("no async event within deadline");
                }
            }
            Err(e) => panic!("poll failed: {}", e),
        }
    };
    assert_eq!(event.result as u32, types::AEN_LOG_PAGE_CHANGE_NOTICE);

    // and the idle peers were not starved while one host waited
    let (hdr, _) = dq2.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 2);
    let (hdr, _) = dq3.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, 2);

    dq1.disconnect(true);
    dq2.disconnect(true);
    dq3.disconnect(true);
    state.stopped.store(true, Ordering::Relaxed);
    drop(harness);
    let _ = notifier.join();
}

#[test]
fn aen_fires_on_relevant_change() {
    let state = test_state("aen");
    configure_target(&state);
    service::add_host(
        &state,
        "H1",
        HostBody {
            alias: Some("H1".to_string()),
            hostnqn: Some("nqn.h".to_string()),
        },
    )
    .unwrap();

    // the notifier thread is what fires subscriptions
    let notifier = aen::spawn_notifier(state.aen.clone(), state.stopped.clone());

    let (harness, addr) = Harness::start(state.clone(), 1);
    let mut dq = harness.connect(addr, "nqn.h");

    let (hdr, _) = dq.get_log_pages().unwrap();
    let before = hdr.numrec;

    dq.set_features(types::FEAT_ASYNC_EVENT, types::AEN_CFG_DISC_LOG_CHG)
        .unwrap();
    dq.send_async_event_request().unwrap();
    // let the worker park the request before mutating
    std::thread::sleep(Duration::from_millis(200));

    // a new open subsystem is a relevant change for every host
    service::set_subsys(
        &state,
        "T1",
        None,
        SubsysBody {
            subnqn: Some("nqn.y".to_string()),
            allow_any: Some(1),
        },
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let event = loop {
        match dq.poll_event() {
            Ok(rsp) => break rsp,
            Err(e) if e.is_try_again() => {
                if Instant::now() > deadline {
                    panic!("no async event within deadline");
                }
            }
            Err(e) => panic!("poll failed: {}", e),
        }
    };
    assert_eq!(event.result as u32, types::AEN_LOG_PAGE_CHANGE_NOTICE);

    let (hdr, _) = dq.get_log_pages().unwrap();
    assert_eq!(hdr.numrec, before + 1);

    dq.disconnect(true);
    state.stopped.store(true, Ordering::Relaxed);
    drop(harness);
    let _ = notifier.join();
}
