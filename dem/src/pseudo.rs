//! The pseudo discovery controller: one listener thread per configured
//! interface, and one worker thread per accepted connection. Each
//! worker polls only its own endpoint, drives the per-connection
//! command state machine and emits the withheld async-event completion
//! when the notifier signals a relevant change, so one slow host never
//! delays another.

use std::sync::{atomic::Ordering, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use nvmf::{
    endpoint::Endpoint,
    error::TransportError,
    page,
    transport::{self, Message},
    types::{
        self,
        fctype,
        opcode,
        reg,
        status,
        ConnectData,
        IdCtrl,
        NvmeCommand,
        NvmeCompletion,
    },
    NVME_DISC_SUBSYS_NAME,
    NVME_DOMAIN_SUBSYS_NAME,
};
use tracing::{debug, error, info, warn};

use crate::{interfaces::HostIface, logpages::IDLE_TIMEOUT, state::ManagerState};

/// Keep-alive assumed when the host supplies none on Connect (ms).
const DEFAULT_KATO: u32 = 120_000;

struct HostConn {
    ep: Endpoint,
    hostnqn: String,
    csts: u32,
    kato_ticks: i64,
    countdown: i64,
    aen_mask: u32,
    aer_cid: Option<u16>,
    aen_sub: Option<(u64, Receiver<()>)>,
}

impl HostConn {
    fn new(ep: Endpoint) -> Self {
        let ticks = (DEFAULT_KATO as u64 / IDLE_TIMEOUT) as i64;
        HostConn {
            ep,
            hostnqn: String::new(),
            csts: 0,
            kato_ticks: ticks,
            countdown: ticks,
            aen_mask: 0,
            aer_cid: None,
            aen_sub: None,
        }
    }

    fn retire(&mut self, state: &ManagerState) {
        if let Some((id, _)) = self.aen_sub.take() {
            state.aen.unsubscribe(id);
        }
        if !self.hostnqn.is_empty() {
            info!("host '{}' disconnected", self.hostnqn);
        }
        self.ep.teardown();
    }
}

fn handle_property_set(conn: &mut HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    if cmd.prop_offset() != reg::CC {
        return Err(status::INVALID_FIELD);
    }
    conn.csts = if cmd.prop_value() == types::CC_ENABLE {
        types::CSTS_RDY
    } else {
        types::CSTS_SHST_CMPLT
    };
    Ok(0)
}

fn handle_property_get(conn: &HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    match cmd.prop_offset() {
        reg::CSTS => Ok(conn.csts as u64),
        reg::CAP => Ok(types::DISC_CAP),
        reg::VS => Ok(types::NVME_VER as u64),
        _ => Err(status::INVALID_FIELD),
    }
}

fn handle_connect(conn: &mut HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    let len = (cmd.dptr.length as usize).min(types::CONNECT_DATA_SIZE);
    if conn
        .ep
        .rma_read_data(cmd.dptr.addr, len, cmd.dptr.key)
        .is_err()
    {
        error!("reading connect data failed");
        return Err(status::READ_ERROR);
    }
    let data = ConnectData::from_bytes(conn.ep.data());

    if data.subsysnqn != NVME_DISC_SUBSYS_NAME && data.subsysnqn != NVME_DOMAIN_SUBSYS_NAME {
        error!(
            "bad subsystem '{}', expecting '{}' or '{}'",
            data.subsysnqn, NVME_DISC_SUBSYS_NAME, NVME_DOMAIN_SUBSYS_NAME
        );
        return Err(status::CONNECT_INVALID_HOST);
    }
    if data.cntlid != types::CNTLID_DYNAMIC {
        error!(
            "bad controller id {:#x}, expecting {:#x}",
            data.cntlid,
            types::CNTLID_DYNAMIC
        );
        return Err(status::CONNECT_INVALID_PARAM);
    }

    info!("host '{}' connected", data.hostnqn);
    conn.hostnqn = data.hostnqn;

    let kato = match cmd.connect_kato() {
        0 => DEFAULT_KATO,
        ms => ms,
    };
    conn.kato_ticks = (kato as u64 / IDLE_TIMEOUT) as i64;
    Ok(0)
}

fn handle_identify(conn: &mut HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    if cmd.identify_cns() != 1 {
        error!("unexpected identify command");
        return Err(status::BAD_ATTRIBUTES);
    }
    let page = IdCtrl::discovery().to_bytes();
    let len = (cmd.dptr.length as usize).min(page.len());
    conn.ep.data_mut()[..len].copy_from_slice(&page[..len]);
    conn.ep
        .rma_write_data(len, cmd.dptr.addr, cmd.dptr.key, cmd.command_id)
        .map_err(|e| {
            error!("identify write failed: {}", e);
            status::WRITE_FAULT
        })?;
    Ok(0)
}

fn handle_get_log_page_count(
    state: &ManagerState,
    conn: &mut HostConn,
    cmd: &NvmeCommand,
) -> Result<u64, u16> {
    let numrec = state.config.read().visible_entries(&conn.hostnqn).len();
    let hdr = page::DiscRspPageHdr {
        genctr: 1,
        numrec: numrec as u64,
    };
    debug!("log page count {} for '{}'", numrec, conn.hostnqn);
    conn.ep.data_mut()[..page::DISC_HDR_SIZE].copy_from_slice(&hdr.to_bytes());
    conn.ep
        .rma_write_data(
            page::DISC_HDR_SIZE,
            cmd.dptr.addr,
            cmd.dptr.key,
            cmd.command_id,
        )
        .map_err(|e| {
            error!("log page header write failed: {}", e);
            status::WRITE_FAULT
        })?;
    Ok(0)
}

fn handle_get_log_pages(
    state: &ManagerState,
    conn: &mut HostConn,
    cmd: &NvmeCommand,
) -> Result<u64, u16> {
    let len = cmd.dptr.length as usize;
    let entries = state.config.read().visible_entries(&conn.hostnqn);
    let mut buf = page::build_log_page(1, &entries);
    buf.resize(len, 0);

    // transient registration sized to this response only
    let mr = conn.ep.xport.alloc_key(&buf).map_err(|_| status::INTERNAL)?;
    let ret = conn
        .ep
        .xport
        .rma_write(&buf, cmd.dptr.addr, cmd.dptr.key, &mr, cmd.command_id);
    conn.ep.xport.dealloc_key(mr);

    ret.map_err(|e| {
        error!("log page write failed: {}", e);
        status::WRITE_FAULT
    })?;
    Ok(0)
}

fn handle_set_features(conn: &mut HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    if cmd.feature_id() != types::FEAT_ASYNC_EVENT {
        return Err(status::INVALID_FIELD);
    }
    conn.aen_mask = cmd.cdw11;
    Ok(0)
}

fn handle_get_features(conn: &HostConn, cmd: &NvmeCommand) -> Result<u64, u16> {
    if cmd.feature_id() != types::FEAT_ASYNC_EVENT {
        return Err(status::INVALID_FIELD);
    }
    Ok(types::AEN_CFG_DISC_LOG_CHG as u64 | conn.aen_mask as u64)
}

/// Dispatch one command; `Ok(true)` means the completion is withheld
/// (a parked async event request).
fn handle_request(
    state: &ManagerState,
    conn: &mut HostConn,
    cmd: &NvmeCommand,
) -> Result<bool, TransportError> {
    let result = match cmd.opcode {
        opcode::FABRICS => match cmd.fctype() {
            fctype::PROPERTY_SET => handle_property_set(conn, cmd),
            fctype::PROPERTY_GET => handle_property_get(conn, cmd),
            fctype::CONNECT => handle_connect(conn, cmd),
            other => {
                error!("unknown fctype {}", other);
                Err(status::INVALID_OPCODE)
            }
        },
        opcode::IDENTIFY => handle_identify(conn, cmd),
        opcode::KEEP_ALIVE => Ok(0),
        opcode::GET_LOG_PAGE => {
            if cmd.dptr.length == page::DISC_HDR_SIZE as u32 {
                handle_get_log_page_count(state, conn, cmd)
            } else {
                handle_get_log_pages(state, conn, cmd)
            }
        }
        opcode::SET_FEATURES => handle_set_features(conn, cmd),
        opcode::GET_FEATURES => handle_get_features(conn, cmd),
        opcode::ASYNC_EVENT => {
            // completion withheld until a relevant change fires
            conn.aer_cid = Some(cmd.command_id);
            if conn.aen_sub.is_none() {
                conn.aen_sub = Some(state.aen.subscribe(&conn.hostnqn));
            }
            return Ok(true);
        }
        other => {
            error!("unknown nvme opcode {}", other);
            Err(status::INVALID_OPCODE)
        }
    };

    let mut rsp = NvmeCompletion::default();
    rsp.command_id = cmd.command_id;
    match result {
        Ok(value) => rsp.result = value,
        Err(sc) => rsp.status = (status::DNR | sc) << 1,
    }
    conn.ep.xport.send_rsp(&rsp)?;
    Ok(false)
}

/// Fire the withheld async event completion after a notifier signal.
fn fire_aen(state: &ManagerState, conn: &mut HostConn) -> Result<(), TransportError> {
    if let Some(cid) = conn.aer_cid.take() {
        debug!("async event to '{}'", conn.hostnqn);
        let mut rsp = NvmeCompletion::default();
        rsp.command_id = cid;
        rsp.result = types::AEN_LOG_PAGE_CHANGE_NOTICE as u64;
        conn.ep.xport.send_rsp(&rsp)?;
    }
    if let Some((id, _)) = conn.aen_sub.take() {
        state.aen.unsubscribe(id);
    }
    Ok(())
}

/// Service one connection for one tick; false retires it.
fn service_conn(state: &ManagerState, conn: &mut HostConn) -> bool {
    loop {
        match conn.ep.xport.poll_for_msg() {
            Ok((Message::Command(cmd), slot)) => {
                let parked = handle_request(state, conn, &cmd);
                if conn.ep.xport.repost_recv(slot).is_err() {
                    return false;
                }
                match parked {
                    Ok(_) => conn.countdown = conn.kato_ticks,
                    Err(_) => return false,
                }
            }
            Ok((Message::Completion(_), _)) => return false,
            Err(TransportError::TryAgain) => break,
            Err(_) => return false,
        }
    }

    let signalled = match &conn.aen_sub {
        Some((_, rx)) => rx.try_recv().is_ok(),
        None => false,
    };
    if signalled && fire_aen(state, conn).is_err() {
        return false;
    }

    conn.countdown -= 1;
    conn.countdown > 0
}

/// The host worker: owns exactly one connection, polling only its
/// endpoint. The poll timeout inside [`service_conn`] paces the loop.
fn host_thread(state: Arc<ManagerState>, ep: Endpoint) {
    let mut conn = HostConn::new(ep);

    while !state.stopped.load(Ordering::Relaxed) {
        if !service_conn(&state, &mut conn) {
            break;
        }
    }

    conn.retire(&state);
}

/// Hand an accepted connection to its own worker thread.
pub fn spawn_host(state: Arc<ManagerState>, ep: Endpoint) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("pseudo-host".to_string())
        .spawn(move || host_thread(state, ep))
}

/// Handshake an accepted transport and wrap it as an endpoint.
pub fn accept_endpoint(
    mut xport: Box<dyn transport::Transport>,
) -> Result<Endpoint, TransportError> {
    xport.accept_connection()?;
    Endpoint::new(xport)
}

/// The listener loop of one host-facing interface.
pub fn interface_thread(state: Arc<ManagerState>, iface: HostIface) {
    let mut listener =
        match transport::init_listener(&iface.trtype, &iface.traddr, &iface.trsvcid) {
            Ok(l) => l,
            Err(e) => {
                error!(
                    "failed to start pseudo target on {}:{}: {}",
                    iface.traddr, iface.trsvcid, e
                );
                return;
            }
        };
    info!(
        "listening on {} {}:{}",
        iface.trtype, iface.traddr, iface.trsvcid
    );

    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while !state.stopped.load(Ordering::Relaxed) {
        match listener.wait_for_connection() {
            Ok(xport) => match accept_endpoint(xport) {
                Ok(ep) => match spawn_host(state.clone(), ep) {
                    Ok(handle) => workers.push(handle),
                    Err(e) => warn!("could not start host worker: {}", e),
                },
                Err(e) => warn!("host connection failed: {}", e),
            },
            Err(TransportError::TryAgain) => {
                reap_finished(&mut workers);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => {
                warn!("host connection failed: {}", e);
                std::thread::sleep(Duration::from_millis(IDLE_TIMEOUT));
            }
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
}

fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < workers.len() {
        if workers[i].is_finished() {
            let _ = workers.remove(i).join();
        } else {
            i += 1;
        }
    }
}
