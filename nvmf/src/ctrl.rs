//! Client side protocol engine: an admin queue to a (discovery)
//! controller, driving the fabrics handshake and the admin commands a
//! discovery session uses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use tracing::{debug, error, warn};

use crate::{
    endpoint::Endpoint,
    error::{NvmeError, TransportError},
    page::{
        self,
        DiscLogEntry,
        DiscRspPageHdr,
        DISC_ENTRY_SIZE,
        DISC_HDR_SIZE,
    },
    transport::{self, Direction},
    types::{
        self,
        fctype,
        opcode,
        reg,
        status,
        NvmeCommand,
        NvmeCompletion,
        SglDesc,
        SglType,
    },
    CONFIG_RETRY_COUNT,
    CONNECT_RETRY_COUNT,
    NVMF_DQ_DEPTH,
    NVME_DISC_KATO,
};

/// Bound on records accepted from a single log page fetch.
const MAX_LOG_RECORDS: u64 = 1024;

/// Poll attempts while waiting for a completion in the normal case.
const RSP_RETRY_COUNT: u32 = 5;

/// Transport address of a remote discovery/config port.
#[derive(Debug, Clone, Default)]
pub struct PortRef {
    pub portid: u16,
    pub trtype: String,
    pub adrfam: String,
    pub traddr: String,
    pub trsvcid: u16,
}

impl PortRef {
    /// Resolve under the declared address family; the address must
    /// parse as that family.
    pub fn resolve(&self) -> Result<SocketAddr, NvmeError> {
        let ip = match self.adrfam.as_str() {
            "ipv4" => Ipv4Addr::from_str(&self.traddr).map(IpAddr::V4),
            "ipv6" => Ipv6Addr::from_str(&self.traddr).map(IpAddr::V6),
            _ => {
                return Err(NvmeError::BadAddress {
                    family: self.adrfam.clone(),
                    address: self.traddr.clone(),
                })
            }
        }
        .map_err(|_| NvmeError::BadAddress {
            family: self.adrfam.clone(),
            address: self.traddr.clone(),
        })?;
        Ok(SocketAddr::new(ip, self.trsvcid))
    }
}

/// An admin queue to one controller.
pub struct CtrlQueue {
    pub portid: PortRef,
    pub hostnqn: String,
    pub subsysnqn: String,
    ep: Option<Endpoint>,
    cid: u16,
    pub connected: bool,
    /// Target rejected our keep-alive value; operate in
    /// connect/work/disconnect cycles instead.
    pub failed_kato: bool,
}

impl CtrlQueue {
    pub fn new(portid: PortRef, hostnqn: &str) -> Self {
        CtrlQueue {
            portid,
            hostnqn: hostnqn.to_string(),
            subsysnqn: crate::NVME_DISC_SUBSYS_NAME.to_string(),
            ep: None,
            cid: 0,
            connected: false,
            failed_kato: false,
        }
    }

    fn ep_mut(&mut self) -> Result<&mut Endpoint, NvmeError> {
        self.ep.as_mut().ok_or(NvmeError::Transport {
            source: TransportError::Shutdown,
        })
    }

    fn next_cid(&mut self) -> u16 {
        self.cid = self.cid.wrapping_add(1);
        self.cid
    }

    fn sgl(&self, addr: u64, len: u32, key: u32, op: u8) -> SglDesc {
        if self.portid.trtype == "rdma" {
            SglDesc::keyed(addr, len, key)
        } else {
            SglDesc {
                addr,
                length: len,
                key: 0,
                ty: if op == opcode::GET_LOG_PAGE {
                    SglType::Transport
                } else {
                    SglType::Offset
                },
            }
        }
    }

    /// Establish the transport connection and run the fabrics
    /// handshake up to controller enable.
    pub fn connect(&mut self) -> Result<(), NvmeError> {
        let dst = self.portid.resolve()?;
        let mut xport = transport::init_endpoint(&self.portid.trtype, NVMF_DQ_DEPTH)?;

        let mut cnt = CONNECT_RETRY_COUNT;
        loop {
            match xport.client_connect(&dst) {
                Ok(()) => break,
                Err(e) if e.is_try_again() && cnt > 0 => {
                    cnt -= 1;
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.ep = Some(Endpoint::new(xport)?);

        let handshake = match self.fabric_connect() {
            Ok(()) => self.set_property(reg::CC, types::CC_ENABLE).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            self.teardown();
            return Err(e);
        }

        self.connected = true;
        debug!(
            "connected to {} {}:{}",
            self.portid.trtype, self.portid.traddr, self.portid.trsvcid
        );
        Ok(())
    }

    /// Drop the queue. On an orderly shutdown the controller is
    /// disabled first; the completion is not waited for.
    pub fn disconnect(&mut self, shutdown: bool) {
        if shutdown && self.connected {
            let _ = self.post_property_set(reg::CC, types::CC_DISABLE);
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.ep = None;
        self.connected = false;
    }

    fn fabric_connect(&mut self) -> Result<(), NvmeError> {
        let kato = if self.failed_kato { 0 } else { NVME_DISC_KATO };
        match self.connect_cmd(kato) {
            Ok(()) => Ok(()),
            Err(e)
                if !self.failed_kato
                    && e.status() == Some(status::DNR | status::INVALID_FIELD) =>
            {
                // target cannot keep this queue alive; reconnect per use
                warn!("target rejected kato, falling back to one-shot queues");
                self.failed_kato = true;
                self.connect_cmd(0)
            }
            Err(e) => Err(e),
        }
    }

    fn connect_cmd(&mut self, kato: u32) -> Result<(), NvmeError> {
        let data = types::ConnectData::new(&self.subsysnqn, &self.hostnqn).to_bytes();
        let cid = self.next_cid();
        let (addr, key) = {
            let ep = self.ep_mut()?;
            // stage the data in the registered buffer for keyed access
            ep.data_mut()[..data.len()].copy_from_slice(&data);
            (ep.data_addr(), ep.data_key())
        };
        let mut cmd = NvmeCommand::connect(0, NVMF_DQ_DEPTH, kato);
        cmd.command_id = cid;
        cmd.dptr = self.sgl(addr, data.len() as u32, key, opcode::FABRICS);

        let ep = self.ep_mut()?;
        ep.xport.send_msg(&cmd, Direction::Out(&data))?;
        self.complete(RSP_RETRY_COUNT, status::DNR | status::INVALID_FIELD)
            .map(|_| ())
    }

    /// Wait for one completion, repost the slot and map the status.
    /// Failures matching `ignore` are not logged (the caller expects
    /// them).
    fn complete(&mut self, attempts: u32, ignore: u16) -> Result<u64, NvmeError> {
        let ep = self.ep_mut()?;
        let mut cnt = attempts;
        let rsp = loop {
            match ep.poll_completion() {
                Ok(rsp) => break rsp,
                Err(e) if e.is_try_again() && cnt > 0 => cnt -= 1,
                Err(e) => return Err(e),
            }
        };
        let sc = rsp.status_code();
        if sc != 0 {
            if sc != ignore {
                error!("command failed: {}", status::name(sc));
            }
            return Err(NvmeError::Status {
                status: sc,
            });
        }
        Ok(rsp.result)
    }

    pub fn get_property(&mut self, offset: u32) -> Result<u64, NvmeError> {
        let mut cmd = NvmeCommand::property_get(offset);
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        self.complete(RSP_RETRY_COUNT, 0)
    }

    pub fn set_property(&mut self, offset: u32, value: u64) -> Result<u64, NvmeError> {
        let mut cmd = NvmeCommand::property_set(offset, value);
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        self.complete(RSP_RETRY_COUNT, 0)
    }

    /// Fire-and-forget property write, used on the disconnect path.
    fn post_property_set(&mut self, offset: u32, value: u64) -> Result<(), NvmeError> {
        let mut cmd = NvmeCommand::property_set(offset, value);
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        Ok(())
    }

    pub fn identify(&mut self) -> Result<types::IdCtrl, NvmeError> {
        let cid = self.next_cid();
        let mut page = vec![0u8; types::ID_CTRL_SIZE];
        let ep = self.ep_mut()?;
        let mr = ep.xport.alloc_key(&page)?;
        let key = ep.xport.remote_key(&mr);
        let addr = page.as_ptr() as u64;

        let mut cmd = NvmeCommand::identify(1);
        cmd.command_id = cid;
        cmd.dptr = self.sgl(addr, types::ID_CTRL_SIZE as u32, key, opcode::IDENTIFY);

        let ret = (|| {
            let ep = self.ep_mut()?;
            ep.xport.send_msg(&cmd, Direction::In)?;
            ep.xport.recv_data(&mut page)?;
            self.complete(RSP_RETRY_COUNT, 0).map(|_| ())
        })();

        if let Ok(ep) = self.ep_mut() {
            ep.xport.dealloc_key(mr);
        }
        ret.map(|_| types::IdCtrl::from_bytes(&page))
    }

    /// Two-phase discovery log fetch: a 16 byte header read for the
    /// record count, then the exact-size full page. Disagreeing
    /// numrec/genctr between the phases is an invalid-field failure.
    pub fn get_log_pages(&mut self) -> Result<(DiscRspPageHdr, Vec<DiscLogEntry>), NvmeError> {
        let mut hdr_buf = [0u8; DISC_HDR_SIZE];
        self.fetch_log(&mut hdr_buf)?;
        let hdr = DiscRspPageHdr::from_bytes(&hdr_buf);

        if hdr.numrec == 0 {
            return Ok((hdr, Vec::new()));
        }
        if hdr.numrec > MAX_LOG_RECORDS {
            warn!("truncating log page of {} records", hdr.numrec);
        }
        let numrec = hdr.numrec.min(MAX_LOG_RECORDS);

        let mut buf = vec![0u8; DISC_HDR_SIZE + numrec as usize * DISC_ENTRY_SIZE];
        self.fetch_log(&mut buf)?;
        let (full, entries) = page::parse_log_page(&buf);

        if full.numrec != hdr.numrec || full.genctr != hdr.genctr {
            return Err(NvmeError::Status {
                status: status::INVALID_FIELD,
            });
        }
        Ok((full, entries))
    }

    fn fetch_log(&mut self, buf: &mut [u8]) -> Result<(), NvmeError> {
        let cid = self.next_cid();
        let len = buf.len();
        let ep = self.ep_mut()?;
        // transient registration for exactly this transfer
        let mr = ep.xport.alloc_key(buf)?;
        let key = ep.xport.remote_key(&mr);
        let addr = buf.as_ptr() as u64;

        let mut cmd = NvmeCommand::get_log_page(types::LOG_DISC, len);
        cmd.command_id = cid;
        cmd.dptr = self.sgl(addr, len as u32, key, opcode::GET_LOG_PAGE);

        let ret = (|| {
            let ep = self.ep_mut()?;
            ep.xport.send_msg(&cmd, Direction::In)?;
            ep.xport.recv_data(buf)?;
            self.complete(RSP_RETRY_COUNT, 0).map(|_| ())
        })();

        if let Ok(ep) = self.ep_mut() {
            ep.xport.dealloc_key(mr);
        }
        ret
    }

    pub fn get_features(&mut self, fid: u8) -> Result<u64, NvmeError> {
        let mut cmd = NvmeCommand::get_features(fid);
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        self.complete(RSP_RETRY_COUNT, 0)
    }

    pub fn set_features(&mut self, fid: u8, value: u32) -> Result<u64, NvmeError> {
        let mut cmd = NvmeCommand::set_features(fid, value);
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        self.complete(RSP_RETRY_COUNT, 0)
    }

    /// Post an async event request. The completion is withheld by the
    /// controller until something changes, so there is nothing to wait
    /// for here.
    pub fn send_async_event_request(&mut self) -> Result<(), NvmeError> {
        let mut cmd = NvmeCommand::async_event_request();
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        Ok(())
    }

    /// Keep-alive including reaping the completion, for queues that do
    /// not have an async event request outstanding.
    pub fn keep_alive(&mut self) -> Result<(), NvmeError> {
        self.post_keep_alive()?;
        self.complete(RSP_RETRY_COUNT, 0).map(|_| ())
    }

    /// Send a keep-alive without waiting; callers reap completions in
    /// their own event loop.
    pub fn post_keep_alive(&mut self) -> Result<(), NvmeError> {
        let mut cmd = NvmeCommand::keep_alive();
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        Ok(())
    }

    /// Reap one pending completion; `TryAgain` when none arrived within
    /// the poll timeout.
    pub fn poll_event(&mut self) -> Result<NvmeCompletion, NvmeError> {
        self.ep_mut()?.poll_completion()
    }

    /// Fetch a resource configuration blob from a self-config target.
    pub fn resource_config_get(&mut self, resource: u32, len: usize) -> Result<Vec<u8>, NvmeError> {
        let mut buf = vec![0u8; len];
        let cid = self.next_cid();
        let ep = self.ep_mut()?;
        let mr = ep.xport.alloc_key(&buf)?;
        let key = ep.xport.remote_key(&mr);
        let addr = buf.as_ptr() as u64;

        let mut cmd = NvmeCommand::resource_config(fctype::RESOURCE_CONFIG_GET, resource);
        cmd.command_id = cid;
        cmd.dptr = self.sgl(addr, len as u32, key, opcode::GET_LOG_PAGE);

        let ret = (|| {
            let ep = self.ep_mut()?;
            ep.xport.send_msg(&cmd, Direction::In)?;
            ep.xport.recv_data(&mut buf)?;
            self.complete(CONFIG_RETRY_COUNT, 0).map(|_| ())
        })();

        if let Ok(ep) = self.ep_mut() {
            ep.xport.dealloc_key(mr);
        }
        ret.map(|_| buf)
    }

    /// Push one resource configuration entry to a self-config target.
    pub fn resource_config_set(&mut self, resource: u32, data: &[u8]) -> Result<(), NvmeError> {
        let cid = self.next_cid();
        let ep = self.ep_mut()?;
        let mr = ep.xport.alloc_key(data)?;
        let key = ep.xport.remote_key(&mr);
        let addr = data.as_ptr() as u64;

        let mut cmd = NvmeCommand::resource_config(fctype::RESOURCE_CONFIG_SET, resource);
        cmd.command_id = cid;
        cmd.dptr = self.sgl(addr, data.len() as u32, key, opcode::FABRICS);

        let ret = (|| {
            let ep = self.ep_mut()?;
            ep.xport.send_msg(&cmd, Direction::Out(data))?;
            self.complete(CONFIG_RETRY_COUNT, 0).map(|_| ())
        })();

        if let Ok(ep) = self.ep_mut() {
            ep.xport.dealloc_key(mr);
        }
        ret
    }

    /// Ask a self-config target to drop its whole configuration.
    pub fn resource_config_reset(&mut self) -> Result<(), NvmeError> {
        let mut cmd = NvmeCommand::resource_config(
            fctype::RESOURCE_CONFIG_RESET,
            types::resource::RESET_CONFIG,
        );
        cmd.command_id = self.next_cid();
        self.ep_mut()?.xport.send_msg(&cmd, Direction::None)?;
        self.complete(CONFIG_RETRY_COUNT, 0).map(|_| ())
    }
}
