//! RDMA verbs transport: reliable-connected queue pairs set up through
//! librdmacm, commands and completions as SEND/RECV messages, data
//! moved with RDMA READ/WRITE against registered regions. All FFI
//! unsafety stays inside this module.

#![allow(clippy::missing_safety_doc)]

use std::{
    mem,
    net::SocketAddr,
    ptr,
    time::{Duration, Instant},
};

use libc::{c_int, c_void, sockaddr, sockaddr_in, sockaddr_in6};
use rdma_sys::*;
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    transport::{
        Direction,
        Listener,
        MemoryRegion,
        Message,
        RecvSlot,
        Transport,
    },
    types::{NvmeCommand, NvmeCompletion},
    MSG_TIMEOUT,
    PAGE_SIZE,
};

const RESOLVE_TIMEOUT_MS: c_int = 5000;
const BACKLOG: c_int = 16;
const MAX_SGE: u32 = 1;

const ACCESS_FLAGS: c_int = 0x1 /* LOCAL_WRITE */ | 0x2 /* REMOTE_WRITE */ | 0x4 /* REMOTE_READ */;
const WR_RDMA_WRITE: u32 = 0;
const WR_SEND: u32 = 2;
const WR_RDMA_READ: u32 = 4;
const SEND_SIGNALED: u32 = 2;

fn errno_err(what: &str) -> TransportError {
    TransportError::Io {
        source: std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("{}: {}", what, std::io::Error::last_os_error()),
        ),
    }
}

struct RecvBuf {
    buf: Box<[u8]>,
    mr: *mut ibv_mr,
}

/// One RDMA connection; used for both accepted and client endpoints.
pub struct RdmaEndpoint {
    channel: *mut rdma_event_channel,
    id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    send_cq: *mut ibv_cq,
    recv_cq: *mut ibv_cq,
    send_buf: Box<[u8]>,
    send_mr: *mut ibv_mr,
    recvs: Vec<RecvBuf>,
    depth: u16,
    connected: bool,
}

// raw verbs handles are used from one owning thread at a time
unsafe impl Send for RdmaEndpoint {}

impl RdmaEndpoint {
    pub fn init(depth: u16) -> Result<Self, TransportError> {
        let channel = unsafe { rdma_create_event_channel() };
        if channel.is_null() {
            return Err(errno_err("rdma_create_event_channel"));
        }
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        let ret = unsafe {
            rdma_create_id(
                channel,
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            unsafe { rdma_destroy_event_channel(channel) };
            return Err(errno_err("rdma_create_id"));
        }
        Ok(RdmaEndpoint {
            channel,
            id,
            pd: ptr::null_mut(),
            send_cq: ptr::null_mut(),
            recv_cq: ptr::null_mut(),
            send_buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            send_mr: ptr::null_mut(),
            recvs: Vec::new(),
            depth,
            connected: false,
        })
    }

    /// Wrap the cm id of an incoming CONNECT_REQUEST.
    fn from_request(id: *mut rdma_cm_id, depth: u16) -> Result<Self, TransportError> {
        let mut ep = RdmaEndpoint {
            channel: ptr::null_mut(),
            id,
            pd: ptr::null_mut(),
            send_cq: ptr::null_mut(),
            recv_cq: ptr::null_mut(),
            send_buf: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            send_mr: ptr::null_mut(),
            recvs: Vec::new(),
            depth,
            connected: false,
        };
        ep.setup_qp()?;
        Ok(ep)
    }

    fn wait_event(&mut self, wanted: rdma_cm_event_type::Type) -> Result<(), TransportError> {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(self.channel, &mut event) };
        if ret != 0 {
            return Err(errno_err("rdma_get_cm_event"));
        }
        let got = unsafe { (*event).event };
        unsafe { rdma_ack_cm_event(event) };
        if got != wanted {
            return Err(TransportError::Protocol {
                reason: format!("cm event {:?}, wanted {:?}", got, wanted),
            });
        }
        Ok(())
    }

    fn setup_qp(&mut self) -> Result<(), TransportError> {
        let verbs = unsafe { (*self.id).verbs };
        if verbs.is_null() {
            return Err(errno_err("no verbs context"));
        }

        self.pd = unsafe { ibv_alloc_pd(verbs) };
        if self.pd.is_null() {
            return Err(errno_err("ibv_alloc_pd"));
        }

        let cqe = self.depth as c_int * 2;
        self.send_cq =
            unsafe { ibv_create_cq(verbs, cqe, ptr::null_mut(), ptr::null_mut(), 0) };
        self.recv_cq =
            unsafe { ibv_create_cq(verbs, cqe, ptr::null_mut(), ptr::null_mut(), 0) };
        if self.send_cq.is_null() || self.recv_cq.is_null() {
            return Err(errno_err("ibv_create_cq"));
        }

        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = self.send_cq;
        attr.recv_cq = self.recv_cq;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = self.depth as u32 * 2;
        attr.cap.max_recv_wr = self.depth as u32 * 2;
        attr.cap.max_send_sge = MAX_SGE;
        attr.cap.max_recv_sge = MAX_SGE;

        if unsafe { rdma_create_qp(self.id, self.pd, &mut attr) } != 0 {
            return Err(errno_err("rdma_create_qp"));
        }

        self.send_mr = unsafe {
            ibv_reg_mr(
                self.pd,
                self.send_buf.as_ptr() as *mut c_void,
                self.send_buf.len(),
                ACCESS_FLAGS,
            )
        };
        if self.send_mr.is_null() {
            return Err(errno_err("ibv_reg_mr send"));
        }

        for i in 0..self.depth as usize {
            let buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
            let mr = unsafe {
                ibv_reg_mr(
                    self.pd,
                    buf.as_ptr() as *mut c_void,
                    buf.len(),
                    ACCESS_FLAGS,
                )
            };
            if mr.is_null() {
                return Err(errno_err("ibv_reg_mr recv"));
            }
            self.recvs.push(RecvBuf {
                buf,
                mr,
            });
            self.post_recv(i)?;
        }
        Ok(())
    }

    fn post_recv(&mut self, index: usize) -> Result<(), TransportError> {
        let slot = &mut self.recvs[index];
        let mut sge = ibv_sge {
            addr: slot.buf.as_ptr() as u64,
            length: slot.buf.len() as u32,
            lkey: unsafe { (*slot.mr).lkey },
        };
        let mut wr: ibv_recv_wr = unsafe { mem::zeroed() };
        wr.wr_id = index as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad: *mut ibv_recv_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_recv((*self.id).qp, &mut wr, &mut bad) };
        if ret != 0 {
            return Err(errno_err("ibv_post_recv"));
        }
        Ok(())
    }

    fn post_send_wr(
        &mut self,
        opcode: u32,
        local: (u64, u32, u32),
        remote: Option<(u64, u32)>,
    ) -> Result<(), TransportError> {
        let (addr, length, lkey) = local;
        let mut sge = ibv_sge {
            addr,
            length,
            lkey,
        };
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = SEND_SIGNALED;
        if let Some((raddr, rkey)) = remote {
            wr.wr.rdma.remote_addr = raddr;
            wr.wr.rdma.rkey = rkey;
        }
        let mut bad: *mut ibv_send_wr = ptr::null_mut();
        let ret = unsafe { ibv_post_send((*self.id).qp, &mut wr, &mut bad) };
        if ret != 0 {
            return Err(errno_err("ibv_post_send"));
        }
        self.wait_send_done()
    }

    fn wait_send_done(&mut self) -> Result<(), TransportError> {
        let started = Instant::now();
        loop {
            let mut wc: ibv_wc = unsafe { mem::zeroed() };
            let n = unsafe { ibv_poll_cq(self.send_cq, 1, &mut wc) };
            if n < 0 {
                return Err(errno_err("ibv_poll_cq send"));
            }
            if n > 0 {
                if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                    return Err(TransportError::Protocol {
                        reason: format!("send completion status {:?}", wc.status),
                    });
                }
                return Ok(());
            }
            if started.elapsed() > Duration::from_millis(MSG_TIMEOUT * 10) {
                return Err(TransportError::TryAgain);
            }
        }
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.send_buf[..bytes.len()].copy_from_slice(bytes);
        let lkey = unsafe { (*self.send_mr).lkey };
        self.post_send_wr(
            WR_SEND,
            (self.send_buf.as_ptr() as u64, bytes.len() as u32, lkey),
            None,
        )
    }
}

fn sockaddr_of(dst: &SocketAddr) -> (Box<[u8]>, *mut sockaddr) {
    match dst {
        SocketAddr::V4(v4) => {
            let mut sa: sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            let mut raw = vec![0u8; mem::size_of::<sockaddr_in>()].into_boxed_slice();
            unsafe {
                ptr::copy_nonoverlapping(
                    &sa as *const _ as *const u8,
                    raw.as_mut_ptr(),
                    raw.len(),
                )
            };
            let p = raw.as_mut_ptr() as *mut sockaddr;
            (raw, p)
        }
        SocketAddr::V6(v6) => {
            let mut sa: sockaddr_in6 = unsafe { mem::zeroed() };
            sa.sin6_family = libc::AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            let mut raw = vec![0u8; mem::size_of::<sockaddr_in6>()].into_boxed_slice();
            unsafe {
                ptr::copy_nonoverlapping(
                    &sa as *const _ as *const u8,
                    raw.as_mut_ptr(),
                    raw.len(),
                )
            };
            let p = raw.as_mut_ptr() as *mut sockaddr;
            (raw, p)
        }
    }
}

impl Transport for RdmaEndpoint {
    fn accept_connection(&mut self) -> Result<(), TransportError> {
        let mut param: rdma_conn_param = unsafe { mem::zeroed() };
        param.responder_resources = 1;
        param.initiator_depth = 1;
        param.retry_count = 7;
        param.rnr_retry_count = 7;
        if unsafe { rdma_accept(self.id, &mut param) } != 0 {
            return Err(errno_err("rdma_accept"));
        }
        self.connected = true;
        Ok(())
    }

    fn reject_connection(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let ret = unsafe {
            rdma_reject(
                self.id,
                data.as_ptr() as *const c_void,
                data.len() as u8,
            )
        };
        if ret != 0 {
            return Err(errno_err("rdma_reject"));
        }
        Ok(())
    }

    fn client_connect(&mut self, dst: &SocketAddr) -> Result<(), TransportError> {
        let (_raw, sa) = sockaddr_of(dst);
        if unsafe { rdma_resolve_addr(self.id, ptr::null_mut(), sa, RESOLVE_TIMEOUT_MS) } != 0 {
            return Err(errno_err("rdma_resolve_addr"));
        }
        self.wait_event(rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED)?;

        if unsafe { rdma_resolve_route(self.id, RESOLVE_TIMEOUT_MS) } != 0 {
            return Err(errno_err("rdma_resolve_route"));
        }
        self.wait_event(rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED)?;

        self.setup_qp()?;

        let mut param: rdma_conn_param = unsafe { mem::zeroed() };
        param.responder_resources = 1;
        param.initiator_depth = 1;
        param.retry_count = 7;
        param.rnr_retry_count = 7;
        if unsafe { rdma_connect(self.id, &mut param) } != 0 {
            return Err(errno_err("rdma_connect"));
        }
        self.wait_event(rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?;
        self.connected = true;
        debug!("rdma queue pair established");
        Ok(())
    }

    fn poll_for_msg(&mut self) -> Result<(Message, RecvSlot), TransportError> {
        let started = Instant::now();
        loop {
            let mut wc: ibv_wc = unsafe { mem::zeroed() };
            let n = unsafe { ibv_poll_cq(self.recv_cq, 1, &mut wc) };
            if n < 0 {
                return Err(errno_err("ibv_poll_cq recv"));
            }
            if n > 0 {
                if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
                    return Err(TransportError::Closed);
                }
                let index = wc.wr_id as usize;
                let bytes = wc.byte_len as usize;
                let buf = &self.recvs[index].buf;
                let msg = match bytes {
                    crate::types::NVME_CMD_SIZE => {
                        Message::Command(NvmeCommand::from_bytes(buf))
                    }
                    crate::types::NVME_CQE_SIZE => {
                        Message::Completion(NvmeCompletion::from_bytes(buf))
                    }
                    _ => {
                        return Err(TransportError::Protocol {
                            reason: format!("unexpected message of {} bytes", bytes),
                        })
                    }
                };
                return Ok((msg, RecvSlot(index)));
            }
            if started.elapsed() > Duration::from_millis(MSG_TIMEOUT) {
                return Err(TransportError::TryAgain);
            }
        }
    }

    fn repost_recv(&mut self, slot: RecvSlot) -> Result<(), TransportError> {
        self.post_recv(slot.0)
    }

    fn send_msg(&mut self, cmd: &NvmeCommand, _dir: Direction<'_>) -> Result<(), TransportError> {
        // data accompanying a command lives in a registered buffer the
        // SGL names; the peer moves it with RDMA READ/WRITE
        self.send_bytes(&cmd.to_bytes())
    }

    fn send_rsp(&mut self, rsp: &NvmeCompletion) -> Result<(), TransportError> {
        self.send_bytes(&rsp.to_bytes())
    }

    fn recv_data(&mut self, _buf: &mut [u8]) -> Result<(), TransportError> {
        // the peer RDMA WRITEs straight into the registered buffer
        Ok(())
    }

    fn rma_read(
        &mut self,
        buf: &mut [u8],
        addr: u64,
        len: usize,
        key: u32,
        mr: &MemoryRegion,
    ) -> Result<(), TransportError> {
        if len > buf.len() {
            return Err(TransportError::InvalidParam {
                reason: format!("read of {} bytes exceeds buffer", len),
            });
        }
        self.post_send_wr(
            WR_RDMA_READ,
            (buf.as_ptr() as u64, len as u32, mr.lkey),
            Some((addr, key)),
        )
    }

    fn rma_write(
        &mut self,
        buf: &[u8],
        addr: u64,
        key: u32,
        mr: &MemoryRegion,
        _cccid: u16,
    ) -> Result<(), TransportError> {
        self.post_send_wr(
            WR_RDMA_WRITE,
            (buf.as_ptr() as u64, buf.len() as u32, mr.lkey),
            Some((addr, key)),
        )
    }

    fn alloc_key(&mut self, buf: &[u8]) -> Result<MemoryRegion, TransportError> {
        let mr = unsafe {
            ibv_reg_mr(
                self.pd,
                buf.as_ptr() as *mut c_void,
                buf.len(),
                ACCESS_FLAGS,
            )
        };
        if mr.is_null() {
            return Err(errno_err("ibv_reg_mr"));
        }
        Ok(MemoryRegion {
            key: unsafe { (*mr).rkey },
            lkey: unsafe { (*mr).lkey },
            handle: mr as usize,
        })
    }

    fn remote_key(&self, mr: &MemoryRegion) -> u32 {
        mr.key
    }

    fn dealloc_key(&mut self, mr: MemoryRegion) {
        if mr.handle != 0 {
            unsafe { ibv_dereg_mr(mr.handle as *mut ibv_mr) };
        }
    }

    fn shutdown(&mut self) {
        if self.connected {
            unsafe { rdma_disconnect(self.id) };
            self.connected = false;
        }
    }
}

impl Drop for RdmaEndpoint {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            for slot in self.recvs.drain(..) {
                ibv_dereg_mr(slot.mr);
                drop(slot.buf);
            }
            if !self.send_mr.is_null() {
                ibv_dereg_mr(self.send_mr);
            }
            if !self.id.is_null() {
                if !(*self.id).qp.is_null() {
                    rdma_destroy_qp(self.id);
                }
            }
            if !self.send_cq.is_null() {
                ibv_destroy_cq(self.send_cq);
            }
            if !self.recv_cq.is_null() {
                ibv_destroy_cq(self.recv_cq);
            }
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            if !self.id.is_null() {
                rdma_destroy_id(self.id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}

/// Passive side: a cm id bound and listening; connection requests are
/// turned into endpoints ready for `accept_connection`.
pub struct RdmaListener {
    channel: *mut rdma_event_channel,
    id: *mut rdma_cm_id,
}

unsafe impl Send for RdmaListener {}

impl RdmaListener {
    pub fn init(addr: &str, trsvcid: &str) -> Result<Self, TransportError> {
        let sockaddr: SocketAddr = format!("{}:{}", addr, trsvcid)
            .parse()
            .map_err(|_| TransportError::InvalidParam {
                reason: format!("bad listen address {}:{}", addr, trsvcid),
            })?;

        let channel = unsafe { rdma_create_event_channel() };
        if channel.is_null() {
            return Err(errno_err("rdma_create_event_channel"));
        }
        let mut id: *mut rdma_cm_id = ptr::null_mut();
        if unsafe {
            rdma_create_id(channel, &mut id, ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        } != 0
        {
            unsafe { rdma_destroy_event_channel(channel) };
            return Err(errno_err("rdma_create_id"));
        }

        let (_raw, sa) = sockaddr_of(&sockaddr);
        if unsafe { rdma_bind_addr(id, sa) } != 0 {
            let err = errno_err("rdma_bind_addr");
            unsafe {
                rdma_destroy_id(id);
                rdma_destroy_event_channel(channel);
            }
            return Err(err);
        }
        if unsafe { rdma_listen(id, BACKLOG) } != 0 {
            let err = errno_err("rdma_listen");
            unsafe {
                rdma_destroy_id(id);
                rdma_destroy_event_channel(channel);
            }
            return Err(err);
        }

        // poll the event channel instead of blocking in the kernel
        unsafe {
            let fd = (*channel).fd;
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        Ok(RdmaListener {
            channel,
            id,
        })
    }
}

impl Listener for RdmaListener {
    fn wait_for_connection(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        let ret = unsafe { rdma_get_cm_event(self.channel, &mut event) };
        if ret != 0 {
            let e = std::io::Error::last_os_error();
            if e.kind() == std::io::ErrorKind::WouldBlock {
                return Err(TransportError::TryAgain);
            }
            return Err(e.into());
        }

        let etype = unsafe { (*event).event };
        if etype != rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST {
            warn!("ignoring cm event {:?}", etype);
            unsafe { rdma_ack_cm_event(event) };
            return Err(TransportError::TryAgain);
        }

        let conn_id = unsafe { (*event).id };
        unsafe { rdma_ack_cm_event(event) };

        Ok(Box::new(RdmaEndpoint::from_request(
            conn_id,
            crate::NVMF_DQ_DEPTH,
        )?))
    }
}

impl Drop for RdmaListener {
    fn drop(&mut self) {
        unsafe {
            if !self.id.is_null() {
                rdma_destroy_id(self.id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}
