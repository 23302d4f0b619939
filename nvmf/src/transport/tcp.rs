//! NVMe/TCP transport: capsules and data transfers framed as PDUs over
//! a plain socket. Remote keys are always zero; "RMA" degenerates to
//! data PDUs on the stream.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    time::{Duration, Instant},
};

use tracing::warn;

use crate::{
    error::TransportError,
    transport::{
        pdu,
        Direction,
        Listener,
        MemoryRegion,
        Message,
        RecvSlot,
        Transport,
    },
    types::{NvmeCommand, NvmeCompletion},
    MSG_TIMEOUT,
};

const CONNECT_TIMEOUT: u64 = 5000;
/// Patience for the tail of a PDU that has started arriving.
const DRAIN_TIMEOUT: u64 = 1000;

pub struct TcpEndpoint {
    stream: Option<TcpStream>,
    #[allow(dead_code)]
    depth: u16,
}

impl TcpEndpoint {
    pub fn init(depth: u16) -> Self {
        TcpEndpoint {
            stream: None,
            depth,
        }
    }

    pub fn from_accepted(stream: TcpStream, depth: u16) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(MSG_TIMEOUT)))?;
        Ok(TcpEndpoint {
            stream: Some(stream),
            depth,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Shutdown)
    }

    /// Read exactly `buf.len()` bytes. When `may_yield` is set and
    /// nothing at all has arrived, report `TryAgain`; once a PDU has
    /// started, wait out the tail for a bounded time.
    fn read_full(&mut self, buf: &mut [u8], may_yield: bool) -> Result<(), TransportError> {
        let stream = self.stream()?;
        let started = Instant::now();
        let mut done = 0;
        while done < buf.len() {
            match stream.read(&mut buf[done..]) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => done += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if done == 0 && may_yield {
                        return Err(TransportError::TryAgain);
                    }
                    if started.elapsed() > Duration::from_millis(DRAIN_TIMEOUT) {
                        return Err(TransportError::Protocol {
                            reason: format!("short pdu, {} of {} bytes", done, buf.len()),
                        });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream()?.write_all(buf)?;
        Ok(())
    }

    /// Read a data PDU of the expected type into `buf`, honouring the
    /// offset/length the peer framed.
    fn read_data_pdu(&mut self, expected: u8, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut hdr = [0u8; pdu::DATA_PDU_SIZE];
        self.read_full(&mut hdr[..pdu::COMMON_HDR_SIZE], false)?;
        let common = pdu::CommonHdr::from_bytes(&hdr);
        if common.pdu_type != expected {
            return Err(TransportError::Protocol {
                reason: format!(
                    "expected data pdu type {}, got {}",
                    expected, common.pdu_type
                ),
            });
        }
        self.read_full(&mut hdr[pdu::COMMON_HDR_SIZE..], false)?;
        let data = pdu::DataHdr::from_bytes(&hdr[pdu::COMMON_HDR_SIZE..]);
        let off = data.data_offset as usize;
        let len = data.data_length as usize;
        if off + len > buf.len() {
            return Err(TransportError::Protocol {
                reason: format!("data pdu of {} bytes exceeds buffer", off + len),
            });
        }
        self.read_full(&mut buf[off..off + len], false)
    }

    fn write_data_pdu(&mut self, pdu_type: u8, cccid: u16, buf: &[u8]) -> Result<(), TransportError> {
        let hdr = pdu::build_data_pdu(pdu_type, cccid, buf.len());
        self.write_all(&hdr)?;
        self.write_all(buf)
    }
}

impl Transport for TcpEndpoint {
    fn accept_connection(&mut self) -> Result<(), TransportError> {
        let mut req = [0u8; pdu::IC_PDU_SIZE];
        self.read_full(&mut req[..pdu::COMMON_HDR_SIZE], false)?;
        let hdr = pdu::CommonHdr::from_bytes(&req);
        if hdr.pdu_type != pdu::ICREQ {
            return Err(TransportError::InvalidParam {
                reason: format!("expected icreq, got pdu type {}", hdr.pdu_type),
            });
        }
        self.read_full(&mut req[pdu::COMMON_HDR_SIZE..], false)?;
        pdu::validate_icreq(&req)?;
        self.write_all(&pdu::build_icresp())
    }

    fn reject_connection(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        // NVMe/TCP has no reject exchange; dropping the socket is it
        self.shutdown();
        Ok(())
    }

    fn client_connect(&mut self, dst: &SocketAddr) -> Result<(), TransportError> {
        let stream = TcpStream::connect_timeout(dst, Duration::from_millis(CONNECT_TIMEOUT))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(Duration::from_millis(MSG_TIMEOUT)))?;
        self.stream = Some(stream);

        self.write_all(&pdu::build_icreq())?;

        let mut rsp = [0u8; pdu::IC_PDU_SIZE];
        self.read_full(&mut rsp, false)?;
        pdu::validate_icresp(&rsp)
    }

    fn poll_for_msg(&mut self) -> Result<(Message, RecvSlot), TransportError> {
        let mut hdr = [0u8; pdu::COMMON_HDR_SIZE];
        self.read_full(&mut hdr, true)?;
        let common = pdu::CommonHdr::from_bytes(&hdr);

        match common.pdu_type {
            pdu::CAPSULECMD => {
                let mut b = [0u8; crate::types::NVME_CMD_SIZE];
                self.read_full(&mut b, false)?;
                Ok((Message::Command(NvmeCommand::from_bytes(&b)), RecvSlot(0)))
            }
            pdu::CAPSULERESP => {
                let mut b = [0u8; crate::types::NVME_CQE_SIZE];
                self.read_full(&mut b, false)?;
                Ok((
                    Message::Completion(NvmeCompletion::from_bytes(&b)),
                    RecvSlot(0),
                ))
            }
            pdu::H2CTERMREQ | pdu::C2HTERMREQ => Err(TransportError::Closed),
            t => Err(TransportError::Protocol {
                reason: format!("unexpected pdu type {}", t),
            }),
        }
    }

    fn repost_recv(&mut self, _slot: RecvSlot) -> Result<(), TransportError> {
        // the socket is its own receive pool
        Ok(())
    }

    fn send_msg(&mut self, cmd: &NvmeCommand, dir: Direction<'_>) -> Result<(), TransportError> {
        let hdr = pdu::CommonHdr::new(
            pdu::CAPSULECMD,
            pdu::CMD_CAPSULE_SIZE,
            pdu::CMD_CAPSULE_SIZE,
        );
        self.write_all(&hdr.to_bytes())?;
        self.write_all(&cmd.to_bytes())?;

        match dir {
            Direction::Out(data) => self.write_data_pdu(pdu::H2CDATA, cmd.command_id, data),
            _ => Ok(()),
        }
    }

    fn send_rsp(&mut self, rsp: &NvmeCompletion) -> Result<(), TransportError> {
        let hdr = pdu::CommonHdr::new(
            pdu::CAPSULERESP,
            pdu::RSP_CAPSULE_SIZE,
            pdu::RSP_CAPSULE_SIZE,
        );
        self.write_all(&hdr.to_bytes())?;
        self.write_all(&rsp.to_bytes())
    }

    fn recv_data(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        self.read_data_pdu(pdu::C2HDATA, buf)
    }

    fn rma_read(
        &mut self,
        buf: &mut [u8],
        _addr: u64,
        len: usize,
        _key: u32,
        _mr: &MemoryRegion,
    ) -> Result<(), TransportError> {
        if len > buf.len() {
            return Err(TransportError::InvalidParam {
                reason: format!("read of {} bytes exceeds buffer", len),
            });
        }
        self.read_data_pdu(pdu::H2CDATA, &mut buf[..len])
    }

    fn rma_write(
        &mut self,
        buf: &[u8],
        _addr: u64,
        _key: u32,
        _mr: &MemoryRegion,
        cccid: u16,
    ) -> Result<(), TransportError> {
        self.write_data_pdu(pdu::C2HDATA, cccid, buf)
    }

    fn alloc_key(&mut self, _buf: &[u8]) -> Result<MemoryRegion, TransportError> {
        Ok(MemoryRegion {
            key: 0,
            lkey: 0,
            handle: 0,
        })
    }

    fn remote_key(&self, _mr: &MemoryRegion) -> u32 {
        0
    }

    fn dealloc_key(&mut self, _mr: MemoryRegion) {}

    fn shutdown(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

pub struct TcpListener {
    listener: std::net::TcpListener,
}

impl TcpListener {
    pub fn init(addr: &str, trsvcid: &str) -> Result<Self, TransportError> {
        let bind = format!("{}:{}", addr, trsvcid);
        let listener = std::net::TcpListener::bind(&bind).map_err(|e| {
            warn!("bind {} failed: {}", bind, e);
            TransportError::from(e)
        })?;
        listener.set_nonblocking(true)?;
        Ok(TcpListener {
            listener,
        })
    }

    /// The address actually bound; lets tests listen on an ephemeral
    /// port.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

impl Listener for TcpListener {
    fn wait_for_connection(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        match self.listener.accept() {
            Ok((stream, _peer)) => Ok(Box::new(TcpEndpoint::from_accepted(
                stream,
                crate::NVMF_DQ_DEPTH,
            )?)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{self, NvmeCommand};

    fn pair() -> (TcpEndpoint, TcpEndpoint) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::thread::spawn(move || {
            let mut ep = TcpEndpoint::init(crate::NVMF_DQ_DEPTH);
            ep.client_connect(&addr).unwrap();
            ep
        });

        let (stream, _) = listener.accept().unwrap();
        let mut server = TcpEndpoint::from_accepted(stream, crate::NVMF_DQ_DEPTH).unwrap();
        server.accept_connection().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn capsule_exchange() {
        let (mut server, mut client) = pair();

        let mut cmd = NvmeCommand::keep_alive();
        cmd.command_id = 5;
        client.send_msg(&cmd, Direction::None).unwrap();

        let (msg, slot) = loop {
            match server.poll_for_msg() {
                Ok(m) => break m,
                Err(TransportError::TryAgain) => continue,
                Err(e) => panic!("poll failed: {}", e),
            }
        };
        let received = match msg {
            Message::Command(c) => c,
            other => panic!("unexpected message {:?}", other),
        };
        assert_eq!(received.opcode, types::opcode::KEEP_ALIVE);
        assert_eq!(received.command_id, 5);
        server.repost_recv(slot).unwrap();

        let mut rsp = crate::types::NvmeCompletion::default();
        rsp.command_id = 5;
        server.send_rsp(&rsp).unwrap();

        let (msg, _) = loop {
            match client.poll_for_msg() {
                Ok(m) => break m,
                Err(TransportError::TryAgain) => continue,
                Err(e) => panic!("poll failed: {}", e),
            }
        };
        match msg {
            Message::Completion(c) => {
                assert_eq!(c.command_id, 5);
                assert_eq!(c.status_code(), 0);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn inline_data_follows_capsule() {
        let (mut server, mut client) = pair();

        let data = crate::types::ConnectData::new(crate::NVME_DISC_SUBSYS_NAME, "nqn.test-host");
        let bytes = data.to_bytes();
        let mut cmd = NvmeCommand::connect(0, crate::NVMF_DQ_DEPTH, 0);
        cmd.dptr = types::SglDesc::keyed(0, bytes.len() as u32, 0);
        client.send_msg(&cmd, Direction::Out(&bytes)).unwrap();

        let (msg, _) = loop {
            match server.poll_for_msg() {
                Ok(m) => break m,
                Err(TransportError::TryAgain) => continue,
                Err(e) => panic!("poll failed: {}", e),
            }
        };
        let cmd = match msg {
            Message::Command(c) => c,
            other => panic!("unexpected message {:?}", other),
        };

        let mut buf = vec![0u8; types::CONNECT_DATA_SIZE];
        let mr = server.alloc_key(&buf).unwrap();
        server
            .rma_read(&mut buf, cmd.dptr.addr, cmd.dptr.length as usize, cmd.dptr.key, &mr)
            .unwrap();
        let back = crate::types::ConnectData::from_bytes(&buf);
        assert_eq!(back.hostnqn, "nqn.test-host");
        assert_eq!(back.cntlid, types::CNTLID_DYNAMIC);
    }
}
