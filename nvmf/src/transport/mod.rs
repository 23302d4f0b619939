//! Transport abstraction the protocol engine and the pseudo controller
//! are written against. Two implementations exist: NVMe/TCP and, behind
//! the `rdma` feature, RDMA verbs. The trait mirrors the operations the
//! higher layers need and nothing more; in particular the transport
//! never looks at opcodes. Commands that move data state the direction
//! explicitly.

use std::net::SocketAddr;

use crate::{
    error::TransportError,
    types::{NvmeCommand, NvmeCompletion},
};

pub mod pdu;
#[cfg(feature = "rdma")]
pub mod rdma;
pub mod tcp;

/// Data movement accompanying a command capsule, decided by the caller.
pub enum Direction<'a> {
    /// Command carries no data.
    None,
    /// Host-to-controller payload follows the capsule.
    Out(&'a [u8]),
    /// Controller-to-host transfer; the peer writes into the buffer
    /// the SGL names, collected later with [`Transport::recv_data`].
    In,
}

/// What a poll produced.
#[derive(Debug)]
pub enum Message {
    Command(NvmeCommand),
    Completion(NvmeCompletion),
}

/// Token for a consumed receive-queue entry; must be handed back via
/// [`Transport::repost_recv`] exactly once or the receive pool drains.
#[derive(Debug)]
pub struct RecvSlot(pub(crate) usize);

/// A registered memory region. For TCP both keys are zero; for RDMA
/// `key` is the verbs rkey and `lkey` the local key.
#[derive(Debug)]
pub struct MemoryRegion {
    pub(crate) key: u32,
    #[allow(dead_code)]
    pub(crate) lkey: u32,
    #[allow(dead_code)]
    pub(crate) handle: usize,
}

impl MemoryRegion {
    pub fn key(&self) -> u32 {
        self.key
    }
}

/// One connection's transport operations. Every call that can wait does
/// so for a bounded time and surfaces [`TransportError::TryAgain`]
/// rather than blocking, so owning threads can watch a stop flag.
pub trait Transport: Send {
    /// Server side handshake on an accepted connection (the IC
    /// request/response exchange on TCP).
    fn accept_connection(&mut self) -> Result<(), TransportError>;

    /// Turn an incoming connection away, optionally carrying reject
    /// data to the peer.
    fn reject_connection(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Connect to a remote listener and run the client handshake.
    fn client_connect(&mut self, dst: &SocketAddr) -> Result<(), TransportError>;

    /// Non-blocking receive of the next capsule.
    fn poll_for_msg(&mut self) -> Result<(Message, RecvSlot), TransportError>;

    /// Return a consumed receive slot to the pool.
    fn repost_recv(&mut self, slot: RecvSlot) -> Result<(), TransportError>;

    /// Send a command capsule, moving inline data per `dir`.
    fn send_msg(&mut self, cmd: &NvmeCommand, dir: Direction<'_>) -> Result<(), TransportError>;

    /// Send a completion capsule.
    fn send_rsp(&mut self, rsp: &NvmeCompletion) -> Result<(), TransportError>;

    /// Collect a controller-to-host transfer into `buf` after a
    /// `Direction::In` command was sent.
    fn recv_data(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Read `len` bytes the peer addressed at us (connect data) into
    /// the registered buffer `buf`/`mr`. The remote address and key
    /// originate from the command's SGL and only matter on RDMA.
    fn rma_read(
        &mut self,
        buf: &mut [u8],
        addr: u64,
        len: usize,
        key: u32,
        mr: &MemoryRegion,
    ) -> Result<(), TransportError>;

    /// Write the registered buffer `buf`/`mr` to the peer buffer named
    /// by `addr`/`key`; `cccid` tags the data PDU on TCP.
    fn rma_write(
        &mut self,
        buf: &[u8],
        addr: u64,
        key: u32,
        mr: &MemoryRegion,
        cccid: u16,
    ) -> Result<(), TransportError>;

    /// Register a buffer for remote access.
    fn alloc_key(&mut self, buf: &[u8]) -> Result<MemoryRegion, TransportError>;

    /// The key the peer uses to address a registered region; zero on
    /// TCP.
    fn remote_key(&self, mr: &MemoryRegion) -> u32;

    /// Drop a registration.
    fn dealloc_key(&mut self, mr: MemoryRegion);

    /// Orderly teardown; further operations fail.
    fn shutdown(&mut self);
}

/// A passive endpoint accepting host connections.
pub trait Listener: Send {
    /// Wait briefly for a connection; `TryAgain` when none is pending
    /// so the listener thread can check for shutdown.
    fn wait_for_connection(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Construct a listener for the given transport type string.
pub fn init_listener(trtype: &str, addr: &str, trsvcid: &str) -> Result<Box<dyn Listener>, TransportError> {
    match trtype {
        "tcp" => Ok(Box::new(tcp::TcpListener::init(addr, trsvcid)?)),
        #[cfg(feature = "rdma")]
        "rdma" => Ok(Box::new(rdma::RdmaListener::init(addr, trsvcid)?)),
        _ => Err(TransportError::Unsupported {
            trtype: trtype.to_string(),
        }),
    }
}

/// Construct an unconnected client endpoint.
pub fn init_endpoint(trtype: &str, depth: u16) -> Result<Box<dyn Transport>, TransportError> {
    match trtype {
        "tcp" => Ok(Box::new(tcp::TcpEndpoint::init(depth))),
        #[cfg(feature = "rdma")]
        "rdma" => Ok(Box::new(rdma::RdmaEndpoint::init(depth)?)),
        _ => Err(TransportError::Unsupported {
            trtype: trtype.to_string(),
        }),
    }
}
