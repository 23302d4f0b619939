//! A connection endpoint: one transport plus the page-sized data buffer
//! registered for its lifetime. Transient buffers (log pages) register
//! per call.

use crate::{
    error::{NvmeError, TransportError},
    transport::{MemoryRegion, Message, Transport},
    types::NvmeCompletion,
    PAGE_SIZE,
};

pub struct Endpoint {
    pub xport: Box<dyn Transport>,
    data: Box<[u8]>,
    data_mr: Option<MemoryRegion>,
}

impl Endpoint {
    pub fn new(mut xport: Box<dyn Transport>) -> Result<Self, TransportError> {
        let data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let data_mr = xport.alloc_key(&data)?;
        Ok(Endpoint {
            xport,
            data,
            data_mr: Some(data_mr),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Address the peer may name in an SGL; only meaningful on RDMA.
    pub fn data_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    pub fn data_key(&self) -> u32 {
        self.data_mr.as_ref().map(|mr| mr.key()).unwrap_or(0)
    }

    /// The long-lived registration covering the data buffer.
    pub fn data_mr(&self) -> Option<&MemoryRegion> {
        self.data_mr.as_ref()
    }

    /// Pull a peer-addressed transfer of `len` bytes into the data
    /// buffer (the connect-data read on the controller side).
    pub fn rma_read_data(&mut self, addr: u64, len: usize, key: u32) -> Result<(), TransportError> {
        let mr = self.data_mr.as_ref().ok_or(TransportError::Shutdown)?;
        self.xport.rma_read(&mut self.data, addr, len, key, mr)
    }

    /// Push the first `len` bytes of the data buffer to the peer
    /// buffer named by `addr`/`key`.
    pub fn rma_write_data(
        &mut self,
        len: usize,
        addr: u64,
        key: u32,
        cccid: u16,
    ) -> Result<(), TransportError> {
        let mr = self.data_mr.as_ref().ok_or(TransportError::Shutdown)?;
        self.xport.rma_write(&self.data[..len], addr, key, mr, cccid)
    }

    /// Wait (bounded by the transport timeout) for one completion and
    /// repost its receive slot.
    pub fn poll_completion(&mut self) -> Result<NvmeCompletion, NvmeError> {
        let (msg, slot) = self.xport.poll_for_msg()?;
        self.xport.repost_recv(slot)?;
        match msg {
            Message::Completion(rsp) => Ok(rsp),
            Message::Command(cmd) => Err(NvmeError::Transport {
                source: TransportError::Protocol {
                    reason: format!("unexpected command opcode {:#x}", cmd.opcode),
                },
            }),
        }
    }

    /// Release the long-lived registration and close the connection.
    pub fn teardown(&mut self) {
        if let Some(mr) = self.data_mr.take() {
            self.xport.dealloc_key(mr);
        }
        self.xport.shutdown();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.teardown();
    }
}
