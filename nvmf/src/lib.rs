//!
//! nvmf implements the subset of the NVMe over Fabrics command set a
//! discovery controller speaks: the fabrics commands (Connect, Property
//! Get/Set), the admin commands a discovery session needs (Identify,
//! Get Log Page, Set/Get Features, Async Event Request, Keep-Alive) and
//! the vendor resource-config commands used to program a target
//! in-band. The same building blocks serve both sides of the wire; the
//! pseudo discovery controller and the monitor client are built on top.
//!
//! Transports are interchangeable behind the [`transport::Transport`]
//! trait. NVMe/TCP is always available; RDMA verbs is compiled in with
//! the `rdma` feature (it links librdmacm/libibverbs).

pub mod ctrl;
pub mod endpoint;
pub mod error;
pub mod page;
pub mod transport;
pub mod types;

pub use error::{NvmeError, TransportError};

/// Well-known discovery subsystem NQN every discovery controller serves.
pub const NVME_DISC_SUBSYS_NAME: &str = "nqn.2014-08.org.nvmexpress.discovery";

/// NQN of the management domain a DEM instance also answers to.
pub const NVME_DOMAIN_SUBSYS_NAME: &str = "nqn.2014-08.org.nvmexpress.domain";

/// Queue depth used for discovery admin queues.
pub const NVMF_DQ_DEPTH: u16 = 2;

/// Buffer size for command/data exchanges, one page.
pub const PAGE_SIZE: usize = 4096;

/// Upper bound a single transport operation may wait before reporting
/// [`TransportError::TryAgain`], in milliseconds.
pub const MSG_TIMEOUT: u64 = 100;

/// Keep-alive the manager negotiates on its discovery queues (ms).
pub const NVME_DISC_KATO: u32 = 360_000;

/// Retries for client connection establishment.
pub const CONNECT_RETRY_COUNT: u32 = 10;

/// Retries while waiting for a resource-config completion.
pub const CONFIG_RETRY_COUNT: u32 = 20;

/// Generate a host NQN from a fresh v4 UUID, the format the kernel
/// tooling uses when no host NQN is configured.
pub fn uuid_hostnqn() -> String {
    format!("nqn.2014-08.org.nvmexpress:uuid:{}", uuid::Uuid::new_v4())
}
