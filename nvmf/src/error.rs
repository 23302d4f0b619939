use snafu::Snafu;

use crate::types::status;

/// Failures raised by the transport layer. Anything that may be retried
/// on the next poll tick maps to `TryAgain`; the rest tears the
/// connection down.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum TransportError {
    #[snafu(display("resource temporarily unavailable"))]
    TryAgain,
    #[snafu(display("connection closed by peer"))]
    Closed,
    #[snafu(display("shutting down"))]
    Shutdown,
    #[snafu(display("invalid parameter: {}", reason))]
    InvalidParam { reason: String },
    #[snafu(display("protocol violation: {}", reason))]
    Protocol { reason: String },
    #[snafu(display("transport type '{}' not supported", trtype))]
    Unsupported { trtype: String },
    #[snafu(display("I/O error: {}", source))]
    Io { source: std::io::Error },
}

impl TransportError {
    pub fn is_try_again(&self) -> bool {
        matches!(self, TransportError::TryAgain)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(source: std::io::Error) -> TransportError {
        match source.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::TryAgain
            }
            std::io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io {
                source,
            },
        }
    }
}

/// Protocol level failures: a completion carrying a non-zero status, or
/// a transport fault underneath an exchange.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum NvmeError {
    #[snafu(display("status {} (0x{:x})", status::name(*status), status))]
    Status { status: u16 },
    #[snafu(display("transport: {}", source))]
    Transport { source: TransportError },
    #[snafu(display("short completion, {} bytes", bytes))]
    ShortCompletion { bytes: usize },
    #[snafu(display("invalid {} address '{}'", family, address))]
    BadAddress { family: String, address: String },
    #[snafu(display("keep-alive not supported by target"))]
    KatoFailed,
}

impl NvmeError {
    /// The NVMe status code (already shifted, DNR preserved) when the
    /// error is a command failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            NvmeError::Status {
                status,
            } => Some(*status),
            _ => None,
        }
    }

    pub fn is_try_again(&self) -> bool {
        matches!(
            self,
            NvmeError::Transport {
                source: TransportError::TryAgain,
            }
        )
    }
}

impl From<TransportError> for NvmeError {
    fn from(source: TransportError) -> NvmeError {
        NvmeError::Transport {
            source,
        }
    }
}
