use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("I/O error: {0}")]
    Io(String),
    #[error("timeout")]
    Timeout,
    #[error("link closed")]
    Closed,
    #[error("operation not supported on this backend: {0}")]
    Unsupported(&'static str),
}

impl TransportError {
    /// Timeouts are the normal "nothing arrived" outcome of a bounded read.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}
