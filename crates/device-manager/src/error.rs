use serial_link::TransportError;
use thiserror::Error;

/// Failures surfaced by a single device connection. None of these are fatal to the manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("{device}: not connected")]
    NotConnected { device: String },
    #[error("{device}: could not open {port}: {source}")]
    Open {
        device: String,
        port: String,
        #[source]
        source: TransportError,
    },
    #[error("{device}: write failed: {source}")]
    Write {
        device: String,
        #[source]
        source: TransportError,
    },
    #[error("{device}: a device with this id is already registered")]
    DuplicateId { device: String },
    #[error("{device}: could not start reader thread: {reason}")]
    Spawn { device: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("metrics init error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("could not start health monitor: {0}")]
    Spawn(#[from] std::io::Error),
}
