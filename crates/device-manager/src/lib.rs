//! device-manager: connection lifecycle for serial telemetry devices
//!
//! A [`DeviceConnection`] owns one open link and a reader thread that splits incoming
//! bytes into lines and hands each to its sinks. [`DeviceManager`] keeps many of them,
//! shares manager-wide sinks across all, broadcasts commands and runs a health monitor
//! that reopens lost links.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod commands;
pub use commands::DeviceCommand;

mod config;
pub use config::{load_config_file, DeviceEntry, MonitorConfig};

mod connection;
pub use connection::{ConnectionSettings, DeviceConnection};

mod discovery;
pub use discovery::{
    derive_device_id, discover_devices, is_known_device, known_chip, DeviceIdentity,
    DESCRIPTION_KEYWORDS, KNOWN_DEVICES,
};

mod error;
pub use error::{ConnectionError, ManagerError};

mod manager;
pub use manager::{DeviceManager, DeviceStatus, ManagerSettings};

mod metrics;
pub use metrics::{MetricsHub, TelemetryMetrics};

mod monitor;

mod sinks;
pub use sinks::{LineSink, SinkId, SinkRegistry};

// Sink and consumer panics are caught, so a poisoned lock still guards consistent data.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
