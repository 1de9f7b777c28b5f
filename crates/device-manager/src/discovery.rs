//! Enumeration and identification of attached telemetry devices.

use serial_link::{PortInfo, SerialBackend, TransportError, UsbIds};
use serde::{Serialize, Serializer};
use tracing::{debug, info};

/// USB bridge chips commonly found on ESP32 development boards.
pub const KNOWN_DEVICES: &[(UsbIds, &str)] = &[
    (UsbIds::new(0x10C4, 0xEA60), "Silicon Labs CP210x"),
    (UsbIds::new(0x1A86, 0x7523), "QinHeng CH340"),
    (UsbIds::new(0x1A86, 0x55D4), "QinHeng CH9102"),
    (UsbIds::new(0x303A, 0x1001), "Espressif USB JTAG/serial"),
    (UsbIds::new(0x303A, 0x0002), "Espressif USB CDC"),
    (UsbIds::new(0x0403, 0x6001), "FTDI FT232R"),
    (UsbIds::new(0x0403, 0x6015), "FTDI FT231X"),
];

/// Substrings (lowercase) that mark a port as a likely device when matched against its
/// description or manufacturer.
pub const DESCRIPTION_KEYWORDS: &[&str] = &["esp32", "cp210", "ch340", "ch910", "ftdi"];

/// Stable identity of a device port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub port: String,
    pub device_id: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "usb_as_text"
    )]
    pub usb: Option<UsbIds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DeviceIdentity {
    /// Identity for a port path, with an explicit id or one derived from the path.
    pub fn new(port: impl Into<String>, device_id: Option<&str>) -> Self {
        let port = port.into();
        let device_id = match device_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => derive_device_id(&port),
        };
        Self {
            port,
            device_id,
            usb: None,
            manufacturer: None,
            description: None,
        }
    }

    pub fn from_port_info(info: &PortInfo) -> Self {
        Self {
            usb: info.usb,
            manufacturer: info.manufacturer.clone(),
            description: info.description.clone(),
            ..Self::new(info.name.clone(), None)
        }
    }
}

// `VID:PID` in uppercase hex, as shown by `list`.
fn usb_as_text<S: Serializer>(usb: &Option<UsbIds>, s: S) -> Result<S::Ok, S::Error> {
    match usb {
        Some(ids) => s.collect_str(ids),
        None => s.serialize_none(),
    }
}

/// Default device id: the last path segment with macOS `tty.`/`cu.` prefixes removed.
///
/// `/dev/tty.usbserial-0001` becomes `usbserial-0001`, `COM3` stays `COM3`.
pub fn derive_device_id(port: &str) -> String {
    let leaf = port
        .rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or(port);
    let stripped = leaf
        .strip_prefix("tty.")
        .or_else(|| leaf.strip_prefix("cu."))
        .unwrap_or(leaf);
    if stripped.is_empty() {
        leaf.to_string()
    } else {
        stripped.to_string()
    }
}

/// Name of the bridge chip, if the port's USB ids are in [`KNOWN_DEVICES`].
pub fn known_chip(info: &PortInfo) -> Option<&'static str> {
    let ids = info.usb?;
    KNOWN_DEVICES
        .iter()
        .find(|(known, _)| *known == ids)
        .map(|(_, name)| *name)
}

/// A port is a candidate if its USB ids are known OR its description or manufacturer
/// mentions one of [`DESCRIPTION_KEYWORDS`].
pub fn is_known_device(info: &PortInfo) -> bool {
    if known_chip(info).is_some() {
        return true;
    }
    [info.description.as_deref(), info.manufacturer.as_deref()]
        .into_iter()
        .flatten()
        .map(str::to_lowercase)
        .any(|text| DESCRIPTION_KEYWORDS.iter().any(|kw| text.contains(kw)))
}

/// Enumerate candidate device ports.
pub fn discover_devices(
    backend: &dyn SerialBackend,
) -> Result<Vec<DeviceIdentity>, TransportError> {
    let ports = backend.list()?;
    let total = ports.len();
    let found: Vec<DeviceIdentity> = ports
        .iter()
        .filter(|p| {
            let keep = is_known_device(p);
            debug!(port = %p.name, usb = ?p.usb.map(|u| u.to_string()), keep, "considered port");
            keep
        })
        .map(DeviceIdentity::from_port_info)
        .collect();
    info!(total, matched = found.len(), "serial port discovery");
    Ok(found)
}
