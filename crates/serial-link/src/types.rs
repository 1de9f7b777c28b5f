use core::fmt;
use std::time::Duration;

/// USB vendor/product id pair reported by the OS for a serial adapter
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct UsbIds {
    pub vid: u16,
    pub pid: u16,
}

impl UsbIds {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

impl fmt::Display for UsbIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{vid:04X}:{pid:04X}", vid = self.vid, pid = self.pid)
    }
}

/// One OS-visible serial port
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub usb: Option<UsbIds>,
    pub manufacturer: Option<String>,
    pub description: Option<String>,
    pub serial_number: Option<String>,
}

impl PortInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_usb(mut self, vid: u16, pid: u16) -> Self {
        self.usb = Some(UsbIds::new(vid, pid));
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Parameters used when opening a link.
///
/// `timeout` bounds every blocking read and write on the opened link.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinkSettings {
    pub baud_rate: u32,
    pub timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout: Duration::from_secs(1),
        }
    }
}
