use crate::{LinkSettings, PortInfo, Result};

/// A minimal blocking byte link to one device.
pub trait SerialLink: Send {
    /// Port path this link was opened on.
    fn name(&self) -> &str;

    /// Read whatever bytes are available, blocking at most the configured timeout.
    ///
    /// Returns [`crate::TransportError::Timeout`] when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Flush pending output to the device.
    fn flush(&mut self) -> Result<()>;

    /// Independent handle onto the same open port (one reader, one writer).
    fn try_clone(&self) -> Result<Box<dyn SerialLink>>;
}

/// Opens links and enumerates ports for one kind of backend.
pub trait SerialBackend: Send + Sync {
    /// Open a port by path (e.g., "/dev/ttyUSB0", "COM3").
    fn open(&self, path: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>>;

    /// List the serial ports this backend can currently see.
    fn list(&self) -> Result<Vec<PortInfo>>;
}
