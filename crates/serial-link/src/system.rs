use crate::{LinkSettings, PortInfo, Result, SerialBackend, SerialLink, TransportError, UsbIds};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

// USB-serial bridges reset the board on open; give it a moment before clearing.
const SETTLE: Duration = Duration::from_millis(100);

/// Serial ports as enumerated by the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemBackend;

impl SerialBackend for SystemBackend {
    fn open(&self, path: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(path, settings.baud_rate)
            .timeout(settings.timeout)
            .open()
            .map_err(|e| match e.kind {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
                _ => TransportError::Open {
                    port: path.to_string(),
                    reason: e.to_string(),
                },
            })?;
        thread::sleep(SETTLE);
        if let Err(e) = port.clear(ClearBuffer::All) {
            tracing::debug!(port = path, error = %e, "could not clear serial buffers");
        }
        Ok(Box::new(SystemLink {
            name: path.to_string(),
            port,
        }))
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))?;
        let mut out = Vec::with_capacity(ports.len());
        for p in ports {
            match p.port_type {
                SerialPortType::UsbPort(u) => out.push(PortInfo {
                    name: p.port_name,
                    usb: Some(UsbIds::new(u.vid, u.pid)),
                    manufacturer: u.manufacturer,
                    description: u.product,
                    serial_number: u.serial_number,
                }),
                _ => out.push(PortInfo::new(p.port_name)),
            }
        }
        Ok(out)
    }
}

struct SystemLink {
    name: String,
    port: Box<dyn SerialPort>,
}

fn map_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            TransportError::Closed
        }
        _ => TransportError::Io(e.to_string()),
    }
}

impl SerialLink for SystemLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.port.read(buf).map_err(map_io)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data).map_err(map_io)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(map_io)
    }

    fn try_clone(&self) -> Result<Box<dyn SerialLink>> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Box::new(SystemLink {
            name: self.name.clone(),
            port,
        }))
    }
}
