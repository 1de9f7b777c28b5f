//! serial-link: serial port abstractions for USB-attached devices
//!
//! This crate provides traits and types for opening, enumerating and talking to serial
//! ports, with feature-gated backends. The default build enables a `mock` backend so
//! that binaries and tests run on any host without hardware attached.

mod types;
pub use types::{LinkSettings, PortInfo, UsbIds};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{SerialBackend, SerialLink};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockBackend, MockPort};

#[cfg(feature = "serial")]
mod system;

#[cfg(feature = "serial")]
pub use system::SystemBackend;
