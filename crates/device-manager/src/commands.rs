use core::fmt;

/// Host-to-device commands understood by the telemetry firmware.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceCommand {
    /// Emit one performance report now.
    PerfReport,
    /// Run a throughput test and report the result.
    SpeedTest,
    /// Period between automatic reports, in milliseconds.
    SetInterval(u32),
    Continuous(bool),
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::PerfReport => f.write_str("PERF_REPORT"),
            DeviceCommand::SpeedTest => f.write_str("SPEED_TEST"),
            DeviceCommand::SetInterval(ms) => write!(f, "SET_INTERVAL:{ms}"),
            DeviceCommand::Continuous(true) => f.write_str("CONTINUOUS:ON"),
            DeviceCommand::Continuous(false) => f.write_str("CONTINUOUS:OFF"),
        }
    }
}
