use crate::{ConnectionSettings, ManagerSettings};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// A device to connect at startup. Without an id one is derived from the port path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub port: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Monitor configuration as read from YAML. Every key is optional.
///
/// ```yaml
/// baud_rate: 115200
/// auto_reconnect: true
/// reconnect_interval_ms: 5000
/// devices:
///   - port: /dev/ttyUSB0
///     id: kitchen
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub history_capacity: usize,
    /// Empty means discover devices instead.
    pub devices: Vec<DeviceEntry>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            stop_grace_ms: 2000,
            auto_reconnect: true,
            reconnect_interval_ms: 5000,
            history_capacity: wifi_telemetry::DEFAULT_HISTORY_CAPACITY,
            devices: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Every problem found, empty when the config is usable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, value) in [
            ("baud_rate", u64::from(self.baud_rate)),
            ("read_timeout_ms", self.read_timeout_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("history_capacity", self.history_capacity as u64),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be positive"));
            }
        }
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.port.trim().is_empty() {
                problems.push(format!("devices[{i}]: port is empty"));
            }
        }
        problems
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let problems = self.problems();
        if !problems.is_empty() {
            bail!("{}", problems.join("; "));
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            connection: self.connection_settings(),
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
        }
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<MonitorConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let cfg: MonitorConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_partial_yaml_with_defaults() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        writeln!(
            f,
            "baud_rate: 921600\nreconnect_interval_ms: 250\ndevices:\n  - port: /dev/ttyUSB0\n    id: kitchen\n  - port: /dev/ttyACM0\n"
        )?;
        let cfg = load_config_file(f.path())?;
        assert_eq!(cfg.baud_rate, 921_600);
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.history_capacity, 1000);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[0].id.as_deref(), Some("kitchen"));
        assert_eq!(cfg.devices[1].id, None);

        let settings = cfg.manager_settings();
        assert_eq!(settings.reconnect_interval, Duration::from_millis(250));
        assert_eq!(settings.connection.baud_rate, 921_600);
        assert_eq!(settings.connection.read_timeout, Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn rejects_bad_values_and_unknown_keys() -> anyhow::Result<()> {
        let mut zero = tempfile::NamedTempFile::new()?;
        writeln!(zero, "reconnect_interval_ms: 0")?;
        assert!(load_config_file(zero.path()).is_err());

        let mut typo = tempfile::NamedTempFile::new()?;
        writeln!(typo, "baudrate: 9600")?;
        assert!(load_config_file(typo.path()).is_err());

        assert!(load_config_file("/nonexistent/wifi-mon.yaml").is_err());

        let cfg = MonitorConfig {
            baud_rate: 0,
            history_capacity: 0,
            devices: vec![DeviceEntry {
                port: " ".into(),
                id: None,
            }],
            ..MonitorConfig::default()
        };
        assert_eq!(cfg.problems().len(), 3);
        Ok(())
    }

    #[test]
    fn empty_document_is_all_defaults() -> anyhow::Result<()> {
        let cfg: MonitorConfig = serde_yaml::from_str("{}")?;
        assert_eq!(cfg, MonitorConfig::default());
        cfg.validate()?;
        Ok(())
    }
}
