//! Registry of device connections with manager-wide sinks, broadcast commands and
//! reconnect supervision.

use crate::connection::{ConnectionSettings, DeviceConnection};
use crate::discovery::{discover_devices, DeviceIdentity};
use crate::monitor::HealthMonitor;
use crate::sinks::{LineSink, SinkId};
use crate::{lock, ConnectionError, DeviceCommand, ManagerError, MetricsHub, MonitorConfig};
use serde::Serialize;
use serial_link::SerialBackend;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use wifi_telemetry::{TelemetryAggregator, TelemetryParser};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Defaults for connections added without an explicit baud rate.
    pub connection: ConnectionSettings,
    pub auto_reconnect: bool,
    /// Health monitor tick period.
    pub reconnect_interval: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
        }
    }
}

/// Bookkeeping for one registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub port: String,
    pub connected: bool,
    pub reading: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_data: Option<OffsetDateTime>,
    /// Connection losses plus failed reconnect attempts.
    pub error_count: u64,
}

impl DeviceStatus {
    fn new(identity: &DeviceIdentity) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            port: identity.port.clone(),
            connected: true,
            reading: false,
            last_data: None,
            error_count: 0,
        }
    }
}

pub(crate) struct Entry {
    pub(crate) connection: Arc<DeviceConnection>,
    pub(crate) status: DeviceStatus,
}

pub(crate) struct Shared {
    pub(crate) settings: ManagerSettings,
    pub(crate) backend: Arc<dyn SerialBackend>,
    // Lock order: `global_sinks` before `devices`. Connection methods that block (stop,
    // connect, send) are never called while `devices` is held.
    pub(crate) global_sinks: Mutex<Vec<(SinkId, LineSink)>>,
    pub(crate) devices: Mutex<HashMap<String, Entry>>,
    pub(crate) metrics: MetricsHub,
}

impl Shared {
    pub(crate) fn connections(&self) -> Vec<(String, Arc<DeviceConnection>)> {
        let mut all: Vec<_> = lock(&self.devices)
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(&e.connection)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Apply `f` to a device's status if it is still registered.
    pub(crate) fn update_status(&self, device_id: &str, f: impl FnOnce(&mut DeviceStatus)) {
        if let Some(entry) = lock(&self.devices).get_mut(device_id) {
            f(&mut entry.status);
        }
    }

    /// Whether `conn` is still the connection registered under `device_id`.
    pub(crate) fn is_registered(&self, device_id: &str, conn: &Arc<DeviceConnection>) -> bool {
        lock(&self.devices)
            .get(device_id)
            .is_some_and(|e| Arc::ptr_eq(&e.connection, conn))
    }

    pub(crate) fn refresh_connected_gauge(&self) {
        let live = self
            .connections()
            .iter()
            .filter(|(_, c)| c.is_connected())
            .count();
        self.metrics
            .telemetry
            .devices_connected
            .set(i64::try_from(live).unwrap_or(i64::MAX));
    }
}

/// Owns every device connection.
///
/// Safe to share between threads; all methods take `&self`. Dropping the manager
/// disconnects everything.
pub struct DeviceManager {
    shared: Arc<Shared>,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl DeviceManager {
    pub fn new(
        settings: ManagerSettings,
        backend: Arc<dyn SerialBackend>,
    ) -> Result<Self, ManagerError> {
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                backend,
                global_sinks: Mutex::new(Vec::new()),
                devices: Mutex::new(HashMap::new()),
                metrics: MetricsHub::new()?,
            }),
            monitor: Mutex::new(None),
        })
    }

    pub fn from_config(
        config: &MonitorConfig,
        backend: Arc<dyn SerialBackend>,
    ) -> Result<Self, ManagerError> {
        Self::new(config.manager_settings(), backend)
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    pub fn metrics(&self) -> &MetricsHub {
        &self.shared.metrics
    }

    /// Open `port` and register it. Returns the device id.
    ///
    /// Nothing is registered when the port cannot be opened or the id is already taken.
    pub fn add_device(
        &self,
        port: &str,
        device_id: Option<&str>,
        baud_rate: Option<u32>,
    ) -> Result<String, ConnectionError> {
        self.add_identity(DeviceIdentity::new(port, device_id), baud_rate)
    }

    fn add_identity(
        &self,
        identity: DeviceIdentity,
        baud_rate: Option<u32>,
    ) -> Result<String, ConnectionError> {
        let id = identity.device_id.clone();
        if lock(&self.shared.devices).contains_key(&id) {
            return Err(ConnectionError::DuplicateId { device: id });
        }

        let mut settings = self.shared.settings.connection;
        if let Some(baud) = baud_rate {
            settings.baud_rate = baud;
        }
        let m = &self.shared.metrics.telemetry;
        let conn = Arc::new(
            DeviceConnection::new(identity, settings, Arc::clone(&self.shared.backend))
                .with_counters(m.lines_received.clone(), m.sink_failures.clone()),
        );
        conn.connect()?;
        conn.add_sink(last_data_sink(Arc::downgrade(&self.shared), id.clone()));

        {
            let globals = lock(&self.shared.global_sinks);
            let mut devices = lock(&self.shared.devices);
            if devices.contains_key(&id) {
                drop(devices);
                drop(globals);
                conn.disconnect();
                return Err(ConnectionError::DuplicateId { device: id });
            }
            for (sid, sink) in globals.iter() {
                conn.insert_sink(*sid, Arc::clone(sink));
            }
            let status = DeviceStatus::new(conn.identity());
            devices.insert(
                id.clone(),
                Entry {
                    connection: Arc::clone(&conn),
                    status,
                },
            );
        }
        self.shared.refresh_connected_gauge();
        info!(device = %id, port = %conn.port(), baud = settings.baud_rate, "device added");
        Ok(id)
    }

    /// Discover candidate ports and add each one, optionally filtered. Returns the ids
    /// that were added; ports that fail to open are logged and skipped.
    pub fn discover_and_connect(
        &self,
        baud_rate: Option<u32>,
        filter: Option<&dyn Fn(&DeviceIdentity) -> bool>,
    ) -> Vec<String> {
        let found = match discover_devices(self.shared.backend.as_ref()) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "device discovery failed");
                return Vec::new();
            }
        };
        let mut added = Vec::new();
        for identity in found {
            if filter.is_some_and(|f| !f(&identity)) {
                debug!(port = %identity.port, "skipped by filter");
                continue;
            }
            let port = identity.port.clone();
            match self.add_identity(identity, baud_rate) {
                Ok(id) => added.push(id),
                Err(e) => warn!(port = %port, error = %e, "could not add discovered device"),
            }
        }
        added
    }

    /// Add the configured devices, or discover when the config lists none.
    pub fn connect_configured(&self, config: &MonitorConfig) -> Vec<String> {
        if config.devices.is_empty() {
            return self.discover_and_connect(Some(config.baud_rate), None);
        }
        config
            .devices
            .iter()
            .filter_map(|d| {
                self.add_device(&d.port, d.id.as_deref(), Some(config.baud_rate))
                    .map_err(|e| warn!(port = %d.port, error = %e, "could not add configured device"))
                    .ok()
            })
            .collect()
    }

    /// Disconnect and forget a device. Returns whether it was registered.
    pub fn remove_device(&self, device_id: &str) -> bool {
        let removed = lock(&self.shared.devices).remove(device_id);
        let Some(entry) = removed else {
            return false;
        };
        entry.connection.disconnect();
        for (sink, _) in lock(&self.shared.global_sinks).iter() {
            entry.connection.remove_sink(*sink);
        }
        self.shared.refresh_connected_gauge();
        info!(device = device_id, "device removed");
        true
    }

    pub fn start_reading_all(&self) {
        for (id, conn) in self.shared.connections() {
            let reading = match conn.start_reading() {
                Ok(()) => true,
                Err(e) => {
                    warn!(device = %id, error = %e, "could not start reading");
                    false
                }
            };
            self.shared.update_status(&id, |s| s.reading = reading);
        }
    }

    pub fn stop_reading_all(&self) {
        for (id, conn) in self.shared.connections() {
            conn.stop_reading();
            self.shared.update_status(&id, |s| s.reading = false);
        }
    }

    /// Register `sink` on every current and future device.
    pub fn add_global_sink<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SinkId::next();
        let sink: LineSink = Arc::new(sink);
        let mut globals = lock(&self.shared.global_sinks);
        globals.push((id, Arc::clone(&sink)));
        for (_, conn) in self.shared.connections() {
            conn.insert_sink(id, Arc::clone(&sink));
        }
        id
    }

    pub fn remove_global_sink(&self, id: SinkId) -> bool {
        let mut globals = lock(&self.shared.global_sinks);
        let before = globals.len();
        globals.retain(|(sid, _)| *sid != id);
        for (_, conn) in self.shared.connections() {
            conn.remove_sink(id);
        }
        globals.len() != before
    }

    /// Parse every line into `aggregator`.
    pub fn pipe_into(
        &self,
        parser: Arc<TelemetryParser>,
        aggregator: Arc<TelemetryAggregator>,
    ) -> SinkId {
        let m = self.shared.metrics.telemetry.clone();
        self.add_global_sink(move |device_id, line| {
            match aggregator.process_line(&parser, device_id, line) {
                Some(_) => m.records_parsed.inc(),
                None => m.parse_failures.inc(),
            }
            Ok(())
        })
    }

    /// Send `command` to every device concurrently. Maps device id to whether the send
    /// succeeded; a slow or failing device does not hold up the others.
    pub fn broadcast_command(&self, command: &str) -> BTreeMap<String, bool> {
        let connections = self.shared.connections();
        thread::scope(|scope| {
            let sends: Vec<_> = connections
                .iter()
                .map(|(id, conn)| (id, scope.spawn(move || conn.send_command(command).is_ok())))
                .collect();
            sends
                .into_iter()
                .map(|(id, handle)| (id.clone(), handle.join().unwrap_or(false)))
                .collect()
        })
    }

    pub fn broadcast(&self, command: DeviceCommand) -> BTreeMap<String, bool> {
        self.broadcast_command(&command.to_string())
    }

    pub fn trigger_all_performance_reports(&self) -> BTreeMap<String, bool> {
        self.broadcast(DeviceCommand::PerfReport)
    }

    pub fn trigger_all_speed_tests(&self) -> BTreeMap<String, bool> {
        self.broadcast(DeviceCommand::SpeedTest)
    }

    /// Set the report interval, then switch continuous reporting on or off. A device
    /// counts as successful only if both commands went through.
    pub fn enable_all_continuous_reporting(
        &self,
        enabled: bool,
        interval_ms: u32,
    ) -> BTreeMap<String, bool> {
        let interval = self.broadcast(DeviceCommand::SetInterval(interval_ms));
        let toggled = self.broadcast(DeviceCommand::Continuous(enabled));
        toggled
            .into_iter()
            .map(|(id, ok)| {
                let both = ok && interval.get(&id).copied().unwrap_or(false);
                (id, both)
            })
            .collect()
    }

    /// Start the health monitor if it is not already running.
    pub fn start_monitoring(&self) -> Result<(), ManagerError> {
        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            return Ok(());
        }
        *monitor = Some(HealthMonitor::spawn(Arc::clone(&self.shared))?);
        Ok(())
    }

    pub fn stop_monitoring(&self) {
        let monitor = lock(&self.monitor).take();
        if let Some(m) = monitor {
            m.stop();
        }
    }

    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    /// Run one health check now, on the calling thread.
    pub fn check_health(&self) {
        crate::monitor::check_devices(&self.shared);
    }

    /// Stop the monitor and every reader, close every link and forget every device.
    /// Global sinks stay registered for devices added later.
    pub fn disconnect_all(&self) {
        self.stop_monitoring();
        self.stop_reading_all();
        let drained: Vec<Entry> = lock(&self.shared.devices)
            .drain()
            .map(|(_, e)| e)
            .collect();
        let count = drained.len();
        for entry in drained {
            entry.connection.disconnect();
        }
        self.shared.refresh_connected_gauge();
        if count > 0 {
            info!(devices = count, "all devices disconnected");
        }
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        lock(&self.shared.devices)
            .get(device_id)
            .map(|e| Arc::clone(&e.connection))
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.shared.connections().into_iter().map(|(id, _)| id).collect()
    }

    pub fn device_count(&self) -> usize {
        lock(&self.shared.devices).len()
    }

    /// Status of one device, or of all when `device_id` is `None`.
    pub fn status(&self, device_id: Option<&str>) -> BTreeMap<String, DeviceStatus> {
        let devices = lock(&self.shared.devices);
        devices
            .iter()
            .filter(|(id, _)| device_id.map_or(true, |want| want == id.as_str()))
            .map(|(id, e)| (id.clone(), e.status.clone()))
            .collect()
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

// Holds only a weak reference: connections live inside `Shared`, so a strong one would
// keep the manager state alive forever.
fn last_data_sink(
    shared: Weak<Shared>,
    device_id: String,
) -> impl Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static {
    move |_, _| {
        if let Some(shared) = shared.upgrade() {
            let now = OffsetDateTime::now_utc();
            shared.update_status(&device_id, |s| s.last_data = Some(now));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::monitor::check_device;
    use serial_link::{MockBackend, MockPort, PortInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn fast() -> ManagerSettings {
        ManagerSettings {
            connection: ConnectionSettings {
                baud_rate: 115_200,
                read_timeout: Duration::from_millis(20),
                stop_grace: Duration::from_millis(500),
            },
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(30),
        }
    }

    fn manager(backend: &MockBackend) -> anyhow::Result<DeviceManager> {
        Ok(DeviceManager::new(fast(), Arc::new(backend.clone()))?)
    }

    fn esp(backend: &MockBackend, name: &str) -> MockPort {
        backend.add_port(PortInfo::new(name).with_usb(0x10C4, 0xEA60))
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    fn global_collector(mgr: &DeviceManager) -> (SinkId, Seen) {
        let seen: Seen = Arc::default();
        let s = Arc::clone(&seen);
        let id = mgr.add_global_sink(move |dev, line| {
            lock(&s).push((dev.to_string(), line.to_string()));
            Ok(())
        });
        (id, seen)
    }

    #[test]
    fn add_device_failure_registers_nothing() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        port.set_fail_open(true);
        let mgr = manager(&backend)?;
        assert!(matches!(
            mgr.add_device("/dev/ttyUSB0", None, None),
            Err(ConnectionError::Open { .. })
        ));
        assert!(matches!(
            mgr.add_device("/dev/missing", None, None),
            Err(ConnectionError::Open { .. })
        ));
        assert_eq!(mgr.device_count(), 0);
        assert!(mgr.status(None).is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_ids_are_rejected() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        esp(&backend, "/dev/ttyUSB0");
        esp(&backend, "/dev/ttyUSB1");
        let mgr = manager(&backend)?;
        assert_eq!(mgr.add_device("/dev/ttyUSB0", Some("desk"), None)?, "desk");
        assert!(matches!(
            mgr.add_device("/dev/ttyUSB1", Some("desk"), None),
            Err(ConnectionError::DuplicateId { .. })
        ));
        assert_eq!(mgr.device_ids(), vec!["desk"]);
        Ok(())
    }

    #[test]
    fn discovery_adds_matching_ports_and_honors_filter() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        esp(&backend, "/dev/ttyUSB0");
        backend.add_port(PortInfo::new("/dev/ttyUSB1").with_description("CP2102 USB to UART"));
        backend.add_port(PortInfo::new("/dev/ttyS0"));
        let mgr = manager(&backend)?;

        let only_usb1 = |d: &DeviceIdentity| d.port.ends_with('1');
        assert_eq!(mgr.discover_and_connect(None, Some(&only_usb1)), vec!["ttyUSB1"]);
        assert_eq!(mgr.discover_and_connect(Some(9600), None), vec!["ttyUSB0"]);
        assert_eq!(mgr.device_ids(), vec!["ttyUSB0", "ttyUSB1"]);
        let baud = mgr.device("ttyUSB0").map(|c| c.settings().baud_rate);
        assert_eq!(baud, Some(9600));
        Ok(())
    }

    #[test]
    fn global_sinks_reach_current_and_later_devices() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let a = esp(&backend, "/dev/ttyUSB0");
        let b = esp(&backend, "/dev/ttyUSB1");
        let mgr = manager(&backend)?;
        mgr.add_device("/dev/ttyUSB0", Some("a"), None)?;
        let (sink, seen) = global_collector(&mgr);
        mgr.add_device("/dev/ttyUSB1", Some("b"), None)?;
        mgr.start_reading_all();

        a.push_line("rssi=-40");
        b.push_line("rssi=-80");
        wait_until("both lines", || lock(&seen).len() == 2);
        let mut got = lock(&seen).clone();
        got.sort();
        assert_eq!(
            got,
            vec![
                ("a".to_string(), "rssi=-40".to_string()),
                ("b".to_string(), "rssi=-80".to_string()),
            ]
        );

        assert!(mgr.remove_global_sink(sink));
        assert!(!mgr.remove_global_sink(sink));
        a.push_line("rssi=-41");
        wait_until("third line read", || mgr.metrics().telemetry.lines_received.get() == 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(lock(&seen).len(), 2);
        let status = mgr.status(None);
        assert!(status.get("a").is_some_and(|s| s.last_data.is_some() && s.reading));
        Ok(())
    }

    #[test]
    fn failing_sink_on_one_device_does_not_affect_another() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let a = esp(&backend, "/dev/ttyUSB0");
        let b = esp(&backend, "/dev/ttyUSB1");
        let mgr = manager(&backend)?;
        mgr.add_device("/dev/ttyUSB0", Some("a"), None)?;
        mgr.add_device("/dev/ttyUSB1", Some("b"), None)?;
        mgr.add_global_sink(|dev, _| {
            if dev == "a" {
                panic!("renderer for a crashed");
            }
            Ok(())
        });
        let b_lines = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&b_lines);
        mgr.add_global_sink(move |dev, _| {
            if dev == "b" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        });
        mgr.start_reading_all();

        for i in 0..5 {
            a.push_line(&format!("rssi=-{i}"));
            b.push_line(&format!("rssi=-{i}"));
        }
        wait_until("all b lines", || b_lines.load(Ordering::SeqCst) == 5);
        wait_until("a failures", || mgr.metrics().telemetry.sink_failures.get() == 5);
        assert!(mgr.device("a").is_some_and(|c| c.is_reading()));
        Ok(())
    }

    #[test]
    fn broadcast_reports_per_device_outcome() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let a = esp(&backend, "/dev/ttyUSB0");
        let b = esp(&backend, "/dev/ttyUSB1");
        let mgr = manager(&backend)?;
        mgr.add_device("/dev/ttyUSB0", Some("a"), None)?;
        mgr.add_device("/dev/ttyUSB1", Some("b"), None)?;
        b.set_fail_write(true);

        let out = mgr.trigger_all_performance_reports();
        assert_eq!(out.get("a"), Some(&true));
        assert_eq!(out.get("b"), Some(&false));
        assert_eq!(a.written_lines(), vec!["PERF_REPORT"]);

        let out = mgr.enable_all_continuous_reporting(true, 1000);
        assert_eq!(out.get("a"), Some(&true));
        assert_eq!(out.get("b"), Some(&false));
        assert_eq!(
            a.written_lines(),
            vec!["PERF_REPORT", "SET_INTERVAL:1000", "CONTINUOUS:ON"]
        );
        assert!(mgr.broadcast_command("PING").values().filter(|ok| **ok).count() == 1);
        Ok(())
    }

    #[test]
    fn monitor_reconnects_and_resumes_reading() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        let mgr = manager(&backend)?;
        let id = mgr.add_device("/dev/ttyUSB0", None, None)?;
        let (_, seen) = global_collector(&mgr);
        mgr.start_reading_all();
        mgr.start_monitoring()?;
        assert!(mgr.is_monitoring());

        port.push_line("rssi=-50");
        wait_until("first line", || lock(&seen).len() == 1);

        port.set_fail_open(true);
        port.unplug();
        wait_until("failed reconnect counted", || {
            mgr.status(Some(&id)).get(&id).is_some_and(|s| !s.connected && s.error_count >= 2)
        });

        port.set_fail_open(false);
        wait_until("reconnected", || {
            mgr.status(Some(&id)).get(&id).is_some_and(|s| s.connected && s.reading)
        });
        port.push_line("rssi=-55");
        wait_until("line after reconnect", || lock(&seen).len() == 2);
        assert_eq!(lock(&seen)[1].1, "rssi=-55");
        assert!(mgr.metrics().telemetry.reconnects.get() >= 1);

        mgr.stop_monitoring();
        assert!(!mgr.is_monitoring());
        Ok(())
    }

    #[test]
    fn remove_device_detaches_live_device() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        let mgr = manager(&backend)?;
        let id = mgr.add_device("/dev/ttyUSB0", Some("desk"), None)?;
        let (_, seen) = global_collector(&mgr);
        mgr.start_reading_all();
        port.push_line("rssi=-50");
        wait_until("first line", || lock(&seen).len() == 1);
        let conn = mgr.device(&id).ok_or_else(|| anyhow::anyhow!("device missing"))?;

        assert!(mgr.remove_device(&id));
        assert!(!mgr.remove_device(&id));
        assert!(!conn.is_connected());
        assert!(!conn.is_reading());
        assert_eq!(mgr.device_count(), 0);
        assert!(mgr.status(None).is_empty());
        assert_eq!(mgr.metrics().telemetry.devices_connected.get(), 0);

        // the detached connection no longer feeds manager-wide sinks
        conn.connect()?;
        conn.start_reading()?;
        port.push_line("rssi=-51");
        wait_until("line read", || mgr.metrics().telemetry.lines_received.get() == 2);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(lock(&seen).len(), 1);
        Ok(())
    }

    #[test]
    fn health_check_skips_removed_connection() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        let mgr = manager(&backend)?;
        let id = mgr.add_device("/dev/ttyUSB0", None, None)?;
        let stale = mgr.device(&id).ok_or_else(|| anyhow::anyhow!("device missing"))?;

        assert!(mgr.remove_device(&id));
        check_device(&mgr.shared, &id, &stale);
        assert_eq!(port.open_count(), 1);
        assert!(!stale.is_connected());

        // same id, new connection: the stale one must still stay closed
        mgr.add_device("/dev/ttyUSB0", None, None)?;
        check_device(&mgr.shared, &id, &stale);
        assert_eq!(port.open_count(), 2);
        assert!(!stale.is_connected());
        assert_eq!(mgr.metrics().telemetry.reconnect_attempts.get(), 0);
        assert!(mgr.device(&id).is_some_and(|c| c.is_connected()));
        Ok(())
    }

    #[test]
    fn no_reconnect_when_disabled() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        let settings = ManagerSettings {
            auto_reconnect: false,
            ..fast()
        };
        let mgr = DeviceManager::new(settings, Arc::new(backend.clone()))?;
        let id = mgr.add_device("/dev/ttyUSB0", None, None)?;
        mgr.start_reading_all();
        port.unplug();
        wait_until("reader exit", || mgr.device(&id).is_some_and(|c| !c.is_reading()));
        mgr.check_health();
        let status = mgr.status(Some(&id));
        assert_eq!(status.get(&id).map(|s| (s.connected, s.error_count)), Some((false, 1)));
        assert_eq!(port.open_count(), 1);
        Ok(())
    }

    #[test]
    fn pipe_into_feeds_aggregator() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = esp(&backend, "/dev/ttyUSB0");
        let mgr = manager(&backend)?;
        let agg = Arc::new(TelemetryAggregator::new(10));
        mgr.pipe_into(Arc::new(TelemetryParser::new()?), Arc::clone(&agg));
        mgr.add_device("/dev/ttyUSB0", Some("esp"), None)?;
        mgr.start_reading_all();

        port.push_line("boot ok");
        port.push_line("rssi=-61, ssid=HomeNet");
        wait_until("record", || agg.latest("esp").is_some());
        assert_eq!(agg.latest("esp").and_then(|r| r.rssi), Some(-61));
        wait_until("metrics", || mgr.metrics().telemetry.parse_failures.get() == 1);
        assert_eq!(mgr.metrics().telemetry.records_parsed.get(), 1);
        assert!(mgr.metrics().telemetry.lines_received.get() >= 2);
        Ok(())
    }

    #[test]
    fn disconnect_all_clears_everything() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        esp(&backend, "/dev/ttyUSB0");
        esp(&backend, "/dev/ttyUSB1");
        let mgr = manager(&backend)?;
        mgr.discover_and_connect(None, None);
        mgr.start_reading_all();
        mgr.start_monitoring()?;
        let conn = mgr.device("ttyUSB0");
        assert_eq!(mgr.metrics().telemetry.devices_connected.get(), 2);

        mgr.disconnect_all();
        assert_eq!(mgr.device_count(), 0);
        assert!(!mgr.is_monitoring());
        assert!(conn.is_some_and(|c| !c.is_connected() && !c.is_reading()));
        assert_eq!(mgr.metrics().telemetry.devices_connected.get(), 0);
        assert!(!mgr.remove_device("ttyUSB0"));
        mgr.disconnect_all();
        Ok(())
    }
}
