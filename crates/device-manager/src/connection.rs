//! One serial link to one device, with a background reader thread.

use crate::discovery::DeviceIdentity;
use crate::sinks::{LineSink, SinkId, SinkRegistry};
use crate::{lock, ConnectionError, DeviceCommand};
use prometheus::IntCounter;
use serial_link::{LinkSettings, SerialBackend, SerialLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 1024;
/// A device that never sends a newline must not grow the buffer without bound.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub baud_rate: u32,
    /// Upper bound on a single blocking read; also how often the reader checks its stop flag.
    pub read_timeout: Duration,
    /// How long `stop_reading` waits for the reader before abandoning it.
    pub stop_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl ConnectionSettings {
    fn link(&self) -> LinkSettings {
        LinkSettings {
            baud_rate: self.baud_rate,
            timeout: self.read_timeout,
        }
    }
}

struct Session {
    link: Box<dyn SerialLink>,
    // Per-session so a late-exiting reader from an old session cannot mark a new one dead.
    alive: Arc<AtomicBool>,
}

struct Reader {
    stop: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

/// A device connection: open link, sink list, optional reader thread.
///
/// All methods take `&self`; share the connection through an `Arc`.
pub struct DeviceConnection {
    identity: DeviceIdentity,
    settings: ConnectionSettings,
    backend: Arc<dyn SerialBackend>,
    session: Mutex<Option<Session>>,
    reader: Mutex<Option<Reader>>,
    sinks: Arc<SinkRegistry>,
    lines_received: Option<IntCounter>,
}

impl DeviceConnection {
    pub fn new(
        identity: DeviceIdentity,
        settings: ConnectionSettings,
        backend: Arc<dyn SerialBackend>,
    ) -> Self {
        Self {
            identity,
            settings,
            backend,
            session: Mutex::new(None),
            reader: Mutex::new(None),
            sinks: Arc::new(SinkRegistry::new()),
            lines_received: None,
        }
    }

    /// Count received lines and sink failures on shared counters.
    pub fn with_counters(mut self, lines_received: IntCounter, sink_failures: IntCounter) -> Self {
        self.lines_received = Some(lines_received);
        self.sinks = Arc::new(SinkRegistry::with_failure_counter(sink_failures));
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn port(&self) -> &str {
        &self.identity.port
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Open the link. Succeeds without reopening when the link is already live.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut session = lock(&self.session);
        if session.as_ref().is_some_and(|s| s.alive.load(Ordering::Acquire)) {
            return Ok(());
        }
        // Drop a dead link before reopening the same port.
        *session = None;
        let link = self
            .backend
            .open(&self.identity.port, &self.settings.link())
            .map_err(|source| {
                warn!(device = %self.identity.device_id, port = %self.identity.port, error = %source, "connect failed");
                ConnectionError::Open {
                    device: self.identity.device_id.clone(),
                    port: self.identity.port.clone(),
                    source,
                }
            })?;
        *session = Some(Session {
            link,
            alive: Arc::new(AtomicBool::new(true)),
        });
        info!(device = %self.identity.device_id, port = %self.identity.port, baud = self.settings.baud_rate, "connected");
        Ok(())
    }

    /// Stop reading and close the link. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.stop_reading();
        if let Some(session) = lock(&self.session).take() {
            session.alive.store(false, Ordering::Release);
            info!(device = %self.identity.device_id, "disconnected");
        }
    }

    /// True while the link is open and no read or open failure has been observed on it.
    pub fn is_connected(&self) -> bool {
        lock(&self.session)
            .as_ref()
            .is_some_and(|s| s.alive.load(Ordering::Acquire))
    }

    pub fn is_reading(&self) -> bool {
        lock(&self.reader)
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    /// Start the background reader. No-op if it is already running.
    pub fn start_reading(&self) -> Result<(), ConnectionError> {
        let mut reader = lock(&self.reader);
        if reader.as_ref().is_some_and(|r| !r.thread.is_finished()) {
            return Ok(());
        }
        if let Some(old) = reader.take() {
            let _ = old.thread.join();
        }

        let device = self.identity.device_id.clone();
        let (link, alive) = {
            let session = lock(&self.session);
            let Some(s) = session.as_ref().filter(|s| s.alive.load(Ordering::Acquire)) else {
                return Err(ConnectionError::NotConnected { device });
            };
            let link = s.link.try_clone().map_err(|e| ConnectionError::Spawn {
                device: device.clone(),
                reason: e.to_string(),
            })?;
            (link, Arc::clone(&s.alive))
        };

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let ctx = ReadLoop {
            device: device.clone(),
            link,
            alive,
            stop: Arc::clone(&stop),
            sinks: Arc::clone(&self.sinks),
            lines_received: self.lines_received.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("reader-{device}"))
            .spawn(move || {
                // dropped on exit, which is what `stop_reading` waits for
                let _done = done_tx;
                ctx.run();
            })
            .map_err(|e| ConnectionError::Spawn {
                device: device.clone(),
                reason: e.to_string(),
            })?;
        *reader = Some(Reader { stop, done, thread });
        debug!(device = %device, "reader started");
        Ok(())
    }

    /// Signal the reader to stop and wait up to the grace period for it to exit.
    ///
    /// A reader that does not exit in time is detached; it still stops at its next read
    /// timeout.
    pub fn stop_reading(&self) {
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        reader.stop.store(true, Ordering::Release);
        if reader.thread.thread().id() == thread::current().id() {
            // called from a sink on the reader thread itself
            return;
        }
        match reader.done.recv_timeout(self.settings.stop_grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(device = %self.identity.device_id, grace = ?self.settings.stop_grace, "reader did not stop in time; detaching");
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = reader.thread.join();
                debug!(device = %self.identity.device_id, "reader stopped");
            }
        }
    }

    pub fn add_sink<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.sinks.add(sink)
    }

    /// Register a sink under an id chosen by the caller (used for manager-wide sinks).
    pub fn insert_sink(&self, id: SinkId, sink: LineSink) {
        self.sinks.insert(id, sink);
    }

    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.sinks.remove(id)
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn sink_failures(&self) -> u64 {
        self.sinks.failures()
    }

    /// Queue received lines for a consumer that pulls with `recv`/`recv_timeout`.
    ///
    /// At most `capacity` lines wait in the queue. Lines arriving while it is full are
    /// dropped and counted as sink failures. Remove the returned sink to stop queueing.
    pub fn line_queue(&self, capacity: usize) -> (SinkId, Receiver<String>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let id = self.sinks.add(move |_, line| match tx.try_send(line.to_string()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => Ok(()),
            Err(TrySendError::Full(_)) => anyhow::bail!("line queue full"),
        });
        (id, rx)
    }

    /// Write `command` and flush, appending a newline unless it already ends with one.
    pub fn send_command(&self, command: &str) -> Result<(), ConnectionError> {
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let mut session = lock(&self.session);
        let Some(s) = session
            .as_mut()
            .filter(|s| s.alive.load(Ordering::Acquire))
        else {
            return Err(ConnectionError::NotConnected {
                device: self.identity.device_id.clone(),
            });
        };
        s.link
            .write_all(line.as_bytes())
            .and_then(|()| s.link.flush())
            .map_err(|source| {
                warn!(device = %self.identity.device_id, error = %source, "command write failed");
                ConnectionError::Write {
                    device: self.identity.device_id.clone(),
                    source,
                }
            })?;
        debug!(device = %self.identity.device_id, command = line.trim_end(), "sent command");
        Ok(())
    }

    pub fn send(&self, command: DeviceCommand) -> Result<(), ConnectionError> {
        self.send_command(&command.to_string())
    }

    pub fn trigger_performance_report(&self) -> Result<(), ConnectionError> {
        self.send(DeviceCommand::PerfReport)
    }

    pub fn trigger_speed_test(&self) -> Result<(), ConnectionError> {
        self.send(DeviceCommand::SpeedTest)
    }

    pub fn set_report_interval(&self, interval_ms: u32) -> Result<(), ConnectionError> {
        self.send(DeviceCommand::SetInterval(interval_ms))
    }

    pub fn enable_continuous_reporting(&self, enabled: bool) -> Result<(), ConnectionError> {
        self.send(DeviceCommand::Continuous(enabled))
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

struct ReadLoop {
    device: String,
    link: Box<dyn SerialLink>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    sinks: Arc<SinkRegistry>,
    lines_received: Option<IntCounter>,
}

impl ReadLoop {
    fn run(mut self) {
        let mut framer = LineFramer::default();
        let mut buf = [0u8; READ_CHUNK];
        while !self.stop.load(Ordering::Acquire) && self.alive.load(Ordering::Acquire) {
            match self.link.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        if self.stop.load(Ordering::Acquire) {
                            break;
                        }
                        if let Some(c) = &self.lines_received {
                            c.inc();
                        }
                        self.sinks.dispatch(&self.device, &line);
                    }
                }
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    warn!(device = %self.device, error = %e, "read failed; link lost");
                    self.alive.store(false, Ordering::Release);
                    break;
                }
            }
        }
        debug!(device = %self.device, "reader exiting");
    }
}

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Default)]
struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        if self.pending.len() > MAX_LINE_BYTES {
            warn!(bytes = self.pending.len(), "discarding unterminated input");
            self.pending.clear();
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_link::{MockBackend, MockPort, PortInfo};
    use std::time::Instant;

    fn fast() -> ConnectionSettings {
        ConnectionSettings {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(20),
            stop_grace: Duration::from_millis(500),
        }
    }

    fn setup(port: &str) -> (MockBackend, MockPort, DeviceConnection) {
        let backend = MockBackend::new();
        let mock = backend.add_port(PortInfo::new(port));
        let conn = DeviceConnection::new(
            DeviceIdentity::new(port, None),
            fast(),
            Arc::new(backend.clone()),
        );
        (backend, mock, conn)
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn collect(conn: &DeviceConnection) -> Arc<Mutex<Vec<(String, String)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        conn.add_sink(move |dev, line| {
            lock(&s).push((dev.to_string(), line.to_string()));
            Ok(())
        });
        seen
    }

    #[test]
    fn framer_trims_and_skips_blank_lines() {
        let mut f = LineFramer::default();
        assert!(f.push(b"rssi=-5").is_empty());
        assert_eq!(f.push(b"0\r\n\r\n  \nssid=a\n"), vec!["rssi=-50", "ssid=a"]);
        assert_eq!(f.push(b"bad\xff\xfebytes\n"), vec!["bad\u{fffd}\u{fffd}bytes"]);
    }

    #[test]
    fn framer_keeps_multibyte_chars_split_across_reads() {
        let mut f = LineFramer::default();
        let bytes = "ssid=Caf\u{e9}\n".as_bytes();
        let (a, b) = bytes.split_at(bytes.len() - 2);
        assert!(f.push(a).is_empty());
        assert_eq!(f.push(b), vec!["ssid=Caf\u{e9}"]);
    }

    #[test]
    fn lines_reach_sinks_with_device_id() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        let seen = collect(&conn);
        conn.connect()?;
        conn.start_reading()?;
        assert!(conn.is_reading());
        mock.push_line("rssi=-60");
        mock.push_bytes(b"\r\n   \nPERF|ping:12\r\n");
        wait_until("two lines", || lock(&seen).len() == 2);
        assert_eq!(
            *lock(&seen),
            vec![
                ("ttyUSB0".to_string(), "rssi=-60".to_string()),
                ("ttyUSB0".to_string(), "PERF|ping:12".to_string()),
            ]
        );
        conn.stop_reading();
        assert!(!conn.is_reading());
        Ok(())
    }

    #[test]
    fn connect_is_idempotent_and_disconnect_is_safe_twice() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        assert!(!conn.is_connected());
        conn.connect()?;
        conn.connect()?;
        assert_eq!(mock.open_count(), 1);
        conn.start_reading()?;
        conn.start_reading()?;
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(!conn.is_reading());
        Ok(())
    }

    #[test]
    fn failed_open_leaves_connection_down() {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        mock.set_fail_open(true);
        let err = conn.connect();
        assert!(matches!(err, Err(ConnectionError::Open { .. })));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.start_reading(),
            Err(ConnectionError::NotConnected { .. })
        ));
    }

    #[test]
    fn unplug_ends_reader_and_marks_disconnected() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        conn.connect()?;
        conn.start_reading()?;
        mock.unplug();
        wait_until("reader exit", || !conn.is_reading());
        assert!(!conn.is_connected());

        let seen = collect(&conn);
        conn.connect()?;
        conn.start_reading()?;
        mock.push_line("rssi=-70");
        wait_until("line after reconnect", || lock(&seen).len() == 1);
        Ok(())
    }

    #[test]
    fn commands_are_newline_terminated() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        assert!(matches!(
            conn.send_command("PERF_REPORT"),
            Err(ConnectionError::NotConnected { .. })
        ));
        conn.connect()?;
        conn.send_command("PING\n")?;
        conn.trigger_performance_report()?;
        conn.trigger_speed_test()?;
        conn.set_report_interval(500)?;
        conn.enable_continuous_reporting(false)?;
        assert_eq!(
            mock.written_lines(),
            vec![
                "PING",
                "PERF_REPORT",
                "SPEED_TEST",
                "SET_INTERVAL:500",
                "CONTINUOUS:OFF"
            ]
        );

        mock.set_fail_write(true);
        assert!(matches!(
            conn.trigger_speed_test(),
            Err(ConnectionError::Write { .. })
        ));
        assert!(conn.is_connected());
        Ok(())
    }

    #[test]
    fn terminated_commands_are_written_verbatim() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        conn.connect()?;
        conn.send_command("AT\r\n")?;
        conn.send_command("STATUS \r")?;
        conn.send_command("PING\n")?;
        assert_eq!(mock.written(), b"AT\r\nSTATUS \r\nPING\n".to_vec());
        Ok(())
    }

    #[test]
    fn slow_sink_cannot_hold_stop_past_grace() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let mock = backend.add_port(PortInfo::new("/dev/ttyUSB0"));
        let settings = ConnectionSettings {
            stop_grace: Duration::from_millis(100),
            ..fast()
        };
        let conn = DeviceConnection::new(
            DeviceIdentity::new("/dev/ttyUSB0", None),
            settings,
            Arc::new(backend.clone()),
        );
        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        conn.add_sink(move |_, _| {
            flag.store(true, Ordering::Release);
            thread::sleep(Duration::from_millis(800));
            Ok(())
        });
        conn.connect()?;
        conn.start_reading()?;
        mock.push_line("rssi=-40");
        wait_until("sink entered", || entered.load(Ordering::Acquire));

        let started = Instant::now();
        conn.stop_reading();
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(90), "returned early: {waited:?}");
        assert!(waited < Duration::from_millis(600), "waited for the sink: {waited:?}");
        assert!(!conn.is_reading());
        Ok(())
    }

    #[test]
    fn line_queue_is_bounded() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        let (id, rx) = conn.line_queue(2);
        conn.connect()?;
        conn.start_reading()?;
        for line in ["a=1", "a=2", "a=3"] {
            mock.push_line(line);
        }
        wait_until("overflow", || conn.sink_failures() == 1);
        let wait = Duration::from_millis(200);
        assert_eq!(rx.recv_timeout(wait)?, "a=1");
        assert_eq!(rx.recv_timeout(wait)?, "a=2");
        assert!(rx.try_recv().is_err());

        mock.push_line("a=4");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, "a=4");
        assert!(conn.remove_sink(id));
        assert_eq!(conn.sink_count(), 0);
        Ok(())
    }

    #[test]
    fn sink_may_stop_its_own_reader() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        let conn = Arc::new(conn);
        let weak = Arc::downgrade(&conn);
        conn.add_sink(move |_, line| {
            if line == "stop" {
                if let Some(c) = weak.upgrade() {
                    c.stop_reading();
                }
            }
            Ok(())
        });
        conn.connect()?;
        conn.start_reading()?;
        mock.push_line("stop");
        wait_until("self stop", || !conn.is_reading());
        assert!(conn.is_connected());
        Ok(())
    }

    #[test]
    fn failing_sink_does_not_stop_reader() -> anyhow::Result<()> {
        let (_backend, mock, conn) = setup("/dev/ttyUSB0");
        conn.add_sink(|_, _| anyhow::bail!("nope"));
        let seen = collect(&conn);
        conn.connect()?;
        conn.start_reading()?;
        for i in 0..3 {
            mock.push_line(&format!("rssi=-{i}"));
        }
        wait_until("three lines", || lock(&seen).len() == 3);
        assert_eq!(conn.sink_failures(), 3);
        assert!(conn.is_reading());
        Ok(())
    }
}
