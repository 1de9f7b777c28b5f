use crate::{LinkSettings, PortInfo, Result, SerialBackend, SerialLink, TransportError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// An in-process backend with scriptable ports. Clones share the same set of ports.
#[derive(Clone, Default)]
pub struct MockBackend {
    ports: Arc<Mutex<BTreeMap<String, MockPort>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a port in and get a handle for feeding and inspecting it.
    pub fn add_port(&self, info: PortInfo) -> MockPort {
        let port = MockPort {
            info,
            shared: Arc::new(Shared::default()),
        };
        self.lock().insert(port.info.name.clone(), port.clone());
        port
    }

    pub fn port(&self, name: &str) -> Option<MockPort> {
        self.lock().get(name).cloned()
    }

    /// Remove a port from enumeration; open links onto it report closed.
    pub fn remove_port(&self, name: &str) -> Option<MockPort> {
        let port = self.lock().remove(name);
        if let Some(p) = &port {
            p.unplug();
        }
        port
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MockPort>> {
        self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SerialBackend for MockBackend {
    fn open(&self, path: &str, settings: &LinkSettings) -> Result<Box<dyn SerialLink>> {
        let port = self
            .port(path)
            .ok_or_else(|| TransportError::PortNotFound(path.to_string()))?;
        let session = port.begin_session()?;
        Ok(Box::new(MockLink {
            name: path.to_string(),
            shared: Arc::clone(&port.shared),
            session,
            timeout: settings.timeout,
        }))
    }

    fn list(&self) -> Result<Vec<PortInfo>> {
        Ok(self.lock().values().map(|p| p.info.clone()).collect())
    }
}

#[derive(Default)]
struct PortState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    open: bool,
    session: u64,
    opens: usize,
    fail_open: bool,
    fail_write: bool,
}

impl PortState {
    fn live(&self, session: u64) -> bool {
        self.open && self.session == session
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<PortState>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Test-side handle onto one mock port.
#[derive(Clone)]
pub struct MockPort {
    info: PortInfo,
    shared: Arc<Shared>,
}

impl MockPort {
    pub fn info(&self) -> &PortInfo {
        &self.info
    }

    /// Queue bytes as if the device had sent them.
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.shared.lock().inbound.extend(bytes.iter().copied());
        self.shared.ready.notify_all();
    }

    pub fn push_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.push_bytes(&bytes);
    }

    /// Everything the host wrote since the port was created.
    pub fn written(&self) -> Vec<u8> {
        self.shared.lock().written.clone()
    }

    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Simulate the cable being pulled: every open link reports closed.
    pub fn unplug(&self) {
        self.shared.lock().open = false;
        self.shared.ready.notify_all();
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.shared.lock().fail_open = fail;
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.shared.lock().fail_write = fail;
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().open
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    fn begin_session(&self) -> Result<u64> {
        let mut st = self.shared.lock();
        if st.fail_open {
            return Err(TransportError::Open {
                port: self.info.name.clone(),
                reason: "device busy".to_string(),
            });
        }
        st.session += 1;
        st.open = true;
        st.opens += 1;
        st.inbound.clear();
        let session = st.session;
        drop(st);
        // wake readers still parked on the previous session
        self.shared.ready.notify_all();
        Ok(session)
    }
}

struct MockLink {
    name: String,
    shared: Arc<Shared>,
    session: u64,
    timeout: Duration,
}

impl SerialLink for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut st = self.shared.lock();
        loop {
            if !st.live(self.session) {
                return Err(TransportError::Closed);
            }
            if !st.inbound.is_empty() {
                let n = buf.len().min(st.inbound.len());
                for (slot, byte) in buf.iter_mut().zip(st.inbound.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            st = self
                .shared
                .ready
                .wait_timeout(st, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut st = self.shared.lock();
        if !st.live(self.session) {
            return Err(TransportError::Closed);
        }
        if st.fail_write {
            return Err(TransportError::Io("write rejected by device".to_string()));
        }
        st.written.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.shared.lock().live(self.session) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn try_clone(&self) -> Result<Box<dyn SerialLink>> {
        Ok(Box::new(MockLink {
            name: self.name.clone(),
            shared: Arc::clone(&self.shared),
            session: self.session,
            timeout: self.timeout,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(ms: u64) -> LinkSettings {
        LinkSettings {
            baud_rate: 115_200,
            timeout: Duration::from_millis(ms),
        }
    }

    #[test]
    fn open_unknown_port_fails() {
        let backend = MockBackend::new();
        let err = backend.open("/dev/ttyUSB9", &settings(10)).err();
        assert_eq!(
            err,
            Some(TransportError::PortNotFound("/dev/ttyUSB9".to_string()))
        );
    }

    #[test]
    fn read_times_out_then_delivers_pushed_bytes() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = backend.add_port(PortInfo::new("/dev/ttyUSB0"));
        let mut link = backend.open("/dev/ttyUSB0", &settings(20))?;
        let mut buf = [0u8; 16];
        assert_eq!(link.read(&mut buf), Err(TransportError::Timeout));

        port.push_line("rssi=-40");
        let n = link.read(&mut buf)?;
        assert_eq!(&buf[..n], b"rssi=-40\n");
        Ok(())
    }

    #[test]
    fn unplug_closes_all_handles_until_reopened() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = backend.add_port(PortInfo::new("COM3"));
        let mut link = backend.open("COM3", &settings(20))?;
        let mut reader = link.try_clone()?;
        port.unplug();
        assert!(!port.is_open());
        assert_eq!(link.write_all(b"PERF_REPORT\n"), Err(TransportError::Closed));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf), Err(TransportError::Closed));

        let mut fresh = backend.open("COM3", &settings(20))?;
        fresh.write_all(b"SPEED_TEST\n")?;
        // the stale handle belongs to the old session
        assert_eq!(reader.read(&mut buf), Err(TransportError::Closed));
        assert_eq!(port.open_count(), 2);
        assert_eq!(port.written_lines(), vec!["SPEED_TEST".to_string()]);
        Ok(())
    }

    #[test]
    fn injected_failures() -> anyhow::Result<()> {
        let backend = MockBackend::new();
        let port = backend.add_port(PortInfo::new("/dev/ttyACM0").with_usb(0x303A, 0x1001));
        port.set_fail_open(true);
        assert!(matches!(
            backend.open("/dev/ttyACM0", &settings(10)),
            Err(TransportError::Open { .. })
        ));
        port.set_fail_open(false);
        let mut link = backend.open("/dev/ttyACM0", &settings(10))?;
        port.set_fail_write(true);
        assert!(matches!(link.write_all(b"x"), Err(TransportError::Io(_))));
        assert_eq!(backend.list()?.len(), 1);
        Ok(())
    }
}
