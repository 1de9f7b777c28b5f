//! Background health check that reconnects devices whose link was lost.

use crate::manager::Shared;
use crate::DeviceConnection;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub(crate) struct HealthMonitor {
    stop: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

impl HealthMonitor {
    pub(crate) fn spawn(shared: Arc<Shared>) -> std::io::Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let interval = shared.settings.reconnect_interval;
        let thread = thread::Builder::new()
            .name("health-monitor".into())
            .spawn(move || {
                info!(interval = ?interval, "health monitor started");
                loop {
                    check_devices(&shared);
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("health monitor stopped");
            })?;
        Ok(Self { stop, thread })
    }

    /// Wakes the monitor and waits for the tick in progress, if any, to finish.
    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("health monitor thread panicked");
        }
    }
}

/// One pass over every registered device: mark lost links and, when enabled, reopen
/// them and restart reading.
pub(crate) fn check_devices(shared: &Shared) {
    for (id, conn) in shared.connections() {
        check_device(shared, &id, &conn);
    }
    shared.refresh_connected_gauge();
}

/// Check one device from a snapshot. A connection removed from the manager since the
/// snapshot is never reopened.
pub(crate) fn check_device(shared: &Shared, id: &str, conn: &Arc<DeviceConnection>) {
    if conn.is_connected() || !shared.is_registered(id, conn) {
        return;
    }
    let reading = conn.is_reading();
    shared.update_status(id, |s| {
        if s.connected {
            s.error_count += 1;
            warn!(device = %id, "connection lost");
        }
        s.connected = false;
        s.reading = reading;
    });
    if !shared.settings.auto_reconnect {
        return;
    }

    let m = &shared.metrics.telemetry;
    m.reconnect_attempts.inc();
    if let Err(e) = conn.connect() {
        debug!(device = %id, error = %e, "reconnect attempt failed");
        shared.update_status(id, |s| s.error_count += 1);
        return;
    }
    let resumed = conn.start_reading();
    if !shared.is_registered(id, conn) {
        // removed while reconnecting
        conn.disconnect();
        debug!(device = %id, "dropped reconnect of removed device");
        return;
    }
    match resumed {
        Ok(()) => {
            m.reconnects.inc();
            info!(device = %id, "reconnected");
            shared.update_status(id, |s| {
                s.connected = true;
                s.reading = true;
            });
        }
        Err(e) => {
            warn!(device = %id, error = %e, "reconnected but could not resume reading");
            shared.update_status(id, |s| {
                s.connected = true;
                s.reading = false;
            });
        }
    }
}
