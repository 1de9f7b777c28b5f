//! Registry of raw-line sinks attached to a connection.

use crate::lock;
use prometheus::IntCounter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Callback receiving `(device_id, line)` for every non-empty line read from a device.
pub type LineSink = Arc<dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync>;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique sink handle. The manager registers one global sink under the same id on
/// every connection so it can be removed everywhere at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    pub fn next() -> Self {
        SinkId(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered set of sinks.
///
/// `dispatch` works on a snapshot taken under the lock and calls sinks with the lock
/// released, so a sink may add or remove sinks (including itself) while being called.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Mutex<Vec<(SinkId, LineSink)>>,
    failures: AtomicU64,
    failure_counter: Option<IntCounter>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also count failures on a shared prometheus counter.
    pub fn with_failure_counter(counter: IntCounter) -> Self {
        Self {
            failure_counter: Some(counter),
            ..Self::default()
        }
    }

    pub fn add<F>(&self, sink: F) -> SinkId
    where
        F: Fn(&str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SinkId::next();
        self.insert(id, Arc::new(sink));
        id
    }

    /// Register an existing sink under a known id; replaces any sink already using it.
    pub fn insert(&self, id: SinkId, sink: LineSink) {
        let mut sinks = lock(&self.sinks);
        match sinks.iter_mut().find(|(sid, _)| *sid == id) {
            Some(slot) => slot.1 = sink,
            None => sinks.push((id, sink)),
        }
    }

    pub fn remove(&self, id: SinkId) -> bool {
        let mut sinks = lock(&self.sinks);
        let before = sinks.len();
        sinks.retain(|(sid, _)| *sid != id);
        sinks.len() != before
    }

    pub fn snapshot(&self) -> Vec<(SinkId, LineSink)> {
        lock(&self.sinks).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.sinks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one line to every sink. Returns how many sinks failed.
    pub fn dispatch(&self, device_id: &str, line: &str) -> usize {
        let mut failed = 0;
        for (id, sink) in self.snapshot() {
            let error = match catch_unwind(AssertUnwindSafe(|| sink(device_id, line))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "sink panicked".to_string(),
            };
            failed += 1;
            self.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(counter) = &self.failure_counter {
                counter.inc();
            }
            warn!(device = device_id, sink = id.0, %error, "line sink failed");
        }
        failed
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
