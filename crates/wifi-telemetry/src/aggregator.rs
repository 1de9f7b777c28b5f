use crate::{Statistics, TelemetryParser, TelemetryRecord};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Callback receiving every accepted record.
pub type RecordConsumer = Arc<dyn Fn(&TelemetryRecord) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`TelemetryAggregator::add_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

#[derive(Default)]
struct State {
    history: HashMap<String, VecDeque<Arc<TelemetryRecord>>>,
    latest: HashMap<String, Arc<TelemetryRecord>>,
}

/// Bounded per-device history plus a latest-value cache, with record fan-out.
pub struct TelemetryAggregator {
    capacity: usize,
    state: Mutex<State>,
    consumers: Mutex<Vec<(ConsumerId, RecordConsumer)>>,
    next_consumer: AtomicU64,
    consumer_failures: AtomicU64,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl TelemetryAggregator {
    /// `capacity` is the number of records kept per device (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            consumers: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
            consumer_failures: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn add_consumer<F>(&self, consumer: F) -> ConsumerId
    where
        F: Fn(&TelemetryRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed));
        lock(&self.consumers).push((id, Arc::new(consumer)));
        id
    }

    pub fn remove_consumer(&self, id: ConsumerId) -> bool {
        let mut consumers = lock(&self.consumers);
        let before = consumers.len();
        consumers.retain(|(cid, _)| *cid != id);
        consumers.len() != before
    }

    /// Store `record` and notify consumers in registration order.
    ///
    /// Consumers run on the caller's thread after the history lock is released; a failing
    /// or panicking consumer is logged and skipped.
    pub fn accept(&self, record: TelemetryRecord) -> Arc<TelemetryRecord> {
        let record = Arc::new(record);
        {
            let mut st = lock(&self.state);
            let history = st.history.entry(record.device_id.clone()).or_default();
            history.push_back(Arc::clone(&record));
            while history.len() > self.capacity {
                history.pop_front();
            }
            st.latest.insert(record.device_id.clone(), Arc::clone(&record));
        }

        let consumers: Vec<(ConsumerId, RecordConsumer)> = lock(&self.consumers).clone();
        for (id, consumer) in consumers {
            let outcome = catch_unwind(AssertUnwindSafe(|| consumer(record.as_ref())));
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "consumer panicked".to_string(),
            };
            self.consumer_failures.fetch_add(1, Ordering::Relaxed);
            warn!(device = %record.device_id, consumer = id.0, error = %failure, "record consumer failed");
        }
        record
    }

    /// Parse `line` and accept the result, if any.
    pub fn process_line(
        &self,
        parser: &TelemetryParser,
        device_id: &str,
        line: &str,
    ) -> Option<Arc<TelemetryRecord>> {
        parser.parse(device_id, line).map(|r| self.accept(r))
    }

    pub fn latest(&self, device_id: &str) -> Option<Arc<TelemetryRecord>> {
        lock(&self.state).latest.get(device_id).cloned()
    }

    pub fn latest_all(&self) -> HashMap<String, Arc<TelemetryRecord>> {
        lock(&self.state).latest.clone()
    }

    /// Most recent `limit` records in arrival order; `None` or `Some(0)` returns everything kept.
    pub fn history(&self, device_id: &str, limit: Option<usize>) -> Vec<Arc<TelemetryRecord>> {
        let st = lock(&self.state);
        let Some(history) = st.history.get(device_id) else {
            return Vec::new();
        };
        let skip = match limit {
            Some(n) if n > 0 => history.len().saturating_sub(n),
            _ => 0,
        };
        history.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self, device_id: &str) -> Statistics {
        let history = self.history(device_id, None);
        Statistics::from_records(history.iter().map(|r| r.as_ref()))
    }

    /// Drop history for one device or for all. The latest-value cache is kept.
    pub fn clear_history(&self, device_id: Option<&str>) {
        let mut st = lock(&self.state);
        match device_id {
            Some(id) => {
                st.history.remove(id);
            }
            None => st.history.clear(),
        }
    }

    /// Devices that have produced at least one record.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.state).latest.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn consumer_failures(&self) -> u64 {
        self.consumer_failures.load(Ordering::Relaxed)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
