//! wifi-telemetry: normalization and aggregation of device WiFi telemetry
//!
//! Devices report link metrics as free-form text lines (JSON objects, `PERF|key:value|...`
//! reports or loose `key=value` pairs). [`TelemetryParser`] turns each line into a typed
//! [`TelemetryRecord`]; [`TelemetryAggregator`] keeps a bounded history per device and fans
//! accepted records out to registered consumers.

mod record;
pub use record::{ConnectionStatus, SignalQuality, TelemetryRecord};

mod fields;
pub use fields::{CoercionError, Field, FieldKind, FieldValue, RawValue};

mod parser;
pub use parser::TelemetryParser;

mod stats;
pub use stats::{FieldStats, Statistics};

mod aggregator;
pub use aggregator::{ConsumerId, RecordConsumer, TelemetryAggregator, DEFAULT_HISTORY_CAPACITY};
