//! Line parser for device telemetry.
//!
//! Three layouts are recognized, tried in this order:
//! - a whole-line JSON object: `{"rssi": -52, "ssid": "HomeNet"}`
//! - a performance report: `PERF|rssi:-75|loss:2.5|tx_rate:120`
//! - loose pairs anywhere in the line: `rssi=-60, ssid=Net1`

use crate::{ConnectionStatus, Field, RawValue, TelemetryRecord};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

const PERF_PREFIX: &str = "PERF|";

/// Stateless translator from raw text lines to [`TelemetryRecord`]s.
#[derive(Debug, Clone)]
pub struct TelemetryParser {
    pair: Regex,
}

impl TelemetryParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pair: Regex::new(r"(\w+)\s*[=:]\s*([^,|]+)")?,
        })
    }

    /// Parse one line received from `device_id`.
    ///
    /// Returns `None` when the line matches none of the layouts. Individual fields that do
    /// not coerce are dropped without affecting the rest of the record.
    pub fn parse(&self, device_id: &str, line: &str) -> Option<TelemetryRecord> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.len() >= 2 && line.starts_with('{') && line.ends_with('}') {
            return self.parse_json(device_id, line);
        }

        let pairs = match line.strip_prefix(PERF_PREFIX).filter(|rest| !rest.is_empty()) {
            Some(rest) => self.scan_pairs(rest.split('|')),
            None if line.contains('=') || line.contains(':') => {
                self.scan_pairs(std::iter::once(line))
            }
            None => {
                debug!(device = device_id, line, "unrecognized telemetry layout");
                return None;
            }
        };
        if pairs.is_empty() {
            debug!(device = device_id, line, "no key/value pairs in line");
            return None;
        }
        Some(build_record(
            device_id,
            line,
            pairs.iter().map(|(k, v)| (k.as_str(), RawValue::Text(v))),
        ))
    }

    fn parse_json(&self, device_id: &str, line: &str) -> Option<TelemetryRecord> {
        match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(obj) => Some(build_record(
                device_id,
                line,
                obj.iter().map(|(k, v)| (k.as_str(), RawValue::Json(v))),
            )),
            Err(e) => {
                debug!(device = device_id, error = %e, "malformed JSON telemetry");
                None
            }
        }
    }

    // Later duplicates of a key overwrite the value but keep the first position.
    fn scan_pairs<'a>(&self, segments: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        for segment in segments {
            for caps in self.pair.captures_iter(segment) {
                let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                let key = key.as_str().to_lowercase();
                let value = value.as_str().trim().to_string();
                match pairs.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => pairs.push((key, value)),
                }
            }
        }
        pairs
    }
}

fn build_record<'a>(
    device_id: &str,
    line: &str,
    entries: impl Iterator<Item = (&'a str, RawValue<'a>)>,
) -> TelemetryRecord {
    let mut record = TelemetryRecord::new(device_id);
    record.raw_data = Some(line.to_string());

    for (key, raw) in entries {
        let key = key.to_lowercase();
        if key == "status" {
            record.status = ConnectionStatus::from_token(&raw.status_token());
            continue;
        }
        let Some(field) = Field::from_alias(&key) else {
            continue;
        };
        if let Err(e) = field.assign(&mut record, raw) {
            trace!(device = device_id, error = %e, "dropping field");
        }
    }
    record
}
