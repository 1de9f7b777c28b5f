//! Canonical telemetry fields, their accepted spellings and value coercion.

use crate::TelemetryRecord;
use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoercionError {
    #[error("{field}: expected {expected}, got {value:?}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0}: value is null")]
    Null(&'static str),
}

/// Declared type of a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view used for statistics; text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(_) => None,
        }
    }
}

/// A value as extracted from a line, before coercion.
#[derive(Debug, Clone, Copy)]
pub enum RawValue<'a> {
    Text(&'a str),
    Json(&'a Value),
}

impl RawValue<'_> {
    /// Token used for status matching.
    pub(crate) fn status_token(&self) -> String {
        match self {
            RawValue::Text(s) => (*s).to_string(),
            RawValue::Json(Value::String(s)) => s.clone(),
            RawValue::Json(Value::Null) => String::new(),
            RawValue::Json(other) => other.to_string(),
        }
    }

    fn describe(&self) -> String {
        match self {
            RawValue::Text(s) => (*s).to_string(),
            RawValue::Json(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Ssid,
    Bssid,
    Channel,
    Rssi,
    Snr,
    NoiseFloor,
    TxRate,
    RxRate,
    LinkSpeed,
    TxPackets,
    RxPackets,
    TxBytes,
    RxBytes,
    TxErrors,
    RxErrors,
    TxRetries,
    PacketLoss,
    LatencyMin,
    LatencyAvg,
    LatencyMax,
    Jitter,
    DownloadSpeed,
    UploadSpeed,
    FreeHeap,
    Uptime,
    CpuFreq,
}

// Typed storage location of a field on the record.
enum Slot {
    Integer(fn(&mut TelemetryRecord) -> &mut Option<i64>),
    Float(fn(&mut TelemetryRecord) -> &mut Option<f64>),
    Text(fn(&mut TelemetryRecord) -> &mut Option<String>),
}

impl Field {
    pub const ALL: [Field; 26] = [
        Field::Ssid,
        Field::Bssid,
        Field::Channel,
        Field::Rssi,
        Field::Snr,
        Field::NoiseFloor,
        Field::TxRate,
        Field::RxRate,
        Field::LinkSpeed,
        Field::TxPackets,
        Field::RxPackets,
        Field::TxBytes,
        Field::RxBytes,
        Field::TxErrors,
        Field::RxErrors,
        Field::TxRetries,
        Field::PacketLoss,
        Field::LatencyMin,
        Field::LatencyAvg,
        Field::LatencyMax,
        Field::Jitter,
        Field::DownloadSpeed,
        Field::UploadSpeed,
        Field::FreeHeap,
        Field::Uptime,
        Field::CpuFreq,
    ];

    /// Resolve a lower-case key to its canonical field. Unknown keys yield `None`.
    pub fn from_alias(key: &str) -> Option<Field> {
        let field = match key {
            "rssi" | "signal" | "signal_strength" | "wifi_rssi" => Field::Rssi,
            "ssid" | "network" | "wifi_ssid" => Field::Ssid,
            "channel" | "chan" | "ch" => Field::Channel,
            "bssid" | "mac" | "ap_mac" => Field::Bssid,
            "tx_rate" | "txrate" | "tx_speed" => Field::TxRate,
            "rx_rate" | "rxrate" | "rx_speed" => Field::RxRate,
            "link_speed" | "linkspeed" | "speed" => Field::LinkSpeed,
            "tx_packets" | "txpkt" => Field::TxPackets,
            "rx_packets" | "rxpkt" => Field::RxPackets,
            "tx_bytes" | "txbytes" => Field::TxBytes,
            "rx_bytes" | "rxbytes" => Field::RxBytes,
            "tx_errors" | "txerr" => Field::TxErrors,
            "rx_errors" | "rxerr" => Field::RxErrors,
            "tx_retries" | "retries" => Field::TxRetries,
            "packet_loss" | "loss" | "ploss" => Field::PacketLoss,
            "latency" | "latency_avg" | "ping" | "rtt" => Field::LatencyAvg,
            "latency_min" | "ping_min" => Field::LatencyMin,
            "latency_max" | "ping_max" => Field::LatencyMax,
            "jitter" => Field::Jitter,
            "download" | "download_speed" | "dl_speed" => Field::DownloadSpeed,
            "upload" | "upload_speed" | "ul_speed" => Field::UploadSpeed,
            "heap" | "free_heap" | "freemem" => Field::FreeHeap,
            "uptime" => Field::Uptime,
            "cpu_freq" | "freq" => Field::CpuFreq,
            "snr" => Field::Snr,
            "noise" | "noise_floor" => Field::NoiseFloor,
            _ => return None,
        };
        Some(field)
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Ssid => "ssid",
            Field::Bssid => "bssid",
            Field::Channel => "channel",
            Field::Rssi => "rssi",
            Field::Snr => "snr",
            Field::NoiseFloor => "noise_floor",
            Field::TxRate => "tx_rate",
            Field::RxRate => "rx_rate",
            Field::LinkSpeed => "link_speed",
            Field::TxPackets => "tx_packets",
            Field::RxPackets => "rx_packets",
            Field::TxBytes => "tx_bytes",
            Field::RxBytes => "rx_bytes",
            Field::TxErrors => "tx_errors",
            Field::RxErrors => "rx_errors",
            Field::TxRetries => "tx_retries",
            Field::PacketLoss => "packet_loss",
            Field::LatencyMin => "latency_min",
            Field::LatencyAvg => "latency_avg",
            Field::LatencyMax => "latency_max",
            Field::Jitter => "jitter",
            Field::DownloadSpeed => "download_speed",
            Field::UploadSpeed => "upload_speed",
            Field::FreeHeap => "free_heap",
            Field::Uptime => "uptime",
            Field::CpuFreq => "cpu_freq",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self.slot() {
            Slot::Integer(_) => FieldKind::Integer,
            Slot::Float(_) => FieldKind::Float,
            Slot::Text(_) => FieldKind::Text,
        }
    }

    fn slot(self) -> Slot {
        match self {
            Field::Ssid => Slot::Text(|r| &mut r.ssid),
            Field::Bssid => Slot::Text(|r| &mut r.bssid),
            Field::Channel => Slot::Integer(|r| &mut r.channel),
            Field::Rssi => Slot::Integer(|r| &mut r.rssi),
            Field::Snr => Slot::Float(|r| &mut r.snr),
            Field::NoiseFloor => Slot::Integer(|r| &mut r.noise_floor),
            Field::TxRate => Slot::Float(|r| &mut r.tx_rate),
            Field::RxRate => Slot::Float(|r| &mut r.rx_rate),
            Field::LinkSpeed => Slot::Integer(|r| &mut r.link_speed),
            Field::TxPackets => Slot::Integer(|r| &mut r.tx_packets),
            Field::RxPackets => Slot::Integer(|r| &mut r.rx_packets),
            Field::TxBytes => Slot::Integer(|r| &mut r.tx_bytes),
            Field::RxBytes => Slot::Integer(|r| &mut r.rx_bytes),
            Field::TxErrors => Slot::Integer(|r| &mut r.tx_errors),
            Field::RxErrors => Slot::Integer(|r| &mut r.rx_errors),
            Field::TxRetries => Slot::Integer(|r| &mut r.tx_retries),
            Field::PacketLoss => Slot::Float(|r| &mut r.packet_loss),
            Field::LatencyMin => Slot::Float(|r| &mut r.latency_min),
            Field::LatencyAvg => Slot::Float(|r| &mut r.latency_avg),
            Field::LatencyMax => Slot::Float(|r| &mut r.latency_max),
            Field::Jitter => Slot::Float(|r| &mut r.jitter),
            Field::DownloadSpeed => Slot::Float(|r| &mut r.download_speed),
            Field::UploadSpeed => Slot::Float(|r| &mut r.upload_speed),
            Field::FreeHeap => Slot::Integer(|r| &mut r.free_heap),
            Field::Uptime => Slot::Integer(|r| &mut r.uptime),
            Field::CpuFreq => Slot::Integer(|r| &mut r.cpu_freq),
        }
    }

    /// Coerce `raw` to this field's declared type and store it on `record`.
    ///
    /// On error the record is left untouched.
    pub fn assign(
        self,
        record: &mut TelemetryRecord,
        raw: RawValue<'_>,
    ) -> Result<(), CoercionError> {
        match self.slot() {
            Slot::Integer(at) => *at(record) = Some(self.coerce_integer(raw)?),
            Slot::Float(at) => *at(record) = Some(self.coerce_float(raw)?),
            Slot::Text(at) => *at(record) = Some(self.coerce_text(raw)?),
        }
        Ok(())
    }

    pub fn value(self, record: &TelemetryRecord) -> Option<FieldValue> {
        let r = record;
        match self {
            Field::Ssid => r.ssid.clone().map(FieldValue::Text),
            Field::Bssid => r.bssid.clone().map(FieldValue::Text),
            Field::Channel => r.channel.map(FieldValue::Integer),
            Field::Rssi => r.rssi.map(FieldValue::Integer),
            Field::Snr => r.snr.map(FieldValue::Float),
            Field::NoiseFloor => r.noise_floor.map(FieldValue::Integer),
            Field::TxRate => r.tx_rate.map(FieldValue::Float),
            Field::RxRate => r.rx_rate.map(FieldValue::Float),
            Field::LinkSpeed => r.link_speed.map(FieldValue::Integer),
            Field::TxPackets => r.tx_packets.map(FieldValue::Integer),
            Field::RxPackets => r.rx_packets.map(FieldValue::Integer),
            Field::TxBytes => r.tx_bytes.map(FieldValue::Integer),
            Field::RxBytes => r.rx_bytes.map(FieldValue::Integer),
            Field::TxErrors => r.tx_errors.map(FieldValue::Integer),
            Field::RxErrors => r.rx_errors.map(FieldValue::Integer),
            Field::TxRetries => r.tx_retries.map(FieldValue::Integer),
            Field::PacketLoss => r.packet_loss.map(FieldValue::Float),
            Field::LatencyMin => r.latency_min.map(FieldValue::Float),
            Field::LatencyAvg => r.latency_avg.map(FieldValue::Float),
            Field::LatencyMax => r.latency_max.map(FieldValue::Float),
            Field::Jitter => r.jitter.map(FieldValue::Float),
            Field::DownloadSpeed => r.download_speed.map(FieldValue::Float),
            Field::UploadSpeed => r.upload_speed.map(FieldValue::Float),
            Field::FreeHeap => r.free_heap.map(FieldValue::Integer),
            Field::Uptime => r.uptime.map(FieldValue::Integer),
            Field::CpuFreq => r.cpu_freq.map(FieldValue::Integer),
        }
    }

    fn invalid(self, expected: &'static str, raw: RawValue<'_>) -> CoercionError {
        CoercionError::Invalid {
            field: self.name(),
            expected,
            value: raw.describe(),
        }
    }

    // Integers go through a decimal number first so "3.0" is accepted and truncated.
    fn coerce_integer(self, raw: RawValue<'_>) -> Result<i64, CoercionError> {
        let as_float = match raw {
            RawValue::Text(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(i);
                }
                s.parse::<f64>().ok()
            }
            RawValue::Json(Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    return Ok(i);
                }
                n.as_f64()
            }
            RawValue::Json(Value::String(s)) => return self.coerce_integer(RawValue::Text(s)),
            RawValue::Json(Value::Bool(b)) => return Ok(i64::from(*b)),
            RawValue::Json(Value::Null) => return Err(CoercionError::Null(self.name())),
            RawValue::Json(_) => None,
        };
        match as_float {
            Some(f) if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                Ok(f.trunc() as i64)
            }
            _ => Err(self.invalid("integer", raw)),
        }
    }

    fn coerce_float(self, raw: RawValue<'_>) -> Result<f64, CoercionError> {
        let parsed = match raw {
            RawValue::Text(s) => s.trim().parse::<f64>().ok(),
            RawValue::Json(Value::Number(n)) => n.as_f64(),
            RawValue::Json(Value::String(s)) => s.trim().parse::<f64>().ok(),
            RawValue::Json(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
            RawValue::Json(Value::Null) => return Err(CoercionError::Null(self.name())),
            RawValue::Json(_) => None,
        };
        match parsed {
            Some(f) if f.is_finite() => Ok(f),
            _ => Err(self.invalid("number", raw)),
        }
    }

    fn coerce_text(self, raw: RawValue<'_>) -> Result<String, CoercionError> {
        match raw {
            RawValue::Text(s) => Ok(s.to_string()),
            RawValue::Json(Value::String(s)) => Ok(s.clone()),
            RawValue::Json(Value::Number(n)) => Ok(n.to_string()),
            RawValue::Json(Value::Bool(b)) => Ok(b.to_string()),
            RawValue::Json(Value::Null) => Err(CoercionError::Null(self.name())),
            RawValue::Json(_) => Err(self.invalid("text", raw)),
        }
    }
}

impl Serialize for Field {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}
