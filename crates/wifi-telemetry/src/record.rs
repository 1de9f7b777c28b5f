use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// WiFi association state as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionStatus {
    /// Map a device-supplied status token. Anything unrecognized means disconnected.
    pub fn from_token(token: &str) -> Self {
        match token.trim().to_lowercase().as_str() {
            "connected" | "1" | "true" => ConnectionStatus::Connected,
            "connecting" | "2" => ConnectionStatus::Connecting,
            "failed" | "-1" | "error" => ConnectionStatus::Failed,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
        }
    }
}

/// Coarse signal bucket derived from RSSI (dBm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Weak,
    Poor,
    Unknown,
}

impl SignalQuality {
    pub fn from_rssi(rssi: Option<i64>) -> Self {
        match rssi {
            None => SignalQuality::Unknown,
            Some(r) if r >= -50 => SignalQuality::Excellent,
            Some(r) if r >= -60 => SignalQuality::Good,
            Some(r) if r >= -70 => SignalQuality::Fair,
            Some(r) if r >= -80 => SignalQuality::Weak,
            Some(_) => SignalQuality::Poor,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SignalQuality::Excellent => "Excellent",
            SignalQuality::Good => "Good",
            SignalQuality::Fair => "Fair",
            SignalQuality::Weak => "Weak",
            SignalQuality::Poor => "Poor",
            SignalQuality::Unknown => "Unknown",
        }
    }
}

/// One parsed telemetry line.
///
/// Only `device_id` and `timestamp` are always present. Every other metric is optional
/// because devices report different subsets; a value that failed coercion is left `None`.
/// Units: dBm for `rssi`/`noise_floor`, Mbps for `link_speed` and speed-test results,
/// milliseconds for latency and jitter, percent for `packet_loss`, bytes for `free_heap`,
/// seconds for `uptime`, MHz for `cpu_freq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub status: ConnectionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub noise_floor: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_speed: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_packets: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_packets: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_errors: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_errors: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_speed: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_heap: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_freq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

impl TelemetryRecord {
    /// Empty record stamped with the current time.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self::at(device_id, OffsetDateTime::now_utc())
    }

    pub fn at(device_id: impl Into<String>, timestamp: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            status: ConnectionStatus::Disconnected,
            ssid: None,
            bssid: None,
            channel: None,
            rssi: None,
            snr: None,
            noise_floor: None,
            tx_rate: None,
            rx_rate: None,
            link_speed: None,
            tx_packets: None,
            rx_packets: None,
            tx_bytes: None,
            rx_bytes: None,
            tx_errors: None,
            rx_errors: None,
            tx_retries: None,
            packet_loss: None,
            latency_min: None,
            latency_avg: None,
            latency_max: None,
            jitter: None,
            download_speed: None,
            upload_speed: None,
            free_heap: None,
            uptime: None,
            cpu_freq: None,
            raw_data: None,
        }
    }

    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_rssi(self.rssi)
    }
}
