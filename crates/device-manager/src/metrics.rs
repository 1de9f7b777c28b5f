use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct TelemetryMetrics {
    pub lines_received: IntCounter,
    pub records_parsed: IntCounter,
    pub parse_failures: IntCounter,
    pub sink_failures: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub reconnects: IntCounter,
    pub devices_connected: IntGauge,
}

/// Per-manager prometheus registry.
#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub telemetry: TelemetryMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let telemetry = TelemetryMetrics {
            lines_received: IntCounter::new(
                "wifimon_lines_received",
                "Non-empty lines read from devices",
            )?,
            records_parsed: IntCounter::new(
                "wifimon_records_parsed",
                "Lines that produced a telemetry record",
            )?,
            parse_failures: IntCounter::new(
                "wifimon_parse_failures",
                "Lines that matched no telemetry layout",
            )?,
            sink_failures: IntCounter::new(
                "wifimon_sink_failures",
                "Line sink invocations that failed or panicked",
            )?,
            reconnect_attempts: IntCounter::new(
                "wifimon_reconnect_attempts",
                "Reconnect attempts made by the health monitor",
            )?,
            reconnects: IntCounter::new(
                "wifimon_reconnects",
                "Reconnects that resumed reading",
            )?,
            devices_connected: IntGauge::new(
                "wifimon_devices_connected",
                "Registered devices with a live link",
            )?,
        };
        let t = &telemetry;
        registry.register(Box::new(t.lines_received.clone()))?;
        registry.register(Box::new(t.records_parsed.clone()))?;
        registry.register(Box::new(t.parse_failures.clone()))?;
        registry.register(Box::new(t.sink_failures.clone()))?;
        registry.register(Box::new(t.reconnect_attempts.clone()))?;
        registry.register(Box::new(t.reconnects.clone()))?;
        registry.register(Box::new(t.devices_connected.clone()))?;
        Ok(Self { registry, telemetry })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
