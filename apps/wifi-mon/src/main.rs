use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use device_manager as dm;
use device_manager::{DeviceConnection, DeviceIdentity, DeviceManager, MonitorConfig};
use serial_link::{MockBackend, MockPort, PortInfo, SerialBackend, SystemBackend};
use wifi_telemetry::{Statistics, TelemetryAggregator, TelemetryParser, TelemetryRecord};

#[derive(Parser, Debug)]
#[command(
    name = "wifi-mon",
    version,
    about = "ESP32 WiFi telemetry monitor",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use a simulated device instead of real serial ports (portable)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports that look like telemetry devices
    List {
        /// Include ports that match no known device
        #[arg(long, action = ArgAction::SetTrue)]
        all: bool,
    },
    /// Read telemetry and print each record as one JSON line
    Monitor {
        /// YAML config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to monitor; repeat for several. Devices are discovered when omitted
        #[arg(long = "port")]
        ports: Vec<String>,
        #[arg(long)]
        baud: Option<u32>,
        /// Stop after this many seconds and print statistics
        #[arg(long)]
        duration: Option<u64>,
        /// Ask devices to report continuously
        #[arg(long, action = ArgAction::SetTrue)]
        continuous: bool,
        /// Report interval in milliseconds (with --continuous)
        #[arg(long, default_value_t = 1000u32)]
        interval: u32,
        /// Run a speed test on every device at startup
        #[arg(long, action = ArgAction::SetTrue)]
        speed_test: bool,
        /// Request one performance report from every device at startup
        #[arg(long, action = ArgAction::SetTrue)]
        report: bool,
        /// Print prometheus metrics on exit
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Send a single command line to a device
    Send {
        #[arg(long)]
        port: String,
        #[arg(long)]
        baud: Option<u32>,
        /// e.g. PERF_REPORT, SPEED_TEST, SET_INTERVAL:500, CONTINUOUS:ON
        command: String,
    },
}

struct MonitorOpts {
    config: Option<PathBuf>,
    ports: Vec<String>,
    baud: Option<u32>,
    duration: Option<u64>,
    continuous: bool,
    interval: u32,
    speed_test: bool,
    report: bool,
    metrics: bool,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let backend: Arc<dyn SerialBackend> = if cli.mock {
        Arc::new(simulated_backend())
    } else {
        Arc::new(SystemBackend)
    };

    match cli.command {
        Commands::List { all } => list_ports(backend.as_ref(), all),
        Commands::Monitor {
            config,
            ports,
            baud,
            duration,
            continuous,
            interval,
            speed_test,
            report,
            metrics,
        } => monitor(
            backend,
            MonitorOpts {
                config,
                ports,
                baud,
                duration,
                continuous,
                interval,
                speed_test,
                report,
                metrics,
            },
        ),
        Commands::Send {
            port,
            baud,
            command,
        } => send(backend, &port, baud, &command),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn list_ports(backend: &dyn SerialBackend, all: bool) -> Result<()> {
    for info in backend.list()? {
        let chip = dm::known_chip(&info);
        if !all && !dm::is_known_device(&info) {
            continue;
        }
        println!(
            "{}\t{}\t{}\t{}\t{}",
            info.name,
            info.usb.map_or_else(|| "-".to_string(), |u| u.to_string()),
            info.manufacturer.as_deref().unwrap_or("-"),
            info.description.as_deref().unwrap_or("-"),
            chip.unwrap_or("-"),
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct DeviceSummary<'a> {
    device_id: &'a str,
    records: usize,
    statistics: Statistics,
}

fn monitor(backend: Arc<dyn SerialBackend>, opts: MonitorOpts) -> Result<()> {
    let mut cfg = match &opts.config {
        Some(path) => dm::load_config_file(path)?,
        None => MonitorConfig::default(),
    };
    if let Some(baud) = opts.baud {
        cfg.baud_rate = baud;
    }
    if !opts.ports.is_empty() {
        cfg.devices = opts
            .ports
            .iter()
            .map(|port| dm::DeviceEntry {
                port: port.clone(),
                id: None,
            })
            .collect();
    }
    cfg.validate()?;

    let manager = DeviceManager::from_config(&cfg, backend)?;
    let aggregator = Arc::new(TelemetryAggregator::new(cfg.history_capacity));
    aggregator.add_consumer(print_record);
    manager.pipe_into(Arc::new(TelemetryParser::new()?), Arc::clone(&aggregator));

    let ids = manager.connect_configured(&cfg);
    if ids.is_empty() {
        bail!("no devices connected");
    }
    info!(devices = ?ids, "monitoring");
    manager.start_reading_all();
    if cfg.auto_reconnect {
        manager.start_monitoring()?;
    }

    if opts.continuous {
        warn_failed(
            "continuous reporting",
            &manager.enable_all_continuous_reporting(true, opts.interval),
        );
    }
    if opts.report {
        warn_failed("performance report", &manager.trigger_all_performance_reports());
    }
    if opts.speed_test {
        warn_failed("speed test", &manager.trigger_all_speed_tests());
    }

    match opts.duration {
        Some(secs) => thread::sleep(Duration::from_secs(secs)),
        None => loop {
            thread::park();
        },
    }

    if opts.continuous {
        manager.enable_all_continuous_reporting(false, opts.interval);
    }
    manager.disconnect_all();

    let mut out = std::io::stdout().lock();
    for id in aggregator.device_ids() {
        let summary = DeviceSummary {
            device_id: &id,
            records: aggregator.history(&id, None).len(),
            statistics: aggregator.statistics(&id),
        };
        writeln!(out, "{}", serde_json::to_string(&summary)?)?;
    }
    if opts.metrics {
        write!(out, "{}", manager.metrics().encode_text())?;
    }
    Ok(())
}

fn print_record(record: &TelemetryRecord) -> Result<()> {
    let line = serde_json::to_string(record)?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}")?;
    Ok(())
}

fn warn_failed(what: &str, outcome: &std::collections::BTreeMap<String, bool>) {
    for (id, ok) in outcome {
        if !ok {
            warn!(device = %id, "{what} command failed");
        }
    }
}

fn send(
    backend: Arc<dyn SerialBackend>,
    port: &str,
    baud: Option<u32>,
    command: &str,
) -> Result<()> {
    let mut settings = dm::ConnectionSettings::default();
    if let Some(baud) = baud {
        settings.baud_rate = baud;
    }
    let conn = DeviceConnection::new(DeviceIdentity::new(port, None), settings, backend);
    conn.connect()?;
    conn.send_command(command)?;
    println!("sent {command} to {}", conn.device_id());
    conn.disconnect();
    Ok(())
}

// One CP2102-attached board that starts talking once a host opens it.
fn simulated_backend() -> MockBackend {
    let backend = MockBackend::new();
    let port = backend.add_port(
        PortInfo::new("/dev/ttyMOCK0")
            .with_usb(0x10C4, 0xEA60)
            .with_manufacturer("Silicon Labs")
            .with_description("CP2102 USB to UART Bridge (simulated)"),
    );
    if let Err(e) = thread::Builder::new()
        .name("simulated-esp32".into())
        .spawn(move || simulate(port))
    {
        warn!(error = %e, "could not start simulated device");
    }
    backend
}

fn simulate(port: MockPort) {
    let mut tick: i64 = 0;
    loop {
        thread::sleep(Duration::from_millis(500));
        if !port.is_open() {
            continue;
        }
        tick += 1;
        let rssi = -55 - tick % 15;
        let line = match tick % 3 {
            0 => format!(
                r#"{{"status":"connected","ssid":"HomeNet","channel":6,"rssi":{rssi},"free_heap":{}}}"#,
                180_000 - (tick % 100) * 8
            ),
            1 => format!(
                "PERF|rssi:{rssi}|ping:{}|loss:{}|tx_rate:72.2",
                10 + tick % 7,
                (tick % 4) as f64 * 0.5
            ),
            _ => format!("wifi_rssi={rssi}, snr={}, uptime={}", 40 + rssi / 4, tick / 2),
        };
        port.push_line(&line);
    }
}
