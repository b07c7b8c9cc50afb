use clap::{App, Arg, ArgMatches};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};
use vehicle_bus::geofence::{default_zones, GeofenceDriver};
use vehicle_bus::settings::BusSettings;
use vehicle_bus::store::{FileStore, RecordStore};
use vehicle_bus::summary::SummaryState;
use vehicle_bus::{AlertEngine, ConfigStore, RpcService, StatusAggregator};

const SERVICES: &[&str] = &["all", "rpc", "alert", "summary", "geofence"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("vbus-services")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🚗 Vehicle bus services: RPC, speed alerts, status summary, geofence")
        .arg(
            Arg::with_name("service")
                .help("Services to run")
                .multiple(true)
                .possible_values(SERVICES)
                .default_value("all"),
        )
        .arg(setting("host", "BUS_HOST", "127.0.0.1", "Host for UDP bindings and targets"))
        .arg(setting("rpc-host", "RPC_HOST", "127.0.0.1", "RPC listen host"))
        .arg(setting("rpc-port", "RPC_PORT", "6000", "RPC listen port"))
        .arg(setting("alert-in-port", "ALERT_IN_PORT", "50052", "Alert engine telemetry port"))
        .arg(setting("alert-out-port", "ALERT_OUT_PORT", "50053", "Alert egress port"))
        .arg(setting("debounce-ms", "ALERT_DEBOUNCE_MS", "2000", "Minimum spacing between alerts"))
        .arg(setting("threshold", "SPEED_THRESHOLD", "80", "Default speed limit in km/h"))
        .arg(setting("summary-in-port", "SUM_SPEED_PORT", "50056", "Status summary telemetry port"))
        .arg(setting("summary-out-port", "SUM_OUT_PORT", "50054", "Status summary egress port"))
        .arg(setting("summary-interval-ms", "SUM_INTERVAL_MS", "1000", "Summary publish interval"))
        .arg(setting("config-path", "CONFIG_PATH", "logs/config.json", "Config record file"))
        .arg(setting("audit-path", "AUDIT_PATH", "logs/audit.jsonl", "RPC audit log"))
        .arg(setting("alert-log", "ALERT_LOG", "logs/alerts.jsonl", "Speed alert log"))
        .get_matches();

    let settings = resolve_settings(&matches)?;
    let selected: Vec<&str> = matches
        .values_of("service")
        .map(|values| values.collect())
        .unwrap_or_default();
    let wants = |name: &str| selected.contains(&"all") || selected.contains(&name);

    let config = ConfigStore::new(Arc::new(FileStore::new(&settings.storage.config_path)));
    let audit_log: Arc<dyn RecordStore> = Arc::new(FileStore::new(&settings.storage.audit_path));
    let alert_log: Arc<dyn RecordStore> = Arc::new(FileStore::new(&settings.storage.alert_path));

    let mut tasks = Vec::new();

    if wants("rpc") {
        let listener = TcpListener::bind(settings.rpc.listen_addr).await?;
        let service = Arc::new(RpcService::new(config.clone(), Arc::clone(&audit_log), &settings.rpc));
        tasks.push(tokio::spawn(async move {
            if let Err(e) = service.serve(listener).await {
                error!("RPC service stopped: {}", e);
            }
        }));
    }

    if wants("alert") {
        let inbound = UdpSocket::bind(settings.alert.listen_addr).await?;
        let outbound = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let engine = AlertEngine::new(config.clone(), Arc::clone(&alert_log), &settings.alert);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = engine.run(inbound, outbound).await {
                error!("Alert engine stopped: {}", e);
            }
        }));
    }

    if wants("summary") {
        let aggregator = StatusAggregator::new(
            config.clone(),
            Arc::new(SummaryState::new()),
            settings.summary.default_threshold,
        );
        let audit = Arc::clone(&audit_log);
        let summary_settings = settings.summary.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = aggregator.run(audit, &summary_settings).await {
                error!("Status aggregator stopped: {}", e);
            }
        }));
    }

    if wants("geofence") {
        let driver = GeofenceDriver::new(config.clone(), default_zones());
        tasks.push(tokio::spawn(async move { driver.run().await }));
    }

    println!("🚗 Vehicle bus services running ({}). Press Ctrl+C to stop.", selected.join(", "));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping {} services", tasks.len());
    for task in tasks {
        task.abort();
    }
    println!("🛑 Vehicle bus services stopped");

    Ok(())
}

fn setting<'a>(name: &'a str, env: &'a str, default: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .long(name)
        .value_name("VALUE")
        .env(env)
        .default_value(default)
        .takes_value(true)
        .help(help)
}

fn value<T>(matches: &ArgMatches<'_>, name: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches
        .value_of(name)
        .ok_or_else(|| format!("missing value for --{}", name))?;
    raw.parse::<T>()
        .map_err(|e| format!("invalid value '{}' for --{}: {}", raw, name, e).into())
}

fn resolve_settings(matches: &ArgMatches<'_>) -> Result<BusSettings, Box<dyn std::error::Error>> {
    let host: std::net::IpAddr = value(matches, "host")?;
    let rpc_host: std::net::IpAddr = value(matches, "rpc-host")?;
    let threshold: f64 = value(matches, "threshold")?;

    let mut settings = BusSettings::default();

    settings.storage.config_path = value::<PathBuf>(matches, "config-path")?;
    settings.storage.audit_path = value::<PathBuf>(matches, "audit-path")?;
    settings.storage.alert_path = value::<PathBuf>(matches, "alert-log")?;

    settings.rpc.listen_addr = SocketAddr::new(rpc_host, value(matches, "rpc-port")?);
    settings.rpc.default_threshold = threshold;

    settings.alert.listen_addr = SocketAddr::new(host, value(matches, "alert-in-port")?);
    settings.alert.alert_target = SocketAddr::new(host, value(matches, "alert-out-port")?);
    settings.alert.debounce_ms = value(matches, "debounce-ms")?;
    settings.alert.default_threshold = threshold;

    settings.summary.speed_addr = SocketAddr::new(host, value(matches, "summary-in-port")?);
    settings.summary.summary_target = SocketAddr::new(host, value(matches, "summary-out-port")?);
    settings.summary.publish_interval = Duration::from_millis(value(matches, "summary-interval-ms")?);
    settings.summary.default_threshold = threshold;

    Ok(settings)
}
