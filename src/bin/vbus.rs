use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use vehicle_bus::behavior::{compute_driver_behavior, load_recent_alerts, RiskLevel, DEFAULT_WINDOW_MS};
use vehicle_bus::codec::{receive_datagram, Reception};
use vehicle_bus::protocol::{epoch_ms, BusMessage, RpcRequest, RpcResponse};
use vehicle_bus::publisher::TelemetryPublisher;
use vehicle_bus::settings::BusSettings;
use vehicle_bus::store::FileStore;
use vehicle_bus::{BusError, RpcClient};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "6000";

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let matches = App::new("vbus")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🚗 Vehicle bus controller - RPC calls, telemetry publishing and monitoring")
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .value_name("HOST")
                .help("RPC service host")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("RPC service port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("lock").about("🔒 Lock the doors"))
        .subcommand(
            SubCommand::with_name("set-limit")
                .about("🚦 Set the RPC speed limit")
                .arg(
                    Arg::with_name("kmh")
                        .help("Speed limit in km/h")
                        .required(true)
                        .validator(|v| match v.parse::<i64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Speed limit must be an integer".into()),
                        }),
                ),
        )
        .subcommand(SubCommand::with_name("config").about("⚙️  Show the current configuration"))
        .subcommand(
            SubCommand::with_name("call")
                .about("📨 Send a raw RPC request")
                .arg(Arg::with_name("method").help("Method name").required(true))
                .arg(
                    Arg::with_name("payload")
                        .long("payload")
                        .value_name("JSON")
                        .help("Request payload as a JSON object")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("correlation-id")
                        .long("correlation-id")
                        .value_name("ID")
                        .help("Correlation id to send instead of a generated one")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("publish")
                .about("📡 Publish speed telemetry")
                .arg(
                    Arg::with_name("kmh")
                        .long("kmh")
                        .value_name("KMH")
                        .takes_value(true)
                        .default_value("72"),
                )
                .arg(
                    Arg::with_name("count")
                        .short("n")
                        .long("count")
                        .value_name("COUNT")
                        .takes_value(true)
                        .env("DEMO_COUNT")
                        .default_value("5"),
                )
                .arg(
                    Arg::with_name("delay")
                        .long("delay-ms")
                        .value_name("MS")
                        .takes_value(true)
                        .default_value("300"),
                )
                .arg(
                    Arg::with_name("target")
                        .short("t")
                        .long("target")
                        .value_name("ADDR")
                        .help("Destination host:port (repeatable; defaults to both consumers)")
                        .takes_value(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("📈 Print datagrams arriving on a UDP port")
                .arg(
                    Arg::with_name("listen")
                        .short("l")
                        .long("listen")
                        .value_name("ADDR")
                        .takes_value(true)
                        .default_value("127.0.0.1:50054"),
                )
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("Stop after this many seconds (default: run forever)")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("behavior")
                .about("🧮 Score driver behavior from recent alerts")
                .arg(alert_log_arg())
                .arg(
                    Arg::with_name("window")
                        .long("window-ms")
                        .value_name("MS")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("alerts")
                .about("📜 Show recent speed alerts")
                .arg(alert_log_arg())
                .arg(
                    Arg::with_name("limit")
                        .long("limit")
                        .value_name("N")
                        .takes_value(true)
                        .default_value("50"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port = matches.value_of("port").unwrap_or(DEFAULT_PORT);
    let format = matches.value_of("format").unwrap_or("table");
    let client = RpcClient::new(format!("{}:{}", host, port));

    match matches.subcommand() {
        ("lock", _) => {
            print_response(&client.lock().await?, format);
        }
        ("set-limit", Some(sub)) => {
            let kmh = parse(sub, "kmh")?;
            print_response(&client.set_speed_limit(kmh).await?, format);
        }
        ("config", _) => {
            print_response(&client.get_config().await?, format);
        }
        ("call", Some(sub)) => handle_call(&client, sub, format).await?,
        ("publish", Some(sub)) => handle_publish(sub).await?,
        ("monitor", Some(sub)) => handle_monitor(sub, format).await?,
        ("behavior", Some(sub)) => handle_behavior(sub, format)?,
        ("alerts", Some(sub)) => handle_alerts(sub, format)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start all services", "vbus-services".bright_cyan());
            println!("  {} Publish speed telemetry", "vbus publish --kmh 95".bright_cyan());
            println!("  {} Watch status summaries", "vbus monitor".bright_cyan());
        }
    }

    Ok(())
}

fn alert_log_arg<'a>() -> Arg<'a, 'a> {
    Arg::with_name("alert-log")
        .long("alert-log")
        .value_name("PATH")
        .takes_value(true)
        .env("ALERT_LOG")
        .default_value("logs/alerts.jsonl")
}

fn parse<T>(matches: &ArgMatches<'_>, name: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = matches
        .value_of(name)
        .ok_or_else(|| format!("missing value for {}", name))?;
    raw.parse::<T>()
        .map_err(|e| format!("invalid value '{}' for {}: {}", raw, name, e).into())
}

async fn handle_call(client: &RpcClient, matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let method = matches.value_of("method").unwrap_or_default();
    let payload = match matches.value_of("payload") {
        Some(raw) => Some(serde_json::from_str::<Value>(raw)?),
        None => None,
    };

    let mut request = RpcRequest::new(method, payload);
    request.correlation_id = matches.value_of("correlation-id").map(str::to_string);

    let response = client.call(&request).await?;
    print_response(&response, format);
    Ok(())
}

async fn handle_publish(matches: &ArgMatches<'_>) -> CliResult {
    let kmh: f64 = parse(matches, "kmh")?;
    let count: usize = parse(matches, "count")?;
    let delay = Duration::from_millis(parse(matches, "delay")?);

    let targets = match matches.values_of("target") {
        Some(values) => values
            .map(str::parse::<SocketAddr>)
            .collect::<Result<Vec<_>, _>>()?,
        None => BusSettings::default().telemetry_targets(),
    };

    let publisher = TelemetryPublisher::bind(targets.clone()).await?;
    let events = publisher.publish_series(kmh, count, delay).await;
    println!(
        "{} Published {} speed events at {} km/h to {:?}",
        "📡".bright_blue(),
        events.len().to_string().bright_white(),
        kmh,
        targets
    );
    Ok(())
}

async fn handle_monitor(matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let listen: SocketAddr = parse(matches, "listen")?;
    let deadline = match matches.value_of("duration") {
        Some(raw) => Some(Instant::now() + Duration::from_secs(raw.parse()?)),
        None => None,
    };

    let socket = UdpSocket::bind(listen).await?;
    println!("{} Listening on udp://{}", "📈".bright_blue(), listen);

    loop {
        if deadline.map_or(false, |d| Instant::now() >= d) {
            break;
        }

        match receive_datagram(&socket, Some(Duration::from_secs(1))).await {
            Ok(Reception::Received((value, peer))) => print_datagram(&value, peer, format),
            Ok(Reception::TimedOut) => continue,
            Ok(Reception::ClosedByPeer) => break,
            Err(BusError::MalformedMessage(reason)) => {
                println!("{} non-JSON datagram: {}", "⚠️".yellow(), reason.dimmed());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn handle_behavior(matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let store = FileStore::new(matches.value_of("alert-log").unwrap_or("logs/alerts.jsonl"));
    let window_ms = match matches.value_of("window") {
        Some(raw) => raw.parse()?,
        None => DEFAULT_WINDOW_MS,
    };

    let report = compute_driver_behavior(&store, epoch_ms(), window_ms)?;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let level = match report.level {
        RiskLevel::Safe => "🟢 Safe".bright_green(),
        RiskLevel::Moderate => "🟡 Moderate".bright_yellow(),
        RiskLevel::Risky => "🔴 Risky".bright_red(),
    };
    println!("{} {}", "Driver behavior:".bright_white().bold(), level);
    println!("{} {}", "Score:".bright_white(), report.score);
    println!(
        "{} {} in the last {} ms",
        "Alerts:".bright_white(),
        report.alert_count,
        report.window_ms
    );
    Ok(())
}

fn handle_alerts(matches: &ArgMatches<'_>, format: &str) -> CliResult {
    let store = FileStore::new(matches.value_of("alert-log").unwrap_or("logs/alerts.jsonl"));
    let limit: usize = parse(matches, "limit")?;
    let alerts = load_recent_alerts(&store, limit)?;

    if alerts.is_empty() {
        println!("{}", "No alerts logged yet.".dimmed());
        return Ok(());
    }
    for alert in alerts.iter().rev() {
        if format == "json" {
            println!("{}", alert);
        } else {
            println!(
                "{} {} km/h (limit {}) zone {} at {}",
                "🚨".red(),
                alert["kmh"].to_string().bright_red(),
                alert["limit"],
                alert["zone"].as_str().unwrap_or("-").bright_white(),
                alert["timestamp_ms"]
            );
        }
    }
    Ok(())
}

fn print_response(response: &RpcResponse, format: &str) {
    if format == "json" {
        match serde_json::to_string_pretty(response) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{} {}", "❌".red(), e),
        }
        return;
    }

    if response.is_ok() {
        println!("{} {}", "✅".green(), response.status.message.bright_green());
    } else {
        println!("{} {}", "❌".red(), response.status.message.bright_red());
    }
    if let Some(limit) = response.effective_limit {
        println!("{} {} km/h", "Effective limit:".bright_white(), limit);
    }
    if let Some(config) = &response.config {
        println!("{} {} km/h", "Effective limit:".bright_white(), config.effective_limit);
        println!("{} {:?}", "RPC limit:".bright_white(), config.record.rpc_speed_limit);
        println!("{} {:?}", "Geofence limit:".bright_white(), config.record.geo_speed_limit);
        println!("{} {:?}", "Zone:".bright_white(), config.record.current_zone);
        for (key, value) in &config.extra {
            println!("{} {}", format!("{}:", key).bright_white(), value);
        }
    }
    println!("{} {}", "Correlation id:".dimmed(), response.correlation_id.dimmed());
}

fn print_datagram(value: &Value, peer: SocketAddr, format: &str) {
    if format == "json" {
        println!("{}", value);
        return;
    }

    match BusMessage::from_value(value.clone()) {
        Ok(BusMessage::Event(event)) => println!(
            "{} EVENT from {} speed={:?} ts={:?}",
            "📡".bright_blue(),
            peer,
            event.payload.speed_kmh(),
            event.payload.timestamp_ms
        ),
        Ok(BusMessage::SpeedAlert(alert)) => println!(
            "{} SPEED_ALERT {:.1} km/h over {:.1} zone={:?}",
            "🚨".red(),
            alert.kmh,
            alert.limit,
            alert.zone
        ),
        Ok(BusMessage::StatusSummary(summary)) => println!(
            "{} SUMMARY speed={:?} locked={:?} limit={:.1} zone={:?}",
            "📊".bright_green(),
            summary.speed_kmh,
            summary.locked,
            summary.effective_limit,
            summary.zone
        ),
        Ok(BusMessage::Other) | Err(_) => println!("{} {}", "❔".dimmed(), value),
    }
}
