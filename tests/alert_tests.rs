use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use vehicle_bus::alert::Debouncer;
use vehicle_bus::codec::{receive_datagram, send_datagram};
use vehicle_bus::protocol::*;
use vehicle_bus::publisher::speed_event;
use vehicle_bus::settings::AlertSettings;
use vehicle_bus::store::{MemoryStore, RecordStore};
use vehicle_bus::*;

const WINDOW: u64 = 2000;

fn engine_with(config: ConfigStore, alert_log: Arc<MemoryStore>) -> AlertEngine {
    let settings = AlertSettings {
        debounce_ms: WINDOW,
        ..AlertSettings::default()
    };
    AlertEngine::new(config, alert_log, &settings)
}

fn test_engine() -> (AlertEngine, ConfigStore, Arc<MemoryStore>) {
    let config = ConfigStore::new(Arc::new(MemoryStore::new()));
    let log = Arc::new(MemoryStore::new());
    (engine_with(config.clone(), log.clone()), config, log)
}

fn event_with_kmh(kmh: Value) -> TelemetryEvent {
    let mut event = speed_event(0.0, 1);
    event.payload.kmh = Some(kmh);
    event
}

#[test]
fn test_debouncer_first_fire_always_passes() {
    let mut debouncer = Debouncer::new(WINDOW);
    assert!(debouncer.try_fire(0));
    assert_eq!(debouncer.last_alert_ms(), Some(0));
}

#[test]
fn test_debouncer_window_boundary() {
    let mut debouncer = Debouncer::new(WINDOW);
    assert!(debouncer.try_fire(10_000));
    assert!(!debouncer.try_fire(10_000 + WINDOW - 1));
    // Suppressed attempts do not re-arm the window.
    assert_eq!(debouncer.last_alert_ms(), Some(10_000));
    assert!(debouncer.try_fire(10_000 + WINDOW));
}

#[test]
fn test_overspeed_within_window_alerts_once() {
    let (mut engine, _, _) = test_engine();
    let event = speed_event(120.0, 1);

    assert!(engine.evaluate(&event, 100_000).is_some());
    assert!(engine.evaluate(&event, 100_000 + WINDOW - 1).is_none());
}

#[test]
fn test_overspeed_after_window_alerts_twice() {
    let (mut engine, _, _) = test_engine();
    let event = speed_event(120.0, 1);

    assert!(engine.evaluate(&event, 100_000).is_some());
    assert!(engine.evaluate(&event, 100_000 + WINDOW + 1).is_some());
}

#[test]
fn test_speed_at_limit_does_not_alert() {
    let (mut engine, _, _) = test_engine();

    assert!(engine.evaluate(&speed_event(80.0, 1), 1_000).is_none());
    assert!(engine.debouncer().last_alert_ms().is_none());
    assert!(engine.evaluate(&speed_event(80.1, 1), 1_000).is_some());
}

#[test]
fn test_missing_or_non_numeric_speed_is_ignored() {
    let (mut engine, _, _) = test_engine();

    let mut no_speed = speed_event(0.0, 1);
    no_speed.payload.kmh = None;
    assert!(engine.evaluate(&no_speed, 1_000).is_none());
    assert!(engine.evaluate(&event_with_kmh(json!("fast")), 1_000).is_none());
    assert!(engine.evaluate(&event_with_kmh(json!([120])), 1_000).is_none());

    assert!(engine.evaluate(&event_with_kmh(json!("120")), 1_000).is_some());
}

#[test]
fn test_alert_carries_zone_and_resolved_limit() {
    let (mut engine, config, _) = test_engine();
    config.set_rpc_limit(100).unwrap();
    config.set_geo_context(Some("School"), Some(30)).unwrap();

    let alert = engine.evaluate(&speed_event(45.0, 1), 5_000).unwrap();

    assert_eq!(alert.kmh, 45.0);
    assert_eq!(alert.limit, 30.0);
    assert_eq!(alert.zone.as_deref(), Some("School"));
    assert_eq!(alert.timestamp_ms, 5_000);
    assert_eq!(alert.source, "up://car-01/vehicle.telemetry/speed?v=1");
}

#[test]
fn test_record_appends_alert_line() {
    let (mut engine, _, log) = test_engine();
    let alert = engine.evaluate(&speed_event(95.0, 1), 1_000).unwrap();

    engine.record(&alert);
    engine.record(&alert);

    let contents = log.read_all().unwrap().unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let entry: Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["type"], "SPEED_ALERT");
    assert_eq!(entry["kmh"], 95.0);
    assert_eq!(entry["zone"], Value::Null);
}

#[tokio::test]
async fn test_engine_emits_and_logs_over_udp() {
    let inbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let outbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alert_sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let publisher = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = inbound.local_addr().unwrap();

    let log = Arc::new(MemoryStore::new());
    let settings = AlertSettings {
        listen_addr: engine_addr,
        alert_target: alert_sink.local_addr().unwrap(),
        recv_timeout: Some(Duration::from_millis(300)),
        ..AlertSettings::default()
    };
    let engine = AlertEngine::new(ConfigStore::new(Arc::new(MemoryStore::new())), log.clone(), &settings);
    let running = tokio::spawn(engine.run(inbound, outbound));

    publisher.send_to(b"not json", engine_addr).await.unwrap();
    send_datagram(&publisher, engine_addr, &json!({"type": "VEHICLE_STATUS_SUMMARY"})).await.unwrap();
    send_datagram(&publisher, engine_addr, &BusMessage::Event(speed_event(130.0, 1))).await.unwrap();
    send_datagram(&publisher, engine_addr, &BusMessage::Event(speed_event(131.0, 2))).await.unwrap();

    let (alert, _) = receive_datagram(&alert_sink, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .received()
        .expect("alert datagram");
    assert_eq!(alert["type"], "SPEED_ALERT");
    assert_eq!(alert["kmh"], 130.0);
    assert_eq!(alert["limit"], 80.0);

    // Engine stops itself after one idle timeout.
    running.await.unwrap().unwrap();

    let contents = log.read_all().unwrap().unwrap();
    assert_eq!(contents.lines().count(), 1);
}

fn off_type_envelopes() -> Vec<Value> {
    vec![
        json!({"type": "EVENT", "id": 7, "source": ["x"], "payload": {"kmh": 120}}),
        json!({"type": "EVENT", "payload": {"kmh": 121, "timestamp_ms": 1.7e12}}),
        json!({"type": "EVENT", "qos": 1000, "ttl_ms": "soon", "payload": {"kmh": 122}}),
        json!({"type": "EVENT", "payload": {"kmh": 123, "lat": "52.1", "lon": {"deg": 4}}}),
    ]
}

#[test]
fn test_off_type_envelope_fields_still_decode() {
    for raw in off_type_envelopes() {
        match BusMessage::from_value(raw.clone()) {
            Ok(BusMessage::Event(event)) => {
                assert!(event.payload.speed_kmh().is_some(), "lost kmh in {}", raw)
            }
            other => panic!("{} decoded as {:?}", raw, other),
        }
    }

    let event = match BusMessage::from_value(off_type_envelopes().remove(1)).unwrap() {
        BusMessage::Event(event) => event,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(event.payload.timestamp_ms, Some(1_700_000_000_000));

    let event = match BusMessage::from_value(off_type_envelopes().remove(3)).unwrap() {
        BusMessage::Event(event) => event,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(event.payload.lat, Some(52.1));
    assert_eq!(event.payload.lon, None);
    assert_eq!(event.id, None);
}

#[tokio::test]
async fn test_engine_alerts_on_off_type_envelopes() {
    let inbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let outbound = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alert_sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let publisher = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine_addr = inbound.local_addr().unwrap();

    let log = Arc::new(MemoryStore::new());
    let settings = AlertSettings {
        listen_addr: engine_addr,
        alert_target: alert_sink.local_addr().unwrap(),
        debounce_ms: 0,
        recv_timeout: Some(Duration::from_millis(300)),
        ..AlertSettings::default()
    };
    let engine = AlertEngine::new(ConfigStore::new(Arc::new(MemoryStore::new())), log.clone(), &settings);
    let running = tokio::spawn(engine.run(inbound, outbound));

    let envelopes = off_type_envelopes();
    for raw in &envelopes {
        send_datagram(&publisher, engine_addr, raw).await.unwrap();
    }

    for raw in &envelopes {
        let (alert, _) = receive_datagram(&alert_sink, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .received()
            .expect("alert datagram");
        assert_eq!(alert["type"], "SPEED_ALERT");
        assert_eq!(alert["kmh"].as_f64(), raw["payload"]["kmh"].as_f64());
    }

    running.await.unwrap().unwrap();
    assert_eq!(log.read_all().unwrap().unwrap().lines().count(), envelopes.len());
}
