use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use vehicle_bus::codec::receive_datagram;
use vehicle_bus::geofence::*;
use vehicle_bus::protocol::BusMessage;
use vehicle_bus::publisher::*;
use vehicle_bus::settings::BusSettings;
use vehicle_bus::store::MemoryStore;
use vehicle_bus::ConfigStore;

#[test]
fn test_default_route() {
    let zones = default_zones();
    let names: Vec<&str> = zones.iter().map(|z| z.name.as_str()).collect();

    assert_eq!(names, vec!["City", "Highway", "School"]);
    assert_eq!(zones[0].limit_kmh, 50);
    assert_eq!(zones[1].dwell, Duration::from_secs(20));
    assert_eq!(zones[2].limit_kmh, 30);
}

#[test]
fn test_entering_zone_sets_geofence_context() {
    let config = ConfigStore::new(Arc::new(MemoryStore::new()));
    config.set_rpc_limit(90).unwrap();
    let driver = GeofenceDriver::new(config.clone(), default_zones());

    driver.enter(&driver.zones()[2]).unwrap();
    let record = config.snapshot();
    assert_eq!(record.current_zone.as_deref(), Some("School"));
    assert_eq!(config.effective_limit(80.0), 30.0);
    assert_eq!(record.rpc_speed_limit, Some(90.0));

    driver.clear().unwrap();
    assert_eq!(config.snapshot().current_zone, None);
    assert_eq!(config.effective_limit(80.0), 90.0);
}

#[tokio::test]
async fn test_driver_walks_route() {
    let config = ConfigStore::new(Arc::new(MemoryStore::new()));
    let zones = vec![
        Zone::new("City", 50, Duration::from_millis(30)),
        Zone::new("Highway", 100, Duration::from_secs(60)),
    ];
    let driver = GeofenceDriver::new(config.clone(), zones);

    let running = tokio::spawn(async move { driver.run().await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    running.abort();

    assert_eq!(config.snapshot().current_zone.as_deref(), Some("Highway"));
    assert_eq!(config.effective_limit(80.0), 100.0);
}

#[test]
fn test_speed_event_shape() {
    let event = speed_event(72.5, 1_234);

    assert!(event.id.is_some());
    assert_eq!(event.payload.speed_kmh(), Some(72.5));
    assert_eq!(event.payload.timestamp_ms, Some(1_234));
    assert_eq!(event.qos, Some(0));
    assert_eq!(event.ttl_ms, Some(2000));
    assert!(event.source.unwrap().starts_with("up://car-01/"));

    let wire = serde_json::to_value(BusMessage::Event(speed_event(1.0, 1))).unwrap();
    assert_eq!(wire["type"], "EVENT");
    assert_eq!(wire["payload"]["kmh"], 1.0);
}

#[test]
fn test_default_publish_targets_cover_both_consumers() {
    let targets = BusSettings::default().telemetry_targets();
    let ports: Vec<u16> = targets.iter().map(|t| t.port()).collect();

    assert_eq!(ports, vec![50052, 50056]);
}

#[tokio::test]
async fn test_publisher_fans_out_to_every_target() {
    let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let publisher = TelemetryPublisher::bind(vec![
        first.local_addr().unwrap(),
        second.local_addr().unwrap(),
    ])
    .await
    .unwrap();

    let events = publisher.publish_series(88.0, 2, Duration::from_millis(5)).await;
    assert_eq!(events.len(), 2);

    for socket in [&first, &second] {
        for event in &events {
            let (value, _) = receive_datagram(socket, Some(Duration::from_secs(2)))
                .await
                .unwrap()
                .received()
                .unwrap();
            assert_eq!(value["id"], event.id.clone().unwrap().as_str());
            assert_eq!(value["payload"]["kmh"], 88.0);
        }
    }
}
