use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::{TcpListener, TcpStream};
use vehicle_bus::codec::{receive_framed_within, send_framed, Reception};
use vehicle_bus::protocol::*;
use vehicle_bus::rpc::parse_limit;
use vehicle_bus::settings::RpcSettings;
use vehicle_bus::store::{FileStore, MemoryStore, RecordStore};
use vehicle_bus::*;

fn test_settings() -> RpcSettings {
    RpcSettings {
        lock_delay: Duration::ZERO,
        ..RpcSettings::default()
    }
}

fn test_service() -> (RpcService, ConfigStore, Arc<MemoryStore>) {
    let config = ConfigStore::new(Arc::new(MemoryStore::new()));
    let audit = Arc::new(MemoryStore::new());
    let service = RpcService::new(config.clone(), audit.clone(), &test_settings());
    (service, config, audit)
}

async fn spawn_service(audit: Arc<dyn RecordStore>) -> (std::net::SocketAddr, ConfigStore) {
    let config = ConfigStore::new(Arc::new(MemoryStore::new()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let service = Arc::new(RpcService::new(config.clone(), audit, &test_settings()));
    tokio::spawn(service.serve(listener));
    (addr, config)
}

fn audit_entries(store: &dyn RecordStore) -> Vec<Value> {
    store
        .read_all()
        .unwrap()
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn wait_for_audit(store: &dyn RecordStore, count: usize) -> Vec<Value> {
    for _ in 0..100 {
        let entries = audit_entries(store);
        if entries.len() >= count {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("audit log never reached {} entries", count);
}

#[tokio::test]
async fn test_lock_reports_success() {
    let (service, _, _) = test_service();

    let response = service.dispatch(&RpcRequest::new("lock", None)).await;

    assert!(response.is_ok());
    assert_eq!(response.status.message, "Doors locked");
    assert_eq!(response.success, Some(true));
}

#[tokio::test]
async fn test_set_speed_limit_then_get_config() {
    let (service, config, _) = test_service();

    let response = service
        .dispatch(&RpcRequest::new("set_speed_limit", Some(json!({"limit_kmh": 120}))))
        .await;
    assert!(response.is_ok());
    assert_eq!(response.status.message, "RPC speed limit set to 120 km/h");
    assert_eq!(response.effective_limit, Some(120.0));
    assert_eq!(config.snapshot().rpc_speed_limit, Some(120.0));

    let response = service.dispatch(&RpcRequest::new("get_config", None)).await;
    let view = response.config.expect("config view");
    assert_eq!(view.record.rpc_speed_limit, Some(120.0));
    assert_eq!(view.effective_limit, 120.0);
}

#[tokio::test]
async fn test_geofence_limit_overrides_rpc_limit_in_response() {
    let (service, config, _) = test_service();
    config.set_geo_context(Some("School"), Some(30)).unwrap();

    let response = service
        .dispatch(&RpcRequest::new("set_speed_limit", Some(json!({"limit_kmh": 90}))))
        .await;

    assert!(response.is_ok());
    assert_eq!(response.effective_limit, Some(30.0));
}

#[tokio::test]
async fn test_invalid_limits_leave_config_unchanged() {
    let (service, config, _) = test_service();
    config.set_rpc_limit(60).unwrap();

    for payload in [json!({}), json!({"limit_kmh": null}), json!({"limit_kmh": "invalid"}),
        json!({"limit_kmh": "10.5"}), json!({"limit_kmh": true})]
    {
        let response = service
            .dispatch(&RpcRequest::new("set_speed_limit", Some(payload.clone())))
            .await;
        assert!(!response.is_ok(), "payload {} should be rejected", payload);
        assert_eq!(response.success, None);
    }

    let response = service.dispatch(&RpcRequest::new("set_speed_limit", None)).await;
    assert_eq!(response.status.message, "missing 'limit_kmh'");
    assert_eq!(config.snapshot().rpc_speed_limit, Some(60.0));
}

#[test]
fn test_parse_limit_accepted_forms() {
    assert_eq!(parse_limit(Some(&json!(100))).unwrap(), 100);
    assert_eq!(parse_limit(Some(&json!(99.9))).unwrap(), 99);
    assert_eq!(parse_limit(Some(&json!(" 75 "))).unwrap(), 75);
    assert!(matches!(parse_limit(None), Err(BusError::Validation(_))));
    assert!(matches!(parse_limit(Some(&json!({"kmh": 1}))), Err(BusError::Validation(_))));
}

#[tokio::test]
async fn test_unknown_method() {
    let (service, _, _) = test_service();

    let response = service.dispatch(&RpcRequest::new("Launch_Rockets", None)).await;

    assert_eq!(response.status.code, StatusCode::Error);
    assert_eq!(response.status.message, "Unknown method 'launch_rockets'");
}

#[tokio::test]
async fn test_method_names_are_case_insensitive() {
    let (service, _, _) = test_service();

    let response = service.dispatch(&RpcRequest::new("LOCK", None)).await;
    assert!(response.is_ok());
}

#[tokio::test]
async fn test_correlation_id_echoed_or_generated() {
    let (service, _, _) = test_service();

    let mut request = RpcRequest::new("get_config", None);
    request.correlation_id = Some("req-42".into());
    assert_eq!(service.dispatch(&request).await.correlation_id, "req-42");

    let first = service.dispatch(&RpcRequest::new("get_config", None)).await;
    let second = service.dispatch(&RpcRequest::new("get_config", None)).await;
    assert!(!first.correlation_id.is_empty());
    assert_ne!(first.correlation_id, second.correlation_id);
}

#[test]
fn test_lenient_request_decode() {
    let request = RpcRequest::from_value(&json!({"method": 5, "correlation_id": ""})).unwrap();
    assert_eq!(request.method(), RpcMethod::Unknown(String::new()));
    assert_eq!(request.correlation_id, None);

    assert!(RpcRequest::from_value(&json!("lock")).is_err());
}

#[tokio::test]
async fn test_client_round_trip_writes_audit() {
    let dir = tempdir().unwrap();
    let audit = Arc::new(FileStore::new(dir.path().join("audit.jsonl")));
    let (addr, config) = spawn_service(audit.clone()).await;
    let client = RpcClient::new(addr.to_string()).with_timeout(Duration::from_secs(2));

    let response = client.set_speed_limit(95).await.unwrap();
    assert!(response.is_ok());
    assert_eq!(config.snapshot().rpc_speed_limit, Some(95.0));
    wait_for_audit(audit.as_ref(), 1).await;

    let response = client.lock().await.unwrap();
    assert_eq!(response.success, Some(true));

    let entries = wait_for_audit(audit.as_ref(), 2).await;
    assert_eq!(entries[0]["request"]["method"], "set_speed_limit");
    assert_eq!(entries[0]["request"]["payload"]["limit_kmh"], 95);
    assert_eq!(entries[1]["request"]["method"], "lock");
    assert_eq!(entries[1]["response"]["success"], true);
    assert_eq!(entries[1]["correlation_id"], response.correlation_id.as_str());
    assert!(entries[1]["remote"].as_str().unwrap().starts_with("127.0.0.1:"));
}

#[tokio::test]
async fn test_error_responses_are_audited() {
    let audit = Arc::new(MemoryStore::new());
    let (addr, _) = spawn_service(audit.clone()).await;
    let client = RpcClient::new(addr.to_string());

    let mut request = RpcRequest::new("reboot", None);
    request.correlation_id = Some("c-1".into());
    let response = client.call(&request).await.unwrap();
    assert!(!response.is_ok());

    let entries = wait_for_audit(audit.as_ref(), 1).await;
    assert_eq!(entries[0]["correlation_id"], "c-1");
    assert_eq!(entries[0]["response"]["status"]["code"], "ERR");
}

#[tokio::test]
async fn test_malformed_frame_closes_without_response() {
    let audit = Arc::new(MemoryStore::new());
    let (addr, _) = spawn_service(audit.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send_framed(&mut stream, &json!(["not", "an", "object"])).await.unwrap();

    let reply = receive_framed_within(&mut stream, Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply, Reception::ClosedByPeer);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(audit_entries(audit.as_ref()).is_empty());
}

#[tokio::test]
async fn test_one_bad_connection_does_not_stop_service() {
    let audit = Arc::new(MemoryStore::new());
    let (addr, _) = spawn_service(audit).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    drop(stream);

    let response = RpcClient::new(addr.to_string()).get_config().await.unwrap();
    assert_eq!(response.status.message, "Config snapshot");
}

#[tokio::test]
async fn test_get_config_returns_whole_record() {
    let record = Arc::new(MemoryStore::new());
    record
        .write_all(r#"{"owner": "fleet-ops", "firmware": {"rev": 3}, "rpc_speed_limit": 65}"#)
        .unwrap();
    let config = ConfigStore::new(record);
    let service = RpcService::new(config, Arc::new(MemoryStore::new()), &test_settings());

    let response = service.dispatch(&RpcRequest::new("get_config", None)).await;

    let wire = serde_json::to_value(&response).unwrap();
    assert_eq!(wire["config"]["owner"], "fleet-ops");
    assert_eq!(wire["config"]["firmware"]["rev"], 3);
    assert_eq!(wire["config"]["rpc_speed_limit"], 65.0);
    assert_eq!(wire["config"]["geo_speed_limit"], Value::Null);
    assert_eq!(wire["config"]["effective_limit"], 65.0);

    // Reading the reply back keeps known and unknown keys apart.
    let decoded: RpcResponse = serde_json::from_value(wire).unwrap();
    let view = decoded.config.unwrap();
    assert_eq!(view.record.rpc_speed_limit, Some(65.0));
    assert_eq!(view.extra.len(), 2);
    assert_eq!(view.extra["owner"], "fleet-ops");
    assert_eq!(view.effective_limit, 65.0);
}
