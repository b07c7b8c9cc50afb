//! Request/response service over framed TCP.
//!
//! Each connection carries exactly one exchange:
//! `AWAIT_FRAME -> DISPATCH -> RESPOND -> CLOSE`. Every dispatched request is
//! appended to the audit log after the response has been written.

use crate::codec::{receive_framed, receive_framed_within, send_framed, Reception};
use crate::config_store::{ConfigRecord, ConfigStore};
use crate::error::{BusError, Result};
use crate::protocol::{
    epoch_ms, AuditEntry, AuditRequest, ConfigView, RpcMethod, RpcRequest, RpcResponse,
};
use crate::settings::RpcSettings;
use crate::store::RecordStore;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const LIMIT_FIELD: &str = "limit_kmh";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RpcService {
    config: ConfigStore,
    audit_log: Arc<dyn RecordStore>,
    default_threshold: f64,
    lock_delay: Duration,
}

impl RpcService {
    pub fn new(config: ConfigStore, audit_log: Arc<dyn RecordStore>, settings: &RpcSettings) -> Self {
        Self {
            config,
            audit_log,
            default_threshold: settings.default_threshold,
            lock_delay: settings.lock_delay,
        }
    }

    /// Accept loop. Each connection is served on its own task; a failing
    /// connection never stops the loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("🌐 RPC service listening on tcp://{}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream, remote).await {
                            warn!("RPC connection {} failed: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept RPC connection: {}", e);
                }
            }
        }
    }

    pub async fn handle_connection(&self, mut stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let frame = receive_framed(&mut stream).await?;
        let request = RpcRequest::from_value(&frame)?;

        let method = request.method();
        let response = self.dispatch(&request).await;
        info!(
            "📨 RPC {} from {} -> {:?} ({})",
            method.as_str(),
            remote,
            response.status.code,
            response.correlation_id
        );

        let sent = send_framed(&mut stream, &response).await;

        self.record_audit(AuditEntry {
            correlation_id: response.correlation_id.clone(),
            remote: remote.to_string(),
            request: AuditRequest {
                method: method.as_str().to_string(),
                payload: request.payload.clone(),
            },
            response,
            ts_ms: epoch_ms(),
        });

        sent
    }

    /// Runs one request to completion. Always produces a response stamped
    /// with the caller's correlation id, or a fresh one if it sent none.
    pub async fn dispatch(&self, request: &RpcRequest) -> RpcResponse {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut response = match request.method() {
            RpcMethod::Lock => self.handle_lock().await,
            RpcMethod::SetSpeedLimit => self.handle_set_speed_limit(request),
            RpcMethod::GetConfig => self.handle_get_config(),
            RpcMethod::Unknown(name) => RpcResponse::error(format!("Unknown method '{}'", name)),
        };

        response.correlation_id = correlation_id;
        response
    }

    async fn handle_lock(&self) -> RpcResponse {
        time::sleep(self.lock_delay).await;
        let mut response = RpcResponse::ok("Doors locked");
        response.success = Some(true);
        response
    }

    fn handle_set_speed_limit(&self, request: &RpcRequest) -> RpcResponse {
        let limit = match parse_limit(request.payload_field(LIMIT_FIELD)) {
            Ok(limit) => limit,
            Err(BusError::Validation(message)) => return RpcResponse::error(message),
            Err(e) => return RpcResponse::error(e.to_string()),
        };

        if let Err(e) = self.config.set_rpc_limit(limit) {
            error!("Failed to store RPC speed limit {}: {}", limit, e);
            return RpcResponse::error(format!("failed to store '{}'", LIMIT_FIELD));
        }

        let mut response = RpcResponse::ok(format!("RPC speed limit set to {} km/h", limit));
        response.success = Some(true);
        response.effective_limit = Some(self.config.effective_limit(self.default_threshold));
        response
    }

    fn handle_get_config(&self) -> RpcResponse {
        let (record, extra) = ConfigRecord::split(self.config.raw_snapshot());
        let effective_limit = record.effective_limit(self.default_threshold);
        let mut response = RpcResponse::ok("Config snapshot");
        response.config = Some(ConfigView {
            record,
            extra,
            effective_limit,
        });
        response
    }

    /// Audit failures are logged and never reach the caller.
    fn record_audit(&self, entry: AuditEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode audit entry {}: {}", entry.correlation_id, e);
                return;
            }
        };
        if let Err(e) = self.audit_log.append_line(&line) {
            error!("Failed to append audit entry {}: {}", entry.correlation_id, e);
        } else {
            debug!("Audited {}", entry.correlation_id);
        }
    }
}

/// Accepts JSON integers, finite floats (truncated toward zero) and strings
/// holding an integer. Everything else is invalid.
pub fn parse_limit(value: Option<&Value>) -> Result<i64> {
    let invalid = || BusError::Validation(format!("invalid '{}'", LIMIT_FIELD));

    match value {
        None | Some(Value::Null) => Err(BusError::Validation(format!("missing '{}'", LIMIT_FIELD))),
        Some(Value::Number(n)) => {
            if let Some(limit) = n.as_i64() {
                Ok(limit)
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                    .map(|f| f.trunc() as i64)
                    .ok_or_else(invalid)
            }
        }
        Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

/// One-shot client for the RPC service.
#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let mut stream = match time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(connected) => connected?,
            Err(_) => return Err(timed_out("connect")),
        };

        send_framed(&mut stream, request).await?;

        match receive_framed_within(&mut stream, self.timeout).await? {
            Reception::Received(value) => serde_json::from_value(value)
                .map_err(|e| BusError::MalformedMessage(format!("bad RPC response: {}", e))),
            Reception::TimedOut => Err(timed_out("response")),
            Reception::ClosedByPeer => Err(BusError::ConnectionClosed),
        }
    }

    pub async fn lock(&self) -> Result<RpcResponse> {
        self.call(&RpcRequest::new("lock", None)).await
    }

    pub async fn set_speed_limit(&self, limit_kmh: i64) -> Result<RpcResponse> {
        let payload = serde_json::json!({ "limit_kmh": limit_kmh });
        self.call(&RpcRequest::new("set_speed_limit", Some(payload))).await
    }

    pub async fn get_config(&self) -> Result<RpcResponse> {
        self.call(&RpcRequest::new("get_config", None)).await
    }
}

fn timed_out(stage: &str) -> BusError {
    BusError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("RPC {} timed out", stage),
    ))
}
