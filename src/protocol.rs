use crate::config_store::ConfigRecord;
use crate::error::{BusError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub const VEHICLE_AUTHORITY: &str = "car-01";
pub const TELEMETRY_QOS: u8 = 0;
pub const TELEMETRY_TTL_MS: u64 = 2000;

/// Builds a `up://authority/entity/resource?v=N` style address.
pub fn uuri(authority: &str, entity: &str, resource: &str) -> String {
    format!("up://{}/{}{}?v=1", authority, entity, resource)
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Null, absent and off-type values all read as `T::default()`.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Millisecond timestamps from integers, floats (truncated) or numeric strings.
fn lenient_millis<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
                .map(|f| f.trunc() as u64)
        }),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    Ok(millis)
}

/// Finite numbers, or numeric strings holding one.
fn lenient_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(number.filter(|f| f.is_finite()))
}

/// Every datagram that travels over the pub/sub side of the bus, keyed by `type`.
///
/// Unknown tags decode to [`BusMessage::Other`] so that listeners can skip
/// them instead of treating them as malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusMessage {
    #[serde(rename = "EVENT")]
    Event(TelemetryEvent),
    #[serde(rename = "SPEED_ALERT")]
    SpeedAlert(AlertRecord),
    #[serde(rename = "VEHICLE_STATUS_SUMMARY")]
    StatusSummary(VehicleStatusSummary),
    #[serde(other)]
    Other,
}

impl BusMessage {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| BusError::MalformedMessage(e.to_string()))
    }
}

/// Speed telemetry envelope.
///
/// Decoding never fails on a single field: anything of the wrong type reads
/// as absent, so a usable `payload.kmh` is enough for consumers to act on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(default, deserialize_with = "lenient")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub source: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub payload: TelemetryPayload,
    #[serde(default, deserialize_with = "lenient")]
    pub qos: Option<u8>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Kept raw: publishers are not trusted to send a number here.
    #[serde(default)]
    pub kmh: Option<Value>,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub timestamp_ms: Option<u64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl TelemetryPayload {
    /// Speed as a finite number. Numeric strings are accepted, anything else is absent.
    pub fn speed_kmh(&self) -> Option<f64> {
        let speed = match self.kmh.as_ref()? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        speed.is_finite().then_some(speed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub kmh: f64,
    pub limit: f64,
    pub timestamp_ms: u64,
    pub source: String,
    pub zone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatusSummary {
    pub speed_kmh: Option<f64>,
    pub locked: Option<bool>,
    pub last_update: Option<u64>,
    pub effective_limit: f64,
    pub zone: Option<String>,
    pub config: ConfigRecord,
}

// RPC

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcMethod {
    Lock,
    SetSpeedLimit,
    GetConfig,
    Unknown(String),
}

impl RpcMethod {
    /// Method names are matched case-insensitively.
    pub fn parse(raw: &str) -> Self {
        let name = raw.to_lowercase();
        match name.as_str() {
            "lock" => RpcMethod::Lock,
            "set_speed_limit" => RpcMethod::SetSpeedLimit,
            "get_config" => RpcMethod::GetConfig,
            _ => RpcMethod::Unknown(name),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RpcMethod::Lock => "lock",
            RpcMethod::SetSpeedLimit => "set_speed_limit",
            RpcMethod::GetConfig => "get_config",
            RpcMethod::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: &str, payload: Option<Value>) -> Self {
        Self {
            method: Some(method.to_string()),
            correlation_id: None,
            payload,
        }
    }

    /// Lenient decode of a request frame.
    ///
    /// Only a non-object frame is rejected. A non-string `method` reads as
    /// empty, and an empty or non-string `correlation_id` reads as absent.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| BusError::MalformedMessage("request frame is not an object".into()))?;

        Ok(Self {
            method: object.get("method").and_then(Value::as_str).map(str::to_string),
            correlation_id: object
                .get("correlation_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            payload: object.get("payload").filter(|p| !p.is_null()).cloned(),
        })
    }

    pub fn method(&self) -> RpcMethod {
        RpcMethod::parse(self.method.as_deref().unwrap_or(""))
    }

    /// Field lookup inside the payload; a non-object payload has no fields.
    pub fn payload_field(&self, key: &str) -> Option<&Value> {
        self.payload
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|p: &Map<String, Value>| p.get(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERR")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

/// Config snapshot as returned by `get_config`: the whole stored record
/// plus the resolved limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigView {
    #[serde(flatten)]
    pub record: ConfigRecord,
    /// Stored keys outside the known three, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub effective_limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: RpcStatus,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigView>,
}

impl RpcResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::Ok, message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::Error, message.into())
    }

    fn with_status(code: StatusCode, message: String) -> Self {
        Self {
            status: RpcStatus { code, message },
            correlation_id: String::new(),
            success: None,
            effective_limit: None,
            config: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.code == StatusCode::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRequest {
    pub method: String,
    pub payload: Option<Value>,
}

/// One line of the RPC audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub correlation_id: String,
    pub remote: String,
    pub request: AuditRequest,
    pub response: RpcResponse,
    pub ts_ms: u64,
}
