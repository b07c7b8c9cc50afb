use crate::codec::send_datagram;
use crate::error::Result;
use crate::protocol::{
    epoch_ms, uuri, BusMessage, TelemetryEvent, TelemetryPayload, TELEMETRY_QOS, TELEMETRY_TTL_MS,
    VEHICLE_AUTHORITY,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, warn};
use uuid::Uuid;

/// Builds a speed `EVENT` stamped with `timestamp_ms`.
pub fn speed_event(kmh: f64, timestamp_ms: u64) -> TelemetryEvent {
    TelemetryEvent {
        id: Some(Uuid::new_v4().to_string()),
        source: Some(uuri(VEHICLE_AUTHORITY, "vehicle.telemetry", "/publisher")),
        target: Some(uuri(VEHICLE_AUTHORITY, "vehicle.telemetry", "/speed")),
        content_type: Some("application/json".to_string()),
        payload: TelemetryPayload {
            kmh: Some(Value::from(kmh)),
            timestamp_ms: Some(timestamp_ms),
            lat: None,
            lon: None,
        },
        qos: Some(TELEMETRY_QOS),
        ttl_ms: Some(TELEMETRY_TTL_MS),
    }
}

/// Fans speed telemetry out to every consumer address.
pub struct TelemetryPublisher {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl TelemetryPublisher {
    pub async fn bind(targets: Vec<SocketAddr>) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        Ok(Self { socket, targets })
    }

    /// Sends one event to all targets. A failed target is logged and skipped.
    pub async fn publish(&self, kmh: f64) -> TelemetryEvent {
        let event = speed_event(kmh, epoch_ms());
        let message = BusMessage::Event(event.clone());
        for target in &self.targets {
            match send_datagram(&self.socket, *target, &message).await {
                Ok(()) => debug!("Published {:.1} km/h to {}", kmh, target),
                Err(e) => warn!("Failed to publish telemetry to {}: {}", target, e),
            }
        }
        event
    }

    pub async fn publish_series(&self, kmh: f64, count: usize, delay: Duration) -> Vec<TelemetryEvent> {
        let mut events = Vec::with_capacity(count);
        for i in 0..count {
            events.push(self.publish(kmh).await);
            if i + 1 < count && !delay.is_zero() {
                time::sleep(delay).await;
            }
        }
        events
    }
}
