use crate::codec::{receive_datagram, send_datagram, Reception};
use crate::config_store::ConfigStore;
use crate::error::{BusError, Result};
use crate::protocol::{epoch_ms, uuri, AlertRecord, BusMessage, TelemetryEvent, VEHICLE_AUTHORITY};
use crate::settings::AlertSettings;
use crate::store::RecordStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

/// Minimum-spacing gate for alerts.
///
/// One instance is shared by every telemetry source the engine hears, so two
/// vehicles feeding the same engine would suppress each other's alerts.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window_ms: u64,
    last_alert_ms: Option<u64>,
}

impl Debouncer {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            last_alert_ms: None,
        }
    }

    /// Returns `true` and arms the window if at least `window_ms` has passed
    /// since the last emission (or nothing was ever emitted). Otherwise leaves
    /// the state untouched.
    pub fn try_fire(&mut self, now_ms: u64) -> bool {
        let ready = match self.last_alert_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.window_ms,
        };
        if ready {
            self.last_alert_ms = Some(now_ms);
        }
        ready
    }

    pub fn last_alert_ms(&self) -> Option<u64> {
        self.last_alert_ms
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Turns overspeed telemetry into debounced `SPEED_ALERT`s.
pub struct AlertEngine {
    config: ConfigStore,
    alert_log: Arc<dyn RecordStore>,
    debouncer: Debouncer,
    default_threshold: f64,
    alert_target: SocketAddr,
    recv_timeout: Option<Duration>,
    source: String,
    emitted: u64,
    dropped: u64,
}

impl AlertEngine {
    pub fn new(config: ConfigStore, alert_log: Arc<dyn RecordStore>, settings: &AlertSettings) -> Self {
        Self {
            config,
            alert_log,
            debouncer: Debouncer::new(settings.debounce_ms),
            default_threshold: settings.default_threshold,
            alert_target: settings.alert_target,
            recv_timeout: settings.recv_timeout,
            source: uuri(VEHICLE_AUTHORITY, "vehicle.telemetry", "/speed"),
            emitted: 0,
            dropped: 0,
        }
    }

    /// Decides whether `event` raises an alert at `now_ms`.
    ///
    /// Events without a usable `kmh` are ignored. The limit and zone come from
    /// a single config snapshot taken here, so the zone may trail the event by
    /// up to one config write.
    pub fn evaluate(&mut self, event: &TelemetryEvent, now_ms: u64) -> Option<AlertRecord> {
        let kmh = event.payload.speed_kmh()?;
        let config = self.config.snapshot();
        let limit = config.effective_limit(self.default_threshold);

        if kmh > limit && self.debouncer.try_fire(now_ms) {
            Some(AlertRecord {
                kmh,
                limit,
                timestamp_ms: now_ms,
                source: self.source.clone(),
                zone: config.current_zone,
            })
        } else {
            None
        }
    }

    /// Appends the alert to the alert log; failures are logged only.
    pub fn record(&self, alert: &AlertRecord) {
        let line = match serde_json::to_string(&BusMessage::SpeedAlert(alert.clone())) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to encode alert: {}", e);
                return;
            }
        };
        if let Err(e) = self.alert_log.append_line(&line) {
            error!("Failed to append alert to {}: {}", self.alert_log.describe(), e);
        }
    }

    /// Receive loop. Runs until the socket errors out fatally or, with a
    /// receive timeout configured, until one timeout passes without traffic.
    pub async fn run(mut self, inbound: UdpSocket, outbound: UdpSocket) -> Result<()> {
        if let Ok(addr) = inbound.local_addr() {
            info!(
                "🚨 Alert engine listening on udp://{}, emitting to {}",
                addr, self.alert_target
            );
        }

        loop {
            let (value, peer) = match receive_datagram(&inbound, self.recv_timeout).await {
                Ok(Reception::Received(datagram)) => datagram,
                Ok(Reception::TimedOut) => {
                    info!("Alert engine idle, stopping");
                    break;
                }
                Ok(Reception::ClosedByPeer) => break,
                Err(BusError::MalformedMessage(reason)) => {
                    self.dropped += 1;
                    debug!("Dropped malformed telemetry: {}", reason);
                    continue;
                }
                Err(e) => {
                    warn!("Telemetry receive failed: {}", e);
                    continue;
                }
            };

            let event = match BusMessage::from_value(value) {
                Ok(BusMessage::Event(event)) => event,
                Ok(_) => continue,
                Err(e) => {
                    self.dropped += 1;
                    debug!("Dropped telemetry from {}: {}", peer, e);
                    continue;
                }
            };

            if let Some(alert) = self.evaluate(&event, epoch_ms()) {
                self.emit(&outbound, &alert).await;
            }
        }

        info!(
            "Alert engine stopped: {} alerts emitted, {} datagrams dropped",
            self.emitted, self.dropped
        );
        Ok(())
    }

    async fn emit(&mut self, outbound: &UdpSocket, alert: &AlertRecord) {
        let message = BusMessage::SpeedAlert(alert.clone());
        match send_datagram(outbound, self.alert_target, &message).await {
            Ok(()) => {
                self.emitted += 1;
                info!(
                    "🚨 SPEED_ALERT {:.1} km/h over limit {:.1} (zone {:?})",
                    alert.kmh, alert.limit, alert.zone
                );
            }
            Err(e) => warn!("Failed to send alert to {}: {}", self.alert_target, e),
        }
        self.record(alert);
    }

    pub fn debouncer(&self) -> &Debouncer {
        &self.debouncer
    }
}
