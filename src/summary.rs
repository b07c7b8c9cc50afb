//! Status aggregator: fuses telemetry, lock history and configuration into a
//! periodic `VEHICLE_STATUS_SUMMARY` datagram.
//!
//! Three tasks feed and read one [`SummaryState`]:
//!
//! | Path      | Trigger                  | Writes                      |
//! |-----------|--------------------------|-----------------------------|
//! | Telemetry | each `EVENT` datagram    | `speed_kmh` + `last_update` |
//! | Audit     | fixed poll of audit log  | `locked`                    |
//! | Publish   | fixed timer              | nothing (reads all slots)   |
//!
//! Each slot is overwritten independently and the last write wins. The
//! publisher never waits on the other two paths and publishes whatever is
//! current, including all-null state.

use crate::codec::{receive_datagram, send_datagram, Reception};
use crate::config_store::ConfigStore;
use crate::error::{BusError, Result};
use crate::protocol::{epoch_ms, BusMessage, VehicleStatusSummary};
use crate::settings::SummarySettings;
use crate::store::RecordStore;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn};

/// A single last-write-wins value.
///
/// Only used for values wider than one atomic word. The mutex makes the
/// overwrite whole; it adds no ordering between writers.
#[derive(Debug)]
pub struct Slot<T: Copy> {
    value: Mutex<Option<T>>,
}

impl<T: Copy> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T: Copy> Slot<T> {
    pub fn set(&self, value: T) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub fn get(&self) -> Option<T> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const LOCK_UNKNOWN: u8 = 0;
const LOCK_RELEASED: u8 = 1;
const LOCK_ENGAGED: u8 = 2;

/// Tri-state door lock: unknown until the first `lock` audit entry is seen.
#[derive(Debug)]
pub struct LockSlot(AtomicU8);

impl Default for LockSlot {
    fn default() -> Self {
        Self(AtomicU8::new(LOCK_UNKNOWN))
    }
}

impl LockSlot {
    pub fn set(&self, locked: bool) {
        let state = if locked { LOCK_ENGAGED } else { LOCK_RELEASED };
        self.0.store(state, Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<bool> {
        match self.0.load(Ordering::Relaxed) {
            LOCK_ENGAGED => Some(true),
            LOCK_RELEASED => Some(false),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedReading {
    pub kmh: f64,
    pub last_update: u64,
}

/// Latest known vehicle state. Fields are written independently by the
/// telemetry and audit paths and are never coordinated with each other.
#[derive(Debug, Default)]
pub struct SummaryState {
    speed: Slot<SpeedReading>,
    locked: LockSlot,
}

impl SummaryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// No ordering check: an older datagram arriving late replaces newer state.
    pub fn record_speed(&self, kmh: f64, last_update: u64) {
        self.speed.set(SpeedReading { kmh, last_update });
    }

    pub fn record_lock(&self, locked: bool) {
        self.locked.set(locked);
    }

    pub fn speed(&self) -> Option<SpeedReading> {
        self.speed.get()
    }

    pub fn locked(&self) -> Option<bool> {
        self.locked.get()
    }
}

/// Lock outcome carried by one audit entry, if it is a `lock` call.
pub fn lock_outcome(entry: &Value) -> Option<bool> {
    let method = entry.get("request")?.get("method")?.as_str()?;
    if method != "lock" {
        return None;
    }
    Some(
        entry
            .get("response")
            .and_then(|r| r.get("success"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    )
}

/// Incremental reader over the append-only audit log.
///
/// The cursor only moves forward and only past complete lines, so a line
/// caught half-written is picked up whole on the next poll.
pub struct AuditTail {
    store: Arc<dyn RecordStore>,
    cursor: u64,
}

impl AuditTail {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, cursor: 0 }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Reads everything appended since the last poll and applies lock
    /// outcomes to `state`. Returns the number of new entries seen.
    pub fn poll(&mut self, state: &SummaryState) -> Result<usize> {
        let fresh = self.store.read_from(self.cursor)?;
        let Some(last_newline) = fresh.iter().rposition(|&b| b == b'\n') else {
            return Ok(0);
        };

        let complete = &fresh[..=last_newline];
        self.cursor += complete.len() as u64;

        let mut seen = 0;
        for line in complete.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            seen += 1;
            match serde_json::from_str::<Value>(line) {
                Ok(entry) => {
                    if let Some(locked) = lock_outcome(&entry) {
                        state.record_lock(locked);
                    }
                }
                Err(e) => debug!("Skipping unparsable audit line: {}", e),
            }
        }
        Ok(seen)
    }
}

pub struct StatusAggregator {
    config: ConfigStore,
    state: Arc<SummaryState>,
    default_threshold: f64,
}

impl StatusAggregator {
    pub fn new(config: ConfigStore, state: Arc<SummaryState>, default_threshold: f64) -> Self {
        Self {
            config,
            state,
            default_threshold,
        }
    }

    pub fn state(&self) -> &Arc<SummaryState> {
        &self.state
    }

    /// Recomputes the summary from the current slots and a fresh config read.
    pub fn build_summary(&self) -> VehicleStatusSummary {
        let config = self.config.snapshot();
        let speed = self.state.speed();

        VehicleStatusSummary {
            speed_kmh: speed.map(|s| s.kmh),
            locked: self.state.locked(),
            last_update: speed.map(|s| s.last_update),
            effective_limit: config.effective_limit(self.default_threshold),
            zone: config.current_zone.clone(),
            config,
        }
    }

    pub async fn publish_once(&self, socket: &UdpSocket, target: SocketAddr) -> Result<VehicleStatusSummary> {
        let summary = self.build_summary();
        send_datagram(socket, target, &BusMessage::StatusSummary(summary.clone())).await?;
        Ok(summary)
    }

    /// Binds the telemetry socket, starts the telemetry and audit paths and
    /// publishes on the current task. Only returns early on a bind failure.
    pub async fn run(self, audit_log: Arc<dyn RecordStore>, settings: &SummarySettings) -> Result<()> {
        let speed_socket = UdpSocket::bind(settings.speed_addr).await?;
        let out_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;

        let telemetry = tokio::spawn(run_telemetry_listener(
            Arc::clone(&self.state),
            speed_socket,
            settings.recv_timeout,
        ));
        let audit = tokio::spawn(run_audit_tail(
            AuditTail::new(audit_log),
            Arc::clone(&self.state),
            settings.audit_poll_interval,
        ));

        run_publisher(&self, &out_socket, settings.summary_target, settings.publish_interval).await;

        telemetry.abort();
        audit.abort();
        Ok(())
    }
}

pub async fn run_telemetry_listener(
    state: Arc<SummaryState>,
    socket: UdpSocket,
    recv_timeout: Option<Duration>,
) {
    if let Ok(addr) = socket.local_addr() {
        info!("📡 Summary listening to telemetry on udp://{}", addr);
    }

    loop {
        let value = match receive_datagram(&socket, recv_timeout).await {
            Ok(Reception::Received((value, _))) => value,
            Ok(Reception::TimedOut) => {
                info!("Telemetry listener idle, stopping");
                return;
            }
            Ok(Reception::ClosedByPeer) => return,
            Err(BusError::MalformedMessage(reason)) => {
                debug!("Dropped malformed telemetry: {}", reason);
                continue;
            }
            Err(e) => {
                warn!("Telemetry receive failed: {}", e);
                continue;
            }
        };

        if let Ok(BusMessage::Event(event)) = BusMessage::from_value(value) {
            if let Some(kmh) = event.payload.speed_kmh() {
                let last_update = event.payload.timestamp_ms.unwrap_or_else(epoch_ms);
                state.record_speed(kmh, last_update);
            }
        }
    }
}

pub async fn run_audit_tail(mut tail: AuditTail, state: Arc<SummaryState>, poll_interval: Duration) {
    let mut interval = time::interval(poll_interval);
    loop {
        interval.tick().await;
        match tail.poll(&state) {
            Ok(0) => {}
            Ok(n) => debug!("Audit tail read {} new entries (cursor {})", n, tail.cursor()),
            Err(e) => warn!("Audit tail poll failed: {}", e),
        }
    }
}

pub async fn run_publisher(
    aggregator: &StatusAggregator,
    socket: &UdpSocket,
    target: SocketAddr,
    publish_interval: Duration,
) {
    info!("📤 Publishing status summaries to udp://{}", target);
    let mut interval = time::interval(publish_interval);
    loop {
        interval.tick().await;
        match aggregator.publish_once(socket, target).await {
            Ok(summary) => debug!(
                "Summary: speed={:?} locked={:?} limit={:.1} zone={:?}",
                summary.speed_kmh, summary.locked, summary.effective_limit, summary.zone
            ),
            Err(e) => warn!("Failed to publish status summary: {}", e),
        }
    }
}
