//! Resolved runtime settings for each service.
//!
//! Nothing here reads the environment; binaries fill these in from their
//! command line and hand them to the services at construction time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SPEED_THRESHOLD_KMH: f64 = 80.0;
pub const DEFAULT_DEBOUNCE_MS: u64 = 2000;
pub const DEFAULT_RPC_PORT: u16 = 6000;
pub const DEFAULT_ALERT_IN_PORT: u16 = 50052;
pub const DEFAULT_ALERT_OUT_PORT: u16 = 50053;
pub const DEFAULT_SUMMARY_OUT_PORT: u16 = 50054;
pub const DEFAULT_SUMMARY_SPEED_PORT: u16 = 50056;

fn localhost(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub config_path: PathBuf,
    pub audit_path: PathBuf,
    pub alert_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("logs/config.json"),
            audit_path: PathBuf::from("logs/audit.jsonl"),
            alert_path: PathBuf::from("logs/alerts.jsonl"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub listen_addr: SocketAddr,
    pub default_threshold: f64,
    /// Simulated door actuation time for `lock`.
    pub lock_delay: Duration,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            listen_addr: localhost(DEFAULT_RPC_PORT),
            default_threshold: DEFAULT_SPEED_THRESHOLD_KMH,
            lock_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub listen_addr: SocketAddr,
    pub alert_target: SocketAddr,
    pub debounce_ms: u64,
    pub default_threshold: f64,
    /// `Some` switches the engine to receive-or-give-up mode.
    pub recv_timeout: Option<Duration>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            listen_addr: localhost(DEFAULT_ALERT_IN_PORT),
            alert_target: localhost(DEFAULT_ALERT_OUT_PORT),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            default_threshold: DEFAULT_SPEED_THRESHOLD_KMH,
            recv_timeout: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SummarySettings {
    pub speed_addr: SocketAddr,
    pub summary_target: SocketAddr,
    pub audit_poll_interval: Duration,
    pub publish_interval: Duration,
    pub default_threshold: f64,
    pub recv_timeout: Option<Duration>,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            speed_addr: localhost(DEFAULT_SUMMARY_SPEED_PORT),
            summary_target: localhost(DEFAULT_SUMMARY_OUT_PORT),
            audit_poll_interval: Duration::from_millis(500),
            publish_interval: Duration::from_secs(1),
            default_threshold: DEFAULT_SPEED_THRESHOLD_KMH,
            recv_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BusSettings {
    pub storage: StorageSettings,
    pub rpc: RpcSettings,
    pub alert: AlertSettings,
    pub summary: SummarySettings,
}

impl BusSettings {
    /// Where a publisher should send telemetry so both consumers see it.
    pub fn telemetry_targets(&self) -> Vec<SocketAddr> {
        vec![self.alert.listen_addr, self.summary.speed_addr]
    }
}
