use crate::config_store::ConfigStore;
use crate::error::Result;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub name: String,
    pub limit_kmh: i64,
    pub dwell: Duration,
}

impl Zone {
    pub fn new(name: &str, limit_kmh: i64, dwell: Duration) -> Self {
        Self {
            name: name.to_string(),
            limit_kmh,
            dwell,
        }
    }
}

/// City, highway and school, in that order.
pub fn default_zones() -> Vec<Zone> {
    vec![
        Zone::new("City", 50, Duration::from_secs(15)),
        Zone::new("Highway", 100, Duration::from_secs(20)),
        Zone::new("School", 30, Duration::from_secs(15)),
    ]
}

/// Simulated geofence: walks a fixed route of zones and writes the zone and
/// its limit into the config record on entry.
pub struct GeofenceDriver {
    config: ConfigStore,
    zones: Vec<Zone>,
}

impl GeofenceDriver {
    pub fn new(config: ConfigStore, zones: Vec<Zone>) -> Self {
        Self { config, zones }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn enter(&self, zone: &Zone) -> Result<()> {
        info!(
            "🗺️  Entering zone '{}' with limit {} km/h for {:?}",
            zone.name, zone.limit_kmh, zone.dwell
        );
        self.config.set_geo_context(Some(&zone.name), Some(zone.limit_kmh))
    }

    /// Leaves every zone: the geofence limit no longer applies.
    pub fn clear(&self) -> Result<()> {
        self.config.set_geo_context(None, None)
    }

    /// Cycles through the zones forever. A failed write is logged and the
    /// driver still dwells in the zone before moving on.
    pub async fn run(&self) {
        if self.zones.is_empty() {
            warn!("Geofence driver has no zones, not starting");
            return;
        }

        loop {
            for zone in &self.zones {
                if let Err(e) = self.enter(zone) {
                    warn!("Failed to record zone '{}': {}", zone.name, e);
                }
                time::sleep(zone.dwell).await;
            }
        }
    }
}
