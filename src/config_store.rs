//! Shared vehicle configuration record and the effective speed limit rule.
//!
//! The record is a JSON object with three mutable fields:
//! `rpc_speed_limit` (written by the RPC service), and `geo_speed_limit` plus
//! `current_zone` (written by the geofence driver).
//!
//! # Consistency
//!
//! Every setter reads the whole record, changes its own fields and writes the
//! whole record back. Writers are not coordinated, so a setter running in
//! another process between our read and our write has its change overwritten.
//! This is a known gap and is left as is: readers see eventual, not immediate,
//! consistency between writers of different fields.

use crate::error::{BusError, Result};
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

pub const RPC_SPEED_LIMIT_KEY: &str = "rpc_speed_limit";
pub const GEO_SPEED_LIMIT_KEY: &str = "geo_speed_limit";
pub const CURRENT_ZONE_KEY: &str = "current_zone";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default)]
    pub rpc_speed_limit: Option<f64>,
    #[serde(default)]
    pub geo_speed_limit: Option<f64>,
    #[serde(default)]
    pub current_zone: Option<String>,
}

impl ConfigRecord {
    /// Reads the known fields out of a raw record. Absent keys, nulls and
    /// values of the wrong type all read as `None`.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            rpc_speed_limit: map.get(RPC_SPEED_LIMIT_KEY).and_then(limit_value),
            geo_speed_limit: map.get(GEO_SPEED_LIMIT_KEY).and_then(limit_value),
            current_zone: map
                .get(CURRENT_ZONE_KEY)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Splits a raw record into the known fields and everything else.
    pub fn split(mut map: Map<String, Value>) -> (Self, Map<String, Value>) {
        let record = Self::from_map(&map);
        for key in [RPC_SPEED_LIMIT_KEY, GEO_SPEED_LIMIT_KEY, CURRENT_ZONE_KEY] {
            map.remove(key);
        }
        (record, map)
    }

    pub fn effective_limit(&self, default_threshold: f64) -> f64 {
        resolve_effective_limit(self.geo_speed_limit, self.rpc_speed_limit, default_threshold)
    }
}

/// Geofence limit wins, then the RPC limit, then `default_threshold`.
pub fn resolve_effective_limit(geo: Option<f64>, rpc: Option<f64>, default_threshold: f64) -> f64 {
    geo.or(rpc).unwrap_or(default_threshold)
}

fn limit_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct ConfigStore {
    store: Arc<dyn RecordStore>,
}

impl ConfigStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn set_rpc_limit(&self, limit_kmh: i64) -> Result<()> {
        let mut raw = self.load_raw();
        raw.insert(RPC_SPEED_LIMIT_KEY.to_string(), Value::from(limit_kmh));
        self.save_raw(&raw)
    }

    pub fn clear_rpc_limit(&self) -> Result<()> {
        let mut raw = self.load_raw();
        raw.insert(RPC_SPEED_LIMIT_KEY.to_string(), Value::Null);
        self.save_raw(&raw)
    }

    pub fn set_geo_context(&self, zone: Option<&str>, limit_kmh: Option<i64>) -> Result<()> {
        let mut raw = self.load_raw();
        raw.insert(
            CURRENT_ZONE_KEY.to_string(),
            zone.map_or(Value::Null, Value::from),
        );
        raw.insert(
            GEO_SPEED_LIMIT_KEY.to_string(),
            limit_kmh.map_or(Value::Null, Value::from),
        );
        self.save_raw(&raw)
    }

    pub fn effective_limit(&self, default_threshold: f64) -> f64 {
        self.snapshot().effective_limit(default_threshold)
    }

    /// Never fails: a missing or unreadable record reads as all-null.
    pub fn snapshot(&self) -> ConfigRecord {
        ConfigRecord::from_map(&self.load_raw())
    }

    /// The whole record, including keys this crate does not know about.
    pub fn raw_snapshot(&self) -> Map<String, Value> {
        self.load_raw()
    }

    fn load_raw(&self) -> Map<String, Value> {
        let contents = match self.store.read_all() {
            Ok(Some(contents)) => contents,
            Ok(None) => return Map::new(),
            Err(e) => {
                warn!("Config record unreadable, treating as empty: {}", e);
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("Config record at {} is not an object, treating as empty", self.store.describe());
                Map::new()
            }
            Err(e) => {
                warn!("Config record at {} is not valid JSON ({}), treating as empty", self.store.describe(), e);
                Map::new()
            }
        }
    }

    fn save_raw(&self, raw: &Map<String, Value>) -> Result<()> {
        let contents =
            serde_json::to_string_pretty(raw).map_err(|e| BusError::Encoding(e.to_string()))?;
        self.store.write_all(&contents)
    }
}
