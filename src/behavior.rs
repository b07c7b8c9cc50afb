//! Driver behavior scoring over the recent alert history.

use crate::error::Result;
use crate::store::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_WINDOW_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Moderate,
    Risky,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=3 => RiskLevel::Safe,
            4..=7 => RiskLevel::Moderate,
            _ => RiskLevel::Risky,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Moderate => "moderate",
            RiskLevel::Risky => "risky",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorReport {
    pub score: u32,
    pub level: RiskLevel,
    pub alert_count: usize,
    pub window_ms: u64,
}

/// Weight of one alert by zone: school 3, city 2, anything else 1.
pub fn zone_weight(zone: Option<&str>) -> u32 {
    let zone = zone.unwrap_or_default().to_lowercase();
    if zone.contains("school") {
        3
    } else if zone.contains("city") {
        2
    } else {
        1
    }
}

fn alert_timestamp(alert: &Value) -> Option<i64> {
    match alert.get("timestamp_ms")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Scores the alerts stamped within `window_ms` before `now_ms`.
/// Alerts without a usable timestamp are ignored.
pub fn score_alerts(alerts: &[Value], now_ms: u64, window_ms: u64) -> BehaviorReport {
    let now = i64::try_from(now_ms).unwrap_or(i64::MAX);
    let window = i64::try_from(window_ms).unwrap_or(i64::MAX);

    let mut score = 0;
    let mut alert_count = 0;
    for alert in alerts {
        let Some(ts) = alert_timestamp(alert) else {
            continue;
        };
        if now.saturating_sub(ts) > window {
            continue;
        }
        alert_count += 1;
        score += zone_weight(alert.get("zone").and_then(Value::as_str));
    }

    BehaviorReport {
        score,
        level: RiskLevel::from_score(score),
        alert_count,
        window_ms,
    }
}

fn parse_lines(contents: &str) -> Vec<Value> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

/// Reads the whole alert log and scores it. A missing log scores as safe.
pub fn compute_driver_behavior(
    alert_log: &dyn RecordStore,
    now_ms: u64,
    window_ms: u64,
) -> Result<BehaviorReport> {
    let alerts = alert_log
        .read_all()?
        .map(|contents| parse_lines(&contents))
        .unwrap_or_default();
    Ok(score_alerts(&alerts, now_ms, window_ms))
}

/// The last `limit` parseable entries of the alert log, oldest first.
pub fn load_recent_alerts(alert_log: &dyn RecordStore, limit: usize) -> Result<Vec<Value>> {
    let Some(contents) = alert_log.read_all()? else {
        return Ok(Vec::new());
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(limit);
    Ok(parse_lines(&lines[start..].join("\n")))
}
