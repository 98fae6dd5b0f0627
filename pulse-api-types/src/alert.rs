use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

serde_plain::derive_display_from_serialize!(AlertLevel);

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A live alert. Lives across polls; created, updated and retired by the
/// alert engine.
pub struct Alert {
    /// Stable hash of resource, metric and level.
    pub id: String,
    pub resource_id: String,
    pub resource_name: String,
    pub metric: String,
    pub threshold: f64,
    pub value: f64,
    pub level: AlertLevel,
    /// Epoch seconds.
    pub first_seen: i64,
    pub last_seen: i64,
    pub acknowledged: bool,
    /// Set for `pulse-monitor-only` resources: visible, never notified.
    pub suppressed: bool,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertEventKind {
    Fired,
    Resolved,
}

serde_plain::derive_display_from_serialize!(AlertEventKind);

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// What the alert engine hands to notifiers, at least once.
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
    /// Number of occurrences coalesced into this event (grouping window).
    #[serde(default = "one")]
    pub count: u64,
    pub timestamp: i64,
}

fn one() -> u64 {
    1
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Warning and critical trigger values for one metric.
pub struct ThresholdPair {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdPair {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }

    pub fn for_level(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Warning => self.warning,
            AlertLevel::Critical => self.critical,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Global threshold defaults plus the hysteresis timing knobs.
pub struct Thresholds {
    /// Percent of allocated cpu.
    pub cpu: ThresholdPair,
    /// Percent of allocated memory.
    pub memory: ThresholdPair,
    /// Percent of allocated disk.
    pub disk: ThresholdPair,
    /// Seconds a node may be unreachable before alerting.
    pub offline: ThresholdPair,
    /// Seconds a metric must stay beyond its threshold before firing.
    pub confirm_secs: u64,
    /// Seconds a metric must stay below threshold minus hysteresis before
    /// clearing.
    pub clear_secs: u64,
    /// Hysteresis in percentage points for percent metrics; rate metrics
    /// use a tenth of their threshold instead.
    pub hysteresis: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: ThresholdPair::new(85.0, 95.0),
            memory: ThresholdPair::new(90.0, 95.0),
            disk: ThresholdPair::new(85.0, 95.0),
            offline: ThresholdPair::new(60.0, 300.0),
            confirm_secs: 60,
            clear_secs: 120,
            hysteresis: 5.0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Partial per-resource override; unset metrics fall through to the
/// effective defaults.
pub struct ThresholdOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<ThresholdPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<ThresholdPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<ThresholdPair>,
    /// Disables alerting for the resource entirely.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
/// Everything the alert engine evaluates against.
pub struct ThresholdConfig {
    pub defaults: Thresholds,
    /// Keyed by resource id (`<instance>/<type>/<vmid>` or `node/<name>`).
    pub overrides: HashMap<String, ThresholdOverride>,
}

impl ThresholdConfig {
    /// Effective pair for one metric: resource override wins over defaults.
    /// Tag effects are applied by the engine on top of this.
    pub fn effective(&self, resource_id: &str, metric: &str) -> Option<ThresholdPair> {
        let base = match metric {
            "cpu" => self.defaults.cpu,
            "memory" => self.defaults.memory,
            "disk" => self.defaults.disk,
            "offline" => self.defaults.offline,
            _ => return None,
        };
        let overridden = self.overrides.get(resource_id).and_then(|o| match metric {
            "cpu" => o.cpu,
            "memory" => o.memory,
            "disk" => o.disk,
            _ => None,
        });
        Some(overridden.unwrap_or(base))
    }

    pub fn is_disabled(&self, resource_id: &str) -> bool {
        self.overrides
            .get(resource_id)
            .is_some_and(|o| o.disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_over_default() {
        let mut config = ThresholdConfig::default();
        config.overrides.insert(
            "pve1/qemu/100".to_string(),
            ThresholdOverride {
                memory: Some(ThresholdPair::new(50.0, 60.0)),
                ..Default::default()
            },
        );
        let pair = config.effective("pve1/qemu/100", "memory").unwrap();
        assert_eq!(pair.warning, 50.0);
        let other = config.effective("pve1/qemu/101", "memory").unwrap();
        assert_eq!(other.warning, Thresholds::default().memory.warning);
        // unset metric falls through
        let cpu = config.effective("pve1/qemu/100", "cpu").unwrap();
        assert_eq!(cpu, Thresholds::default().cpu);
    }

    #[test]
    fn unknown_metric_has_no_pair() {
        let config = ThresholdConfig::default();
        assert!(config.effective("x", "iops").is_none());
    }
}
