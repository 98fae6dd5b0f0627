//! Threshold evaluation with hysteresis and suppression.
//!
//! The engine owns the per-(resource, metric) state machines and is driven
//! by the poll supervisor, once per assembled snapshot. It returns the live
//! alert set for embedding into the published snapshot and pushes
//! [`AlertEvent`]s towards the notifier dispatcher.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use siphasher::sip::SipHasher24;
use tokio::sync::mpsc;

use pulse_api_types::{
    Alert, AlertEvent, AlertEventKind, AlertLevel, Guest, NodeOnlineStatus, Snapshot,
    ThresholdConfig, ThresholdPair, TAG_MONITOR_ONLY, TAG_NO_ALERTS, TAG_RELAXED,
};

pub mod notify;

pub use notify::{LogNotifier, Notifier};

/// Relaxed-tag thresholds: cpu/memory fire at 95, disk at 98.
const RELAXED_PERCENT: f64 = 95.0;
const RELAXED_DISK: f64 = 98.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ok,
    Pending,
    Active,
    Clearing,
}

struct MetricState {
    phase: Phase,
    /// When the current phase was entered, epoch seconds.
    since: i64,
    alert: Option<Alert>,
    /// Bumped every evaluation; states not touched in a pass belong to
    /// entities that left the snapshot and are retired.
    generation: u64,
}

struct Sample<'a> {
    resource_id: String,
    resource_name: &'a str,
    metric: &'static str,
    value: f64,
    /// Percent metrics use absolute hysteresis, others a tenth of the
    /// threshold.
    percent: bool,
    pair: ThresholdPair,
    suppress_events: bool,
}

pub struct AlertEngine {
    config: Arc<RwLock<ThresholdConfig>>,
    states: HashMap<(String, &'static str), MetricState>,
    /// First time a node was seen offline, epoch seconds.
    offline_since: HashMap<String, i64>,
    events: mpsc::UnboundedSender<AlertEvent>,
    generation: u64,
}

impl AlertEngine {
    pub fn new(
        config: Arc<RwLock<ThresholdConfig>>,
        events: mpsc::UnboundedSender<AlertEvent>,
    ) -> Self {
        Self {
            config,
            states: HashMap::new(),
            offline_since: HashMap::new(),
            events,
            generation: 0,
        }
    }

    /// Evaluate one snapshot. Returns the alert set to embed in it.
    pub fn evaluate(&mut self, snapshot: &Snapshot, now: i64) -> Vec<Alert> {
        self.generation += 1;
        let config = self.config.read().unwrap().clone();

        let mut samples = Vec::new();
        for guest in snapshot.guests() {
            self.guest_samples(&config, guest, &mut samples);
        }
        for node in &snapshot.nodes {
            self.node_samples(&config, node, now, &mut samples);
        }

        for sample in samples {
            self.advance(sample, &config, now);
        }

        // entities gone from the snapshot take their alerts with them
        let generation = self.generation;
        self.states.retain(|_, state| state.generation == generation);
        let live_nodes: std::collections::HashSet<&str> =
            snapshot.nodes.iter().map(|n| n.name.as_str()).collect();
        self.offline_since
            .retain(|name, _| live_nodes.contains(name.as_str()));

        let mut alerts: Vec<Alert> = self
            .states
            .values()
            .filter_map(|state| state.alert.clone())
            .collect();
        alerts.sort_by(|a, b| {
            (&a.resource_id, &a.metric).cmp(&(&b.resource_id, &b.metric))
        });
        alerts
    }

    fn guest_samples<'a>(
        &self,
        config: &ThresholdConfig,
        guest: &'a Guest,
        samples: &mut Vec<Sample<'a>>,
    ) {
        if guest.has_tag(TAG_NO_ALERTS) {
            return;
        }
        let resource_id = guest.entity_id();
        if config.is_disabled(&resource_id) {
            return;
        }
        let relaxed = guest.has_tag(TAG_RELAXED);
        let suppress_events = guest.has_tag(TAG_MONITOR_ONLY);

        let metrics: [(&'static str, f64, f64); 3] = [
            ("cpu", guest.cpu * 100.0, RELAXED_PERCENT),
            ("memory", guest.memory.usage, RELAXED_PERCENT),
            (
                "disk",
                crate::history::percentage(guest.disk.used, guest.disk.total),
                RELAXED_DISK,
            ),
        ];
        for (metric, value, relaxed_floor) in metrics {
            let mut pair = match config.effective(&resource_id, metric) {
                Some(pair) => pair,
                None => continue,
            };
            if relaxed {
                pair.warning = pair.warning.max(relaxed_floor);
                pair.critical = pair.critical.max(pair.warning);
            }
            samples.push(Sample {
                resource_id: resource_id.clone(),
                resource_name: &guest.name,
                metric,
                value,
                percent: true,
                pair,
                suppress_events,
            });
        }
    }

    fn node_samples<'a>(
        &mut self,
        config: &ThresholdConfig,
        node: &'a pulse_api_types::NodeStatus,
        now: i64,
        samples: &mut Vec<Sample<'a>>,
    ) {
        let resource_id = node.entity_id();
        if config.is_disabled(&resource_id) {
            return;
        }

        let offline_secs = match node.status {
            NodeOnlineStatus::Offline => {
                let since = *self.offline_since.entry(node.name.clone()).or_insert(now);
                (now - since) as f64
            }
            NodeOnlineStatus::Online => {
                self.offline_since.remove(&node.name);
                0.0
            }
        };

        let metrics: [(&'static str, f64, bool); 4] = [
            ("cpu", node.cpu * 100.0, true),
            ("memory", node.memory.usage, true),
            (
                "disk",
                crate::history::percentage(node.disk.used, node.disk.total),
                true,
            ),
            ("offline", offline_secs, false),
        ];
        for (metric, value, percent) in metrics {
            let pair = match config.effective(&resource_id, metric) {
                Some(pair) => pair,
                None => continue,
            };
            samples.push(Sample {
                resource_id: resource_id.clone(),
                resource_name: &node.name,
                metric,
                value,
                percent,
                pair,
                suppress_events: false,
            });
        }
    }

    /// Run one sample through the `ok -> pending -> active -> clearing -> ok`
    /// machine.
    fn advance(&mut self, sample: Sample, config: &ThresholdConfig, now: i64) {
        let defaults = config.defaults;
        let events = self.events.clone();
        let key = (sample.resource_id.clone(), sample.metric);
        let state = self.states.entry(key).or_insert(MetricState {
            phase: Phase::Ok,
            since: now,
            alert: None,
            generation: 0,
        });
        state.generation = self.generation;

        let firing = sample.value >= sample.pair.warning;
        let hysteresis = if sample.percent {
            defaults.hysteresis
        } else {
            sample.pair.warning * 0.1
        };
        let cleared = sample.value <= sample.pair.warning - hysteresis;

        match state.phase {
            Phase::Ok => {
                if firing {
                    state.phase = Phase::Pending;
                    state.since = now;
                }
            }
            Phase::Pending => {
                if !firing {
                    state.phase = Phase::Ok;
                    state.since = now;
                } else if (now - state.since) as u64 >= defaults.confirm_secs {
                    let alert = build_alert(&sample, state.since, now);
                    if !sample.suppress_events {
                        send_event(&events, AlertEventKind::Fired, &alert, now);
                    }
                    state.alert = Some(alert);
                    state.phase = Phase::Active;
                    state.since = now;
                }
            }
            Phase::Active => {
                refresh_alert(state, &sample, now);
                if cleared {
                    state.phase = Phase::Clearing;
                    state.since = now;
                }
            }
            Phase::Clearing => {
                refresh_alert(state, &sample, now);
                if !cleared {
                    // bounced back above the clear threshold, still firing
                    state.phase = Phase::Active;
                    state.since = now;
                } else if (now - state.since) as u64 >= defaults.clear_secs {
                    if let Some(alert) = state.alert.take() {
                        if !sample.suppress_events {
                            send_event(&events, AlertEventKind::Resolved, &alert, now);
                        }
                    }
                    state.phase = Phase::Ok;
                    state.since = now;
                }
            }
        }
    }
}

fn send_event(
    events: &mpsc::UnboundedSender<AlertEvent>,
    kind: AlertEventKind,
    alert: &Alert,
    now: i64,
) {
    let event = AlertEvent {
        kind,
        alert: alert.clone(),
        count: 1,
        timestamp: now,
    };
    if events.send(event).is_err() {
        log::warn!("alert event dropped, dispatcher gone");
    }
}

fn level_for(sample: &Sample) -> AlertLevel {
    if sample.value >= sample.pair.critical {
        AlertLevel::Critical
    } else {
        AlertLevel::Warning
    }
}

fn build_alert(sample: &Sample, first_seen: i64, now: i64) -> Alert {
    let level = level_for(sample);
    Alert {
        id: alert_id(&sample.resource_id, sample.metric, level),
        resource_id: sample.resource_id.clone(),
        resource_name: sample.resource_name.to_string(),
        metric: sample.metric.to_string(),
        threshold: sample.pair.for_level(level),
        value: sample.value,
        level,
        first_seen,
        last_seen: now,
        acknowledged: false,
        suppressed: sample.suppress_events,
        message: alert_message(sample, level),
    }
}

/// Keep an existing alert current: value, level and message track the
/// latest sample without generating events.
fn refresh_alert(state: &mut MetricState, sample: &Sample, now: i64) {
    if let Some(alert) = state.alert.as_mut() {
        let level = level_for(sample);
        if alert.level != level {
            alert.level = level;
            alert.id = alert_id(&sample.resource_id, sample.metric, level);
            alert.threshold = sample.pair.for_level(level);
        }
        alert.value = sample.value;
        alert.last_seen = now;
        alert.suppressed = sample.suppress_events;
        alert.message = alert_message(sample, level);
    }
}

fn alert_message(sample: &Sample, level: AlertLevel) -> String {
    if sample.metric == "offline" {
        format!(
            "{} unreachable for {} seconds",
            sample.resource_name, sample.value as i64
        )
    } else {
        format!(
            "{} {} at {:.1}% ({} threshold {:.0}%)",
            sample.resource_name,
            sample.metric,
            sample.value,
            level,
            sample.pair.for_level(level),
        )
    }
}

/// Stable across restarts: clients key acknowledgements on it.
fn alert_id(resource_id: &str, metric: &str, level: AlertLevel) -> String {
    let mut hasher = SipHasher24::new_with_keys(0x70756c7365_u64, 0x616c657274_u64);
    resource_id.hash(&mut hasher);
    metric.hash(&mut hasher);
    level.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_api_types::{DiskUsage, GuestKind, GuestStatus, MemoryUsage};

    fn guest(memory_pct: f64, tags: &[&str]) -> Guest {
        Guest {
            kind: GuestKind::Qemu,
            vmid: 100,
            node: "pve1".into(),
            instance: "pve1".into(),
            name: "web".into(),
            status: GuestStatus::Running,
            cpu: 0.1,
            cpus: 4,
            memory: MemoryUsage {
                used: (memory_pct * 10.0) as u64,
                total: 1000,
                usage: memory_pct,
            },
            disk: DiskUsage::default(),
            disk_read: 0.0,
            disk_write: 0.0,
            network_in: 0.0,
            network_out: 0.0,
            uptime: 1000,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            meta: None,
        }
    }

    fn snapshot_with(memory_pct: f64, tags: &[&str], generated_at: i64) -> Snapshot {
        Snapshot {
            vms: vec![guest(memory_pct, tags)],
            generated_at,
            ..Default::default()
        }
    }

    fn engine() -> (AlertEngine, mpsc::UnboundedReceiver<AlertEvent>) {
        let mut config = ThresholdConfig::default();
        config.defaults.memory = ThresholdPair::new(90.0, 101.0);
        // keep cpu/disk out of the way
        config.defaults.cpu = ThresholdPair::new(1000.0, 1001.0);
        config.defaults.disk = ThresholdPair::new(1000.0, 1001.0);
        let (tx, rx) = mpsc::unbounded_channel();
        (AlertEngine::new(Arc::new(RwLock::new(config)), tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AlertEvent>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Memory sequence over eight ticks, 60 s apart, warning at 90 with
    /// 5-point hysteresis: fires once the excursion is confirmed, resolves
    /// once the recovery is.
    #[test]
    fn fire_and_clear_sequence() {
        let (mut engine, mut rx) = engine();
        let series = [40.0, 92.0, 93.0, 91.0, 95.0, 70.0, 60.0, 55.0];
        let mut fired_at = None;
        let mut resolved_at = None;

        for (tick, memory) in series.iter().enumerate() {
            let now = 60 * tick as i64;
            engine.evaluate(&snapshot_with(*memory, &[], now), now);
            for event in drain(&mut rx) {
                match event.kind {
                    AlertEventKind::Fired => fired_at = Some(tick),
                    AlertEventKind::Resolved => resolved_at = Some(tick),
                }
            }
        }

        // pending at tick 1 (92), confirmed one tick later
        assert_eq!(fired_at, Some(2));
        // clearing from tick 5 (70 <= 85), confirmed two ticks later
        assert_eq!(resolved_at, Some(7));
    }

    #[test]
    fn no_alerts_tag_silences_everything() {
        let (mut engine, mut rx) = engine();
        for tick in 0..8 {
            let now = 60 * tick;
            let alerts =
                engine.evaluate(&snapshot_with(99.0, &[TAG_NO_ALERTS], now), now);
            assert!(alerts.is_empty());
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn monitor_only_surfaces_alert_without_events() {
        let (mut engine, mut rx) = engine();
        let mut last = Vec::new();
        for tick in 0..4 {
            let now = 60 * tick;
            last = engine.evaluate(&snapshot_with(99.0, &[TAG_MONITOR_ONLY], now), now);
        }
        assert_eq!(last.len(), 1);
        assert!(last[0].suppressed);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn relaxed_tag_raises_thresholds() {
        let (mut engine, mut rx) = engine();
        for tick in 0..4 {
            let now = 60 * tick;
            let alerts = engine.evaluate(&snapshot_with(93.0, &[TAG_RELAXED], now), now);
            // 93 < relaxed floor of 95, nothing fires
            assert!(alerts.is_empty());
        }
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn noisy_source_does_not_flap() {
        let (mut engine, mut rx) = engine();
        // oscillating around the threshold after firing; stays above the
        // clear threshold of 85, so no resolve and no second fire
        let series = [92.0, 93.0, 92.0, 88.0, 91.0, 87.0, 92.0];
        for (tick, memory) in series.iter().enumerate() {
            let now = 60 * tick as i64;
            engine.evaluate(&snapshot_with(*memory, &[], now), now);
        }
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AlertEventKind::Fired);
    }

    #[test]
    fn vanished_entity_retires_its_state() {
        let (mut engine, mut rx) = engine();
        for tick in 0..3 {
            let now = 60 * tick;
            engine.evaluate(&snapshot_with(99.0, &[], now), now);
        }
        assert_eq!(drain(&mut rx).len(), 1);

        let empty = Snapshot {
            generated_at: 300,
            ..Default::default()
        };
        let alerts = engine.evaluate(&empty, 300);
        assert!(alerts.is_empty());
        assert!(engine.states.is_empty());
    }

    #[test]
    fn alert_id_is_stable() {
        let a = alert_id("pve1/qemu/100", "memory", AlertLevel::Warning);
        let b = alert_id("pve1/qemu/100", "memory", AlertLevel::Warning);
        let c = alert_id("pve1/qemu/100", "memory", AlertLevel::Critical);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
