//! In-memory metrics history.
//!
//! One bounded ring of [`HistoryPoint`]s per entity. Appends happen once
//! per published snapshot for each entity present in it; entities missing
//! from a snapshot are left alone. There is no disk persistence, a restart
//! starts empty.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use pulse_api_types::{Guest, HistoryPoint, NodeStatus, Snapshot};

/// Default ring capacity: 1440 points, about four hours at a 10 s tick.
pub const DEFAULT_CAPACITY: usize = 1440;

pub struct MetricsHistory {
    capacity: usize,
    rings: Mutex<HashMap<String, VecDeque<HistoryPoint>>>,
}

impl MetricsHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: Mutex::new(HashMap::new()),
        }
    }

    /// Append one point per live entity of the snapshot. O(1) per entity.
    pub fn record(&self, snapshot: &Snapshot) {
        let timestamp = snapshot.generated_at / 1000;
        let mut rings = self.rings.lock().unwrap();
        for node in &snapshot.nodes {
            let point = node_point(node, timestamp);
            push(&mut rings, self.capacity, node.entity_id(), point);
        }
        for guest in snapshot.guests() {
            let point = guest_point(guest, timestamp);
            push(&mut rings, self.capacity, guest.entity_id(), point);
        }
    }

    /// Points of one entity inside `[from, to]`, decimated by plain stride
    /// to at most `max_points`.
    pub fn range(&self, entity: &str, from: i64, to: i64, max_points: usize) -> Vec<HistoryPoint> {
        let rings = self.rings.lock().unwrap();
        let ring = match rings.get(entity) {
            Some(ring) => ring,
            None => return Vec::new(),
        };
        let selected: Vec<HistoryPoint> = ring
            .iter()
            .filter(|p| p.timestamp >= from && p.timestamp <= to)
            .copied()
            .collect();
        decimate(selected, max_points)
    }

    /// Range query across every known entity, for the charts endpoint.
    pub fn range_all(
        &self,
        from: i64,
        to: i64,
        max_points: usize,
    ) -> HashMap<String, Vec<HistoryPoint>> {
        let entities: Vec<String> = {
            let rings = self.rings.lock().unwrap();
            rings.keys().cloned().collect()
        };
        entities
            .into_iter()
            .filter_map(|entity| {
                let points = self.range(&entity, from, to, max_points);
                if points.is_empty() {
                    None
                } else {
                    Some((entity, points))
                }
            })
            .collect()
    }
}

fn push(
    rings: &mut HashMap<String, VecDeque<HistoryPoint>>,
    capacity: usize,
    entity: String,
    point: HistoryPoint,
) {
    let ring = rings
        .entry(entity)
        .or_insert_with(|| VecDeque::with_capacity(capacity));
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(point);
}

fn decimate(points: Vec<HistoryPoint>, max_points: usize) -> Vec<HistoryPoint> {
    if max_points == 0 || points.len() <= max_points {
        return points;
    }
    let stride = (points.len() + max_points - 1) / max_points;
    points.into_iter().step_by(stride).collect()
}

fn guest_point(guest: &Guest, timestamp: i64) -> HistoryPoint {
    HistoryPoint {
        timestamp,
        cpu: guest.cpu * 100.0,
        mem_usage: guest.memory.usage,
        disk_usage: percentage(guest.disk.used, guest.disk.total),
        disk_read_rate: guest.disk_read,
        disk_write_rate: guest.disk_write,
        net_in_rate: guest.network_in,
        net_out_rate: guest.network_out,
    }
}

fn node_point(node: &NodeStatus, timestamp: i64) -> HistoryPoint {
    HistoryPoint {
        timestamp,
        cpu: node.cpu * 100.0,
        mem_usage: node.memory.usage,
        disk_usage: percentage(node.disk.used, node.disk.total),
        ..Default::default()
    }
}

pub(crate) fn percentage(used: u64, total: u64) -> f64 {
    if total > 0 {
        100.0 * used as f64 / total as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64) -> HistoryPoint {
        HistoryPoint {
            timestamp: ts,
            cpu: ts as f64,
            ..Default::default()
        }
    }

    fn history_with(capacity: usize, count: i64) -> MetricsHistory {
        let history = MetricsHistory::new(capacity);
        {
            let mut rings = history.rings.lock().unwrap();
            for ts in 0..count {
                push(&mut rings, capacity, "vm/100".to_string(), point(ts));
            }
        }
        history
    }

    #[test]
    fn ring_is_bounded() {
        let history = history_with(5, 12);
        let points = history.range("vm/100", 0, 100, 100);
        assert_eq!(points.len(), 5);
        // oldest entries were displaced
        assert_eq!(points[0].timestamp, 7);
        assert_eq!(points[4].timestamp, 11);
    }

    #[test]
    fn range_filters_and_decimates() {
        let history = history_with(100, 100);
        let points = history.range("vm/100", 10, 59, 10);
        assert!(points.len() <= 10);
        assert!(points.iter().all(|p| (10..=59).contains(&p.timestamp)));
        // stride keeps the first point of the window
        assert_eq!(points[0].timestamp, 10);
    }

    #[test]
    fn unknown_entity_is_empty() {
        let history = MetricsHistory::new(16);
        assert!(history.range("vm/999", 0, 100, 10).is_empty());
    }
}
