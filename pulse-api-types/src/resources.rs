use serde::{Deserialize, Serialize};

use super::{ClusterEndpoint, GuestKind, NodeKind};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Memory usage with the percentage precomputed for clients.
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
    /// `100 * used / total`, or 0 when total is 0.
    pub usage: f64,
}

impl MemoryUsage {
    pub fn new(used: u64, total: u64) -> Self {
        let usage = if total > 0 {
            // ballooning can briefly report used > total
            (100.0 * used as f64 / total as f64).clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self { used, total, usage }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub used: u64,
    pub total: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuestStatus {
    Running,
    Stopped,
    Paused,
    #[default]
    Unknown,
}

serde_plain::derive_display_from_serialize!(GuestStatus);

impl GuestStatus {
    /// Maps upstream status strings, falling back to `Unknown`.
    pub fn parse(status: &str) -> Self {
        match status {
            "running" => GuestStatus::Running,
            "stopped" => GuestStatus::Stopped,
            "paused" | "suspended" => GuestStatus::Paused,
            _ => GuestStatus::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A VM or container, rebuilt from upstream every poll.
pub struct Guest {
    #[serde(rename = "type")]
    pub kind: GuestKind,
    pub vmid: u64,
    /// Name of the PVE node currently hosting the guest.
    pub node: String,
    /// Instance stamp: cluster name for clusters, node name otherwise.
    pub instance: String,
    pub name: String,
    pub status: GuestStatus,
    /// Fraction of one core in `0..=1` per allocated cpu.
    pub cpu: f64,
    pub cpus: u64,
    pub memory: MemoryUsage,
    pub disk: DiskUsage,
    /// Rates in bytes per second, derived from consecutive counter samples.
    pub disk_read: f64,
    pub disk_write: f64,
    pub network_in: f64,
    pub network_out: f64,
    pub uptime: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Guest {
    /// Stable identifier used by the alert engine and the history ring.
    pub fn entity_id(&self) -> String {
        format!("{}/{}/{}", self.instance, self.kind, self.vmid)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeOnlineStatus {
    Online,
    #[default]
    Offline,
}

serde_plain::derive_display_from_serialize!(NodeOnlineStatus);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionHealth {
    Healthy,
    Degraded,
    #[default]
    Unhealthy,
}

serde_plain::derive_display_from_serialize!(ConnectionHealth);

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// Health and usage of one upstream node.
pub struct NodeStatus {
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeOnlineStatus,
    pub connection_health: ConnectionHealth,
    pub cpu: f64,
    pub memory: MemoryUsage,
    pub disk: DiskUsage,
    pub uptime: u64,
    pub is_cluster_member: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_endpoints: Vec<ClusterEndpoint>,
    /// True while the entry carries last-known data from a missed poll.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl NodeStatus {
    pub fn entity_id(&self) -> String {
        format!("node/{}", self.name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// A PVE storage as seen from one node.
pub struct Storage {
    pub id: String,
    pub node: String,
    pub instance: String,
    pub name: String,
    #[serde(rename = "type")]
    pub storage_type: String,
    /// Comma separated content kinds, e.g. `images,iso,backup`.
    pub content: String,
    pub status: String,
    pub shared: bool,
    pub used: u64,
    pub total: u64,
    pub free: u64,
    /// Set when the PVE storage wraps a PBS datastore.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_pbs: bool,
}

impl Storage {
    pub fn holds_backups(&self) -> bool {
        self.content.split(',').any(|c| c.trim() == "backup")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
/// Usage of one PBS datastore.
pub struct PbsDatastore {
    pub name: String,
    pub used: u64,
    pub total: u64,
    pub free: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
/// One sync/verify/prune job on a PBS instance.
pub struct PbsJob {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_endtime: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
/// Aggregated view of one PBS instance.
pub struct PbsInstance {
    pub name: String,
    pub status: NodeOnlineStatus,
    pub connection_health: ConnectionHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datastores: Vec<PbsDatastore>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_jobs: Vec<PbsJob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify_jobs: Vec<PbsJob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prune_jobs: Vec<PbsJob>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_usage_is_bounded() {
        let m = MemoryUsage::new(512, 1024);
        assert_eq!(m.usage, 50.0);
        let empty = MemoryUsage::new(123, 0);
        assert_eq!(empty.usage, 0.0);
    }

    #[test]
    fn guest_status_parses_leniently() {
        assert_eq!(GuestStatus::parse("running"), GuestStatus::Running);
        assert_eq!(GuestStatus::parse("suspended"), GuestStatus::Paused);
        assert_eq!(GuestStatus::parse("weird"), GuestStatus::Unknown);
    }

    #[test]
    fn backup_content_detection() {
        let storage = Storage {
            id: "pve1/local".into(),
            node: "pve1".into(),
            instance: "pve1".into(),
            name: "local".into(),
            storage_type: "dir".into(),
            content: "images,iso,backup".into(),
            status: "available".into(),
            shared: false,
            used: 0,
            total: 0,
            free: 0,
            is_pbs: false,
        };
        assert!(storage.holds_backups());
    }
}
