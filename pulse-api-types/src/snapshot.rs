use serde::{Deserialize, Serialize};

use super::{Alert, BackupRecord, Guest, NodeStatus, PbsInstance, PveBackups, Storage};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
/// The complete merged state of the fleet at one instant.
///
/// Published as `Arc<Snapshot>` and never mutated afterwards; one publish
/// per poll window. `generated_at` is epoch milliseconds and strictly
/// increases across publishes.
pub struct Snapshot {
    pub nodes: Vec<NodeStatus>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub storage: Vec<Storage>,
    pub pve_backups: PveBackups,
    pub pbs_backups: Vec<BackupRecord>,
    pub pbs_instances: Vec<PbsInstance>,
    pub alerts: Vec<Alert>,
    pub generated_at: i64,
}

impl Snapshot {
    /// All guests, VMs first.
    pub fn guests(&self) -> impl Iterator<Item = &Guest> {
        self.vms.iter().chain(self.containers.iter())
    }
}
