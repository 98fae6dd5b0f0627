use serde::{Deserialize, Serialize};

use super::GuestKind;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "backupType", rename_all = "lowercase")]
/// A backup-shaped record. The discriminator tells clients where it came
/// from: a guest snapshot, a PVE storage volume, or a PBS datastore entry.
pub enum BackupRecord {
    #[serde(rename_all = "camelCase")]
    Snapshot {
        vmid: u64,
        guest_type: GuestKind,
        node: String,
        /// Snapshot creation time, epoch seconds.
        backup_time: i64,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        vmstate: bool,
    },
    #[serde(rename_all = "camelCase")]
    Local {
        vmid: u64,
        guest_type: GuestKind,
        node: String,
        backup_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
        storage: String,
        volid: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        protected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        /// True when the underlying PVE storage wraps a PBS datastore; such
        /// records are dropped in favour of the direct PBS listing.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        on_pbs: bool,
    },
    #[serde(rename_all = "camelCase")]
    Remote {
        vmid: u64,
        guest_type: GuestKind,
        backup_time: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_bytes: Option<u64>,
        datastore: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        namespace: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        verified: Option<bool>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        protected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        encrypted: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },
}

impl BackupRecord {
    pub fn vmid(&self) -> u64 {
        match self {
            BackupRecord::Snapshot { vmid, .. }
            | BackupRecord::Local { vmid, .. }
            | BackupRecord::Remote { vmid, .. } => *vmid,
        }
    }

    pub fn backup_time(&self) -> i64 {
        match self {
            BackupRecord::Snapshot { backup_time, .. }
            | BackupRecord::Local { backup_time, .. }
            | BackupRecord::Remote { backup_time, .. } => *backup_time,
        }
    }

    /// Key under which a PBS backup reached via two routes collapses into
    /// one record.
    pub fn dedup_key(&self) -> (u64, i64) {
        (self.vmid(), self.backup_time())
    }

    /// True for PVE-side records that mirror a PBS datastore entry.
    pub fn shadows_remote(&self) -> bool {
        matches!(self, BackupRecord::Local { on_pbs: true, .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
/// Backups visible through the PVE side.
pub struct PveBackups {
    pub guest_snapshots: Vec<BackupRecord>,
    pub storage_backups: Vec<BackupRecord>,
}
