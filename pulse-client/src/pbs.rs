use async_trait::async_trait;
use serde_json::{json, Value};

use pulse_api_types::lenient;
use pulse_api_types::GuestKind;

use crate::error::ApiError;
use crate::http_client::HttpClient;
use crate::pve::{expect_array, VersionInfo};

/// Typed, read-only view of the PBS API consumed by the poll engine.
#[async_trait]
pub trait PbsApi: Send + Sync {
    async fn version(&self) -> Result<VersionInfo, ApiError>;
    async fn list_datastores(&self) -> Result<Vec<PbsDatastoreUsage>, ApiError>;
    async fn list_namespaces(&self, store: &str) -> Result<Vec<String>, ApiError>;
    async fn list_snapshots(
        &self,
        store: &str,
        namespace: &str,
    ) -> Result<Vec<PbsSnapshotInfo>, ApiError>;
    async fn list_sync_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError>;
    async fn list_verify_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError>;
    async fn list_prune_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError>;
}

#[derive(Clone, Debug, Default)]
pub struct PbsDatastoreUsage {
    pub store: String,
    pub used: u64,
    pub total: u64,
    pub avail: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PbsSnapshotInfo {
    /// Upstream backup type: `vm`, `ct` or `host`.
    pub backup_type: String,
    /// The backup id; a vmid for guest backups.
    pub backup_id: String,
    /// Epoch seconds.
    pub backup_time: i64,
    pub namespace: String,
    pub size: Option<u64>,
    pub verified: Option<bool>,
    pub protected: bool,
    pub encrypted: Option<bool>,
    pub owner: Option<String>,
    pub comment: Option<String>,
}

impl PbsSnapshotInfo {
    pub fn vmid(&self) -> Option<u64> {
        self.backup_id.parse().ok()
    }

    pub fn guest_kind(&self) -> Option<GuestKind> {
        match self.backup_type.as_str() {
            "vm" => Some(GuestKind::Qemu),
            "ct" => Some(GuestKind::Lxc),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PbsJobInfo {
    pub id: String,
    pub store: Option<String>,
    pub schedule: Option<String>,
    pub last_run_state: Option<String>,
    pub last_run_endtime: Option<i64>,
    pub next_run: Option<i64>,
}

fn parse_job_list(value: Value) -> Result<Vec<PbsJobInfo>, ApiError> {
    let mut jobs = Vec::new();
    for item in expect_array(value, "jobs")? {
        let id = match lenient::field_string(&item, "id") {
            Some(id) => id,
            None => continue,
        };
        jobs.push(PbsJobInfo {
            id,
            store: lenient::field_string(&item, "store"),
            schedule: lenient::field_string(&item, "schedule"),
            last_run_state: lenient::field_string(&item, "last-run-state"),
            last_run_endtime: lenient::field_i64(&item, "last-run-endtime"),
            next_run: lenient::field_i64(&item, "next-run"),
        });
    }
    Ok(jobs)
}

#[async_trait]
impl PbsApi for HttpClient {
    async fn version(&self) -> Result<VersionInfo, ApiError> {
        let value = self.get("version", None).await?;
        Ok(VersionInfo {
            version: lenient::field_string(&value, "version")
                .ok_or_else(|| ApiError::Parse("version reply without version".into()))?,
            release: lenient::field_string(&value, "release"),
        })
    }

    async fn list_datastores(&self) -> Result<Vec<PbsDatastoreUsage>, ApiError> {
        let value = self.get("status/datastore-usage", None).await?;
        let mut stores = Vec::new();
        for item in expect_array(value, "datastore usage entries")? {
            let store = match lenient::field_string(&item, "store") {
                Some(store) => store,
                None => continue,
            };
            stores.push(PbsDatastoreUsage {
                store,
                used: lenient::field_u64(&item, "used").unwrap_or(0),
                total: lenient::field_u64(&item, "total").unwrap_or(0),
                avail: lenient::field_u64(&item, "avail").unwrap_or(0),
            });
        }
        Ok(stores)
    }

    async fn list_namespaces(&self, store: &str) -> Result<Vec<String>, ApiError> {
        let value = self
            .get(
                &format!("admin/datastore/{}/namespace", store),
                Some(json!({ "max-depth": 7 })),
            )
            .await?;
        let mut namespaces = Vec::new();
        for item in expect_array(value, "namespaces")? {
            if let Some(ns) = lenient::field_string(&item, "ns") {
                namespaces.push(ns);
            }
        }
        // the root namespace is always present, listed or not
        if !namespaces.iter().any(String::is_empty) {
            namespaces.insert(0, String::new());
        }
        Ok(namespaces)
    }

    async fn list_snapshots(
        &self,
        store: &str,
        namespace: &str,
    ) -> Result<Vec<PbsSnapshotInfo>, ApiError> {
        let param = if namespace.is_empty() {
            None
        } else {
            Some(json!({ "ns": namespace }))
        };
        let value = self
            .get(&format!("admin/datastore/{}/snapshots", store), param)
            .await?;
        let mut snapshots = Vec::new();
        for item in expect_array(value, "snapshots")? {
            let backup_type = match lenient::field_string(&item, "backup-type") {
                Some(backup_type) => backup_type,
                None => continue,
            };
            let backup_id = match lenient::field_string(&item, "backup-id") {
                Some(backup_id) => backup_id,
                None => continue,
            };
            let verified = item.get("verification").and_then(|verification| {
                lenient::field_string(verification, "state").map(|state| state == "ok")
            });
            snapshots.push(PbsSnapshotInfo {
                backup_type,
                backup_id,
                backup_time: lenient::field_i64(&item, "backup-time").unwrap_or(0),
                namespace: namespace.to_string(),
                size: lenient::field_u64(&item, "size"),
                verified,
                protected: lenient::field_bool(&item, "protected").unwrap_or(false),
                encrypted: lenient::field_bool(&item, "encrypted"),
                owner: lenient::field_string(&item, "owner"),
                comment: lenient::field_string(&item, "comment"),
            });
        }
        Ok(snapshots)
    }

    async fn list_sync_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        parse_job_list(self.get("admin/sync", None).await?)
    }

    async fn list_verify_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        parse_job_list(self.get("admin/verify", None).await?)
    }

    async fn list_prune_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        parse_job_list(self.get("admin/prune", None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_vmid_and_kind() {
        let snapshot = PbsSnapshotInfo {
            backup_type: "vm".into(),
            backup_id: "101".into(),
            ..Default::default()
        };
        assert_eq!(snapshot.vmid(), Some(101));
        assert_eq!(snapshot.guest_kind(), Some(GuestKind::Qemu));

        let host = PbsSnapshotInfo {
            backup_type: "host".into(),
            backup_id: "backup-host".into(),
            ..Default::default()
        };
        assert_eq!(host.vmid(), None);
        assert_eq!(host.guest_kind(), None);
    }

    #[test]
    fn job_list_tolerates_missing_optionals() {
        let value = serde_json::json!([
            { "id": "sync-1", "store": "backup-01", "last-run-endtime": "1700000000" },
            { "store": "no-id-skipped" },
        ]);
        let jobs = parse_job_list(value).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].last_run_endtime, Some(1_700_000_000));
    }
}
