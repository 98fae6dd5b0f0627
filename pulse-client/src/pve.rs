use async_trait::async_trait;
use serde_json::{json, Value};

use pulse_api_types::lenient;
use pulse_api_types::GuestKind;

use crate::error::ApiError;
use crate::http_client::HttpClient;

/// Typed, read-only view of the PVE API consumed by the poll engine.
///
/// The HTTPS client is the only production implementation; the engine's
/// tests run against in-process fakes.
#[async_trait]
pub trait PveApi: Send + Sync {
    async fn version(&self) -> Result<VersionInfo, ApiError>;
    async fn cluster_status(&self) -> Result<ClusterStatusInfo, ApiError>;
    async fn list_nodes(&self) -> Result<Vec<PveNodeInfo>, ApiError>;
    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError>;
    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError>;
    async fn vm_status(&self, node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError>;
    async fn lxc_status(&self, node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError>;
    async fn list_storage(&self, node: &str) -> Result<Vec<PveStorageInfo>, ApiError>;
    async fn list_storage_contents(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<PveStorageContent>, ApiError>;
    async fn list_snapshots(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u64,
    ) -> Result<Vec<PveSnapshotInfo>, ApiError>;
}

#[derive(Clone, Debug, Default)]
pub struct VersionInfo {
    pub version: String,
    pub release: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PveNodeInfo {
    pub node: String,
    pub status: String,
    pub cpu: f64,
    pub maxcpu: u64,
    pub mem: u64,
    pub maxmem: u64,
    pub disk: u64,
    pub maxdisk: u64,
    pub uptime: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PveGuestInfo {
    pub vmid: u64,
    pub name: String,
    pub status: String,
    pub cpu: f64,
    pub cpus: u64,
    pub mem: u64,
    pub maxmem: u64,
    pub disk: u64,
    pub maxdisk: u64,
    /// Raw monotonic byte counters, not rates.
    pub diskread: u64,
    pub diskwrite: u64,
    pub netin: u64,
    pub netout: u64,
    pub uptime: u64,
    pub tags: Vec<String>,
    pub template: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PveStorageInfo {
    pub storage: String,
    pub storage_type: String,
    pub content: String,
    pub active: bool,
    pub enabled: bool,
    pub shared: bool,
    pub used: u64,
    pub total: u64,
    pub avail: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PveStorageContent {
    pub volid: String,
    pub vmid: Option<u64>,
    pub guest_kind: GuestKind,
    pub ctime: i64,
    pub size: Option<u64>,
    pub notes: Option<String>,
    pub protected: bool,
    pub encrypted: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct PveSnapshotInfo {
    pub name: String,
    pub snaptime: Option<i64>,
    pub description: Option<String>,
    pub vmstate: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ClusterMemberInfo {
    pub name: String,
    pub ip: Option<String>,
    pub online: bool,
    pub local: bool,
    pub id: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ClusterStatusInfo {
    /// Set when the endpoint is part of a named cluster.
    pub cluster_name: Option<String>,
    pub members: Vec<ClusterMemberInfo>,
}

pub(crate) fn expect_array(value: Value, what: &str) -> Result<Vec<Value>, ApiError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(ApiError::Parse(format!(
            "expected array of {}, got {}",
            what,
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// PVE separates tags with semicolons; older versions used commas.
fn parse_tags(raw: Option<String>) -> Vec<String> {
    match raw {
        Some(raw) => raw
            .split([';', ','])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        None => Vec::new(),
    }
}

fn parse_guest(item: &Value, fallback_vmid: Option<u64>) -> Result<PveGuestInfo, ApiError> {
    let vmid = lenient::field_u64(item, "vmid")
        .or(fallback_vmid)
        .ok_or_else(|| ApiError::Parse("guest entry without vmid".into()))?;
    Ok(PveGuestInfo {
        vmid,
        name: lenient::field_string(item, "name").unwrap_or_else(|| vmid.to_string()),
        status: lenient::field_string(item, "status").unwrap_or_default(),
        cpu: lenient::field_f64(item, "cpu").unwrap_or(0.0),
        cpus: lenient::field_u64(item, "cpus").unwrap_or(1),
        mem: lenient::field_u64(item, "mem").unwrap_or(0),
        maxmem: lenient::field_u64(item, "maxmem").unwrap_or(0),
        disk: lenient::field_u64(item, "disk").unwrap_or(0),
        maxdisk: lenient::field_u64(item, "maxdisk").unwrap_or(0),
        diskread: lenient::field_u64(item, "diskread").unwrap_or(0),
        diskwrite: lenient::field_u64(item, "diskwrite").unwrap_or(0),
        netin: lenient::field_u64(item, "netin").unwrap_or(0),
        netout: lenient::field_u64(item, "netout").unwrap_or(0),
        uptime: lenient::field_u64(item, "uptime").unwrap_or(0),
        tags: parse_tags(lenient::field_string(item, "tags")),
        template: lenient::field_bool(item, "template").unwrap_or(false),
    })
}

fn parse_guest_list(value: Value) -> Result<Vec<PveGuestInfo>, ApiError> {
    let mut guests = Vec::new();
    for item in expect_array(value, "guests")? {
        let guest = parse_guest(&item, None)?;
        if !guest.template {
            guests.push(guest);
        }
    }
    Ok(guests)
}

/// Guess the guest type from a vzdump or PBS volume id.
fn guest_kind_from_volid(volid: &str) -> GuestKind {
    if volid.contains("-lxc-") || volid.contains("/ct/") || volid.contains("openvz") {
        GuestKind::Lxc
    } else {
        GuestKind::Qemu
    }
}

#[async_trait]
impl PveApi for HttpClient {
    async fn version(&self) -> Result<VersionInfo, ApiError> {
        let value = self.get("version", None).await?;
        Ok(VersionInfo {
            version: lenient::field_string(&value, "version")
                .ok_or_else(|| ApiError::Parse("version reply without version".into()))?,
            release: lenient::field_string(&value, "release"),
        })
    }

    async fn cluster_status(&self) -> Result<ClusterStatusInfo, ApiError> {
        let value = self.get("cluster/status", None).await?;
        let mut status = ClusterStatusInfo::default();
        for item in expect_array(value, "cluster status entries")? {
            match lenient::field_string(&item, "type").as_deref() {
                Some("cluster") => {
                    status.cluster_name = lenient::field_string(&item, "name");
                }
                Some("node") => {
                    let name = match lenient::field_string(&item, "name") {
                        Some(name) => name,
                        None => continue,
                    };
                    status.members.push(ClusterMemberInfo {
                        name,
                        ip: lenient::field_string(&item, "ip"),
                        online: lenient::field_bool(&item, "online").unwrap_or(false),
                        local: lenient::field_bool(&item, "local").unwrap_or(false),
                        id: lenient::field_string(&item, "id"),
                    });
                }
                _ => {}
            }
        }
        Ok(status)
    }

    async fn list_nodes(&self) -> Result<Vec<PveNodeInfo>, ApiError> {
        let value = self.get("nodes", None).await?;
        let mut nodes = Vec::new();
        for item in expect_array(value, "nodes")? {
            let node = match lenient::field_string(&item, "node") {
                Some(node) => node,
                None => continue,
            };
            nodes.push(PveNodeInfo {
                node,
                status: lenient::field_string(&item, "status").unwrap_or_default(),
                cpu: lenient::field_f64(&item, "cpu").unwrap_or(0.0),
                maxcpu: lenient::field_u64(&item, "maxcpu").unwrap_or(0),
                mem: lenient::field_u64(&item, "mem").unwrap_or(0),
                maxmem: lenient::field_u64(&item, "maxmem").unwrap_or(0),
                disk: lenient::field_u64(&item, "disk").unwrap_or(0),
                maxdisk: lenient::field_u64(&item, "maxdisk").unwrap_or(0),
                uptime: lenient::field_u64(&item, "uptime").unwrap_or(0),
            });
        }
        Ok(nodes)
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError> {
        parse_guest_list(self.get(&format!("nodes/{}/qemu", node), None).await?)
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError> {
        parse_guest_list(self.get(&format!("nodes/{}/lxc", node), None).await?)
    }

    async fn vm_status(&self, node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError> {
        let value = self
            .get(&format!("nodes/{}/qemu/{}/status/current", node, vmid), None)
            .await?;
        parse_guest(&value, Some(vmid))
    }

    async fn lxc_status(&self, node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError> {
        let value = self
            .get(&format!("nodes/{}/lxc/{}/status/current", node, vmid), None)
            .await?;
        parse_guest(&value, Some(vmid))
    }

    async fn list_storage(&self, node: &str) -> Result<Vec<PveStorageInfo>, ApiError> {
        let value = self.get(&format!("nodes/{}/storage", node), None).await?;
        let mut storages = Vec::new();
        for item in expect_array(value, "storages")? {
            let storage = match lenient::field_string(&item, "storage") {
                Some(storage) => storage,
                None => continue,
            };
            storages.push(PveStorageInfo {
                storage,
                storage_type: lenient::field_string(&item, "type").unwrap_or_default(),
                content: lenient::field_string(&item, "content").unwrap_or_default(),
                active: lenient::field_bool(&item, "active").unwrap_or(false),
                enabled: lenient::field_bool(&item, "enabled").unwrap_or(true),
                shared: lenient::field_bool(&item, "shared").unwrap_or(false),
                used: lenient::field_u64(&item, "used").unwrap_or(0),
                total: lenient::field_u64(&item, "total").unwrap_or(0),
                avail: lenient::field_u64(&item, "avail").unwrap_or(0),
            });
        }
        Ok(storages)
    }

    async fn list_storage_contents(
        &self,
        node: &str,
        storage: &str,
    ) -> Result<Vec<PveStorageContent>, ApiError> {
        let value = self
            .get(
                &format!("nodes/{}/storage/{}/content", node, storage),
                Some(json!({ "content": "backup" })),
            )
            .await?;
        let mut contents = Vec::new();
        for item in expect_array(value, "storage contents")? {
            let volid = match lenient::field_string(&item, "volid") {
                Some(volid) => volid,
                None => continue,
            };
            contents.push(PveStorageContent {
                guest_kind: guest_kind_from_volid(&volid),
                vmid: lenient::field_u64(&item, "vmid"),
                ctime: lenient::field_i64(&item, "ctime").unwrap_or(0),
                size: lenient::field_u64(&item, "size"),
                notes: lenient::field_string(&item, "notes"),
                protected: lenient::field_bool(&item, "protected").unwrap_or(false),
                encrypted: lenient::field_bool(&item, "encrypted"),
                volid,
            });
        }
        Ok(contents)
    }

    async fn list_snapshots(
        &self,
        node: &str,
        kind: GuestKind,
        vmid: u64,
    ) -> Result<Vec<PveSnapshotInfo>, ApiError> {
        let value = self
            .get(&format!("nodes/{}/{}/{}/snapshot", node, kind, vmid), None)
            .await?;
        let mut snapshots = Vec::new();
        for item in expect_array(value, "snapshots")? {
            let name = match lenient::field_string(&item, "name") {
                Some(name) => name,
                None => continue,
            };
            // the list closes with a synthetic "current" entry
            if name == "current" {
                continue;
            }
            snapshots.push(PveSnapshotInfo {
                name,
                snaptime: lenient::field_i64(&item, "snaptime"),
                description: lenient::field_string(&item, "description"),
                vmstate: lenient::field_bool(&item, "vmstate").unwrap_or(false),
            });
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_split_on_both_separators() {
        assert_eq!(
            parse_tags(Some("pulse-no-alerts;prod, web".into())),
            vec!["pulse-no-alerts", "prod", "web"]
        );
        assert!(parse_tags(None).is_empty());
    }

    #[test]
    fn guest_parses_string_numbers() {
        let item = serde_json::json!({
            "vmid": "100",
            "name": "web",
            "status": "running",
            "cpu": "0.04",
            "cpus": 4,
            "mem": "1073741824",
            "maxmem": 2147483648u64,
            "netin": 1000,
            "netout": "2000",
        });
        let guest = parse_guest(&item, None).unwrap();
        assert_eq!(guest.vmid, 100);
        assert_eq!(guest.cpu, 0.04);
        assert_eq!(guest.mem, 1 << 30);
        assert_eq!(guest.netout, 2000);
    }

    #[test]
    fn guest_without_vmid_is_a_parse_error() {
        let item = serde_json::json!({ "name": "broken" });
        assert!(matches!(
            parse_guest(&item, None),
            Err(ApiError::Parse(_))
        ));
    }

    #[test]
    fn volid_guest_kind() {
        assert_eq!(
            guest_kind_from_volid("local:backup/vzdump-lxc-200-2023_11_14.tar.zst"),
            GuestKind::Lxc
        );
        assert_eq!(
            guest_kind_from_volid("backup-01:backup/vm/101/2023-11-14T22:13:20Z"),
            GuestKind::Qemu
        );
    }
}
