//! In-process upstream fakes for poll engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use pulse_api_types::GuestKind;
use pulse_client::{
    ApiError, ClusterMemberInfo, ClusterStatusInfo, PbsApi, PbsDatastoreUsage, PbsJobInfo,
    PbsSnapshotInfo, PveApi, PveGuestInfo, PveNodeInfo, PveSnapshotInfo, PveStorageContent,
    PveStorageInfo, VersionInfo,
};

pub struct FakePve {
    pub host: String,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_transient: Arc<AtomicBool>,
    pub cluster: ClusterStatusInfo,
    pub nodes: Vec<PveNodeInfo>,
    pub vms: HashMap<String, Vec<PveGuestInfo>>,
    pub containers: HashMap<String, Vec<PveGuestInfo>>,
}

impl FakePve {
    pub fn standalone(host: &str) -> Self {
        Self {
            host: host.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_transient: Arc::new(AtomicBool::new(false)),
            cluster: ClusterStatusInfo::default(),
            nodes: vec![node_info(host)],
            vms: HashMap::new(),
            containers: HashMap::new(),
        }
    }

    fn log(&self, op: &str) {
        self.calls.lock().unwrap().push(format!("{}:{}", self.host, op));
    }

    fn gate(&self, op: &str) -> Result<(), ApiError> {
        self.log(op);
        if self.fail_transient.load(Ordering::Relaxed) {
            Err(ApiError::Transient("503 service unavailable".into()))
        } else {
            Ok(())
        }
    }
}

pub fn node_info(name: &str) -> PveNodeInfo {
    PveNodeInfo {
        node: name.to_string(),
        status: "online".to_string(),
        cpu: 0.25,
        maxcpu: 8,
        mem: 8 << 30,
        maxmem: 16 << 30,
        disk: 100 << 30,
        maxdisk: 500u64 << 30,
        uptime: 86_400,
    }
}

pub fn guest_info(vmid: u64, status: &str) -> PveGuestInfo {
    PveGuestInfo {
        vmid,
        name: format!("guest-{}", vmid),
        status: status.to_string(),
        cpu: 0.04,
        cpus: 2,
        mem: 1 << 30,
        maxmem: 2 << 30,
        disk: 4 << 30,
        maxdisk: 32u64 << 30,
        diskread: 1_000_000,
        diskwrite: 2_000_000,
        netin: 3_000_000,
        netout: 4_000_000,
        uptime: 3600,
        tags: Vec::new(),
        template: false,
    }
}

pub fn cluster_of(name: &str, members: &[(&str, &str)]) -> ClusterStatusInfo {
    ClusterStatusInfo {
        cluster_name: Some(name.to_string()),
        members: members
            .iter()
            .map(|(node, ip)| ClusterMemberInfo {
                name: node.to_string(),
                ip: Some(ip.to_string()),
                online: true,
                local: false,
                id: Some(format!("node/{}", node)),
            })
            .collect(),
    }
}

#[async_trait]
impl PveApi for FakePve {
    async fn version(&self) -> Result<VersionInfo, ApiError> {
        self.gate("version")?;
        Ok(VersionInfo {
            version: "8.1.4".into(),
            release: None,
        })
    }

    async fn cluster_status(&self) -> Result<ClusterStatusInfo, ApiError> {
        self.gate("cluster_status")?;
        Ok(self.cluster.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<PveNodeInfo>, ApiError> {
        self.gate("list_nodes")?;
        Ok(self.nodes.clone())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError> {
        self.gate("list_vms")?;
        Ok(self.vms.get(node).cloned().unwrap_or_default())
    }

    async fn list_containers(&self, node: &str) -> Result<Vec<PveGuestInfo>, ApiError> {
        self.gate("list_containers")?;
        Ok(self.containers.get(node).cloned().unwrap_or_default())
    }

    async fn vm_status(&self, _node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError> {
        self.gate("vm_status")?;
        Ok(guest_info(vmid, "running"))
    }

    async fn lxc_status(&self, _node: &str, vmid: u64) -> Result<PveGuestInfo, ApiError> {
        self.gate("lxc_status")?;
        Ok(guest_info(vmid, "running"))
    }

    async fn list_storage(&self, _node: &str) -> Result<Vec<PveStorageInfo>, ApiError> {
        self.gate("list_storage")?;
        Ok(Vec::new())
    }

    async fn list_storage_contents(
        &self,
        _node: &str,
        _storage: &str,
    ) -> Result<Vec<PveStorageContent>, ApiError> {
        self.gate("list_storage_contents")?;
        Ok(Vec::new())
    }

    async fn list_snapshots(
        &self,
        _node: &str,
        _kind: GuestKind,
        _vmid: u64,
    ) -> Result<Vec<PveSnapshotInfo>, ApiError> {
        self.gate("list_snapshots")?;
        Ok(Vec::new())
    }
}

pub struct FakePbs {
    pub datastores: Vec<PbsDatastoreUsage>,
    pub snapshots: HashMap<String, Vec<PbsSnapshotInfo>>,
}

#[async_trait]
impl PbsApi for FakePbs {
    async fn version(&self) -> Result<VersionInfo, ApiError> {
        Ok(VersionInfo {
            version: "3.2.2".into(),
            release: None,
        })
    }

    async fn list_datastores(&self) -> Result<Vec<PbsDatastoreUsage>, ApiError> {
        Ok(self.datastores.clone())
    }

    async fn list_namespaces(&self, _store: &str) -> Result<Vec<String>, ApiError> {
        Ok(vec![String::new()])
    }

    async fn list_snapshots(
        &self,
        store: &str,
        _namespace: &str,
    ) -> Result<Vec<PbsSnapshotInfo>, ApiError> {
        Ok(self.snapshots.get(store).cloned().unwrap_or_default())
    }

    async fn list_sync_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_verify_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        Ok(Vec::new())
    }

    async fn list_prune_jobs(&self) -> Result<Vec<PbsJobInfo>, ApiError> {
        Ok(Vec::new())
    }
}
