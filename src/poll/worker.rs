//! Per-node poll workers.
//!
//! A worker loops `tick -> poll once -> publish partial` until cancelled.
//! Upstream failures never kill the worker: they degrade the node's health
//! in the partial it publishes. Only internal errors (client construction)
//! back the worker off before the next attempt.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use pulse_api_types::{
    BackupRecord, ClusterEndpoint, ClusterInfo, ConnectionHealth, DiskUsage, Guest, GuestKind,
    GuestStatus, MemoryUsage, NodeConfig, NodeKind, NodeOnlineStatus, NodeStatus, PbsDatastore,
    PbsInstance, PbsJob, Storage,
};
use pulse_client::{ApiError, PbsApi, PbsJobInfo, PveApi, PveGuestInfo, PveNodeInfo};

use super::endpoints::EndpointSet;
use super::rates::RateKey;
use super::{PartialSnapshot, PollContext, CLUSTER_REFRESH, STALE_RETENTION_POLLS};

/// Worker restart backoff after internal errors.
const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(2);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct WorkerHandle {
    node_id: String,
    cancel: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Cancel the worker; it observes the signal within one tick, aborting
    /// in-flight requests.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn stop(self) {
        self.cancel();
        let _ = self.handle.await;
    }
}

pub fn spawn_worker(
    config: NodeConfig,
    ctx: Arc<PollContext>,
    partials: mpsc::UnboundedSender<PartialSnapshot>,
) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let node_id = config.id.clone();
    let handle = match config.kind {
        NodeKind::Pve => tokio::spawn(PveWorker::new(config, ctx).run(cancel_rx, partials)),
        NodeKind::Pbs => tokio::spawn(PbsWorker::new(config, ctx).run(cancel_rx, partials)),
    };
    WorkerHandle {
        node_id,
        cancel: cancel_tx,
        handle,
    }
}

/// Retention bookkeeping shared by both worker kinds.
struct Retention {
    last_good: Option<PartialSnapshot>,
    missed_polls: u32,
}

impl Retention {
    fn new() -> Self {
        Self {
            last_good: None,
            missed_polls: 0,
        }
    }

    fn good(&mut self, partial: &PartialSnapshot) {
        self.missed_polls = 0;
        self.last_good = Some(partial.clone());
    }

    /// Build the offline partial for a missed poll: node entries go
    /// offline/unhealthy, last known entities ride along (stale) for up to
    /// [`STALE_RETENTION_POLLS`] misses.
    fn missed(&mut self, config: &NodeConfig, instance: &str) -> PartialSnapshot {
        self.missed_polls = self.missed_polls.saturating_add(1);
        let mut partial = match &self.last_good {
            Some(last) if self.missed_polls <= STALE_RETENTION_POLLS => last.clone(),
            _ => PartialSnapshot {
                node_id: config.id.clone(),
                instance: instance.to_string(),
                nodes: vec![offline_node_status(config, instance)],
                ..Default::default()
            },
        };
        partial.stale = true;
        for node in &mut partial.nodes {
            node.status = NodeOnlineStatus::Offline;
            node.connection_health = ConnectionHealth::Unhealthy;
            node.stale = true;
        }
        if let Some(pbs) = &mut partial.pbs_instance {
            pbs.status = NodeOnlineStatus::Offline;
            pbs.connection_health = ConnectionHealth::Unhealthy;
        }
        partial
    }
}

fn offline_node_status(config: &NodeConfig, instance: &str) -> NodeStatus {
    NodeStatus {
        name: config.name.clone(),
        kind: config.kind,
        status: NodeOnlineStatus::Offline,
        connection_health: ConnectionHealth::Unhealthy,
        cpu: 0.0,
        memory: MemoryUsage::default(),
        disk: DiskUsage::default(),
        uptime: 0,
        is_cluster_member: false,
        cluster_name: if instance == config.name {
            None
        } else {
            Some(instance.to_string())
        },
        cluster_endpoints: Vec::new(),
        stale: true,
    }
}

// ---------------------------------------------------------------------------
// PVE
// ---------------------------------------------------------------------------

struct PveWorker {
    config: NodeConfig,
    ctx: Arc<PollContext>,
    endpoints: EndpointSet,
    clients: HashMap<String, Arc<dyn PveApi>>,
    cluster: Option<ClusterInfo>,
    cluster_checked: Option<Instant>,
    retention: Retention,
}

impl PveWorker {
    fn new(config: NodeConfig, ctx: Arc<PollContext>) -> Self {
        let endpoints = EndpointSet::new(config.host());
        let cluster = config.cluster.clone();
        let mut worker = Self {
            config,
            ctx,
            endpoints,
            clients: HashMap::new(),
            cluster: None,
            cluster_checked: None,
            retention: Retention::new(),
        };
        // cached membership from the config store seeds the failover list
        if let Some(cluster) = cluster {
            worker.apply_cluster(Some(cluster));
        }
        worker
    }

    async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
        partials: mpsc::UnboundedSender<PartialSnapshot>,
    ) {
        let mut ticker = tokio::time::interval(self.ctx.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = RESTART_BACKOFF_BASE;

        log::info!("starting poll worker for PVE node '{}'", self.config.name);
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }
            let partial = tokio::select! {
                _ = cancel.changed() => break,
                result = self.poll_once() => result,
            };
            match partial {
                Ok(partial) => {
                    backoff = RESTART_BACKOFF_BASE;
                    if partials.send(partial).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::error!(
                        "poll worker '{}': internal error: {:#}, backing off {:?}",
                        self.config.name,
                        err,
                        backoff
                    );
                    let instance = self.instance_name();
                    let _ = partials.send(self.retention.missed(&self.config, &instance));
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
                }
            }
        }
        log::info!("poll worker for '{}' stopped", self.config.name);
    }

    fn instance_name(&self) -> String {
        match &self.cluster {
            Some(cluster) => cluster.name.clone(),
            None => self.config.name.clone(),
        }
    }

    fn client_for(&mut self, host: &str) -> Result<Arc<dyn PveApi>, anyhow::Error> {
        if let Some(client) = self.clients.get(host) {
            return Ok(client.clone());
        }
        let client = (self.ctx.pve_factory)(&self.config, host)?;
        self.clients.insert(host.to_string(), client.clone());
        Ok(client)
    }

    fn apply_cluster(&mut self, cluster: Option<ClusterInfo>) {
        match cluster {
            Some(cluster) => {
                let hosts = cluster.endpoints.iter().map(|e| e.host.clone()).collect();
                self.endpoints.set_members(hosts);
                self.cluster = Some(cluster);
            }
            None => {
                self.endpoints.set_members(vec![self.config.host()]);
                self.cluster = None;
            }
        }
    }

    /// Refresh cluster membership when unknown or older than five minutes.
    async fn refresh_cluster(&mut self, now: Instant) {
        let due = match self.cluster_checked {
            None => true,
            Some(at) => now.duration_since(at) >= CLUSTER_REFRESH,
        };
        if !due {
            return;
        }
        let host = match self.endpoints.candidates(now).into_iter().next() {
            Some(host) => host,
            None => return,
        };
        let client = match self.client_for(&host) {
            Ok(client) => client,
            Err(_) => return,
        };
        match client.cluster_status().await {
            Ok(status) if status.members.len() > 1 => {
                let name = status
                    .cluster_name
                    .unwrap_or_else(|| self.config.name.clone());
                let endpoints = status
                    .members
                    .iter()
                    .map(|m| ClusterEndpoint {
                        node_name: m.name.clone(),
                        host: m.ip.clone().unwrap_or_else(|| m.name.clone()),
                        online: m.online,
                        local_id: m.id.clone(),
                    })
                    .collect();
                self.apply_cluster(Some(ClusterInfo { name, endpoints }));
                self.cluster_checked = Some(now);
            }
            Ok(_) => {
                self.apply_cluster(None);
                self.cluster_checked = Some(now);
            }
            Err(err) => {
                // keep the cached membership, the poll itself will surface
                // connectivity problems
                log::debug!(
                    "cluster status refresh for '{}' failed: {}",
                    self.config.name,
                    err
                );
            }
        }
    }

    async fn poll_once(&mut self) -> Result<PartialSnapshot, anyhow::Error> {
        let now = Instant::now();
        self.refresh_cluster(now).await;

        let candidates = self.endpoints.candidates(now);
        let mut attempts = 0;
        for host in candidates {
            // one same-tick retry on the next healthy endpoint
            if attempts >= 2 {
                break;
            }
            attempts += 1;
            let client = self.client_for(&host)?;
            match self.fetch(client.as_ref(), &host).await {
                Ok(partial) => {
                    self.endpoints.report_ok(&host);
                    self.retention.good(&partial);
                    return Ok(partial);
                }
                Err(err) if err.is_transient() => {
                    log::warn!(
                        "poll of '{}' via {} failed: {}",
                        self.config.name,
                        host,
                        err
                    );
                    self.endpoints.report_failure(&host, now);
                }
                Err(err) => {
                    if err.is_auth() {
                        log::warn!(
                            "authentication against '{}' rejected; check its credentials",
                            self.config.name
                        );
                    } else {
                        log::warn!("poll of '{}' failed: {}", self.config.name, err);
                    }
                    let instance = self.instance_name();
                    return Ok(self.retention.missed(&self.config, &instance));
                }
            }
        }
        let instance = self.instance_name();
        Ok(self.retention.missed(&self.config, &instance))
    }

    async fn fetch(
        &self,
        client: &dyn PveApi,
        endpoint: &str,
    ) -> Result<PartialSnapshot, ApiError> {
        let instance = self.instance_name();
        let caps = self.config.capabilities;

        let node_infos = client.list_nodes().await?;
        let online: Vec<&PveNodeInfo> = node_infos
            .iter()
            .filter(|n| n.status == "online")
            .collect();

        let mut vms = Vec::new();
        let mut containers = Vec::new();
        let mut storage = Vec::new();

        if caps.monitor_vms {
            let lists = join_all(online.iter().map(|n| {
                let node = n.node.clone();
                async move { (node.clone(), client.list_vms(&node).await) }
            }))
            .await;
            for (node, result) in lists {
                for info in result? {
                    vms.push(self.normalize_guest(info, GuestKind::Qemu, &node, &instance, endpoint));
                }
            }
        }
        if caps.monitor_containers {
            let lists = join_all(online.iter().map(|n| {
                let node = n.node.clone();
                async move { (node.clone(), client.list_containers(&node).await) }
            }))
            .await;
            for (node, result) in lists {
                for info in result? {
                    containers.push(self.normalize_guest(
                        info,
                        GuestKind::Lxc,
                        &node,
                        &instance,
                        endpoint,
                    ));
                }
            }
        }
        if caps.monitor_storage {
            let lists = join_all(online.iter().map(|n| {
                let node = n.node.clone();
                async move { (node.clone(), client.list_storage(&node).await) }
            }))
            .await;
            for (node, result) in lists {
                for info in result? {
                    storage.push(Storage {
                        id: format!("{}/{}", node, info.storage),
                        node: node.clone(),
                        instance: instance.clone(),
                        name: info.storage,
                        storage_type: info.storage_type.clone(),
                        content: info.content,
                        status: if info.active {
                            "available".to_string()
                        } else {
                            "inactive".to_string()
                        },
                        shared: info.shared,
                        used: info.used,
                        total: info.total,
                        free: info.avail,
                        is_pbs: info.storage_type == "pbs",
                    });
                }
            }
        }

        let guest_snapshots = if caps.monitor_backups {
            self.fetch_guest_snapshots(client, &vms, &containers).await
        } else {
            Vec::new()
        };
        let storage_backups = if caps.monitor_backups {
            self.fetch_storage_backups(client, &storage).await
        } else {
            Vec::new()
        };

        let nodes = self.node_statuses(&node_infos);

        Ok(PartialSnapshot {
            node_id: self.config.id.clone(),
            instance,
            nodes,
            vms,
            containers,
            storage,
            guest_snapshots,
            storage_backups,
            pbs_backups: Vec::new(),
            pbs_instance: None,
            stale: false,
        })
    }

    /// Snapshot listings are per guest; individual failures (guest deleted
    /// mid-poll) are skipped, they must not fail the whole tick.
    async fn fetch_guest_snapshots(
        &self,
        client: &dyn PveApi,
        vms: &[Guest],
        containers: &[Guest],
    ) -> Vec<BackupRecord> {
        let guests: Vec<&Guest> = vms.iter().chain(containers.iter()).collect();
        let lists = join_all(guests.iter().map(|guest| async move {
            let result = client
                .list_snapshots(&guest.node, guest.kind, guest.vmid)
                .await;
            (guest, result)
        }))
        .await;

        let mut records = Vec::new();
        for (guest, result) in lists {
            match result {
                Ok(snapshots) => {
                    for snapshot in snapshots {
                        records.push(BackupRecord::Snapshot {
                            vmid: guest.vmid,
                            guest_type: guest.kind,
                            node: guest.node.clone(),
                            backup_time: snapshot.snaptime.unwrap_or(0),
                            name: snapshot.name,
                            description: snapshot.description,
                            vmstate: snapshot.vmstate,
                        });
                    }
                }
                Err(err) => log::debug!(
                    "snapshot list for {}/{} failed: {}",
                    guest.node,
                    guest.vmid,
                    err
                ),
            }
        }
        records
    }

    /// Backup volumes per backup-bearing storage. Shared storages are
    /// listed from a single node; failures are skipped like snapshots.
    async fn fetch_storage_backups(
        &self,
        client: &dyn PveApi,
        storages: &[Storage],
    ) -> Vec<BackupRecord> {
        let mut targets: Vec<&Storage> = Vec::new();
        let mut seen_shared = HashSet::new();
        for storage in storages {
            if !storage.holds_backups() || storage.status != "available" {
                continue;
            }
            if storage.shared && !seen_shared.insert(storage.name.clone()) {
                continue;
            }
            targets.push(storage);
        }

        let lists = join_all(targets.into_iter().map(|storage| async move {
            let result = client
                .list_storage_contents(&storage.node, &storage.name)
                .await;
            (storage, result)
        }))
        .await;

        let mut records = Vec::new();
        let mut seen_volids = HashSet::new();
        for (storage, result) in lists {
            match result {
                Ok(contents) => {
                    for content in contents {
                        let vmid = match content.vmid {
                            Some(vmid) => vmid,
                            None => continue,
                        };
                        if !seen_volids.insert(content.volid.clone()) {
                            continue;
                        }
                        records.push(BackupRecord::Local {
                            vmid,
                            guest_type: content.guest_kind,
                            node: storage.node.clone(),
                            backup_time: content.ctime,
                            size_bytes: content.size,
                            storage: storage.name.clone(),
                            volid: content.volid,
                            protected: content.protected,
                            encrypted: content.encrypted,
                            notes: content.notes,
                            on_pbs: storage.is_pbs,
                        });
                    }
                }
                Err(err) => log::debug!(
                    "backup list for {}/{} failed: {}",
                    storage.node,
                    storage.name,
                    err
                ),
            }
        }
        records
    }

    fn normalize_guest(
        &self,
        info: PveGuestInfo,
        kind: GuestKind,
        node: &str,
        instance: &str,
        endpoint: &str,
    ) -> Guest {
        let time = proxmox_time::epoch_f64();
        let rate = |counter: &'static str, value: u64| {
            self.ctx.rates.rate(
                RateKey {
                    endpoint: endpoint.to_string(),
                    kind,
                    vmid: info.vmid,
                    counter,
                },
                time,
                value,
            )
        };
        let disk_read = rate("diskread", info.diskread);
        let disk_write = rate("diskwrite", info.diskwrite);
        let network_in = rate("netin", info.netin);
        let network_out = rate("netout", info.netout);

        Guest {
            kind,
            vmid: info.vmid,
            node: node.to_string(),
            instance: instance.to_string(),
            name: info.name,
            status: GuestStatus::parse(&info.status),
            cpu: info.cpu.clamp(0.0, 1.0),
            cpus: info.cpus,
            memory: MemoryUsage::new(info.mem, info.maxmem),
            disk: DiskUsage {
                used: info.disk,
                total: info.maxdisk,
            },
            disk_read,
            disk_write,
            network_in,
            network_out,
            uptime: info.uptime,
            tags: info.tags,
            meta: None,
        }
    }

    fn node_statuses(&self, infos: &[PveNodeInfo]) -> Vec<NodeStatus> {
        let cluster = self.cluster.as_ref();
        infos
            .iter()
            .map(|info| {
                let endpoint_host = cluster
                    .and_then(|c| {
                        c.endpoints
                            .iter()
                            .find(|e| e.node_name == info.node)
                            .map(|e| e.host.clone())
                    })
                    .unwrap_or_else(|| self.config.host());
                let degraded = self.endpoints.is_degraded(&endpoint_host);
                NodeStatus {
                    name: info.node.clone(),
                    kind: NodeKind::Pve,
                    status: if info.status == "online" {
                        NodeOnlineStatus::Online
                    } else {
                        NodeOnlineStatus::Offline
                    },
                    connection_health: if degraded {
                        ConnectionHealth::Degraded
                    } else {
                        ConnectionHealth::Healthy
                    },
                    cpu: info.cpu,
                    memory: MemoryUsage::new(info.mem, info.maxmem),
                    disk: DiskUsage {
                        used: info.disk,
                        total: info.maxdisk,
                    },
                    uptime: info.uptime,
                    is_cluster_member: cluster.is_some(),
                    cluster_name: cluster.map(|c| c.name.clone()),
                    cluster_endpoints: cluster
                        .map(|c| c.endpoints.clone())
                        .unwrap_or_default(),
                    stale: false,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PBS
// ---------------------------------------------------------------------------

struct PbsWorker {
    config: NodeConfig,
    ctx: Arc<PollContext>,
    client: Option<Arc<dyn PbsApi>>,
    retention: Retention,
}

impl PbsWorker {
    fn new(config: NodeConfig, ctx: Arc<PollContext>) -> Self {
        Self {
            config,
            ctx,
            client: None,
            retention: Retention::new(),
        }
    }

    async fn run(
        mut self,
        mut cancel: watch::Receiver<bool>,
        partials: mpsc::UnboundedSender<PartialSnapshot>,
    ) {
        let mut ticker = tokio::time::interval(self.ctx.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = RESTART_BACKOFF_BASE;

        log::info!("starting poll worker for PBS node '{}'", self.config.name);
        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {}
            }
            let partial = tokio::select! {
                _ = cancel.changed() => break,
                result = self.poll_once() => result,
            };
            match partial {
                Ok(partial) => {
                    backoff = RESTART_BACKOFF_BASE;
                    if partials.send(partial).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    log::error!(
                        "poll worker '{}': internal error: {:#}, backing off {:?}",
                        self.config.name,
                        err,
                        backoff
                    );
                    let name = self.config.name.clone();
                    let _ = partials.send(self.retention.missed(&self.config, &name));
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RESTART_BACKOFF_CAP);
                }
            }
        }
        log::info!("poll worker for '{}' stopped", self.config.name);
    }

    fn client(&mut self) -> Result<Arc<dyn PbsApi>, anyhow::Error> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = (self.ctx.pbs_factory)(&self.config, &self.config.host())?;
        self.client = Some(client.clone());
        Ok(client)
    }

    async fn poll_once(&mut self) -> Result<PartialSnapshot, anyhow::Error> {
        let client = self.client()?;
        match self.fetch(client.as_ref()).await {
            Ok(partial) => {
                self.retention.good(&partial);
                Ok(partial)
            }
            Err(err) => {
                if err.is_auth() {
                    log::warn!(
                        "authentication against '{}' rejected; check its credentials",
                        self.config.name
                    );
                } else {
                    log::warn!("poll of '{}' failed: {}", self.config.name, err);
                }
                let name = self.config.name.clone();
                Ok(self.retention.missed(&self.config, &name))
            }
        }
    }

    async fn fetch(&self, client: &dyn PbsApi) -> Result<PartialSnapshot, ApiError> {
        let caps = self.config.capabilities;
        let name = self.config.name.clone();

        let version = client.version().await?;

        let mut datastores = Vec::new();
        let mut pbs_backups = Vec::new();
        if caps.monitor_datastores {
            for usage in client.list_datastores().await? {
                datastores.push(PbsDatastore {
                    name: usage.store.clone(),
                    used: usage.used,
                    total: usage.total,
                    free: usage.avail,
                });
            }
            let stores: Vec<String> = datastores.iter().map(|d| d.name.clone()).collect();
            pbs_backups = self.fetch_backups(client, &stores).await;
        }

        let sync_jobs = if caps.monitor_sync_jobs {
            jobs_of(client.list_sync_jobs().await?)
        } else {
            Vec::new()
        };
        let verify_jobs = if caps.monitor_verify_jobs {
            jobs_of(client.list_verify_jobs().await?)
        } else {
            Vec::new()
        };
        let prune_jobs = if caps.monitor_prune_jobs {
            jobs_of(client.list_prune_jobs().await?)
        } else {
            Vec::new()
        };

        let instance = PbsInstance {
            name: name.clone(),
            status: NodeOnlineStatus::Online,
            connection_health: ConnectionHealth::Healthy,
            version: Some(version.version),
            datastores,
            sync_jobs,
            verify_jobs,
            prune_jobs,
        };

        let node_status = NodeStatus {
            name: name.clone(),
            kind: NodeKind::Pbs,
            status: NodeOnlineStatus::Online,
            connection_health: ConnectionHealth::Healthy,
            cpu: 0.0,
            memory: MemoryUsage::default(),
            disk: DiskUsage::default(),
            uptime: 0,
            is_cluster_member: false,
            cluster_name: None,
            cluster_endpoints: Vec::new(),
            stale: false,
        };

        Ok(PartialSnapshot {
            node_id: self.config.id.clone(),
            instance: name,
            nodes: vec![node_status],
            pbs_backups,
            pbs_instance: Some(instance),
            ..Default::default()
        })
    }

    /// Snapshot listings per datastore and namespace; per-namespace
    /// failures are skipped.
    async fn fetch_backups(&self, client: &dyn PbsApi, stores: &[String]) -> Vec<BackupRecord> {
        let mut records = Vec::new();
        for store in stores {
            let namespaces = match client.list_namespaces(store).await {
                Ok(namespaces) => namespaces,
                Err(err) => {
                    log::debug!("namespace list for '{}' failed: {}", store, err);
                    vec![String::new()]
                }
            };
            let lists = join_all(namespaces.iter().map(|ns| {
                let store = store.clone();
                async move { (ns.clone(), client.list_snapshots(&store, ns).await) }
            }))
            .await;
            for (namespace, result) in lists {
                match result {
                    Ok(snapshots) => {
                        for snapshot in snapshots {
                            let (vmid, guest_type) =
                                match (snapshot.vmid(), snapshot.guest_kind()) {
                                    (Some(vmid), Some(kind)) => (vmid, kind),
                                    // host backups have no guest identity
                                    _ => continue,
                                };
                            records.push(BackupRecord::Remote {
                                vmid,
                                guest_type,
                                backup_time: snapshot.backup_time,
                                size_bytes: snapshot.size,
                                datastore: store.clone(),
                                namespace: namespace.clone(),
                                verified: snapshot.verified,
                                protected: snapshot.protected,
                                encrypted: snapshot.encrypted,
                                owner: snapshot.owner,
                                notes: snapshot.comment,
                            });
                        }
                    }
                    Err(err) => log::debug!(
                        "snapshot list for {}:{} failed: {}",
                        store,
                        namespace,
                        err
                    ),
                }
            }
        }
        records
    }
}

fn jobs_of(infos: Vec<PbsJobInfo>) -> Vec<PbsJob> {
    infos
        .into_iter()
        .map(|info| PbsJob {
            id: info.id,
            store: info.store,
            schedule: info.schedule,
            last_run_state: info.last_run_state,
            last_run_endtime: info.last_run_endtime,
            next_run: info.next_run,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::testing::{cluster_of, guest_info, node_info, FakePve};
    use crate::poll::{PbsFactory, PveFactory, RateCache};
    use pulse_api_types::NodeCapabilities;

    fn pve_config(name: &str, url: &str) -> NodeConfig {
        NodeConfig {
            id: format!("id-{}", name),
            kind: NodeKind::Pve,
            name: name.to_string(),
            url: url.to_string(),
            user: Some("monitor@pam".into()),
            password: None,
            token_name: Some("pulse".into()),
            token_secret: Some("secret".into()),
            verify_tls: true,
            timeout_secs: None,
            capabilities: NodeCapabilities::default(),
            cluster: None,
        }
    }

    fn unused_pbs_factory() -> PbsFactory {
        Arc::new(|_, _| anyhow::bail!("no PBS in this test"))
    }

    fn ctx(pve_factory: PveFactory) -> Arc<PollContext> {
        Arc::new(PollContext {
            tick: Duration::from_millis(20),
            rates: Arc::new(RateCache::new()),
            pve_factory,
            pbs_factory: unused_pbs_factory(),
        })
    }

    fn single_fake_factory(fake: Arc<FakePve>) -> PveFactory {
        Arc::new(move |_, _| Ok(fake.clone() as Arc<dyn PveApi>))
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_node_first_poll() {
        let mut fake = FakePve::standalone("pve1");
        fake.vms.insert(
            "pve1".into(),
            vec![guest_info(100, "running"), guest_info(101, "running")],
        );
        fake.containers
            .insert("pve1".into(), vec![guest_info(200, "stopped")]);
        let fake = Arc::new(fake);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            pve_config("pve1", "https://pve1:8006"),
            ctx(single_fake_factory(fake)),
            tx,
        );

        let partial = rx.recv().await.unwrap();
        assert_eq!(partial.instance, "pve1");
        assert_eq!(partial.nodes.len(), 1);
        assert_eq!(partial.vms.len(), 2);
        assert_eq!(partial.containers.len(), 1);
        assert!(!partial.stale);

        let node = &partial.nodes[0];
        assert_eq!(node.status, NodeOnlineStatus::Online);
        assert_eq!(node.connection_health, ConnectionHealth::Healthy);
        assert!(!node.is_cluster_member);

        let vm = &partial.vms[0];
        assert!((0.0..=1.0).contains(&vm.cpu));
        assert!((0.0..=100.0).contains(&vm.memory.usage));
        assert!(vm.disk_read >= 0.0 && vm.network_in >= 0.0);
        assert_eq!(partial.containers[0].status, GuestStatus::Stopped);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cluster_membership_is_discovered_and_stamped() {
        let mut fake = FakePve::standalone("pve-a");
        fake.cluster = cluster_of(
            "prod",
            &[
                ("pve-a", "10.0.0.10"),
                ("pve-b", "10.0.0.11"),
                ("pve-c", "10.0.0.12"),
            ],
        );
        fake.nodes = vec![node_info("pve-a"), node_info("pve-b"), node_info("pve-c")];
        fake.vms
            .insert("pve-b".into(), vec![guest_info(100, "running")]);
        let fake = Arc::new(fake);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            pve_config("pve-a", "https://pve-a:8006"),
            ctx(single_fake_factory(fake)),
            tx,
        );

        let partial = rx.recv().await.unwrap();
        assert_eq!(partial.instance, "prod");
        assert_eq!(partial.nodes.len(), 3);
        for node in &partial.nodes {
            assert_eq!(node.cluster_name.as_deref(), Some("prod"));
            assert_eq!(node.cluster_endpoints.len(), 3);
            assert!(node.is_cluster_member);
        }
        // guests are tagged with the cluster name, not the entry hostname
        assert_eq!(partial.vms[0].instance, "prod");
        assert_eq!(partial.vms[0].node, "pve-b");

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failover_retries_on_next_member_and_moves_preference() {
        let endpoints = [
            ("pve-a", "10.0.0.10"),
            ("pve-b", "10.0.0.11"),
            ("pve-c", "10.0.0.12"),
        ];
        let cluster = cluster_of("prod", &endpoints);
        let make_fake = |host: &str, failing: bool| {
            let mut fake = FakePve::standalone(host);
            fake.cluster = cluster.clone();
            fake.nodes = vec![node_info("pve-a"), node_info("pve-b"), node_info("pve-c")];
            fake.fail_transient
                .store(failing, std::sync::atomic::Ordering::Relaxed);
            Arc::new(fake)
        };
        let fake_a = make_fake("10.0.0.10", true);
        let fake_b = make_fake("10.0.0.11", false);
        let fake_c = make_fake("10.0.0.12", false);

        let factory: PveFactory = {
            let (a, b, c) = (fake_a.clone(), fake_b.clone(), fake_c.clone());
            Arc::new(move |_, host| {
                Ok(match host {
                    "10.0.0.10" => a.clone() as Arc<dyn PveApi>,
                    "10.0.0.11" => b.clone(),
                    "10.0.0.12" => c.clone(),
                    other => anyhow::bail!("unexpected endpoint {}", other),
                })
            })
        };

        let mut config = pve_config("pve-a", "https://10.0.0.10:8006");
        // cached membership from an earlier run seeds the failover list
        config.cluster = Some(ClusterInfo {
            name: "prod".into(),
            endpoints: endpoints
                .iter()
                .map(|(node, ip)| ClusterEndpoint {
                    node_name: node.to_string(),
                    host: ip.to_string(),
                    online: true,
                    local_id: None,
                })
                .collect(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(config, ctx(factory), tx);

        // first tick: entry endpoint fails, fallback answers the same tick
        let partial = rx.recv().await.unwrap();
        assert!(!partial.stale);
        let health_of = |name: &str| {
            partial
                .nodes
                .iter()
                .find(|n| n.name == name)
                .unwrap()
                .connection_health
        };
        assert_eq!(health_of("pve-a"), ConnectionHealth::Degraded);
        assert_eq!(health_of("pve-b"), ConnectionHealth::Healthy);
        assert_eq!(health_of("pve-c"), ConnectionHealth::Healthy);

        // second tick: polling starts directly at the endpoint that worked
        let _second = rx.recv().await.unwrap();
        let a_calls = fake_a.calls.lock().unwrap().clone();
        let fetches = a_calls.iter().filter(|c| c.ends_with("list_nodes")).count();
        assert_eq!(fetches, 1, "failed endpoint polled again: {:?}", a_calls);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pbs_worker_reports_instance_and_remote_backups() {
        use crate::poll::testing::FakePbs;
        use pulse_client::{PbsDatastoreUsage, PbsSnapshotInfo};

        let mut snapshots = HashMap::new();
        snapshots.insert(
            "backup-01".to_string(),
            vec![
                PbsSnapshotInfo {
                    backup_type: "vm".into(),
                    backup_id: "101".into(),
                    backup_time: 1_700_000_000,
                    size: Some(1 << 30),
                    verified: Some(true),
                    ..Default::default()
                },
                // host backups carry no guest identity and are skipped
                PbsSnapshotInfo {
                    backup_type: "host".into(),
                    backup_id: "pbs-itself".into(),
                    backup_time: 1_700_000_100,
                    ..Default::default()
                },
            ],
        );
        let fake = Arc::new(FakePbs {
            datastores: vec![PbsDatastoreUsage {
                store: "backup-01".into(),
                used: 10 << 30,
                total: 100u64 << 30,
                avail: 90 << 30,
            }],
            snapshots,
        });
        let pbs_factory: PbsFactory = Arc::new(move |_, _| Ok(fake.clone() as Arc<dyn PbsApi>));
        let ctx = Arc::new(PollContext {
            tick: Duration::from_millis(20),
            rates: Arc::new(RateCache::new()),
            pve_factory: Arc::new(|_, _| anyhow::bail!("no PVE in this test")),
            pbs_factory,
        });

        let mut config = pve_config("backup", "https://pbs1:8007");
        config.kind = NodeKind::Pbs;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(config, ctx, tx);

        let partial = rx.recv().await.unwrap();
        let instance = partial.pbs_instance.as_ref().unwrap();
        assert_eq!(instance.name, "backup");
        assert_eq!(instance.version.as_deref(), Some("3.2.2"));
        assert_eq!(instance.datastores.len(), 1);
        assert_eq!(instance.datastores[0].free, 90 << 30);

        assert_eq!(partial.pbs_backups.len(), 1);
        match &partial.pbs_backups[0] {
            BackupRecord::Remote {
                vmid,
                datastore,
                verified,
                ..
            } => {
                assert_eq!(*vmid, 101);
                assert_eq!(datastore, "backup-01");
                assert_eq!(*verified, Some(true));
            }
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(partial.nodes[0].kind, NodeKind::Pbs);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_node_retains_last_known_entities_then_drops_them() {
        let mut fake = FakePve::standalone("pve1");
        fake.vms
            .insert("pve1".into(), vec![guest_info(100, "running")]);
        let fake = Arc::new(fake);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_worker(
            pve_config("pve1", "https://pve1:8006"),
            ctx(single_fake_factory(fake.clone())),
            tx,
        );

        let good = rx.recv().await.unwrap();
        assert_eq!(good.vms.len(), 1);

        fake.fail_transient
            .store(true, std::sync::atomic::Ordering::Relaxed);

        // three missed polls keep the stale entities around
        for _ in 0..3 {
            let partial = rx.recv().await.unwrap();
            assert!(partial.stale);
            assert_eq!(partial.vms.len(), 1, "stale entities retained");
            assert_eq!(partial.nodes[0].status, NodeOnlineStatus::Offline);
            assert_eq!(
                partial.nodes[0].connection_health,
                ConnectionHealth::Unhealthy
            );
        }

        // the fourth miss drops them
        let partial = rx.recv().await.unwrap();
        assert!(partial.stale);
        assert!(partial.vms.is_empty());
        assert_eq!(partial.nodes[0].status, NodeOnlineStatus::Offline);

        handle.stop().await;
    }
}
