//! The poll/merge engine: per-node workers, cluster failover, snapshot
//! assembly.
//!
//! One long-lived worker task per configured node feeds partial snapshots
//! to a single supervisor, which merges them into the authoritative
//! [`Snapshot`] and hands it to the state hub, the alert engine and the
//! history ring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use pulse_api_types::{BackupRecord, Guest, NodeConfig, NodeStatus, PbsInstance, Storage};
use pulse_client::{PbsApi, PveApi};

mod endpoints;
mod merge;
mod rates;
mod supervisor;
#[cfg(test)]
pub(crate) mod testing;
mod worker;

pub use endpoints::EndpointSet;
pub use rates::{RateCache, RateKey};
pub use supervisor::Supervisor;
pub use worker::{spawn_worker, WorkerHandle};

/// What one worker contributes to the merged snapshot each tick.
#[derive(Clone, Debug, Default)]
pub struct PartialSnapshot {
    pub node_id: String,
    /// Instance stamp: canonical cluster name for clusters, node name
    /// otherwise.
    pub instance: String,
    pub nodes: Vec<NodeStatus>,
    pub vms: Vec<Guest>,
    pub containers: Vec<Guest>,
    pub storage: Vec<Storage>,
    pub guest_snapshots: Vec<BackupRecord>,
    pub storage_backups: Vec<BackupRecord>,
    pub pbs_backups: Vec<BackupRecord>,
    pub pbs_instance: Option<PbsInstance>,
    /// Set when this is retained last-known data from a missed poll.
    pub stale: bool,
}

/// Client construction seam; tests substitute in-process fakes.
pub type PveFactory =
    Arc<dyn Fn(&NodeConfig, &str) -> Result<Arc<dyn PveApi>, Error> + Send + Sync>;
pub type PbsFactory =
    Arc<dyn Fn(&NodeConfig, &str) -> Result<Arc<dyn PbsApi>, Error> + Send + Sync>;

/// Shared dependencies of every worker.
pub struct PollContext {
    pub tick: Duration,
    pub rates: Arc<RateCache>,
    pub pve_factory: PveFactory,
    pub pbs_factory: PbsFactory,
}

impl PollContext {
    pub fn new(tick: Duration) -> Self {
        let (pve_factory, pbs_factory) = https_factories();
        Self {
            tick,
            rates: Arc::new(RateCache::new()),
            pve_factory,
            pbs_factory,
        }
    }
}

/// The production factories, backed by the HTTPS client.
pub fn https_factories() -> (PveFactory, PbsFactory) {
    let pve: PveFactory = Arc::new(|config, host| {
        let client = pulse_client::client_for_endpoint(config, host)?;
        Ok(Arc::new(client) as Arc<dyn PveApi>)
    });
    let pbs: PbsFactory = Arc::new(|config, host| {
        let client = pulse_client::client_for_endpoint(config, host)?;
        Ok(Arc::new(client) as Arc<dyn PbsApi>)
    });
    (pve, pbs)
}

/// How many consecutive missed polls keep the last known entities in the
/// snapshot (marked stale) before they are dropped.
pub const STALE_RETENTION_POLLS: u32 = 3;

/// Publishes completing within this window coalesce into one snapshot.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Cluster membership refresh cadence.
pub const CLUSTER_REFRESH: Duration = Duration::from_secs(5 * 60);

pub use merge::assemble;
