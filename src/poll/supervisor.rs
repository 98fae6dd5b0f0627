//! The poll supervisor: owns the workers, merges their partials, publishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use pulse_api_types::NodeConfig;

use crate::alerts::AlertEngine;
use crate::history::MetricsHistory;
use crate::reload::NodeEvent;
use crate::state::StateHub;

use super::worker::{spawn_worker, WorkerHandle};
use super::{assemble, PartialSnapshot, PollContext, COALESCE_WINDOW};

pub struct Supervisor {
    ctx: Arc<PollContext>,
    hub: Arc<StateHub>,
    history: Arc<MetricsHistory>,
    engine: AlertEngine,
    workers: HashMap<String, WorkerHandle>,
    partials: HashMap<String, PartialSnapshot>,
    partial_tx: mpsc::UnboundedSender<PartialSnapshot>,
    partial_rx: Option<mpsc::UnboundedReceiver<PartialSnapshot>>,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<PollContext>,
        hub: Arc<StateHub>,
        history: Arc<MetricsHistory>,
        engine: AlertEngine,
    ) -> Self {
        let (partial_tx, partial_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            hub,
            history,
            engine,
            workers: HashMap::new(),
            partials: HashMap::new(),
            partial_tx,
            partial_rx: Some(partial_rx),
        }
    }

    /// Run until shutdown. Workers for `nodes` are started immediately,
    /// later config changes arrive over the reload bus.
    pub async fn run(
        mut self,
        nodes: Vec<NodeConfig>,
        mut reload_rx: mpsc::UnboundedReceiver<NodeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        for node in nodes {
            self.start_worker(node);
        }

        let mut partial_rx = self.partial_rx.take().expect("run called twice");
        // publishes within the window coalesce into one assembly
        let mut flush_at: Option<Instant> = None;
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(60));
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                partial = partial_rx.recv() => {
                    let partial = match partial {
                        Some(partial) => partial,
                        None => break,
                    };
                    // a cancelled worker may have queued one last partial
                    if !self.workers.contains_key(&partial.node_id) {
                        continue;
                    }
                    self.partials.insert(partial.node_id.clone(), partial);
                    if flush_at.is_none() {
                        flush_at = Some(Instant::now() + COALESCE_WINDOW);
                    }
                }
                _ = maybe_sleep_until(flush_at), if flush_at.is_some() => {
                    flush_at = None;
                    self.publish();
                }
                event = reload_rx.recv() => {
                    if let Some(event) = event {
                        let republish = self.apply(event).await;
                        if republish && flush_at.is_none() {
                            flush_at = Some(Instant::now() + COALESCE_WINDOW);
                        }
                    }
                }
                _ = sweep_tick.tick() => {
                    let horizon = proxmox_time::epoch_f64()
                        - 10.0 * self.ctx.tick.as_secs_f64().max(1.0);
                    self.ctx.rates.sweep(horizon);
                }
                _ = shutdown.changed() => break,
            }
        }

        log::info!("supervisor shutting down, stopping {} workers", self.workers.len());
        let workers: Vec<WorkerHandle> = self.workers.drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.cancel();
        }
        for worker in workers {
            worker.stop().await;
        }
    }

    fn start_worker(&mut self, config: NodeConfig) {
        let id = config.id.clone();
        let handle = spawn_worker(config, self.ctx.clone(), self.partial_tx.clone());
        if let Some(old) = self.workers.insert(id, handle) {
            old.cancel();
        }
    }

    /// Reload events are applied between ticks, in emission order. Any
    /// update restarts the worker; credential changes need the full
    /// teardown anyway. Returns whether the merged snapshot changed
    /// without a new partial arriving.
    async fn apply(&mut self, event: NodeEvent) -> bool {
        match event {
            NodeEvent::Added(config) => {
                log::info!("node '{}' added", config.name);
                self.start_worker(config);
                false
            }
            NodeEvent::Updated(config) => {
                log::info!("node '{}' updated, restarting its worker", config.name);
                if let Some(worker) = self.workers.remove(&config.id) {
                    worker.stop().await;
                }
                self.partials.remove(&config.id);
                self.start_worker(config);
                false
            }
            NodeEvent::Removed(id) => {
                log::info!("node '{}' removed", id);
                if let Some(worker) = self.workers.remove(&id) {
                    worker.stop().await;
                }
                self.partials.remove(&id).is_some()
            }
        }
    }

    fn publish(&mut self) {
        let now_ms = (proxmox_time::epoch_f64() * 1000.0) as i64;
        let previous = self.hub.current().generated_at;
        let mut snapshot = assemble(&self.partials, previous, now_ms);
        snapshot.alerts = self
            .engine
            .evaluate(&snapshot, snapshot.generated_at / 1000);
        let snapshot = Arc::new(snapshot);
        self.hub.publish(snapshot.clone());
        self.history.record(&snapshot);
        log::debug!(
            "published snapshot {} ({} nodes, {} vms, {} containers)",
            snapshot.generated_at,
            snapshot.nodes.len(),
            snapshot.vms.len(),
            snapshot.containers.len()
        );
    }
}

async fn maybe_sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::testing::{guest_info, FakePve};
    use crate::poll::{PbsFactory, PveFactory, RateCache};
    use crate::reload;
    use pulse_api_types::{NodeCapabilities, NodeKind, ThresholdConfig};
    use pulse_client::PveApi;
    use std::sync::RwLock;

    fn test_ctx(fake: Arc<FakePve>) -> Arc<PollContext> {
        let pve_factory: PveFactory = Arc::new(move |_, _| Ok(fake.clone() as Arc<dyn PveApi>));
        let pbs_factory: PbsFactory = Arc::new(|_, _| anyhow::bail!("no PBS here"));
        Arc::new(PollContext {
            tick: Duration::from_millis(20),
            rates: Arc::new(RateCache::new()),
            pve_factory,
            pbs_factory,
        })
    }

    fn node_config() -> NodeConfig {
        NodeConfig {
            id: "n1".into(),
            kind: NodeKind::Pve,
            name: "pve1".into(),
            url: "https://pve1:8006".into(),
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

    #[tokio::test(start_paused = true)]
    async fn publishes_merged_snapshot_and_reacts_to_removal() {
        let mut fake = FakePve::standalone("pve1");
        fake.vms.insert(
            "pve1".into(),
            vec![guest_info(100, "running"), guest_info(101, "running")],
        );
        fake.containers
            .insert("pve1".into(), vec![guest_info(200, "stopped")]);
        let ctx = test_ctx(Arc::new(fake));

        let hub = crate::state::StateHub::new();
        let history = Arc::new(MetricsHistory::new(32));
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let engine = AlertEngine::new(
            Arc::new(RwLock::new(ThresholdConfig::default())),
            event_tx,
        );

        let supervisor = Supervisor::new(ctx, hub.clone(), history.clone(), engine);
        let (reload_tx, reload_rx) = reload::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervisor.run(vec![node_config()], reload_rx, shutdown_rx));

        let mut sub = hub.subscribe();
        // the initial empty state, then the first assembled snapshot
        let initial = sub.recv().await.unwrap();
        let snapshot = sub.recv().await.unwrap();
        assert!(snapshot.generated_at > initial.generated_at);
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.vms.len(), 2);
        assert_eq!(snapshot.containers.len(), 1);
        for guest in snapshot.guests() {
            assert!((0.0..=100.0).contains(&guest.memory.usage));
            assert!(guest.disk_read >= 0.0 && guest.network_out >= 0.0);
        }
        // history recorded the published entities
        assert!(!history
            .range("pve1/qemu/100", 0, i64::MAX, 10)
            .is_empty());

        // removal drains the node from the next assembly
        reload_tx.send(crate::reload::NodeEvent::Removed("n1".into()));
        let mut last = snapshot;
        for _ in 0..20 {
            last = sub.recv().await.unwrap();
            if last.nodes.is_empty() {
                break;
            }
        }
        assert!(last.nodes.is_empty());
        assert!(last.vms.is_empty());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
