//! Config reload bus.
//!
//! Node mutations from the REST layer travel to the poll supervisor over
//! an unbounded channel and are applied between ticks, in the order they
//! were emitted.

use tokio::sync::mpsc;

use pulse_api_types::NodeConfig;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    Added(NodeConfig),
    /// Any edit; a credential change implies a full worker teardown, so
    /// the supervisor restarts the worker for every update.
    Updated(NodeConfig),
    Removed(String),
}

#[derive(Clone)]
pub struct ReloadTx {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl ReloadTx {
    pub fn send(&self, event: NodeEvent) {
        // the supervisor outlives every sender except during shutdown
        if self.tx.send(event).is_err() {
            log::debug!("reload event dropped, supervisor gone");
        }
    }
}

pub fn channel() -> (ReloadTx, mpsc::UnboundedReceiver<NodeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReloadTx { tx }, rx)
}
