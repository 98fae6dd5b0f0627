//! The state hub: current snapshot plus subscriber fan-out.
//!
//! `publish` only swaps an `Arc` pointer and pushes into per-subscriber
//! bounded buffers, so it never blocks on subscriber I/O. Buffers coalesce
//! latest-wins; a subscriber that stops draining is evicted with a close
//! reason.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use pulse_api_types::{DiscoveredServer, Snapshot};

/// Outbound frames buffered per subscriber before coalescing kicks in.
const SUBSCRIBER_BUFFER: usize = 4;

/// A subscriber that has not drained for this long is evicted.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

pub struct StateHub {
    current: RwLock<Arc<Snapshot>>,
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
    discovered: RwLock<Arc<Vec<DiscoveredServer>>>,
    next_id: AtomicU64,
}

struct SubscriberShared {
    id: u64,
    queue: Mutex<SubscriberQueue>,
    notify: Notify,
}

struct SubscriberQueue {
    frames: VecDeque<Arc<Snapshot>>,
    last_drained: Instant,
    closed: Option<String>,
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closed {
    /// The hub evicted the subscriber; carries the close reason.
    Evicted(String),
}

/// Receiving side of one subscription. Dropping it unregisters promptly.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
    registry: Arc<StateHub>,
}

impl StateHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            subscribers: Mutex::new(Vec::new()),
            discovered: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        })
    }

    /// The most recently published snapshot.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    /// Register a subscriber. Its first frame is the current snapshot.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(SubscriberQueue {
                frames: VecDeque::from([self.current()]),
                last_drained: Instant::now(),
                closed: None,
            }),
            notify: Notify::new(),
        });
        self.subscribers.lock().unwrap().push(shared.clone());
        shared.notify.notify_one();
        Subscription {
            shared,
            registry: self.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Publish a new snapshot to every subscriber.
    ///
    /// Stale publishes (`generated_at` not beyond the current snapshot) are
    /// discarded, keeping every subscriber's frame sequence monotonic.
    pub fn publish(&self, snapshot: Arc<Snapshot>) {
        {
            let mut current = self.current.write().unwrap();
            if snapshot.generated_at <= current.generated_at {
                log::debug!(
                    "discarding stale publish ({} <= {})",
                    snapshot.generated_at,
                    current.generated_at
                );
                return;
            }
            *current = snapshot.clone();
        }

        let targets: Vec<Arc<SubscriberShared>> =
            self.subscribers.lock().unwrap().iter().cloned().collect();

        let now = Instant::now();
        let mut evicted = Vec::new();
        for subscriber in targets {
            let mut queue = subscriber.queue.lock().unwrap();
            if queue.closed.is_some() {
                continue;
            }
            if !queue.frames.is_empty()
                && now.duration_since(queue.last_drained) > DRAIN_DEADLINE
            {
                queue.closed = Some("subscriber too slow".to_string());
                queue.frames.clear();
                evicted.push(subscriber.id);
                drop(queue);
                subscriber.notify.notify_one();
                continue;
            }
            if queue.frames.len() == SUBSCRIBER_BUFFER {
                // latest wins
                queue.frames.pop_front();
            }
            queue.frames.push_back(snapshot.clone());
            drop(queue);
            subscriber.notify.notify_one();
        }

        if !evicted.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|s| !evicted.contains(&s.id));
            log::warn!("evicted {} slow subscriber(s)", evicted.len());
        }
    }

    /// Latest discovery scan results.
    pub fn discovered(&self) -> Arc<Vec<DiscoveredServer>> {
        self.discovered.read().unwrap().clone()
    }

    pub fn set_discovered(&self, servers: Vec<DiscoveredServer>) {
        *self.discovered.write().unwrap() = Arc::new(servers);
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().retain(|s| s.id != id);
    }
}

impl Subscription {
    /// Wait for the next frame.
    ///
    /// Frames arrive in strictly increasing `generated_at` order; under
    /// backpressure intermediate frames are dropped, never reordered.
    pub async fn recv(&mut self) -> Result<Arc<Snapshot>, Closed> {
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(reason) = &queue.closed {
                    return Err(Closed::Evicted(reason.clone()));
                }
                if let Some(frame) = queue.frames.pop_front() {
                    queue.last_drained = Instant::now();
                    return Ok(frame);
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(self.shared.id);
    }
}
