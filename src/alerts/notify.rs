//! Alert delivery: the notifier seam and the queue drain task.
//!
//! Delivery is at-least-once. Events pass a per-(resource, level) grouping
//! window, then each notifier is tried with exponential backoff; an event
//! that still fails after ten attempts is dropped with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use pulse_api_types::{AlertEvent, AlertLevel};

/// Identical (resource, level) events inside this window coalesce into one
/// delivery carrying a count.
const GROUP_WINDOW: Duration = Duration::from_secs(5 * 60);

const MAX_ATTEMPTS: u32 = 10;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Deadline for draining queued events at shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Abstract alert sink. Webhook and email implementations live outside the
/// core; the daemon ships a log-backed one.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<(), Error>;

    fn name(&self) -> &str {
        "notifier"
    }
}

/// Writes alert traffic to the log. Also the default sink in tests.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &AlertEvent) -> Result<(), Error> {
        log::info!(
            "alert {}: {} (count {})",
            event.kind,
            event.alert.message,
            event.count
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

struct GroupEntry {
    last_sent: Instant,
    pending: Option<AlertEvent>,
}

/// Counters the REST surface exposes for observability.
#[derive(Default)]
pub struct DispatchStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct Dispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    groups: HashMap<(String, AlertLevel), GroupEntry>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn spawn(
        notifiers: Vec<Arc<dyn Notifier>>,
        events: mpsc::UnboundedReceiver<AlertEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<DispatchStats>, tokio::task::JoinHandle<()>) {
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Dispatcher {
            notifiers,
            groups: HashMap::new(),
            stats: stats.clone(),
        };
        let handle = tokio::spawn(dispatcher.run(events, shutdown));
        (stats, handle)
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<AlertEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut flush_tick = tokio::time::interval(Duration::from_secs(10));
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.group_or_deliver(event).await,
                    None => break,
                },
                _ = flush_tick.tick() => self.flush_expired().await,
                _ = shutdown.changed() => {
                    self.drain(&mut events).await;
                    return;
                }
            }
        }
        log::debug!("alert dispatcher: event source closed");
    }

    /// First event of a (resource, level) passes through; repeats within
    /// the window fold into one pending event with a count.
    async fn group_or_deliver(&mut self, event: AlertEvent) {
        let key = (event.alert.resource_id.clone(), event.alert.level);
        let now = Instant::now();
        match self.groups.get_mut(&key) {
            Some(entry) if now.duration_since(entry.last_sent) < GROUP_WINDOW => {
                match entry.pending.as_mut() {
                    Some(pending) => {
                        pending.count += 1;
                        pending.alert = event.alert;
                        pending.kind = event.kind;
                        pending.timestamp = event.timestamp;
                    }
                    None => entry.pending = Some(event),
                }
            }
            _ => {
                self.deliver(&event).await;
                self.groups.insert(
                    key,
                    GroupEntry {
                        last_sent: now,
                        pending: None,
                    },
                );
            }
        }
    }

    async fn flush_expired(&mut self) {
        let now = Instant::now();
        let due: Vec<(String, AlertLevel)> = self
            .groups
            .iter()
            .filter(|(_, entry)| {
                entry.pending.is_some() && now.duration_since(entry.last_sent) >= GROUP_WINDOW
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if let Some(entry) = self.groups.get_mut(&key) {
                if let Some(pending) = entry.pending.take() {
                    entry.last_sent = now;
                    self.deliver(&pending).await;
                }
            }
        }
    }

    async fn deliver(&self, event: &AlertEvent) {
        for notifier in &self.notifiers {
            let mut attempt = 0;
            loop {
                match notifier.notify(event).await {
                    Ok(()) => {
                        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(err) if attempt + 1 < MAX_ATTEMPTS => {
                        let delay = BACKOFF_CAP.min(BACKOFF_BASE * 2u32.pow(attempt.min(16)));
                        log::debug!(
                            "notifier '{}' failed (attempt {}): {}, retrying in {:?}",
                            notifier.name(),
                            attempt + 1,
                            err,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "dropping alert event for '{}' after {} attempts via '{}': {}",
                            event.alert.resource_id,
                            MAX_ATTEMPTS,
                            notifier.name(),
                            err
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Best-effort delivery of whatever is still queued, bounded by the
    /// shutdown deadline. Single attempt per event.
    async fn drain(&mut self, events: &mut mpsc::UnboundedReceiver<AlertEvent>) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        // flush grouped leftovers first
        let pending: Vec<AlertEvent> = self
            .groups
            .values_mut()
            .filter_map(|entry| entry.pending.take())
            .collect();
        for event in pending {
            self.deliver_once(&event).await;
        }
        while let Ok(Some(event)) =
            tokio::time::timeout_at(deadline, events.recv()).await
        {
            self.deliver_once(&event).await;
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    async fn deliver_once(&self, event: &AlertEvent) {
        for notifier in &self.notifiers {
            if let Err(err) = notifier.notify(event).await {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "shutdown drain: notifier '{}' failed: {}",
                    notifier.name(),
                    err
                );
            } else {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_api_types::{Alert, AlertEventKind};
    use std::sync::Mutex;

    struct RecordingNotifier {
        delivered: Mutex<Vec<AlertEvent>>,
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: &AlertEvent) -> Result<(), Error> {
            if self.fail_first.load(Ordering::Relaxed) > 0 {
                self.fail_first.fetch_sub(1, Ordering::Relaxed);
                anyhow::bail!("sink unavailable");
            }
            self.delivered.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn event(resource: &str, level: AlertLevel) -> AlertEvent {
        AlertEvent {
            kind: AlertEventKind::Fired,
            alert: Alert {
                id: "x".into(),
                resource_id: resource.into(),
                resource_name: resource.into(),
                metric: "memory".into(),
                threshold: 90.0,
                value: 95.0,
                level,
                first_seen: 0,
                last_seen: 0,
                acknowledged: false,
                suppressed: false,
                message: "test".into(),
            },
            count: 1,
            timestamp: 0,
        }
    }

    fn recording(fail_first: u64) -> Arc<RecordingNotifier> {
        Arc::new(RecordingNotifier {
            delivered: Mutex::new(Vec::new()),
            fail_first: AtomicU64::new(fail_first),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn events_within_window_coalesce() {
        let sink = recording(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats, handle) = Dispatcher::spawn(vec![sink.clone()], rx, shutdown_rx);

        tx.send(event("vm/100", AlertLevel::Warning)).unwrap();
        tx.send(event("vm/100", AlertLevel::Warning)).unwrap();
        tx.send(event("vm/100", AlertLevel::Warning)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // only the first goes out immediately
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);

        // after the window the folded remainder flushes with its count
        tokio::time::sleep(GROUP_WINDOW + Duration::from_secs(11)).await;
        {
            let delivered = sink.delivered.lock().unwrap();
            assert_eq!(delivered.len(), 2);
            assert_eq!(delivered[1].count, 2);
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_delivery_retries_with_backoff() {
        let sink = recording(2);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stats, _handle) = Dispatcher::spawn(vec![sink.clone()], rx, shutdown_rx);

        tx.send(event("vm/100", AlertLevel::Critical)).unwrap();
        // two failures at 1 s and 2 s backoff, then success
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 1);
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_resources_do_not_coalesce() {
        let sink = recording(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_stats, _handle) = Dispatcher::spawn(vec![sink.clone()], rx, shutdown_rx);

        tx.send(event("vm/100", AlertLevel::Warning)).unwrap();
        tx.send(event("vm/101", AlertLevel::Warning)).unwrap();
        tx.send(event("vm/100", AlertLevel::Critical)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.delivered.lock().unwrap().len(), 3);
    }
}
