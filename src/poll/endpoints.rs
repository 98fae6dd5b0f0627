//! Endpoint preference and quarantine for clustered nodes.
//!
//! Candidates are scanned round-robin starting at the last-good endpoint.
//! Two consecutive transient failures quarantine an endpoint for 30 s;
//! an endpoint that keeps failing right after a reprobe is parked for five
//! minutes before the next attempt.

use std::time::Duration;

use tokio::time::Instant;

const SHORT_QUARANTINE: Duration = Duration::from_secs(30);
const LONG_QUARANTINE: Duration = Duration::from_secs(5 * 60);

/// Failures before an endpoint leaves the rotation.
const QUARANTINE_AFTER: u32 = 2;

#[derive(Debug, Clone)]
struct EndpointHealth {
    host: String,
    consecutive_failures: u32,
    quarantined_until: Option<Instant>,
}

impl EndpointHealth {
    fn new(host: String) -> Self {
        Self {
            host,
            consecutive_failures: 0,
            quarantined_until: None,
        }
    }

    fn available(&self, now: Instant) -> bool {
        match self.quarantined_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct EndpointSet {
    entries: Vec<EndpointHealth>,
    preferred: usize,
}

impl EndpointSet {
    pub fn new(entry_host: String) -> Self {
        Self {
            entries: vec![EndpointHealth::new(entry_host)],
            preferred: 0,
        }
    }

    /// Sync with freshly discovered cluster membership, keeping health
    /// state for hosts that are still members. The preferred endpoint
    /// stays preferred while it remains a member.
    pub fn set_members(&mut self, hosts: Vec<String>) {
        if hosts.is_empty() {
            return;
        }
        let preferred_host = self.entries[self.preferred].host.clone();
        let old = std::mem::take(&mut self.entries);
        self.entries = hosts
            .into_iter()
            .map(|host| {
                old.iter()
                    .find(|e| e.host == host)
                    .cloned()
                    .unwrap_or_else(|| EndpointHealth::new(host))
            })
            .collect();
        self.preferred = self
            .entries
            .iter()
            .position(|e| e.host == preferred_host)
            .unwrap_or(0);
    }

    pub fn hosts(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.host.clone()).collect()
    }

    /// Hosts to try this tick, round-robin from the preferred one,
    /// quarantined entries last (they are still returned when everything
    /// else is down, so a recovered cluster is eventually found again).
    pub fn candidates(&self, now: Instant) -> Vec<String> {
        let n = self.entries.len();
        let mut available = Vec::new();
        let mut parked = Vec::new();
        for offset in 0..n {
            let entry = &self.entries[(self.preferred + offset) % n];
            if entry.available(now) {
                available.push(entry.host.clone());
            } else {
                parked.push(entry.host.clone());
            }
        }
        available.extend(parked);
        available
    }

    /// The endpoint answered; it becomes the preferred one.
    pub fn report_ok(&mut self, host: &str) {
        if let Some(index) = self.entries.iter().position(|e| e.host == host) {
            self.entries[index].consecutive_failures = 0;
            self.entries[index].quarantined_until = None;
            self.preferred = index;
        }
    }

    /// A transient failure against the endpoint.
    pub fn report_failure(&mut self, host: &str, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.host == host) {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures == QUARANTINE_AFTER {
                entry.quarantined_until = Some(now + SHORT_QUARANTINE);
            } else if entry.consecutive_failures > QUARANTINE_AFTER {
                entry.quarantined_until = Some(now + LONG_QUARANTINE);
            }
        }
    }

    /// True when the endpoint failed recently and has not recovered.
    pub fn is_degraded(&self, host: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.host == host && e.consecutive_failures > 0)
    }
}
